//! Durable persistence owned exclusively by the orchestrator: the
//! cursor/lock/pub-sub surface (`kv`) and the relational store (`db`).

pub mod db;
pub mod kv;

pub use db::{PgRepository, Repository};
pub use kv::{KvBackend, RedisKv};
