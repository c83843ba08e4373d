//! The cursor & lock store (C1): a small Redis-backed key-value surface
//! with expiring entries, an atomic set-if-absent, an atomic
//! get-and-delete, a sliding-window counter, and pub/sub.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::time::sleep;

use aegis_types::error::KvError;

const CONNECT_RETRIES: usize = 5;
const BASE_BACKOFF_MS: u64 = 100;

fn retry_delay(attempt: usize) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(1u64 << attempt).min(4_000))
}

/// Well-known key patterns from the data model. Grouped here so every
/// caller derives the same key instead of hand-formatting strings.
pub mod keys {
    pub fn last_block() -> String {
        "scanner:last_block".to_string()
    }
    pub fn scanner_lock(onchain_proposal_id: &str) -> String {
        format!("scanner:lock:{onchain_proposal_id}")
    }
    pub fn analysis_result(proposal_internal_id: i64) -> String {
        format!("analysis:result:{proposal_internal_id}")
    }
    pub fn analysis_events(proposal_internal_id: i64) -> String {
        format!("analysis:events:{proposal_internal_id}")
    }
    pub const ANALYSIS_EVENTS_WILDCARD: &str = "analysis:events:*";
}

/// The object-safe surface consumed by the scanner, queue, and executor.
/// Abstracted so those crates can exercise their logic against an
/// in-memory fake without a live Redis instance.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    /// `SET key value NX EX ttl`. Returns `true` if the key was set
    /// (lock acquired), `false` if it already existed.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError>;
    /// Atomic get-and-delete; falls back to `GET` + `DEL` for servers
    /// predating `GETDEL` (Redis < 6.2).
    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn zadd_window(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;
    async fn zcount_window(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;
}

/// The Redis-backed implementation of [`KvBackend`].
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    client: Client,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = Client::open(redis_url).map_err(|e| KvError::Connection(e.to_string()))?;

        let mut attempt = 0;
        let manager = loop {
            match client.get_connection_manager().await {
                Ok(m) => break m,
                Err(e) if attempt < CONNECT_RETRIES => {
                    tracing::warn!(attempt, error = %e, "redis connect failed, retrying");
                    sleep(retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(KvError::Connection(e.to_string())),
            }
        };

        Ok(Self { manager, client })
    }

    /// Opens a dedicated pub/sub connection subscribed to the given
    /// pattern. Kept outside `KvBackend` since `redis::aio::PubSub` is a
    /// stateful stream, not something a mock backend can reasonably
    /// stand in for.
    pub async fn subscribe_pattern(&self, pattern: &str) -> Result<redis::aio::PubSub, KvError> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?
            .into_pubsub();
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(pubsub)
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.set(key, value).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.del(key).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_secs as usize));
        let result: Option<String> = conn
            .set_options(key, value, opts)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        match redis::cmd("GETDEL").arg(key).query_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) if e.code() == Some("ERR") => {
                // Older Redis without GETDEL: GET then DEL, best-effort atomicity.
                let value: Option<String> = conn.get(key).await.map_err(|e| KvError::Command(e.to_string()))?;
                if value.is_some() {
                    let _: () = conn.del(key).await.map_err(|e| KvError::Command(e.to_string()))?;
                }
                Ok(value)
            }
            Err(e) => Err(KvError::Command(e.to_string())),
        }
    }

    async fn zadd_window(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.zadd(key, member, score)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn zcount_window(&self, key: &str, min: f64, max: f64) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        conn.zcount(key, min, max).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.publish(channel, payload)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }
}

/// Reads `scanner:last_block`, degrading to `None` (rather than erroring)
/// on a cache miss or transient KV failure — the documented floor-block
/// fallback for a non-durable cursor.
pub async fn last_block_or_floor(kv: &dyn KvBackend, floor: u64) -> u64 {
    match kv.get(&keys::last_block()).await {
        Ok(Some(raw)) => raw.parse::<u64>().unwrap_or(floor),
        Ok(None) => floor,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read scanner:last_block, using floor");
            floor
        }
    }
}
