//! Structured logging and metrics plumbing shared by every AEGIS
//! component: JSON tracing setup, a Prometheus-backed metrics sink, a
//! small HTTP exposition server, and a pipeline-duration timer.

/// The initialization routine for the global `tracing` subscriber.
pub mod init;

/// The HTTP server exposing `/metrics`, `/healthz`, and `/readyz`.
pub mod http;

/// The Prometheus-backed implementation of the `sinks` traits.
pub mod prometheus;

/// Abstract metrics-sink traits, decoupled from any specific backend.
pub mod sinks;

/// RAII timing helpers.
pub mod time;

pub use sinks::{
    chain_metrics, error_metrics, executor_metrics, queue_metrics, ChainMetricsSink, ErrorMetricsSink,
    ExecutorMetricsSink, MetricsSink, QueueMetricsSink,
};
