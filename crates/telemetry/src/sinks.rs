//! Abstract traits for metrics reporting, decoupling core orchestration
//! logic from the Prometheus backend.

use once_cell::sync::OnceCell;

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink`.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

pub fn error_metrics() -> &'static dyn ErrorMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

pub fn chain_metrics() -> &'static dyn ChainMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

pub fn queue_metrics() -> &'static dyn QueueMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

pub fn executor_metrics() -> &'static dyn ExecutorMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Metrics for the chain scanner (C3).
pub trait ChainMetricsSink: Send + Sync + std::fmt::Debug {
    fn inc_blocks_scanned(&self, count: u64);
    fn inc_events_handled(&self, event_kind: &'static str);
    fn inc_reconnects(&self);
    fn set_scanner_state(&self, state_name: &'static str);
}
impl ChainMetricsSink for NopSink {
    fn inc_blocks_scanned(&self, _count: u64) {}
    fn inc_events_handled(&self, _event_kind: &'static str) {}
    fn inc_reconnects(&self) {}
    fn set_scanner_state(&self, _state_name: &'static str) {}
}

/// Metrics for the analysis job bus (C4).
pub trait QueueMetricsSink: Send + Sync + std::fmt::Debug {
    fn inc_jobs_enqueued(&self, lane: &'static str);
    fn inc_jobs_retried(&self, lane: &'static str);
    fn inc_jobs_stalled(&self);
    fn inc_jobs_failed(&self);
    fn set_lane_depth(&self, lane: &'static str, depth: f64);
}
impl QueueMetricsSink for NopSink {
    fn inc_jobs_enqueued(&self, _lane: &'static str) {}
    fn inc_jobs_retried(&self, _lane: &'static str) {}
    fn inc_jobs_stalled(&self) {}
    fn inc_jobs_failed(&self) {}
    fn set_lane_depth(&self, _lane: &'static str, _depth: f64) {}
}

/// Metrics for the vote executor (C5).
pub trait ExecutorMetricsSink: Send + Sync + std::fmt::Debug {
    fn inc_votes_cast(&self, direction: &'static str);
    fn inc_votes_failed(&self, code: &'static str);
    fn inc_batch_reverts(&self);
    fn observe_pipeline_duration(&self, duration_secs: f64);
}
impl ExecutorMetricsSink for NopSink {
    fn inc_votes_cast(&self, _direction: &'static str) {}
    fn inc_votes_failed(&self, _code: &'static str) {}
    fn inc_batch_reverts(&self) {}
    fn observe_pipeline_duration(&self, _duration_secs: f64) {}
}

/// A sink for recording structured error metrics, keyed by the
/// `ErrorCode`-producing enums in `aegis-types::error`.
pub trait ErrorMetricsSink: Send + Sync + std::fmt::Debug {
    fn inc_error(&self, kind: &'static str, variant: &'static str);
}
impl ErrorMetricsSink for NopSink {
    fn inc_error(&self, _kind: &'static str, _variant: &'static str) {}
}

/// A unified sink implementing all domain-specific traits.
pub trait MetricsSink:
    ChainMetricsSink + QueueMetricsSink + ExecutorMetricsSink + ErrorMetricsSink
{
}

impl<T> MetricsSink for T where
    T: ChainMetricsSink + QueueMetricsSink + ExecutorMetricsSink + ErrorMetricsSink
{
}
