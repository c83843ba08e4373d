//! Concrete `MetricsSink` implementation backed by the `prometheus` crate.

use crate::sinks::{ChainMetricsSink, ErrorMetricsSink, ExecutorMetricsSink, QueueMetricsSink, SINK};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct PrometheusSink {
    registry: Registry,
    blocks_scanned: prometheus::IntCounter,
    events_handled: IntCounterVec,
    reconnects: prometheus::IntCounter,
    scanner_state: IntGaugeVec,
    jobs_enqueued: IntCounterVec,
    jobs_retried: IntCounterVec,
    jobs_stalled: prometheus::IntCounter,
    jobs_failed: prometheus::IntCounter,
    lane_depth: IntGaugeVec,
    votes_cast: IntCounterVec,
    votes_failed: IntCounterVec,
    batch_reverts: prometheus::IntCounter,
    pipeline_duration: Histogram,
    errors_total: IntCounterVec,
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl PrometheusSink {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let blocks_scanned = prometheus::IntCounter::new("aegis_blocks_scanned_total", "blocks scanned")?;
        let events_handled = IntCounterVec::new(
            Opts::new("aegis_events_handled_total", "events handled by kind"),
            &["kind"],
        )?;
        let reconnects = prometheus::IntCounter::new("aegis_scanner_reconnects_total", "scanner reconnects")?;
        let scanner_state = IntGaugeVec::new(
            Opts::new("aegis_scanner_state", "current scanner state (1 = active)"),
            &["state"],
        )?;
        let jobs_enqueued = IntCounterVec::new(
            Opts::new("aegis_jobs_enqueued_total", "analysis jobs enqueued"),
            &["lane"],
        )?;
        let jobs_retried = IntCounterVec::new(
            Opts::new("aegis_jobs_retried_total", "analysis jobs retried"),
            &["lane"],
        )?;
        let jobs_stalled = prometheus::IntCounter::new("aegis_jobs_stalled_total", "stalled leases reclaimed")?;
        let jobs_failed = prometheus::IntCounter::new("aegis_jobs_failed_total", "jobs exhausting retries")?;
        let lane_depth = IntGaugeVec::new(
            Opts::new("aegis_lane_depth", "pending jobs per lane"),
            &["lane"],
        )?;
        let votes_cast = IntCounterVec::new(
            Opts::new("aegis_votes_cast_total", "votes cast by direction"),
            &["direction"],
        )?;
        let votes_failed = IntCounterVec::new(
            Opts::new("aegis_votes_failed_total", "votes failed by error code"),
            &["code"],
        )?;
        let batch_reverts = prometheus::IntCounter::new("aegis_batch_reverts_total", "batch vote call reverts")?;
        let pipeline_duration = Histogram::with_opts(HistogramOpts::new(
            "aegis_executor_pipeline_duration_seconds",
            "time to process one completed analysis",
        ))?;
        let errors_total = IntCounterVec::new(
            Opts::new("aegis_errors_total", "errors by component kind and variant"),
            &["kind", "variant"],
        )?;

        registry.register(Box::new(blocks_scanned.clone()))?;
        registry.register(Box::new(events_handled.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(scanner_state.clone()))?;
        registry.register(Box::new(jobs_enqueued.clone()))?;
        registry.register(Box::new(jobs_retried.clone()))?;
        registry.register(Box::new(jobs_stalled.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(lane_depth.clone()))?;
        registry.register(Box::new(votes_cast.clone()))?;
        registry.register(Box::new(votes_failed.clone()))?;
        registry.register(Box::new(batch_reverts.clone()))?;
        registry.register(Box::new(pipeline_duration.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            blocks_scanned,
            events_handled,
            reconnects,
            scanner_state,
            jobs_enqueued,
            jobs_retried,
            jobs_stalled,
            jobs_failed,
            lane_depth,
            votes_cast,
            votes_failed,
            batch_reverts,
            pipeline_duration,
            errors_total,
        })
    }

    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        // Encoding a well-formed registry snapshot never fails in practice;
        // degrade to an empty body rather than panicking on a metrics path.
        let _ = encoder.encode(&metric_families, &mut buf);
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl ChainMetricsSink for PrometheusSink {
    fn inc_blocks_scanned(&self, count: u64) {
        self.blocks_scanned.inc_by(count);
    }
    fn inc_events_handled(&self, event_kind: &'static str) {
        self.events_handled.with_label_values(&[event_kind]).inc();
    }
    fn inc_reconnects(&self) {
        self.reconnects.inc();
    }
    fn set_scanner_state(&self, state_name: &'static str) {
        for s in ["stopped", "starting", "syncing_historical", "live", "reconnecting", "error"] {
            self.scanner_state
                .with_label_values(&[s])
                .set(if s == state_name { 1 } else { 0 });
        }
    }
}

impl QueueMetricsSink for PrometheusSink {
    fn inc_jobs_enqueued(&self, lane: &'static str) {
        self.jobs_enqueued.with_label_values(&[lane]).inc();
    }
    fn inc_jobs_retried(&self, lane: &'static str) {
        self.jobs_retried.with_label_values(&[lane]).inc();
    }
    fn inc_jobs_stalled(&self) {
        self.jobs_stalled.inc();
    }
    fn inc_jobs_failed(&self) {
        self.jobs_failed.inc();
    }
    fn set_lane_depth(&self, lane: &'static str, depth: f64) {
        self.lane_depth.with_label_values(&[lane]).set(depth as i64);
    }
}

impl ExecutorMetricsSink for PrometheusSink {
    fn inc_votes_cast(&self, direction: &'static str) {
        self.votes_cast.with_label_values(&[direction]).inc();
    }
    fn inc_votes_failed(&self, code: &'static str) {
        self.votes_failed.with_label_values(&[code]).inc();
    }
    fn inc_batch_reverts(&self) {
        self.batch_reverts.inc();
    }
    fn observe_pipeline_duration(&self, duration_secs: f64) {
        self.pipeline_duration.observe(duration_secs);
    }
}

impl ErrorMetricsSink for PrometheusSink {
    fn inc_error(&self, kind: &'static str, variant: &'static str) {
        self.errors_total.with_label_values(&[kind, variant]).inc();
    }
}

static INSTANCE: Lazy<anyhow::Result<PrometheusSink>> = Lazy::new(PrometheusSink::new);

/// Builds the process-wide Prometheus sink and returns a `'static`
/// reference suitable for `telemetry::sinks::SINK.set(...)`.
pub fn install() -> anyhow::Result<&'static PrometheusSink> {
    match &*INSTANCE {
        Ok(sink) => Ok(sink),
        Err(e) => Err(anyhow::anyhow!("failed to build Prometheus sink: {e}")),
    }
}

pub fn install_global() -> anyhow::Result<()> {
    let sink = install()?;
    SINK.set(sink as &'static dyn crate::sinks::MetricsSink)
        .map_err(|_| anyhow::anyhow!("metrics sink already installed"))
}
