//! A lightweight HTTP server for exposing `/metrics`, `/healthz`, and
//! `/readyz` endpoints to an external scraper or orchestrator probe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use warp::Filter;

use crate::prometheus::PrometheusSink;

/// Flips to `true` once startup has finished and the process is serving
/// traffic; `/readyz` reports this back to the prober.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serves metrics and health endpoints until the process exits. Intended
/// to run as a background task alongside the scanner, queue, and executor.
pub async fn serve(addr: SocketAddr, sink: &'static PrometheusSink, readiness: Readiness) {
    let metrics_route = warp::path("metrics").map(move || {
        warp::http::Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(sink.gather_text())
            .unwrap()
    });

    let healthz_route = warp::path("healthz").map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));

    let readyz_route = warp::path("readyz").map(move || {
        if readiness.is_ready() {
            warp::reply::with_status("ready", warp::http::StatusCode::OK)
        } else {
            warp::reply::with_status("starting", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        }
    });

    let routes = metrics_route.or(healthz_route).or(readyz_route);

    tracing::info!(%addr, "telemetry server listening");
    warp::serve(routes).run(addr).await;
}
