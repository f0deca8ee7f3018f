//! Health and metrics endpoints.
//!
//! - `GET /health` - Liveness probe (cleared once a worker dies)
//! - `GET /ready` - Readiness probe (worker pool and signaling listener up)
//! - `GET /metrics` - Prometheus text format, when a recorder handle is given

use axum::{extract::State, http::StatusCode, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags shared between main and the probes.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthState {
    /// Live but not yet ready; main flips readiness once the pool and
    /// listener are up.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (shutdown or drain).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Mark the process as dying. Clears readiness too.
    pub fn set_not_live(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    metrics: Option<PrometheusHandle>,
}

/// Create the health router.
///
/// `/metrics` is mounted only when `metrics_handle` is present, so tests
/// can build the router without installing a global recorder.
pub fn health_router(
    health_state: Arc<HealthState>,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    let has_metrics = metrics_handle.is_some();
    let router = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler));
    let router = if has_metrics {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };
    router.with_state(ProbeState {
        health: health_state,
        metrics: metrics_handle,
    })
}

fn probe_status(up: bool) -> StatusCode {
    if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness_handler(State(state): State<ProbeState>) -> StatusCode {
    probe_status(state.health.is_live())
}

async fn readiness_handler(State(state): State<ProbeState>) -> StatusCode {
    probe_status(state.health.is_ready())
}

async fn metrics_handler(State(state): State<ProbeState>) -> (StatusCode, String) {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
