use crate::registry::HealthSnapshot;
use crate::state::SharedState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub failure_ratio: Option<f64>,
    pub threshold: f64,
    pub window: usize,
    pub window_failed: usize,
    pub pending: Option<usize>,
    pub running: Option<usize>,
    pub uptime_seconds: u64,
}

/// Liveness probe for the container health check.
///
/// Never waits on the registry: if a writer holds the lock the answer is
/// "degraded" with 200, since a hung probe gets the instance restarted.
pub async fn health_handler(State(state): State<SharedState>) -> (StatusCode, Json<HealthReport>) {
    let snapshot = state.supervisor.registry().health_snapshot();
    let (code, mut report) = evaluate(snapshot, state.config.health.max_failure_ratio);
    report.uptime_seconds = state.started_at.elapsed().as_secs();

    if code != StatusCode::OK {
        warn!(
            "Health check failing: {}/{} recent jobs failed",
            report.window_failed, report.window
        );
    } else {
        debug!("Health check: {}", report.status);
    }
    (code, Json(report))
}

/// Healthy while the failed share of recent terminal jobs stays at or below
/// `threshold`. Pending and running jobs do not count.
pub fn evaluate(snapshot: Option<HealthSnapshot>, threshold: f64) -> (StatusCode, HealthReport) {
    let Some(snapshot) = snapshot else {
        return (
            StatusCode::OK,
            HealthReport {
                status: "degraded",
                failure_ratio: None,
                threshold,
                window: 0,
                window_failed: 0,
                pending: None,
                running: None,
                uptime_seconds: 0,
            },
        );
    };

    let ratio = snapshot.failure_ratio();
    let healthy = ratio <= threshold;
    let report = HealthReport {
        status: if healthy { "ok" } else { "unhealthy" },
        failure_ratio: Some(ratio),
        threshold,
        window: snapshot.window_len,
        window_failed: snapshot.window_failed,
        pending: Some(snapshot.pending),
        running: Some(snapshot.running),
        uptime_seconds: 0,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, report)
}
