use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tas_core::{EnforcerStatus, MetricCache, MetricEnforcer};
use tracing::{error, info};

use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub enforcer: Arc<MetricEnforcer>,
    pub cache: Arc<MetricCache>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub detail: String,
    pub enforcer: EnforcerStatus,
    pub checked_at: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/{name}", put(metrics::write_metric))
        .with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: AppState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Not ready until the first pass has completed. Queued cleanups keep the
/// service up but mark it degraded.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let enforcer = state.enforcer.status();

    let (status_code, status, detail) = if enforcer.passes == 0 {
        let detail = "no enforcement pass has completed yet".to_string();
        (StatusCode::SERVICE_UNAVAILABLE, "starting", detail)
    } else if !enforcer.pending_cleanups.is_empty() {
        (
            StatusCode::OK,
            "degraded",
            format!("{} cleanup(s) waiting to be retried", enforcer.pending_cleanups.len()),
        )
    } else {
        (StatusCode::OK, "ready", format!("{} pass(es) completed", enforcer.passes))
    };

    let payload = HealthResponse { status, detail, enforcer, checked_at: Utc::now().to_rfc3339() };
    (status_code, Json(payload))
}
