//! Loopback status endpoint: `/health` and `/metrics`

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_session::{CredentialStore, RefreshStatus, now_millis};
use tokio::sync::watch;

/// Shared state for the status handlers
#[derive(Clone)]
pub struct StatusState {
    pub store: Arc<CredentialStore>,
    pub refresh: watch::Receiver<RefreshStatus>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the status router with a concurrency limit of `max_connections`.
pub fn build_router(state: StatusState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// 200 while a credential is held and the refresh loop is alive, 503
/// otherwise.
async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let refresh = state.refresh.borrow().clone();
    let expires = state.store.expires().await;
    let expires_in = expires.map(|e| e.saturating_sub(now_millis()) / 1000);
    let healthy = expires.is_some() && !refresh.is_terminal();

    let mut body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "authenticated": expires.is_some(),
        "expires_in_seconds": expires_in,
        "refresh": refresh.label(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    if let RefreshStatus::Failed(reason) = &refresh {
        body["refresh_error"] = serde_json::Value::String(reason.clone());
    }

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition format.
async fn metrics_handler(State(state): State<StatusState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
