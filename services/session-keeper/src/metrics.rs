//! Prometheus metrics exposition
//!
//! Counters recorded by the library:
//!
//! - `oauth_callbacks_total` (counter): label `outcome`
//! - `oauth_token_requests_total` (counter): labels `grant`, `outcome`
//! - `oauth_token_request_duration_seconds` (histogram): label `grant`
//! - `oauth_refresh_retries_total` (counter)
//!
//! Gauges maintained here from the refresh status channel:
//!
//! - `oauth_credential_expiry_timestamp_seconds`
//! - `oauth_refresh_loop_up` (1 while the loop is alive, 0 once it ended)

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use oauth_session::{CredentialStore, RefreshStatus};
use tokio::sync::watch;

/// Token endpoint round trips, 50ms to 30s.
const TOKEN_REQUEST_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("oauth_token_request_duration_seconds".to_string()),
            TOKEN_REQUEST_BUCKETS,
        )
        .context("failed to set histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record the expiry (unix ms) of the credential currently in the store.
pub fn record_credential_expiry(expires_millis: u64) {
    metrics::gauge!("oauth_credential_expiry_timestamp_seconds")
        .set(expires_millis as f64 / 1000.0);
}

pub fn record_refresh_status(status: &RefreshStatus) {
    let up = if status.is_terminal() { 0.0 } else { 1.0 };
    metrics::gauge!("oauth_refresh_loop_up").set(up);
}

/// Follow the refresh status channel and keep the gauges current.
///
/// Returns once the refresh loop reaches a terminal status or its sender is
/// dropped.
pub async fn track_refresh(
    mut status: watch::Receiver<RefreshStatus>,
    store: Arc<CredentialStore>,
) {
    loop {
        let current = status.borrow_and_update().clone();
        record_refresh_status(&current);
        if let Some(expires) = store.expires().await {
            record_credential_expiry(expires);
        }
        if current.is_terminal() || status.changed().await.is_err() {
            break;
        }
    }
}
