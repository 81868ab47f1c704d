//! OAuth session keeper
//!
//! Single-binary service that:
//! 1. Runs the interactive Authorization Code grant once (browser consent)
//! 2. Keeps the access token fresh in the background until shutdown
//! 3. Optionally exposes `/health` and `/metrics` on a loopback address

mod config;
mod metrics;
mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use oauth_session::{Authorizer, CredentialStore, RefreshScheduler, RefreshStatus};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::status::StatusState;

/// How long the status server may take to drain after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oauth-session-keeper");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let client_config = Arc::new(
        config
            .client_config()
            .context("invalid [oauth] configuration")?,
    );

    info!(
        client_id = client_config.client_id(),
        scopes = client_config.scopes().len(),
        callback_port = client_config.callback_port(),
        pkce = client_config.use_pkce(),
        status_enabled = config.status.is_some(),
        "configuration loaded"
    );

    let store = Arc::new(CredentialStore::new());
    let authorizer = Authorizer::new(client_config.clone(), store.clone());

    // The grant blocks on the user; let a signal abort it cleanly
    let credential = tokio::select! {
        result = authorizer.authenticate() => result.context("authorization failed")?,
        _ = shutdown_signal() => {
            info!("shutdown requested before authorization completed");
            return Ok(());
        }
    };
    metrics::record_credential_expiry(credential.expires);

    let refresh = RefreshScheduler::new(
        store.clone(),
        authorizer.token_endpoint(),
        client_config.refresh_margin(),
    )
    .with_retry_policy(config.refresh.retry_policy())
    .spawn();
    tokio::spawn(metrics::track_refresh(refresh.subscribe(), store.clone()));

    let status_server = match config.status {
        Some(ref status) => {
            let state = StatusState {
                store: store.clone(),
                refresh: refresh.subscribe(),
                prometheus: prometheus_handle,
                started_at: Instant::now(),
            };
            let app = status::build_router(state, status.max_connections);
            let listener = TcpListener::bind(status.listen_addr)
                .await
                .with_context(|| format!("failed to bind status endpoint {}", status.listen_addr))?;
            info!(addr = %status.listen_addr, "status endpoint listening");

            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            });
            Some((shutdown_tx, handle))
        }
        None => None,
    };

    info!("session established, keeping credential fresh");

    // Run until a signal arrives or the refresh loop gives up
    let refresh_failure = tokio::select! {
        _ = shutdown_signal() => None,
        reason = refresh_terminated(refresh.subscribe()) => reason,
    };

    let final_status = refresh.stop().await;
    info!(refresh = final_status.label(), "refresh loop stopped");

    if let Some((shutdown_tx, handle)) = status_server {
        let _ = shutdown_tx.send(());
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => info!("status endpoint drained"),
            Ok(Ok(Err(e))) => error!(error = %e, "status server error during shutdown"),
            Ok(Err(e)) => error!(error = %e, "status server task panicked"),
            Err(_) => warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            ),
        }
    }

    if let Some(reason) = refresh_failure {
        anyhow::bail!("credential can no longer be refreshed: {reason}");
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolve when the refresh loop ends on its own. Yields the failure reason,
/// or `None` if it stopped without one.
async fn refresh_terminated(mut status: watch::Receiver<RefreshStatus>) -> Option<String> {
    match status.wait_for(RefreshStatus::is_terminal).await {
        Ok(current) => match &*current {
            RefreshStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        },
        // Sender gone without a terminal status; the task itself died
        Err(_) => Some("refresh task exited unexpectedly".to_string()),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
