//! One-shot localhost listener for the authorization redirect
//!
//! Each listener owns its own axum `Router`, so parallel listeners (tests,
//! retried attempts) share no routing state. The handler reports through two
//! capacity-1 channels using `try_send`: it never waits on a reader, and a
//! duplicate or forged request arriving after the first result is dropped.
//!
//! Only `GET` on the redirect path is handled; anything else gets a 404 or
//! 405 and leaves the wait untouched (browsers probe `/favicon.ico`).
//!
//! `await_callback` consumes the listener. Whatever the outcome, the server
//! is stopped and the socket closed before it returns, so the port can be
//! bound again immediately. Dropping the wait aborts the server too.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::constants::{CALLBACK_SHUTDOWN_GRACE, SUCCESS_HTML};
use crate::error::{AuthorizationFailure, Error, Result};
use crate::pkce::AuthorizationState;

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
struct CallbackContext {
    expected: Arc<AuthorizationState>,
    path: Arc<str>,
    code_tx: mpsc::Sender<String>,
    error_tx: mpsc::Sender<Error>,
}

/// A bound, not yet serving, callback socket on `127.0.0.1`.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
    path: String,
}

impl CallbackListener {
    /// Bind `127.0.0.1:<port>`. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| Error::Listener(format!("failed to bind 127.0.0.1:{port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Listener(format!("local_addr failed: {e}")))?;
        debug!(%addr, "callback listener bound");
        Ok(Self {
            listener,
            addr,
            path: "/".to_owned(),
        })
    }

    /// Serve the callback on `path` instead of `/`.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until one callback resolves or `timeout` elapses.
    ///
    /// Returns the authorization code, an `Authorization` error for a
    /// rejected callback, or `Timeout`.
    pub async fn await_callback(self, state: AuthorizationState, timeout: Duration) -> Result<String> {
        let (code_tx, mut code_rx) = mpsc::channel::<String>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<Error>(1);
        let app = callback_router(CallbackContext {
            expected: Arc::new(state),
            path: Arc::from(self.path),
            code_tx,
            error_tx,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let addr = self.addr;
        let listener = self.listener;
        let mut server = AbortOnDropHandle::new(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        }));

        info!(%addr, timeout_secs = timeout.as_secs(), "waiting for authorization callback");

        let mut server_exited = false;
        let outcome = tokio::select! {
            Some(code) = code_rx.recv() => Ok(code),
            Some(err) = error_rx.recv() => Err(err),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
            exit = &mut server => {
                server_exited = true;
                Err(Error::Listener(match exit {
                    Ok(Ok(())) => "callback server stopped unexpectedly".to_string(),
                    Ok(Err(e)) => format!("callback server failed: {e}"),
                    Err(e) => format!("callback server task failed: {e}"),
                }))
            }
        };

        if !server_exited {
            let _ = shutdown_tx.send(());
            if tokio::time::timeout(CALLBACK_SHUTDOWN_GRACE, &mut server)
                .await
                .is_err()
            {
                debug!(%addr, "callback server did not drain in time, aborting");
                server.abort();
                let _ = server.await;
            }
        }

        let label = match &outcome {
            Ok(_) => "success",
            Err(Error::Timeout(_)) => "timeout",
            Err(Error::Authorization(AuthorizationFailure::InvalidState)) => "invalid_state",
            Err(Error::Authorization(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::counter!("oauth_callbacks_total", "outcome" => label).increment(1);
        debug!(%addr, outcome = label, "callback listener closed");

        outcome
    }
}

/// Private router for one listener. The handler matches method and path
/// itself so any redirect path can be served without route syntax.
fn callback_router(context: CallbackContext) -> Router {
    Router::new()
        .fallback(handle_callback)
        .with_state(context)
}

async fn handle_callback(
    State(context): State<CallbackContext>,
    method: Method,
    uri: Uri,
    query: std::result::Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    if uri.path() != &*context.path {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    // Unparseable queries (duplicate keys and the like) cannot carry a
    // trustworthy state, so they fail the same way a mismatch does
    let params = match query {
        Ok(Query(params)) => params,
        Err(rejection) => {
            debug!(error = %rejection, "callback query could not be parsed");
            CallbackParams::default()
        }
    };

    let state_ok = params
        .state
        .as_deref()
        .is_some_and(|s| context.expected.matches(s));
    if !state_ok {
        warn!("callback rejected: state parameter does not match");
        return reject(
            &context,
            AuthorizationFailure::InvalidState,
            "Invalid state parameter".to_string(),
        );
    }

    if let Some(reason) = params.error.filter(|e| !e.is_empty()) {
        warn!(reason = %reason, "provider denied authorization");
        let body = format!("Authorization denied: {reason}");
        return reject(&context, AuthorizationFailure::Denied(reason), body);
    }

    match params.code.filter(|c| !c.is_empty()) {
        Some(code) => {
            if context.code_tx.try_send(code).is_err() {
                debug!("authorization code already delivered, dropping duplicate");
            }
            Html(SUCCESS_HTML).into_response()
        }
        None => reject(
            &context,
            AuthorizationFailure::MissingCode,
            "No code received".to_string(),
        ),
    }
}

fn reject(context: &CallbackContext, failure: AuthorizationFailure, body: String) -> Response {
    if context
        .error_tx
        .try_send(Error::Authorization(failure))
        .is_err()
    {
        debug!("callback error already delivered, dropping");
    }
    (StatusCode::BAD_REQUEST, body).into_response()
}
