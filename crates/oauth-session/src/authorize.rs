//! Interactive Authorization Code grant
//!
//! `Authorizer::authenticate` runs the whole browser round trip once:
//!
//! 1. fresh state nonce (and PKCE pair when enabled)
//! 2. bind the callback listener, then open the authorization URL
//! 3. wait for the redirect, bounded by the configured callback timeout
//! 4. exchange the code at the token endpoint
//! 5. store the credential
//!
//! Phases: `Idle → AwaitingRedirect → ExchangingCode → Authenticated | Failed`.
//! Only one attempt can be live per authorizer; a second concurrent call is
//! refused without touching the first. Dropping an `authenticate` future
//! mid-flight counts as a failed attempt and frees the slot.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::{BrowserLauncher, SystemBrowser};
use crate::callback::CallbackListener;
use crate::config::ClientConfig;
use crate::credentials::{Credential, CredentialStore, now_millis};
use crate::error::{AuthorizationFailure, Error, Result};
use crate::pkce::{AuthorizationState, PkcePair, build_authorization_url};
use crate::token::{HttpTokenEndpoint, TokenEndpoint};

/// Where an authorizer is in its single authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationPhase {
    Idle,
    AwaitingRedirect,
    ExchangingCode,
    Authenticated,
    Failed,
}

impl AuthorizationPhase {
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AuthorizationPhase::AwaitingRedirect | AuthorizationPhase::ExchangingCode
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            AuthorizationPhase::Idle => "idle",
            AuthorizationPhase::AwaitingRedirect => "awaiting_redirect",
            AuthorizationPhase::ExchangingCode => "exchanging_code",
            AuthorizationPhase::Authenticated => "authenticated",
            AuthorizationPhase::Failed => "failed",
        }
    }
}

/// Drives the Authorization Code grant and populates the credential store.
pub struct Authorizer {
    config: Arc<ClientConfig>,
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    browser: Arc<dyn BrowserLauncher>,
    phase: watch::Sender<AuthorizationPhase>,
}

impl Authorizer {
    /// Authorizer using the HTTP token endpoint and the system browser.
    pub fn new(config: Arc<ClientConfig>, store: Arc<CredentialStore>) -> Self {
        let endpoint = Arc::new(HttpTokenEndpoint::new(
            reqwest::Client::new(),
            config.clone(),
        ));
        Self::with_parts(config, store, endpoint, Arc::new(SystemBrowser))
    }

    pub fn with_parts(
        config: Arc<ClientConfig>,
        store: Arc<CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let (phase, _) = watch::channel(AuthorizationPhase::Idle);
        Self {
            config,
            store,
            endpoint,
            browser,
            phase,
        }
    }

    pub fn phase(&self) -> AuthorizationPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorizationPhase> {
        self.phase.subscribe()
    }

    /// The token endpoint, shared with the refresh scheduler.
    pub fn token_endpoint(&self) -> Arc<dyn TokenEndpoint> {
        self.endpoint.clone()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Run the interactive grant and store the resulting credential.
    pub async fn authenticate(&self) -> Result<Credential> {
        let attempt = self.begin_attempt()?;

        let result = self.run_attempt().await;
        match &result {
            Ok(credential) => {
                attempt.finish(AuthorizationPhase::Authenticated);
                info!(
                    expires = credential.expires,
                    scopes = credential.scopes.len(),
                    "authorization complete"
                );
            }
            Err(e) => {
                attempt.finish(AuthorizationPhase::Failed);
                warn!(error = %e, "authorization failed");
            }
        }
        result
    }

    /// Claim the single live-attempt slot.
    fn begin_attempt(&self) -> Result<AttemptGuard<'_>> {
        let mut claimed = false;
        self.phase.send_if_modified(|phase| {
            if phase.is_live() {
                return false;
            }
            *phase = AuthorizationPhase::AwaitingRedirect;
            claimed = true;
            true
        });

        if claimed {
            Ok(AttemptGuard {
                phase: &self.phase,
                finished: false,
            })
        } else {
            Err(Error::Authorization(AuthorizationFailure::AttemptInProgress))
        }
    }

    async fn run_attempt(&self) -> Result<Credential> {
        let state = AuthorizationState::generate();
        let pkce = self.config.use_pkce().then(PkcePair::generate);
        let url = build_authorization_url(
            &self.config,
            &state,
            pkce.as_ref().map(|p| p.challenge.as_str()),
        )?;

        // Bind before the browser opens so a fast redirect cannot beat us
        let listener = CallbackListener::bind(self.config.callback_port())
            .await?
            .with_path(self.config.redirect_path());

        eprintln!("Opening browser to visit the authorization URL:\n{url}\n");
        if let Err(e) = self.browser.open(&url) {
            warn!(error = %e, "could not open browser");
            eprintln!("Failed to open browser automatically. Please open this URL manually:\n{url}\n");
        }

        let code = listener
            .await_callback(state, self.config.callback_timeout())
            .await?;

        self.phase.send_replace(AuthorizationPhase::ExchangingCode);
        let response = self
            .endpoint
            .exchange_code(&code, pkce.as_ref().map(|p| p.verifier.as_str()))
            .await?;

        let credential =
            Credential::from_token_response(response, self.config.scopes(), None, now_millis());
        if credential.refresh.is_none() {
            warn!("provider issued no refresh token; automatic refresh will not be possible");
        }

        self.store.update(credential.clone()).await?;
        Ok(credential)
    }
}

/// Holds the live-attempt slot. Publishes `Failed` if dropped before
/// `finish`, so a cancelled attempt never blocks the next one.
struct AttemptGuard<'a> {
    phase: &'a watch::Sender<AuthorizationPhase>,
    finished: bool,
}

impl AttemptGuard<'_> {
    fn finish(mut self, outcome: AuthorizationPhase) {
        self.finished = true;
        self.phase.send_replace(outcome);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("authorization attempt abandoned before completion");
            self.phase.send_replace(AuthorizationPhase::Failed);
        }
    }
}
