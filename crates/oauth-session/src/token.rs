//! OAuth token endpoint: code exchange and refresh
//!
//! Both grants POST `application/x-www-form-urlencoded` bodies to the same
//! endpoint with the client credentials in the body. `TokenEndpoint` is the
//! seam the authorizer and the refresh scheduler talk through;
//! `HttpTokenEndpoint` is the reqwest implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::constants::DEFAULT_EXPIRES_IN_SECS;
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds; `Credential` converts it to an
/// absolute timestamp. Providers may omit `refresh_token` on refresh.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    /// Space-separated scopes actually granted
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Boxed future returned by [`TokenEndpoint`] methods.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;

/// Provider token endpoint.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be shared as
/// `Arc<dyn TokenEndpoint>`.
pub trait TokenEndpoint: Send + Sync {
    /// `grant_type=authorization_code`
    fn exchange_code<'a>(&'a self, code: &'a str, verifier: Option<&'a str>) -> TokenFuture<'a>;

    /// `grant_type=refresh_token`
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a>;
}

/// reqwest-backed token endpoint built from a `ClientConfig`.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client, config: Arc<ClientConfig>) -> Self {
        Self { client, config }
    }

    async fn post(&self, grant: &'static str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let started = std::time::Instant::now();
        let result = self.send(form).await;
        metrics::histogram!("oauth_token_request_duration_seconds", "grant" => grant)
            .record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "success",
            Err(Error::InvalidGrant(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::counter!("oauth_token_requests_total", "grant" => grant, "outcome" => outcome)
            .increment(1);
        result
    }

    async fn send(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(self.config.token_endpoint())
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Network(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 or an OAuth `invalid_grant` means the code or refresh
            // token is revoked, expired or already used
            if status.as_u16() == 401 || status.as_u16() == 403 || body.contains("invalid_grant") {
                return Err(Error::InvalidGrant(format!("{status}: {body}")));
            }

            return Err(Error::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        let status = status.as_u16();
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenEndpoint {
                status,
                body: format!("invalid token response: {e}"),
            })
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange_code<'a>(&'a self, code: &'a str, verifier: Option<&'a str>) -> TokenFuture<'a> {
        Box::pin(async move {
            debug!(pkce = verifier.is_some(), "exchanging authorization code");
            let mut form = vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id()),
                ("client_secret", self.config.client_secret().expose().as_str()),
                ("redirect_uri", self.config.redirect_url()),
            ];
            if let Some(verifier) = verifier {
                form.push(("code_verifier", verifier));
            }
            self.post("authorization_code", &form).await
        })
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            debug!("refreshing access token");
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id()),
                ("client_secret", self.config.client_secret().expose().as_str()),
            ];
            self.post("refresh_token", &form).await
        })
    }
}
