//! Client configuration for the Authorization Code grant
//!
//! Built once through `ClientConfigBuilder`, validated, and immutable
//! afterwards. Validation happens before any socket is bound or request sent.

use std::time::Duration;

use common::Secret;
use reqwest::Url;
use tracing::warn;

use crate::constants::{
    DEFAULT_CALLBACK_TIMEOUT, DEFAULT_REFRESH_MARGIN, GOOGLE_AUTHORIZE_ENDPOINT,
    GOOGLE_TOKEN_ENDPOINT,
};
use crate::error::{Error, Result};

/// Validated OAuth client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    client_id: String,
    client_secret: Secret<String>,
    scopes: Vec<String>,
    redirect_url: String,
    redirect_path: String,
    callback_port: u16,
    authorize_endpoint: String,
    token_endpoint: String,
    callback_timeout: Duration,
    refresh_margin: Duration,
    use_pkce: bool,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &Secret<String> {
        &self.client_secret
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    /// Path component of `redirect_url`; the callback listener answers here.
    pub fn redirect_path(&self) -> &str {
        &self.redirect_path
    }

    pub fn callback_port(&self) -> u16 {
        self.callback_port
    }

    pub fn authorize_endpoint(&self) -> &str {
        &self.authorize_endpoint
    }

    pub fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    pub fn callback_timeout(&self) -> Duration {
        self.callback_timeout
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    pub fn use_pkce(&self) -> bool {
        self.use_pkce
    }
}

/// Builder for [`ClientConfig`]. Endpoint, timeout and margin fields fall
/// back to the Google defaults in `constants`.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    client_id: Option<String>,
    client_secret: Option<Secret<String>>,
    scopes: Vec<String>,
    redirect_url: Option<String>,
    callback_port: Option<u16>,
    authorize_endpoint: Option<String>,
    token_endpoint: Option<String>,
    callback_timeout: Option<Duration>,
    refresh_margin: Option<Duration>,
    use_pkce: Option<bool>,
}

impl ClientConfigBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, client_secret: impl Into<Secret<String>>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn redirect_url(mut self, redirect_url: impl Into<String>) -> Self {
        self.redirect_url = Some(redirect_url.into());
        self
    }

    pub fn callback_port(mut self, port: u16) -> Self {
        self.callback_port = Some(port);
        self
    }

    pub fn authorize_endpoint(mut self, url: impl Into<String>) -> Self {
        self.authorize_endpoint = Some(url.into());
        self
    }

    pub fn token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = Some(url.into());
        self
    }

    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = Some(margin);
        self
    }

    pub fn use_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = Some(enabled);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        let client_id = required("client_id", self.client_id)?;
        let client_secret = self
            .client_secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("client_secret is required".into()))?;
        let redirect_url = required("redirect_url", self.redirect_url)?;

        let scopes: Vec<String> = self
            .scopes
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            return Err(Error::Configuration(
                "at least one scope is required".into(),
            ));
        }

        let callback_port = match self.callback_port {
            Some(0) | None => {
                return Err(Error::Configuration(
                    "callback_port must be a non-zero port".into(),
                ));
            }
            Some(port) => port,
        };

        let redirect = parse_url("redirect_url", &redirect_url)?;
        if redirect.port_or_known_default() != Some(callback_port) {
            warn!(
                redirect_url = %redirect_url,
                callback_port, "redirect_url port differs from callback_port"
            );
        }
        let redirect_path = redirect.path().to_owned();

        let authorize_endpoint = self
            .authorize_endpoint
            .unwrap_or_else(|| GOOGLE_AUTHORIZE_ENDPOINT.to_owned());
        parse_url("authorize_endpoint", &authorize_endpoint)?;
        let token_endpoint = self
            .token_endpoint
            .unwrap_or_else(|| GOOGLE_TOKEN_ENDPOINT.to_owned());
        parse_url("token_endpoint", &token_endpoint)?;

        let callback_timeout = self.callback_timeout.unwrap_or(DEFAULT_CALLBACK_TIMEOUT);
        if callback_timeout.is_zero() {
            return Err(Error::Configuration(
                "callback_timeout must be greater than 0".into(),
            ));
        }

        Ok(ClientConfig {
            client_id,
            client_secret,
            scopes,
            redirect_url,
            redirect_path,
            callback_port,
            authorize_endpoint,
            token_endpoint,
            callback_timeout,
            refresh_margin: self.refresh_margin.unwrap_or(DEFAULT_REFRESH_MARGIN),
            use_pkce: self.use_pkce.unwrap_or(true),
        })
    }
}

fn required(name: &str, value: Option<String>) -> Result<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Configuration(format!("{name} is required")))
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| Error::Configuration(format!("{name} is not a valid URL ({value}): {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::Configuration(format!(
            "{name} must use http or https, got: {value}"
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClientConfigBuilder {
        ClientConfig::builder()
            .client_id("client-123.apps.googleusercontent.com")
            .client_secret("s3cret")
            .scopes(["https://www.googleapis.com/auth/gmail.readonly"])
            .redirect_url("http://localhost:8085/")
            .callback_port(8085)
    }

    #[test]
    fn builds_with_defaults() {
        let config = valid().build().unwrap();
        assert_eq!(config.authorize_endpoint(), GOOGLE_AUTHORIZE_ENDPOINT);
        assert_eq!(config.token_endpoint(), GOOGLE_TOKEN_ENDPOINT);
        assert_eq!(config.callback_timeout(), Duration::from_secs(120));
        assert_eq!(config.refresh_margin(), Duration::from_secs(300));
        assert!(config.use_pkce());
        assert_eq!(config.callback_port(), 8085);
    }

    #[test]
    fn missing_client_id_is_rejected() {
        let err = ClientConfig::builder()
            .client_secret("s")
            .scopes(["a"])
            .redirect_url("http://localhost:8085/")
            .callback_port(8085)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("client_id")));
    }

    #[test]
    fn blank_values_are_rejected() {
        assert!(valid().client_id("   ").build().is_err());
        assert!(valid().client_secret("").build().is_err());
        assert!(valid().redirect_url("").build().is_err());
        assert!(valid().scopes(Vec::<String>::new()).build().is_err());
        assert!(valid().scopes([" ", ""]).build().is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let err = valid().callback_port(0).build().unwrap_err();
        assert!(err.to_string().contains("callback_port"));
    }

    #[test]
    fn non_http_endpoints_are_rejected() {
        assert!(valid().token_endpoint("ftp://example.com/token").build().is_err());
        assert!(valid().authorize_endpoint("not a url").build().is_err());
        assert!(valid().redirect_url("urn:ietf:wg:oauth:2.0:oob").build().is_err());
    }

    #[test]
    fn redirect_path_is_taken_from_redirect_url() {
        assert_eq!(valid().build().unwrap().redirect_path(), "/");
        let config = valid()
            .redirect_url("http://127.0.0.1:8085/oauth2callback")
            .build()
            .unwrap();
        assert_eq!(config.redirect_path(), "/oauth2callback");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(valid().callback_timeout(Duration::ZERO).build().is_err());
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let config = valid().build().unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cret"), "client secret leaked: {debug}");
    }
}
