//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from the OAUTH_CLIENT_SECRET env var or
//! client_secret_file, never stored in the TOML directly.

use common::Secret;
use oauth_session::{ClientConfig, RetryPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Status endpoint is disabled when the table is absent
    #[serde(default)]
    pub status: Option<StatusConfig>,
}

/// OAuth client registration and flow settings
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to OAUTH_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    pub scopes: Vec<String>,
    pub redirect_url: String,
    pub callback_port: u16,
    #[serde(default)]
    pub authorize_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_use_pkce")]
    pub use_pkce: bool,
}

/// Retry behaviour of the background refresh
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

/// Loopback status endpoint
#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_callback_timeout() -> u64 {
    oauth_session::DEFAULT_CALLBACK_TIMEOUT.as_secs()
}

fn default_refresh_margin() -> u64 {
    oauth_session::DEFAULT_REFRESH_MARGIN.as_secs()
}

fn default_use_pkce() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60
}

fn default_max_connections() -> usize {
    64
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl RefreshConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. OAUTH_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.refresh.max_attempts == 0 {
            return Err(common::Error::Config(
                "refresh.max_attempts must be at least 1".into(),
            ));
        }

        if config.refresh.multiplier.is_nan() || config.refresh.multiplier < 1.0 {
            return Err(common::Error::Config(format!(
                "refresh.multiplier must be >= 1.0, got: {}",
                config.refresh.multiplier
            )));
        }

        if let Some(ref status) = config.status {
            // Health output reveals session state; keep it off the network
            if !status.listen_addr.ip().is_loopback() {
                return Err(common::Error::Config(format!(
                    "status.listen_addr must be a loopback address, got: {}",
                    status.listen_addr
                )));
            }
            if status.max_connections == 0 {
                return Err(common::Error::Config(
                    "status.max_connections must be greater than 0".into(),
                ));
            }
        }

        // Resolve client secret: env var takes precedence over file
        if let Ok(secret) = std::env::var("OAUTH_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        Ok(config)
    }

    /// Build the validated library configuration from the `[oauth]` table.
    pub fn client_config(&self) -> common::Result<ClientConfig> {
        let oauth = &self.oauth;
        let secret = oauth.client_secret.clone().ok_or_else(|| {
            common::Error::Missing(
                "client secret (set OAUTH_CLIENT_SECRET or oauth.client_secret_file)".into(),
            )
        })?;

        let mut builder = ClientConfig::builder()
            .client_id(oauth.client_id.clone())
            .client_secret(secret)
            .scopes(oauth.scopes.iter().cloned())
            .redirect_url(oauth.redirect_url.clone())
            .callback_port(oauth.callback_port)
            .callback_timeout(Duration::from_secs(oauth.callback_timeout_secs))
            .refresh_margin(Duration::from_secs(oauth.refresh_margin_secs))
            .use_pkce(oauth.use_pkce);
        if let Some(ref endpoint) = oauth.authorize_endpoint {
            builder = builder.authorize_endpoint(endpoint.clone());
        }
        if let Some(ref endpoint) = oauth.token_endpoint {
            builder = builder.token_endpoint(endpoint.clone());
        }

        builder
            .build()
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-keeper.toml")
    }
}
