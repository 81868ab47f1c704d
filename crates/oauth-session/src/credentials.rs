//! Credential storage and the authorized client derived from it
//!
//! The store holds the current credential together with the HTTP client built
//! from it. Both live under one `RwLock` so readers always see a matching
//! pair: `update` is the only writer and swaps them in a single step.
//!
//! Nothing is persisted. A process restart means a new interactive grant.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An OAuth access credential.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Debug, Clone)]
pub struct Credential {
    pub access: Secret<String>,
    /// Absent only if the provider never issued one
    pub refresh: Option<Secret<String>>,
    pub expires: u64,
    pub scopes: Vec<String>,
}

impl Credential {
    /// Build a credential from a token endpoint response received at `now`.
    ///
    /// A refresh response without `refresh_token` keeps `previous_refresh`.
    /// Without a `scope` field the requested scopes are assumed granted.
    pub fn from_token_response(
        response: TokenResponse,
        requested_scopes: &[String],
        previous_refresh: Option<&Secret<String>>,
        now: u64,
    ) -> Self {
        let scopes = match response.scope.as_deref() {
            Some(granted) if !granted.trim().is_empty() => {
                granted.split_whitespace().map(str::to_owned).collect()
            }
            _ => requested_scopes.to_vec(),
        };

        Self {
            access: response.access_token,
            refresh: response
                .refresh_token
                .filter(|r| !r.is_empty())
                .or_else(|| previous_refresh.cloned()),
            expires: now.saturating_add(response.expires_in.saturating_mul(1000)),
            scopes,
        }
    }

    /// Time left until `expires - margin`, zero if that moment has passed.
    pub fn refresh_delay(&self, margin: Duration, now: u64) -> Duration {
        let margin_millis = u64::try_from(margin.as_millis()).unwrap_or(u64::MAX);
        let due = self.expires.saturating_sub(margin_millis);
        Duration::from_millis(due.saturating_sub(now))
    }

    /// Like [`refresh_delay`](Self::refresh_delay) for a credential that was
    /// just issued: never earlier than halfway through its remaining
    /// lifetime, and never under `floor`. Tokens that live no longer than
    /// the margin would otherwise be refreshed back to back.
    pub fn paced_refresh_delay(&self, margin: Duration, floor: Duration, now: u64) -> Duration {
        let half_life = Duration::from_millis(self.expires.saturating_sub(now) / 2);
        self.refresh_delay(margin, now).max(half_life).max(floor)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires <= now
    }
}

/// HTTP client that sends `Authorization: Bearer <access token>` on every
/// request.
///
/// Derived from the store's current credential; stale as soon as the store
/// is updated. Consumers should call `CredentialStore::current_client` per
/// unit of work rather than hold one long-term.
#[derive(Clone)]
pub struct AuthorizedClient {
    http: reqwest::Client,
    generation: u64,
    expires: u64,
}

impl AuthorizedClient {
    fn build(credential: &Credential, generation: u64) -> Result<Self> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access.expose()))
            .map_err(|e| Error::Client(format!("access token is not a valid header value: {e}")))?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;

        Ok(Self {
            http,
            generation,
            expires: credential.expires,
        })
    }

    /// Which `update` produced this client (1 for the first credential).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Expiry of the credential this client carries (unix ms).
    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn get(&self, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        self.http.get(url)
    }

    pub fn post(&self, url: impl reqwest::IntoUrl) -> reqwest::RequestBuilder {
        self.http.post(url)
    }

    pub fn request(
        &self,
        method: reqwest::Method,
        url: impl reqwest::IntoUrl,
    ) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }
}

impl std::fmt::Debug for AuthorizedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedClient")
            .field("generation", &self.generation)
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

struct Current {
    credential: Credential,
    client: AuthorizedClient,
}

#[derive(Default)]
struct State {
    current: Option<Current>,
    generation: u64,
}

/// Concurrency-safe holder of the current credential and its client.
#[derive(Default)]
pub struct CredentialStore {
    state: RwLock<State>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the credential and rebuild the client in one step.
    ///
    /// Rejects a credential that is already expired; on any error the store
    /// keeps its previous contents.
    pub async fn update(&self, credential: Credential) -> Result<AuthorizedClient> {
        if credential.is_expired(now_millis()) {
            return Err(Error::ExpiredCredential(credential.expires));
        }

        let mut state = self.state.write().await;
        let generation = state.generation + 1;
        let client = AuthorizedClient::build(&credential, generation)?;
        let expires = credential.expires;
        state.generation = generation;
        state.current = Some(Current {
            credential,
            client: client.clone(),
        });
        drop(state);

        if generation == 1 {
            info!(expires, "credential stored");
        } else {
            debug!(generation, expires, "credential replaced");
        }
        Ok(client)
    }

    /// The client derived from the most recently stored credential.
    pub async fn current_client(&self) -> Result<AuthorizedClient> {
        let state = self.state.read().await;
        state
            .current
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or(Error::NotAuthenticated)
    }

    /// Snapshot of the current credential.
    pub async fn current(&self) -> Option<Credential> {
        let state = self.state.read().await;
        state.current.as_ref().map(|c| c.credential.clone())
    }

    /// Expiry of the current credential (unix ms).
    pub async fn expires(&self) -> Option<u64> {
        let state = self.state.read().await;
        state.current.as_ref().map(|c| c.credential.expires)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.current.is_some()
    }
}
