//! Authorization state nonce, PKCE (RFC 7636) and authorization URL
//!
//! Every authorization attempt gets a fresh `AuthorizationState`. The nonce
//! is round-tripped through the browser redirect and compared in constant
//! time by the callback listener. PKCE adds a verifier that only this process
//! knows, so an intercepted code cannot be exchanged elsewhere.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Single-use CSRF nonce for one authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationState(String);

impl AuthorizationState {
    /// 32 random bytes, URL-safe base64 without padding (43 chars).
    pub fn generate() -> Self {
        Self(random_urlsafe::<32>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against the `state` a callback carried.
    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// Generate a PKCE code verifier: 64 random bytes → 86 base64url chars,
/// inside the 43-128 range RFC 7636 allows.
pub fn generate_verifier() -> String {
    random_urlsafe::<64>()
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the provider authorization URL.
///
/// Always asks for offline access and forces the consent screen so the
/// provider issues a refresh token even for a previously approved client.
pub fn build_authorization_url(
    config: &ClientConfig,
    state: &AuthorizationState,
    challenge: Option<&str>,
) -> Result<String> {
    let mut url = Url::parse(config.authorize_endpoint())
        .map_err(|e| Error::Configuration(format!("invalid authorize_endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params
            .append_pair("client_id", config.client_id())
            .append_pair("redirect_uri", config.redirect_url())
            .append_pair("response_type", "code")
            .append_pair("scope", &config.scopes().join(" "))
            .append_pair("state", state.as_str())
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        if let Some(challenge) = challenge {
            params
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256");
        }
    }

    Ok(url.into())
}

fn random_urlsafe<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
