//! OAuth2 Authorization Code session library
//!
//! Obtains a user's consent once through the browser, then keeps the access
//! token fresh for as long as the process runs. Nothing is written to disk.
//!
//! Credential flow:
//! 1. Caller builds a `config::ClientConfig` and an empty `CredentialStore`
//! 2. `Authorizer::authenticate()` opens the browser and waits on the
//!    localhost `CallbackListener` for the redirect
//! 3. The code is exchanged through a `TokenEndpoint` and the credential
//!    stored with `CredentialStore::update()`
//! 4. `RefreshScheduler::spawn()` refreshes shortly before each expiry
//! 5. Consumers call `CredentialStore::current_client()` per unit of work

pub mod authorize;
pub mod browser;
pub mod callback;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod pkce;
pub mod refresh;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use authorize::{AuthorizationPhase, Authorizer};
pub use browser::{BrowserLauncher, SystemBrowser};
pub use callback::CallbackListener;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use constants::*;
pub use credentials::{AuthorizedClient, Credential, CredentialStore, now_millis};
pub use error::{AuthorizationFailure, Error, Result};
pub use refresh::{RefreshHandle, RefreshScheduler, RefreshStatus, RetryPolicy};
pub use token::{HttpTokenEndpoint, TokenEndpoint, TokenResponse};
