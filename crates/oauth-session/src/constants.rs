//! Provider defaults and fixed timings
//!
//! The endpoint defaults point at Google's OAuth2 service. Any provider that
//! implements the standard Authorization Code grant can be used by overriding
//! them in `ClientConfig`.

use std::time::Duration;

/// Google authorization endpoint (browser redirect)
pub const GOOGLE_AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/auth";

/// Google token endpoint for code exchange and token refresh
pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// How long the callback listener waits for the browser redirect.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Lead time before expiry at which the scheduler refreshes.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Shortest wait between two successful refreshes.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on graceful shutdown of the callback server before it is aborted.
pub const CALLBACK_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Used when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Page served to the browser after a successful redirect.
pub const SUCCESS_HTML: &str =
    "<h1>Authorization Successful</h1><p>You can close this window now.</p>";
