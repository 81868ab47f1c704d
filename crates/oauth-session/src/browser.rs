//! Opening the authorization URL in the user's browser

use tracing::debug;

/// Something that can show the authorization URL to the user.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the platform default browser (`xdg-open`, `open`, `start`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        debug!("launching default browser");
        open::that_detached(url)
    }
}
