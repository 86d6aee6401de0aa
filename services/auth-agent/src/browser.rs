//! System browser launcher

use spotify_session::{BrowserOpener, Error, Result};
use tracing::info;
use url::Url;

/// Opens the authorize URL in the user's default browser. The URL is always
/// logged so a headless user can copy it by hand.
#[derive(Debug, Clone, Copy)]
pub struct SystemBrowser {
    launch: bool,
}

impl SystemBrowser {
    pub fn new(launch: bool) -> Self {
        Self { launch }
    }
}

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        info!(url = %url, "open this URL to sign in to Spotify");
        if self.launch {
            open::that(url.as_str()).map_err(|e| Error::BrowserLaunch(e.to_string()))?;
        }
        Ok(())
    }
}
