//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env > default file name.
//! Every section is optional. `SPOTIFY_CLIENT_ID` overrides `oauth.client_id`
//! so a client ID can be injected without editing the file.

use serde::Deserialize;
use spotify_auth::{OAuthConfig, RetryPolicy};
use spotify_session::{
    DEFAULT_REDIRECT_TIMEOUT, DEFAULT_STORAGE_KEY, ProviderConfig, RefreshPolicy, ScopeSet,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "spotify-auth-agent.toml";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    pub http: HttpConfig,
    pub refresh: RefreshConfig,
    pub flow: FlowConfig,
    pub storage: StorageConfig,
}

/// Loopback listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            max_connections: 64,
        }
    }
}

/// Outbound HTTP retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            timeout_secs: policy.timeout.as_secs(),
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

/// Background refresh settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub network_retry_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            network_retry_secs: RefreshPolicy::default().network_retry_delay.as_secs(),
        }
    }
}

/// Interactive sign-in settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub redirect_timeout_secs: u64,
    /// Scopes used when a token request names none
    pub default_scopes: Vec<String>,
    /// Launch the system browser; when false the URL is only logged
    pub open_browser: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            redirect_timeout_secs: DEFAULT_REDIRECT_TIMEOUT.as_secs(),
            default_scopes: OAuthConfig::default_scopes(),
            open_browser: true,
        }
    }
}

/// Secret file settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("spotify-auth-agent.secrets.json"),
            key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load `path` when it exists, otherwise start from defaults. Only used
    /// for the implicit default path; an explicitly named file must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::from_toml("")
        }
    }

    fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Ok(client_id) = std::env::var("SPOTIFY_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                config.oauth.client_id = client_id.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        self.oauth
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.http.timeout_secs == 0 {
            return Err(common::Error::Config(
                "http.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.refresh.network_retry_secs == 0 {
            return Err(common::Error::Config(
                "refresh.network_retry_secs must be greater than 0".into(),
            ));
        }
        if self.flow.redirect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "flow.redirect_timeout_secs must be greater than 0".into(),
            ));
        }
        ScopeSet::new(&self.flow.default_scopes).map_err(|_| {
            common::Error::Config("flow.default_scopes must name at least one scope".into())
        })?;
        if self.storage.key.trim().is_empty() {
            return Err(common::Error::Config("storage.key must not be empty".into()));
        }
        Ok(())
    }

    /// Default scopes as a normalized set. Validated at load time.
    pub fn default_scopes(&self) -> common::Result<ScopeSet> {
        ScopeSet::new(&self.flow.default_scopes)
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    /// Library-level settings for `AuthProvider::initialize`.
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            oauth: self.oauth.clone(),
            retry: RetryPolicy {
                timeout: Duration::from_secs(self.http.timeout_secs),
                max_retries: self.http.max_retries,
                base_delay: Duration::from_millis(self.http.base_delay_ms),
            },
            refresh: RefreshPolicy {
                network_retry_delay: Duration::from_secs(self.refresh.network_retry_secs),
                ..RefreshPolicy::default()
            },
            redirect_timeout: Duration::from_secs(self.flow.redirect_timeout_secs),
            storage_key: self.storage.key.clone(),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The boolean is true when the path was named explicitly.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }
}
