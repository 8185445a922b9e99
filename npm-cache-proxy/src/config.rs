//! # Configuration Management
//!
//! Everything the proxy needs to know about its environment is read once at
//! startup into a [`Config`] value and handed to the components that need it.
//! Nothing inside the core looks configuration up on its own.
//!
//! - [`ServerConfig`]: listener addresses and the public origin
//! - [`UpstreamSettings`]: registry origin, TLS, proxy and credentials
//! - [`CacheConfig`]: on-disk cache location and freshness mode
//! - [`MemoConfig`]: in-process packument memo bounds
//! - [`LogSettings`]: tracing output
//!
//! ```rust,no_run
//! # use npm_cache_proxy::config::Config;
//! let config = Config::load_or_default("npm-cache-proxy.json")?;
//! # Ok::<(), npm_cache_proxy::AppError>(())
//! ```

use crate::error::{AppError, AppResult};
use npm_cache_logging::LogSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamSettings,
    pub cache: CacheConfig,
    pub memo: MemoConfig,
    pub logging: LogSettings,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub host: String,
    /// Port of the npm-facing registry listener
    pub registry_port: u16,
    /// Port of the browsable cache index
    pub web_port: u16,
    /// Origin written into rewritten tarball URLs; defaults to
    /// `http://localhost:<registry_port>`
    pub public_url: Option<String>,
    /// Emit one log line per handled request
    pub log_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            registry_port: 22000,
            web_port: 22001,
            public_url: None,
            log_requests: true,
        }
    }
}

/// Connection settings for the upstream registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Registry origin, e.g. `https://registry.npmjs.org`
    pub registry: String,
    /// Idle limit for connecting and between body reads
    pub timeout_secs: u64,
    pub user_agent: String,
    /// HTTP(S) proxy for outgoing requests
    pub proxy: Option<String>,
    /// Reject invalid upstream certificates
    pub strict_ssl: bool,
    /// Extra PEM bundle trusted for upstream TLS
    pub ca_file: Option<PathBuf>,
    /// Idle connections kept per upstream host
    pub max_sockets: Option<usize>,
    /// Headers added to every upstream request
    pub headers: BTreeMap<String, String>,
    pub auth: AuthConfig,
    /// Request full packuments instead of the abbreviated install document
    pub full_metadata: bool,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            registry: "https://registry.npmjs.org".to_string(),
            timeout_secs: 30,
            user_agent: format!("npm-cache-proxy/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            strict_ssl: true,
            ca_file: None,
            max_sockets: None,
            headers: BTreeMap::new(),
            auth: AuthConfig::default(),
            full_metadata: false,
        }
    }
}

impl UpstreamSettings {
    /// Registry origin without a trailing slash.
    pub fn registry_origin(&self) -> &str {
        self.registry.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Registry credentials, mirroring npm's `_authToken`, `username`/`_password`
/// and legacy `_auth` settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-encoded `user:pass` in base64
    pub auth: Option<String>,
    /// Send credentials to hosts other than the registry (e.g. tarball CDNs)
    pub always_auth: bool,
}

/// Freshness policy for cached upstream responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Serve fresh entries, revalidate stale ones
    #[default]
    Default,
    /// Always revalidate with the registry (`--prefer-online`)
    NoCache,
    /// Use any cached entry regardless of age (`--prefer-offline`)
    ForceCache,
    /// Never touch the network (`--offline`)
    OnlyIfCached,
}

impl CacheMode {
    /// Map npm-style switches onto a mode; `offline` wins over the others.
    pub fn from_flags(offline: bool, prefer_offline: bool, prefer_online: bool) -> Self {
        if offline {
            CacheMode::OnlyIfCached
        } else if prefer_offline {
            CacheMode::ForceCache
        } else if prefer_online {
            CacheMode::NoCache
        } else {
            CacheMode::Default
        }
    }
}

/// On-disk cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("npm-cache-proxy");
        Self {
            dir,
            mode: CacheMode::Default,
        }
    }
}

/// Bounds of the in-process packument memo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Total weight (sum of packument content lengths) before eviction
    pub max_weight_bytes: u64,
    /// Lifetime of an entry from insertion
    pub ttl_secs: u64,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            max_weight_bytes: 200 * 1024 * 1024,
            ttl_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not match the expected shape.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config_str = fs::read_to_string(path)?;
        let config = serde_json::from_str(&config_str)?;
        Ok(config)
    }

    /// Load configuration from file with fallback to defaults.
    ///
    /// A missing file yields [`Config::default`]; a file that exists but
    /// does not parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Origin the proxy advertises in rewritten tarball URLs.
    pub fn public_origin(&self) -> String {
        match &self.server.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.server.registry_port),
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> AppResult<()> {
        url::Url::parse(&self.upstream.registry).map_err(|e| {
            AppError::BadRequest(format!(
                "Invalid upstream registry URL {}: {e}",
                self.upstream.registry
            ))
        })?;
        if let Some(public) = &self.server.public_url {
            url::Url::parse(public).map_err(|e| {
                AppError::BadRequest(format!("Invalid public URL {public}: {e}"))
            })?;
        }
        if self.server.registry_port == self.server.web_port {
            return Err(AppError::BadRequest(format!(
                "Registry and web listeners cannot share port {}",
                self.server.registry_port
            )));
        }
        Ok(())
    }
}
