use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::request::RetryLimits;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub mock: MockSettings,
}

/// Defaults applied to every transport call
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSettings {
    /// Base URL used by requests that do not declare their own
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    pub proxy: Option<String>,
    #[serde(default = "default_true")]
    pub allows_cellular: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Bearer token (loaded from environment, not from config file)
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: default_user_agent(),
            proxy: None,
            allows_cellular: true,
            max_redirects: default_max_redirects(),
            auth_token: None,
        }
    }
}

impl TransportSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("courier/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    10
}

/// Cache backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Fjall,
    Memory,
}

/// Response cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub backend: CacheBackendKind,
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    /// Host application version stamped into every cache entry
    #[serde(default = "default_app_version")]
    pub app_version: String,
    /// Write cache entries off the completion path
    #[serde(default = "default_true")]
    pub write_async: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            path: default_cache_path(),
            app_version: default_app_version(),
            write_async: true,
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Retry limits used by requests that do not declare their own
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Number of retries; negative means unlimited
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub interval_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl RetrySettings {
    pub fn limits(&self) -> RetryLimits {
        RetryLimits {
            count: self.count,
            interval: Duration::from_millis(self.interval_ms),
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Debug mock responses substituted for failed requests
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Request path (leading `/` optional) -> response body
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    #[serde(default = "default_mock_status")]
    pub status: u16,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            responses: BTreeMap::new(),
            status: default_mock_status(),
        }
    }
}

fn default_mock_status() -> u16 {
    200
}
