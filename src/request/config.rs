use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::Priority;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How arguments are encoded into a request body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestSerializer {
    #[default]
    Form,
    Json,
}

/// How the response body is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSerializer {
    Raw,
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Per-request cache policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Time to live in seconds; negative disables caching
    pub ttl_secs: i64,
    pub version: i64,
    /// Token that must match for a stored entry to be reused (e.g. user id)
    pub sensitive_data: Option<String>,
    /// Deliver a valid cached payload before the network attempt
    pub preload: bool,
    /// Overrides the store-wide write mode
    pub write_async: Option<bool>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl_secs: -1,
            version: 0,
            sensitive_data: None,
            preload: false,
            write_async: None,
        }
    }
}

impl CachePolicy {
    pub fn with_ttl(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            ..Self::default()
        }
    }

    pub fn preloaded(mut self) -> Self {
        self.preload = true;
        self
    }
}

/// Retry limits of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryLimits {
    /// Number of retries after the first attempt; negative means unlimited
    pub count: i32,
    pub interval: Duration,
    /// Budget measured from the first start
    pub timeout: Option<Duration>,
}

/// Immutable description of a request
#[derive(Debug, Clone, bon::Builder)]
pub struct RequestConfig {
    /// Path relative to the base URL, or an absolute URL
    #[builder(into)]
    pub path: String,
    #[builder(into)]
    pub base_url: Option<String>,
    #[builder(default)]
    pub method: Method,
    pub arguments: Option<Value>,
    #[builder(default)]
    pub request_serializer: RequestSerializer,
    #[builder(default)]
    pub response_serializer: ResponseSerializer,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    pub authorization: Option<Authorization>,
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub priority: Priority,
    /// Falls back to the manager's `[retry]` settings
    pub retry: Option<RetryLimits>,
    #[builder(default)]
    pub cache: CachePolicy,
    /// Serialize through the manager's single-slot gate
    #[builder(default)]
    pub synchronous: bool,
    #[builder(default = true)]
    pub allows_cellular: bool,
    /// Stream the body to this file; disables cache preload
    pub download_path: Option<PathBuf>,
    #[builder(default)]
    pub shows_loading: bool,
    #[builder(into)]
    pub loading_text: Option<String>,
    #[builder(default)]
    pub shows_error: bool,
}

impl RequestConfig {
    /// Preloading from cache is meaningless for file downloads
    pub fn preloads_cache(&self) -> bool {
        self.cache.preload && self.download_path.is_none()
    }

    pub fn is_resumable_download(&self) -> bool {
        self.download_path.is_some()
    }
}
