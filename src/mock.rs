//! Debug mock responses
//!
//! When enabled, a failed attempt whose path has a registered mock is turned
//! into a success carrying the mock body.

use std::collections::BTreeMap;

use crate::config::MockSettings;
use crate::error::RequestError;
use crate::request::Request;
use crate::transport::TransportResponse;

pub trait MockProvider: Send + Sync {
    /// Whether this failure may be replaced by a mock
    fn accepts(&self, request: &Request, error: &RequestError) -> bool;

    /// Response substituted for the failed one
    fn respond(&self, request: &Request) -> Option<TransportResponse>;
}

/// Mock bodies keyed by request path
#[derive(Debug, Clone)]
pub struct StaticMockProvider {
    responses: BTreeMap<String, String>,
    status: u16,
}

impl StaticMockProvider {
    pub fn new(status: u16) -> Self {
        Self {
            responses: BTreeMap::new(),
            status,
        }
    }

    /// `None` unless mocking is enabled
    pub fn from_settings(settings: &MockSettings) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        let mut provider = Self::new(settings.status);
        for (path, body) in &settings.responses {
            provider = provider.with_response(path, body.clone());
        }
        Some(provider)
    }

    pub fn with_response(mut self, path: &str, body: impl Into<String>) -> Self {
        self.responses.insert(normalize(path).to_string(), body.into());
        self
    }

    fn lookup(&self, request: &Request) -> Option<&String> {
        self.responses.get(normalize(&request.config().path))
    }
}

impl MockProvider for StaticMockProvider {
    fn accepts(&self, request: &Request, error: &RequestError) -> bool {
        !error.is_cancellation() && self.lookup(request).is_some()
    }

    fn respond(&self, request: &Request) -> Option<TransportResponse> {
        let body = self.lookup(request)?;
        Some(
            TransportResponse::ok(self.status, body.clone())
                .with_header("content-type", mime::APPLICATION_JSON.to_string()),
        )
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}
