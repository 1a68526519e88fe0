//! Error taxonomy shared by requests, the cache store and request groups

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Reasons a cached entry cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Cache expired")]
    Expired,

    #[error("Cache version mismatch: stored {stored}, expected {expected}")]
    VersionMismatch { stored: i64, expected: i64 },

    #[error("Cache sensitive data mismatch")]
    SensitiveDataMismatch,

    #[error("App version mismatch: stored {stored}, current {current}")]
    AppVersionMismatch { stored: String, current: String },

    #[error("Invalid cache time (caching disabled)")]
    InvalidTtl,

    #[error("Invalid cache metadata")]
    InvalidMetadata,

    #[error("Invalid cache data")]
    InvalidData,

    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Errors for which the stored entry is deleted as soon as they are observed
    pub fn invalidates_entry(&self) -> bool {
        matches!(
            self,
            CacheError::Expired
                | CacheError::VersionMismatch { .. }
                | CacheError::SensitiveDataMismatch
                | CacheError::AppVersionMismatch { .. }
        )
    }
}

impl From<fjall::Error> for CacheError {
    fn from(value: fjall::Error) -> Self {
        CacheError::Backend(value.to_string())
    }
}

impl From<object_store::Error> for CacheError {
    fn from(value: object_store::Error) -> Self {
        CacheError::Backend(value.to_string())
    }
}

/// Network-level failure categories reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Redirect,
    Body,
    Io,
    Cancelled,
    Other,
}

/// Error attached to a Request once it fails
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    #[error("Invalid response format: {0}")]
    InvalidResponseFormat(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Custom(Arc<dyn StdError + Send + Sync>),

    #[error("Unknown error")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, RequestError>;

impl RequestError {
    /// Wrap an arbitrary error raised by a caller-supplied hook
    pub fn custom<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        RequestError::Custom(Arc::new(error))
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        RequestError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// True when the failure was produced by the request pipeline itself
    /// (status, format or validation), as opposed to the network.
    pub fn is_request_error(&self) -> bool {
        self.any_in_chain(&|e| {
            matches!(
                e,
                RequestError::InvalidStatusCode(_)
                    | RequestError::InvalidResponseFormat(_)
                    | RequestError::InvalidUrl(_)
                    | RequestError::Serialization(_)
            )
        })
    }

    pub fn is_connectivity_error(&self) -> bool {
        self.any_in_chain(&|e| {
            matches!(
                e,
                RequestError::Transport {
                    kind: TransportErrorKind::Timeout | TransportErrorKind::Connect,
                    ..
                }
            )
        })
    }

    pub fn is_cancellation(&self) -> bool {
        self.any_in_chain(&|e| {
            matches!(
                e,
                RequestError::Cancelled
                    | RequestError::Transport {
                        kind: TransportErrorKind::Cancelled,
                        ..
                    }
            )
        })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestError::InvalidStatusCode(code) => Some(*code),
            _ => None,
        }
    }

    fn any_in_chain(&self, pred: &dyn Fn(&RequestError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        let RequestError::Custom(inner) = self else {
            return false;
        };
        let root: &(dyn StdError + 'static) = inner.as_ref();
        let mut current = Some(root);
        while let Some(err) = current {
            if let Some(request_error) = err.downcast_ref::<RequestError>() {
                if request_error.any_in_chain(pred) {
                    return true;
                }
            }
            current = err.source();
        }
        false
    }
}

/// Terminal failure of a Batch or Chain
#[derive(Debug, Clone, Error)]
pub enum GroupError {
    #[error("{failed} of {total} requests failed: {first}")]
    Failed {
        failed: usize,
        total: usize,
        first: RequestError,
    },

    #[error("Request group stopped before completion")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("wrapped: {inner}")]
    struct Wrapper {
        #[source]
        inner: RequestError,
    }

    #[test]
    fn test_classification_direct() {
        assert!(RequestError::InvalidStatusCode(500).is_request_error());
        assert!(!RequestError::InvalidStatusCode(500).is_connectivity_error());

        let timeout = RequestError::transport(TransportErrorKind::Timeout, "timed out");
        assert!(timeout.is_connectivity_error());
        assert!(!timeout.is_request_error());

        assert!(RequestError::Cancelled.is_cancellation());
    }

    #[test]
    fn test_classification_walks_nested_errors() {
        let nested = RequestError::custom(Wrapper {
            inner: RequestError::transport(TransportErrorKind::Connect, "refused"),
        });
        assert!(nested.is_connectivity_error());
        assert!(!nested.is_cancellation());

        let nested_status = RequestError::custom(Wrapper {
            inner: RequestError::InvalidStatusCode(404),
        });
        assert!(nested_status.is_request_error());
    }

    #[test]
    fn test_cache_errors_that_invalidate() {
        assert!(CacheError::Expired.invalidates_entry());
        assert!(CacheError::SensitiveDataMismatch.invalidates_entry());
        assert!(!CacheError::InvalidData.invalidates_entry());
        assert!(!CacheError::InvalidTtl.invalidates_entry());
    }
}
