//! Transport abstraction
//!
//! The manager never talks to the network directly. It hands a fully built
//! [`TransportCall`] plus a [`TaskControl`] to a [`Transport`] and awaits the
//! resulting [`TransportResponse`]. The control handle carries suspend/resume,
//! cancellation and the priority hint for the in-flight task.

pub mod builder;
pub mod http;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::error::{RequestError, TransportErrorKind};
use crate::request::{Authorization, Method};

pub use builder::build_call;
pub use http::{HttpTransport, partial_download_path};

/// Scheduling hint forwarded to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Default,
    High,
}

/// Fully built description of one network call
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub authorization: Option<Authorization>,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub allows_cellular: bool,
    pub priority: Priority,
    /// Stream the body to this path instead of memory (resumable)
    pub download_path: Option<PathBuf>,
}

impl TransportCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }
}

/// Response body as produced by the transport
#[derive(Debug, Clone, Default)]
pub enum TransportBody {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Body was written to disk (download calls)
    File(PathBuf),
}

/// (response metadata, payload, error) triple
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub body: TransportBody,
    pub error: Option<RequestError>,
}

impl TransportResponse {
    pub fn ok(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status: Some(status),
            headers: BTreeMap::new(),
            body: TransportBody::Bytes(body.into()),
            error: None,
        }
    }

    pub fn failed(error: RequestError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(RequestError::transport(
            TransportErrorKind::Cancelled,
            "task cancelled",
        ))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Network capability the manager depends on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one call. Implementations should honour `control` at their
    /// await points: park while suspended, stop early when cancelled.
    async fn execute(&self, call: TransportCall, control: TaskControl) -> TransportResponse;
}

#[derive(Debug)]
struct ControlInner {
    paused: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
    priority: Priority,
}

/// Task-level handle shared between the manager and the transport
#[derive(Debug, Clone)]
pub struct TaskControl {
    inner: Arc<ControlInner>,
}

impl TaskControl {
    pub fn new(priority: Priority) -> Self {
        let (paused, _) = watch::channel(false);
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                paused,
                cancelled,
                priority,
            }),
        }
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn suspend(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Park while suspended. Returns `false` if the task was cancelled.
    pub async fn checkpoint(&self) -> bool {
        let mut paused = self.inner.paused.subscribe();
        let mut cancelled = self.inner.cancelled.subscribe();
        loop {
            if *cancelled.borrow_and_update() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = paused.changed() => if changed.is_err() { return true; },
                changed = cancelled.changed() => if changed.is_err() { return false; },
            }
        }
    }

    /// Resolves once the task is cancelled
    pub async fn cancelled(&self) {
        let mut cancelled = self.inner.cancelled.subscribe();
        while !*cancelled.borrow_and_update() {
            if cancelled.changed().await.is_err() {
                return;
            }
        }
    }
}
