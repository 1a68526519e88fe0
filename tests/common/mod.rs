#![allow(dead_code)]

use async_trait::async_trait;
use courier::cache::CacheStore;
use courier::config::Config;
use courier::error::RequestError;
use courier::manager::{RequestManager, RequestManagerBuilder};
use courier::request::{Request, RequestConfig};
use courier::transport::{TaskControl, Transport, TransportCall, TransportResponse};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const BASE_URL: &str = "http://courier.test";

/// One canned reply
#[derive(Clone)]
pub struct Script {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
    pub error: Option<RequestError>,
}

impl Script {
    pub fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn error(error: RequestError) -> Self {
        Self {
            status: 0,
            body: String::new(),
            delay: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub at: Instant,
    pub headers: Vec<(String, String)>,
}

/// In-process transport answering from per-path scripts.
/// The last script of a path repeats forever.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(self: &Arc<Self>, path: &str, scripts: Vec<Script>) -> Arc<Self> {
        self.routes
            .lock()
            .insert(path.to_string(), scripts.into_iter().collect());
        self.clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    fn next_script(&self, path: &str) -> Script {
        let mut routes = self.routes.lock();
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Script::status(404, "{}"),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, call: TransportCall, control: TaskControl) -> TransportResponse {
        let path = call.url.path().trim_start_matches('/').to_string();
        self.calls.lock().push(RecordedCall {
            path: path.clone(),
            at: Instant::now(),
            headers: call.headers.clone(),
        });

        let script = self.next_script(&path);

        tokio::select! {
            _ = tokio::time::sleep(script.delay) => {}
            _ = control.cancelled() => return TransportResponse::cancelled(),
        }
        if !control.checkpoint().await {
            return TransportResponse::cancelled();
        }

        match script.error {
            Some(error) => TransportResponse::failed(error),
            None => TransportResponse::ok(script.status, script.body)
                .with_header("content-type", "application/json"),
        }
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.base_url = Some(BASE_URL.to_string());
    config
}

pub fn builder(transport: &Arc<ScriptedTransport>) -> RequestManagerBuilder {
    RequestManager::builder(test_config())
        .transport(transport.clone())
        .cache(CacheStore::in_memory("test"))
}

pub fn manager(transport: &Arc<ScriptedTransport>) -> RequestManager {
    builder(transport).build().unwrap()
}

pub fn get(manager: &RequestManager, path: &str) -> Request {
    Request::new(manager, RequestConfig::builder().path(path).build())
}

/// Shared event log for callback assertions
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until(check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
