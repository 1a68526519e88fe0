//! Request handle and lifecycle
//!
//! A [`Request`] is a cheap, cloneable handle to one logical network call.
//! Its configuration is frozen at construction; everything that changes over
//! the lifecycle lives behind a single lock and is only touched by the
//! request itself and by the [`RequestManager`](crate::manager::RequestManager).
//!
//! ```rust,ignore
//! let request = Request::new(&manager, RequestConfig::builder().path("users").build());
//! request
//!     .on_success(|r| println!("{:?}", r.response_json()))
//!     .on_failure(|r| eprintln!("{:?}", r.error()));
//! request.start();
//! ```

mod config;
mod hooks;
mod observer;
mod payload;
mod state;

pub use config::{
    Authorization, CachePolicy, Method, RequestConfig, RequestSerializer, ResponseSerializer,
    RetryLimits,
};
pub use hooks::RequestHooks;
pub use observer::{RequestAccessory, RequestDelegate, UiContext};
pub use payload::ResponsePayload;
pub use state::RequestState;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::run_guarded;
use crate::error::{RequestError, Result};
use crate::manager::RequestManager;
use crate::transport::{TaskControl, TransportBody, TransportResponse};
use hooks::{Model, RequestFn};

type Waiter = oneshot::Sender<Result<Arc<ResponsePayload>>>;

/// Handle to one logical network call
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: Uuid,
    config: RequestConfig,
    hooks: RequestHooks,
    manager: RequestManager,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    state: RequestState,
    response: Option<Arc<ResponsePayload>>,
    cached: Option<Arc<ResponsePayload>>,
    from_cache: bool,
    status: Option<u16>,
    headers: BTreeMap<String, String>,
    body_file: Option<std::path::PathBuf>,
    error: Option<RequestError>,
    model: Option<Model>,

    control: Option<TaskControl>,
    abort: Option<AbortHandle>,
    attempts: u32,
    started_at: Option<Instant>,
    attempt_started_at: Option<Instant>,
    total_elapsed: Duration,

    success: Option<RequestFn>,
    failure: Option<RequestFn>,
    cancel: Option<RequestFn>,
    delegate: Option<Arc<dyn RequestDelegate>>,
    accessories: Vec<Arc<dyn RequestAccessory>>,
    ui: Option<Arc<dyn UiContext>>,
    ui_suppressed: bool,
    gated_by_group: bool,

    sync_permit: Option<OwnedSemaphorePermit>,
    waiters: Vec<Waiter>,
}

/// Everything released when a request reaches a terminal state
pub(crate) struct Terminal {
    pub success: Option<RequestFn>,
    pub failure: Option<RequestFn>,
    pub cancel: Option<RequestFn>,
    pub delegate: Option<Arc<dyn RequestDelegate>>,
    pub accessories: Vec<Arc<dyn RequestAccessory>>,
    pub ui: Option<Arc<dyn UiContext>>,
    pub waiters: Vec<Waiter>,
    pub permit: Option<OwnedSemaphorePermit>,
}

impl Terminal {
    pub(crate) fn resolve(self, outcome: Result<Arc<ResponsePayload>>) {
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
        drop(self.permit);
    }
}

impl Request {
    pub fn new(manager: &RequestManager, config: RequestConfig) -> Self {
        Self::with_hooks(manager, config, RequestHooks::default())
    }

    pub fn with_hooks(manager: &RequestManager, config: RequestConfig, hooks: RequestHooks) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: Uuid::new_v4(),
                config,
                hooks,
                manager: manager.clone(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &RequestConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &RequestHooks {
        &self.inner.hooks
    }

    pub fn manager(&self) -> &RequestManager {
        &self.inner.manager
    }

    // ---- callbacks and observers ----

    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.inner.shared.lock().success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.inner.shared.lock().failure = Some(Arc::new(f));
        self
    }

    pub fn on_cancel<F>(&self, f: F) -> &Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.inner.shared.lock().cancel = Some(Arc::new(f));
        self
    }

    pub fn set_delegate(&self, delegate: Arc<dyn RequestDelegate>) -> &Self {
        self.inner.shared.lock().delegate = Some(delegate);
        self
    }

    pub fn add_accessory(&self, accessory: Arc<dyn RequestAccessory>) -> &Self {
        self.inner.shared.lock().accessories.push(accessory);
        self
    }

    pub fn set_ui_context(&self, ui: Arc<dyn UiContext>) -> &Self {
        self.inner.shared.lock().ui = Some(ui);
        self
    }

    /// Batch and chain members leave user feedback to their group
    pub(crate) fn suppress_ui(&self) {
        self.inner.shared.lock().ui_suppressed = true;
    }

    /// Members of a synchronous group run under the group's permit
    pub(crate) fn gated_by_group(&self) {
        self.inner.shared.lock().gated_by_group = true;
    }

    // ---- lifecycle ----

    /// Start the request. Only the first call on an idle request has effect.
    pub fn start(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != RequestState::Idle {
                warn!(
                    request_id = %self.id(),
                    state = ?shared.state,
                    "Request is not idle, ignoring start"
                );
                return;
            }
            shared.state = RequestState::Started;
            shared.started_at = Some(Instant::now());
        }

        let manager = &self.inner.manager;
        manager.metrics().request_started();
        debug!(request_id = %self.id(), path = %self.inner.config.path, "Request started");

        let request = self.clone();
        manager.main().dispatch(move || request.notify_will_start());

        let request = self.clone();
        manager.spawn(async move { request.launch().await });
    }

    pub fn start_with<S, F>(&self, success: S, failure: F)
    where
        S: Fn(&Request) + Send + Sync + 'static,
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.on_success(success).on_failure(failure);
        self.start();
    }

    /// Start (if idle) and wait for the terminal outcome.
    /// A cache preview does not resolve this future.
    pub async fn send(&self) -> Result<Arc<ResponsePayload>> {
        let (receiver, should_start) = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                RequestState::Finished => {
                    return Ok(shared.response.clone().unwrap_or_default());
                }
                RequestState::Failed => {
                    return Err(shared.error.clone().unwrap_or(RequestError::Unknown));
                }
                RequestState::Cancelled => return Err(RequestError::Cancelled),
                _ => {}
            }
            let (sender, receiver) = oneshot::channel();
            shared.waiters.push(sender);
            (receiver, shared.state == RequestState::Idle)
        };

        if should_start {
            self.start();
        }

        receiver.await.unwrap_or(Err(RequestError::Cancelled))
    }

    pub fn suspend(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.state != RequestState::Started {
            return;
        }
        shared.state = RequestState::Suspended;
        if let Some(control) = &shared.control {
            control.suspend();
        }
        debug!(request_id = %self.id(), "Request suspended");
    }

    pub fn resume(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.state != RequestState::Suspended {
            return;
        }
        shared.state = RequestState::Started;
        if let Some(control) = &shared.control {
            control.resume();
        }
        debug!(request_id = %self.id(), "Request resumed");
    }

    /// Cancel the request. Idempotent; the cancel callback fires once.
    pub fn cancel(&self) {
        let (control, abort, terminal, was_started) = {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return;
            }
            let was_started = shared.state != RequestState::Idle;
            shared.state = RequestState::Cancelled;
            let control = shared.control.take();
            let abort = shared.abort.take();
            (control, abort, take_terminal(&mut shared), was_started)
        };

        let manager = &self.inner.manager;
        manager.cancel_request(self, control, abort);
        manager.metrics().request_cancelled();
        info!(request_id = %self.id(), "Request cancelled");

        let request = self.clone();
        manager.main().dispatch(move || {
            let id = request.id();
            if was_started {
                request.hide_loading(&terminal);
                for accessory in &terminal.accessories {
                    accessory.will_stop(id);
                }
            }
            run_guarded("cancel", || {
                if let Some(cancel) = &terminal.cancel {
                    cancel(&request);
                }
                if let Some(delegate) = &terminal.delegate {
                    delegate.request_cancelled(&request);
                }
            });
            if was_started {
                for accessory in &terminal.accessories {
                    accessory.did_stop(id);
                }
            }
            terminal.resolve(Err(RequestError::Cancelled));
        });
    }

    async fn launch(self) {
        let manager = self.inner.manager.clone();

        let gated_by_group = self.inner.shared.lock().gated_by_group;
        if self.inner.config.synchronous && !gated_by_group {
            match manager.sync_gate().acquire_owned().await {
                Ok(permit) => {
                    let mut shared = self.inner.shared.lock();
                    if shared.state.is_terminal() {
                        return;
                    }
                    shared.sync_permit = Some(permit);
                }
                Err(_) => warn!(request_id = %self.id(), "Synchronous gate closed"),
            }
        }

        if self.is_cancelled() {
            return;
        }

        if self.inner.config.preloads_cache() {
            manager.preload_cache(&self).await;
        }

        manager.add_request(self).await;
    }

    fn notify_will_start(&self) {
        let (accessories, ui) = {
            let shared = self.inner.shared.lock();
            let ui = if shared.ui_suppressed { None } else { shared.ui.clone() };
            (shared.accessories.clone(), ui)
        };
        if let Some(ui) = ui {
            if self.inner.config.shows_loading {
                ui.show_loading(self.inner.config.loading_text.as_deref());
            }
        }
        for accessory in &accessories {
            accessory.will_start(self.id());
        }
    }

    pub(crate) fn hide_loading(&self, terminal: &Terminal) {
        if let Some(ui) = &terminal.ui {
            if self.inner.config.shows_loading {
                ui.hide_loading();
            }
        }
    }

    // ---- state queries ----

    pub fn state(&self) -> RequestState {
        self.inner.shared.lock().state
    }

    pub fn is_executing(&self) -> bool {
        self.state().is_executing()
    }

    pub fn is_suspended(&self) -> bool {
        self.state() == RequestState::Suspended
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.state() == RequestState::Finished
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RequestState::Failed
    }

    // ---- results ----

    /// Payload currently exposed: the cache preview while it is being
    /// delivered, otherwise the live response
    pub fn response_payload(&self) -> Option<Arc<ResponsePayload>> {
        let shared = self.inner.shared.lock();
        if shared.from_cache {
            shared.cached.clone()
        } else {
            shared.response.clone()
        }
    }

    pub fn response_data(&self) -> Option<Bytes> {
        self.response_payload().map(|p| p.data().clone())
    }

    pub fn response_string(&self) -> Option<String> {
        self.response_payload()
            .and_then(|p| p.text().map(str::to_string))
    }

    pub fn response_json(&self) -> Option<Value> {
        self.response_payload().and_then(|p| p.json().cloned())
    }

    pub fn response_headers(&self) -> BTreeMap<String, String> {
        self.inner.shared.lock().headers.clone()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.inner.shared.lock().status
    }

    pub fn error(&self) -> Option<RequestError> {
        self.inner.shared.lock().error.clone()
    }

    /// Why the request did not finish, for reporting through a group
    pub(crate) fn failure_reason(&self) -> RequestError {
        let shared = self.inner.shared.lock();
        match (&shared.error, shared.state) {
            (Some(error), _) => error.clone(),
            (None, RequestState::Cancelled) => RequestError::Cancelled,
            (None, _) => RequestError::Unknown,
        }
    }

    pub fn is_data_from_cache(&self) -> bool {
        self.inner.shared.lock().from_cache
    }

    pub fn attempts(&self) -> u32 {
        self.inner.shared.lock().attempts
    }

    /// Wall-clock time spent on the network across all attempts
    pub fn total_elapsed(&self) -> Duration {
        self.inner.shared.lock().total_elapsed
    }

    pub(crate) fn started_at(&self) -> Option<Instant> {
        self.inner.shared.lock().started_at
    }

    /// Model decoded by [`RequestHooks::decode_model`]
    pub fn model<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let model = self.inner.shared.lock().model.clone()?;
        model.downcast::<T>().ok()
    }

    // ---- manager side ----

    /// Move to `next` if legal. The lock makes this the arbiter between
    /// cancellation and the response pipeline.
    pub(crate) fn transition(&self, next: RequestState) -> bool {
        let mut shared = self.inner.shared.lock();
        if !shared.state.can_transition_to(next) {
            return false;
        }
        shared.state = next;
        true
    }

    pub(crate) fn begin_attempt(&self, control: TaskControl) -> u32 {
        let mut shared = self.inner.shared.lock();
        if shared.state == RequestState::Suspended {
            control.suspend();
        }
        if shared.state == RequestState::Cancelled {
            control.cancel();
        }
        shared.control = Some(control);
        shared.attempts += 1;
        shared.attempt_started_at = Some(Instant::now());
        shared.attempts
    }

    pub(crate) fn set_abort_handle(&self, abort: AbortHandle) {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_terminal() {
            return;
        }
        shared.abort = Some(abort);
    }

    pub(crate) fn end_attempt(&self) {
        let mut shared = self.inner.shared.lock();
        if let Some(started) = shared.attempt_started_at.take() {
            shared.total_elapsed += started.elapsed();
        }
    }

    pub(crate) fn store_response(&self, response: &TransportResponse) {
        let encoding = response
            .headers
            .get("content-type")
            .and_then(|value| value.parse::<mime::Mime>().ok())
            .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_ascii_lowercase()));

        let (payload, file) = match &response.body {
            TransportBody::Empty => (ResponsePayload::from_bytes(Bytes::new()), None),
            TransportBody::Bytes(bytes) => (ResponsePayload::from_bytes(bytes.clone()), None),
            TransportBody::File(path) => (ResponsePayload::from_file(path.clone()), Some(path.clone())),
        };
        let payload = match encoding {
            Some(encoding) => payload.with_encoding(encoding),
            None => payload,
        };

        let mut shared = self.inner.shared.lock();
        shared.status = response.status;
        shared.headers = response.headers.clone();
        shared.response = Some(Arc::new(payload));
        shared.body_file = file;
        shared.error = None;
    }

    /// Payload of the most recent network response, ignoring any preview
    pub(crate) fn live_payload(&self) -> Option<Arc<ResponsePayload>> {
        self.inner.shared.lock().response.clone()
    }

    pub(crate) fn take_body_file(&self) -> Option<std::path::PathBuf> {
        self.inner.shared.lock().body_file.take()
    }

    pub(crate) fn set_error(&self, error: RequestError) {
        self.inner.shared.lock().error = Some(error);
    }

    pub(crate) fn set_model(&self, model: Model) {
        self.inner.shared.lock().model = Some(model);
    }

    pub(crate) fn set_cached_payload(&self, payload: Arc<ResponsePayload>) {
        self.inner.shared.lock().cached = Some(payload);
    }

    pub(crate) fn set_from_cache(&self, from_cache: bool) {
        self.inner.shared.lock().from_cache = from_cache;
    }

    /// Success callback for the cache preview, which leaves it in place
    pub(crate) fn preview_callback(&self) -> Option<RequestFn> {
        self.inner.shared.lock().success.clone()
    }

    pub(crate) fn take_terminal(&self) -> Terminal {
        take_terminal(&mut self.inner.shared.lock())
    }
}

fn take_terminal(shared: &mut Shared) -> Terminal {
    let ui = if shared.ui_suppressed {
        None
    } else {
        shared.ui.clone()
    };
    Terminal {
        success: shared.success.take(),
        failure: shared.failure.take(),
        cancel: shared.cancel.take(),
        delegate: shared.delegate.take(),
        accessories: std::mem::take(&mut shared.accessories),
        ui,
        waiters: std::mem::take(&mut shared.waiters),
        permit: shared.sync_permit.take(),
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("method", &self.inner.config.method)
            .field("path", &self.inner.config.path)
            .field("state", &self.state())
            .finish()
    }
}
