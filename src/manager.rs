//! Request manager
//!
//! The manager is the runtime context every request runs in. It owns the
//! registry of in-flight requests, runs the response pipeline, decides on
//! retries and delivers terminal outcomes on the main lane.
//!
//! Response pipeline for one attempt:
//! 1. drop the response if the request is no longer registered or was cancelled
//! 2. transport error, then the request's response filter, status validator
//!    and JSON validator
//! 3. on failure, let the mock provider substitute a response
//! 4. on success, run every plugin's global filter
//! 5. failures go through the retry policy before becoming terminal

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::BatchRequest;
use crate::cache::CacheStore;
use crate::chain::ChainRequest;
use crate::config::Config;
use crate::dispatch::{MainQueue, run_guarded};
use crate::error::{CacheError, RequestError};
use crate::mock::{MockProvider, StaticMockProvider};
use crate::observability::Metrics;
use crate::plugin::RequestPlugin;
use crate::request::{Request, RequestState, ResponseSerializer};
use crate::retry::{RetryFilter, RetryPolicy};
use crate::transport::{
    HttpTransport, TaskControl, Transport, TransportCall, TransportResponse, build_call,
    builder::effective_base_url,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("No Tokio runtime is running")]
    NoRuntime,

    #[error("Failed to create transport: {0}")]
    Transport(#[from] RequestError),

    #[error("Failed to open cache: {0}")]
    Cache(#[from] CacheError),
}

/// Runtime context shared by all requests, batches and chains
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Config,
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    retry: RetryPolicy,
    mock: Option<Arc<dyn MockProvider>>,
    plugins: Vec<Arc<dyn RequestPlugin>>,
    registry: Mutex<HashMap<Uuid, Request>>,
    batches: Mutex<HashMap<Uuid, BatchRequest>>,
    chains: Mutex<HashMap<Uuid, ChainRequest>>,
    sync_gate: Arc<Semaphore>,
    metrics: Metrics,
    main: MainQueue,
    runtime: Handle,
}

pub struct RequestManagerBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<CacheStore>,
    retry_filter: Option<Arc<dyn RetryFilter>>,
    mock: Option<Arc<dyn MockProvider>>,
    plugins: Vec<Arc<dyn RequestPlugin>>,
}

impl RequestManagerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn retry_filter(mut self, filter: Arc<dyn RetryFilter>) -> Self {
        self.retry_filter = Some(filter);
        self
    }

    pub fn mock(mut self, mock: Arc<dyn MockProvider>) -> Self {
        self.mock = Some(mock);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn RequestPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Components not supplied are created from the configuration.
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<RequestManager, ManagerError> {
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config.transport)?),
        };
        let cache = match self.cache {
            Some(cache) => cache,
            None => CacheStore::from_settings(&self.config.cache)?,
        };
        let mock = self.mock.or_else(|| {
            StaticMockProvider::from_settings(&self.config.mock)
                .map(|provider| Arc::new(provider) as Arc<dyn MockProvider>)
        });

        info!(
            plugins = self.plugins.len(),
            mock = mock.is_some(),
            "Request manager ready"
        );

        Ok(RequestManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                transport,
                cache,
                retry: RetryPolicy::new(self.retry_filter),
                mock,
                plugins: self.plugins,
                registry: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                chains: Mutex::new(HashMap::new()),
                sync_gate: Arc::new(Semaphore::new(1)),
                metrics: Metrics::new(),
                main: MainQueue::spawn(&runtime),
                runtime,
            }),
        })
    }
}

impl RequestManager {
    pub fn builder(config: Config) -> RequestManagerBuilder {
        RequestManagerBuilder {
            config,
            transport: None,
            cache: None,
            retry_filter: None,
            mock: None,
            plugins: Vec::new(),
        }
    }

    /// Manager with the HTTP transport and the configured cache backend
    pub fn from_config(config: Config) -> Result<Self, ManagerError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn main(&self) -> &MainQueue {
        &self.inner.main
    }

    /// Wait until every callback queued so far has been delivered
    pub async fn flush(&self) {
        self.inner.main.flush().await;
    }

    /// Number of registered in-flight requests
    pub fn active_requests(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn is_registered(&self, id: Uuid) -> bool {
        self.inner.registry.lock().contains_key(&id)
    }

    /// Cache identifier of `request`
    pub fn cache_key(&self, request: &Request) -> String {
        let config = request.config();
        let arguments: Option<Value> = request.hooks().cache_arguments(config.arguments.as_ref());
        CacheStore::key(
            config.method,
            effective_base_url(config, &self.inner.config.transport),
            &config.path,
            arguments.as_ref(),
        )
    }

    /// Cancel every registered request and stop every running group
    pub fn cancel_all_requests(&self) {
        let batches: Vec<BatchRequest> = self.inner.batches.lock().values().cloned().collect();
        for batch in batches {
            batch.stop();
        }

        let chains: Vec<ChainRequest> = self.inner.chains.lock().values().cloned().collect();
        for chain in chains {
            chain.stop();
        }

        let requests: Vec<Request> = self.inner.registry.lock().values().cloned().collect();
        info!(count = requests.len(), "Cancelling all requests");
        for request in requests {
            request.cancel();
        }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.runtime.spawn(future)
    }

    pub(crate) fn sync_gate(&self) -> Arc<Semaphore> {
        self.inner.sync_gate.clone()
    }

    pub(crate) fn register_batch(&self, batch: &BatchRequest) {
        self.inner.batches.lock().insert(batch.id(), batch.clone());
    }

    pub(crate) fn deregister_batch(&self, id: Uuid) {
        self.inner.batches.lock().remove(&id);
    }

    pub(crate) fn register_chain(&self, chain: &ChainRequest) {
        self.inner.chains.lock().insert(chain.id(), chain.clone());
    }

    pub(crate) fn deregister_chain(&self, id: Uuid) {
        self.inner.chains.lock().remove(&id);
    }

    fn deregister(&self, id: Uuid) {
        self.inner.registry.lock().remove(&id);
    }

    /// Deliver a valid cache entry as a success preview. The network attempt
    /// still follows.
    pub(crate) async fn preload_cache(&self, request: &Request) {
        let key = self.cache_key(request);
        let config = request.config();

        match self
            .inner
            .cache
            .load(&key, &config.cache, config.response_serializer)
            .await
        {
            Ok(payload) => {
                self.inner.metrics.cache_hit();
                debug!(request_id = %request.id(), key, "Delivering cached preview");
                request.set_cached_payload(payload);

                let success = request.preview_callback();
                let request = request.clone();
                self.inner.main.dispatch(move || {
                    if request.is_cancelled() {
                        return;
                    }
                    request.set_from_cache(true);
                    request.hooks().filter_completion(&request);
                    if let Some(success) = success {
                        success(&request);
                    }
                });
            }
            Err(e) => {
                self.inner.metrics.cache_miss();
                debug!(request_id = %request.id(), key, reason = %e, "No usable cache entry");
            }
        }
    }

    /// Register `request` and dispatch its first attempt
    pub(crate) async fn add_request(&self, request: Request) {
        let call = match build_call(request.config(), &self.inner.config.transport) {
            Ok(call) => call,
            Err(e) => {
                warn!(request_id = %request.id(), error = %e, "Failed to build request");
                self.request_did_fail(request, e).await;
                return;
            }
        };

        {
            let mut registry = self.inner.registry.lock();
            if request.is_cancelled() {
                return;
            }
            registry.insert(request.id(), request.clone());
        }

        self.submit(request, call);
    }

    fn submit(&self, request: Request, mut call: TransportCall) {
        for plugin in &self.inner.plugins {
            plugin.prepare(&mut call, &request);
        }

        let control = TaskControl::new(call.priority);
        let attempt = request.begin_attempt(control.clone());

        for plugin in &self.inner.plugins {
            plugin.will_send(&request);
        }

        debug!(
            request_id = %request.id(),
            attempt,
            method = call.method.as_str(),
            url = %call.url,
            "Dispatching attempt"
        );

        let manager = self.clone();
        let transport = self.inner.transport.clone();
        let task_request = request.clone();
        let handle = self.inner.runtime.spawn(async move {
            let response = transport.execute(call, control).await;
            manager.handle_response(task_request, response).await;
        });
        request.set_abort_handle(handle.abort_handle());
    }

    /// Tear down the transport side of a cancelled request
    pub(crate) fn cancel_request(
        &self,
        request: &Request,
        control: Option<TaskControl>,
        abort: Option<AbortHandle>,
    ) {
        if let Some(control) = control {
            control.cancel();
        }

        if request.config().is_resumable_download() {
            // The transport flushes partial data once it sees the cancel
            debug!(request_id = %request.id(), "Keeping resume data of cancelled download");
        } else if let Some(abort) = abort {
            abort.abort();
        }

        self.deregister(request.id());
    }

    async fn handle_response(&self, request: Request, response: TransportResponse) {
        request.end_attempt();

        if !self.is_registered(request.id()) || request.is_cancelled() {
            debug!(request_id = %request.id(), "Dropping response of inactive request");
            return;
        }

        request.store_response(&response);
        for plugin in &self.inner.plugins {
            plugin.did_receive(&request);
        }

        let mut outcome = self.evaluate(&request, &response);

        let mocked = match (&outcome, &self.inner.mock) {
            (Err(error), Some(mock)) if mock.accepts(&request, error) => mock.respond(&request),
            _ => None,
        };
        if let Some(mocked) = mocked {
            info!(request_id = %request.id(), "Substituting mock response");
            request.store_response(&mocked);
            outcome = Ok(());
        }

        if outcome.is_ok() {
            for plugin in &self.inner.plugins {
                if let Err(e) = plugin.validate(&request) {
                    outcome = Err(e);
                    break;
                }
            }
        }

        match outcome {
            Ok(()) => self.request_did_succeed(request).await,
            Err(error) => self.retry_or_fail(request, error).await,
        }
    }

    fn evaluate(&self, request: &Request, response: &TransportResponse) -> Result<(), RequestError> {
        if let Some(error) = &response.error {
            return Err(error.clone());
        }

        let hooks = request.hooks();
        hooks.filter_response(request)?;

        let status = response.status.unwrap_or_default();
        if !hooks.validate_status(status) {
            return Err(RequestError::InvalidStatusCode(status));
        }

        if request.config().response_serializer != ResponseSerializer::Json {
            return Ok(());
        }
        let Some(payload) = request.live_payload() else {
            return Ok(());
        };
        if payload.file_path().is_some() {
            return Ok(());
        }

        let json = match payload.json() {
            Some(value) => value,
            None if payload.is_empty() => &Value::Null,
            None => {
                return Err(RequestError::InvalidResponseFormat(
                    "body is not valid JSON".to_string(),
                ));
            }
        };

        if hooks.has_json_validator() && !hooks.validate_json(json) {
            return Err(RequestError::InvalidResponseFormat(
                "JSON validation failed".to_string(),
            ));
        }

        Ok(())
    }

    async fn retry_or_fail(&self, request: Request, error: RequestError) {
        let limits = request
            .config()
            .retry
            .unwrap_or_else(|| self.inner.config.retry.limits());

        if !self.inner.retry.should_retry(&request, &error, &limits).await {
            self.request_did_fail(request, error).await;
            return;
        }

        if request.is_cancelled() {
            return;
        }

        self.inner.metrics.request_retried();
        info!(
            request_id = %request.id(),
            attempt = request.attempts(),
            error = %error,
            delay_ms = limits.interval.as_millis() as u64,
            "Retrying request"
        );

        tokio::time::sleep(limits.interval).await;

        if request.is_cancelled() || !self.is_registered(request.id()) {
            debug!(request_id = %request.id(), "Retry dropped, request no longer active");
            return;
        }

        match build_call(request.config(), &self.inner.config.transport) {
            Ok(call) => self.submit(request, call),
            Err(e) => self.request_did_fail(request, e).await,
        }
    }

    async fn request_did_succeed(&self, request: Request) {
        if !request.transition(RequestState::Finished) {
            debug!(request_id = %request.id(), "Request already settled, dropping success");
            return;
        }
        self.deregister(request.id());
        self.inner.metrics.request_succeeded();
        info!(
            request_id = %request.id(),
            status = request.status_code(),
            attempts = request.attempts(),
            "Request finished"
        );

        self.save_cache(&request).await;

        if let Some(payload) = request.live_payload() {
            match request.hooks().decode(payload.data()) {
                Some(Ok(model)) => request.set_model(model),
                Some(Err(e)) => warn!(request_id = %request.id(), error = %e, "Model decoding failed"),
                None => {}
            }
        }
        request.hooks().preprocess_completion(&request);

        let terminal = request.take_terminal();
        self.inner.main.dispatch(move || {
            let id = request.id();
            request.set_from_cache(false);
            request.hide_loading(&terminal);
            for accessory in &terminal.accessories {
                accessory.will_stop(id);
            }

            run_guarded("success", || {
                request.hooks().filter_completion(&request);
                if let Some(delegate) = &terminal.delegate {
                    delegate.request_finished(&request);
                }
                if let Some(success) = &terminal.success {
                    success(&request);
                }
            });

            for accessory in &terminal.accessories {
                accessory.did_stop(id);
            }
            let payload = request.live_payload().unwrap_or_default();
            terminal.resolve(Ok(payload));
        });
    }

    async fn request_did_fail(&self, request: Request, error: RequestError) {
        if !request.transition(RequestState::Failed) {
            debug!(request_id = %request.id(), "Request already settled, dropping failure");
            return;
        }
        self.deregister(request.id());
        self.inner.metrics.request_failed();
        warn!(
            request_id = %request.id(),
            error = %error,
            attempts = request.attempts(),
            "Request failed"
        );

        request.set_error(error.clone());

        if let Some(file) = request.take_body_file() {
            if request.config().download_path.as_deref() != Some(file.as_path()) {
                if let Err(e) = tokio::fs::remove_file(&file).await {
                    debug!(path = %file.display(), error = %e, "Failed to remove temporary body");
                }
            }
        }

        request.hooks().preprocess_failure(&request);

        let terminal = request.take_terminal();
        self.inner.main.dispatch(move || {
            let id = request.id();
            request.set_from_cache(false);
            request.hide_loading(&terminal);
            for accessory in &terminal.accessories {
                accessory.will_stop(id);
            }

            run_guarded("failure", || {
                request.hooks().filter_failure(&request);
                if let Some(delegate) = &terminal.delegate {
                    delegate.request_failed(&request);
                }
                if let Some(failure) = &terminal.failure {
                    failure(&request);
                }
                if request.config().shows_error {
                    if let Some(ui) = &terminal.ui {
                        ui.show_error(&error);
                    }
                }
            });

            for accessory in &terminal.accessories {
                accessory.did_stop(id);
            }
            terminal.resolve(Err(error));
        });
    }

    async fn save_cache(&self, request: &Request) {
        let config = request.config();
        if config.cache.ttl_secs <= 0 || config.is_resumable_download() {
            return;
        }
        let Some(payload) = request.live_payload() else {
            return;
        };

        let key = self.cache_key(request);
        let cache = &self.inner.cache;
        if cache.writes_async(&config.cache) {
            cache.save_in_background(key, config.cache.clone(), payload);
        } else if let Err(e) = cache.save(&key, &config.cache, &payload).await {
            warn!(request_id = %request.id(), key, error = %e, "Cache write failed");
        }
    }
}
