//! Concurrent fan-out / fan-in of independent requests

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::run_guarded;
use crate::error::GroupError;
use crate::manager::RequestManager;
use crate::request::{Request, RequestAccessory, RequestDelegate, UiContext};

type BatchFn = Arc<dyn Fn(&BatchRequest) + Send + Sync>;

/// Receives the terminal outcome of a batch
pub trait BatchDelegate: Send + Sync {
    fn batch_finished(&self, _batch: &BatchRequest) {}
    fn batch_failed(&self, _batch: &BatchRequest) {}
}

/// Runs its member requests concurrently and completes once
#[derive(Clone)]
pub struct BatchRequest {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    id: Uuid,
    manager: RequestManager,
    requests: Vec<Request>,
    state: Mutex<BatchState>,
}

struct BatchState {
    started: bool,
    done: bool,
    finished_count: usize,
    failed: Vec<Request>,
    stopped_on_failure: bool,
    synchronous: bool,
    permit: Option<OwnedSemaphorePermit>,
    success: Option<BatchFn>,
    failure: Option<BatchFn>,
    delegate: Option<Arc<dyn BatchDelegate>>,
    accessories: Vec<Arc<dyn RequestAccessory>>,
    ui: Option<Arc<dyn UiContext>>,
    shows_loading: bool,
    waiters: Vec<oneshot::Sender<Result<(), GroupError>>>,
}

/// Callbacks and observers released when a batch settles
struct Settled {
    success: Option<BatchFn>,
    failure: Option<BatchFn>,
    delegate: Option<Arc<dyn BatchDelegate>>,
    accessories: Vec<Arc<dyn RequestAccessory>>,
    ui: Option<Arc<dyn UiContext>>,
    shows_loading: bool,
    waiters: Vec<oneshot::Sender<Result<(), GroupError>>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl BatchRequest {
    pub fn new(manager: &RequestManager, requests: Vec<Request>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                id: Uuid::new_v4(),
                manager: manager.clone(),
                requests,
                state: Mutex::new(BatchState {
                    started: false,
                    done: false,
                    finished_count: 0,
                    failed: Vec::new(),
                    stopped_on_failure: true,
                    synchronous: false,
                    permit: None,
                    success: None,
                    failure: None,
                    delegate: None,
                    accessories: Vec::new(),
                    ui: None,
                    shows_loading: false,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn requests(&self) -> &[Request] {
        &self.inner.requests
    }

    /// Members that failed, in the order they reported
    pub fn failed_requests(&self) -> Vec<Request> {
        self.inner.state.lock().failed.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Stop the remaining members at the first failure (default `true`)
    pub fn stopped_on_failure(&self, stop: bool) -> &Self {
        self.inner.state.lock().stopped_on_failure = stop;
        self
    }

    /// Run the whole batch under the manager's synchronous gate
    pub fn synchronous(&self, synchronous: bool) -> &Self {
        self.inner.state.lock().synchronous = synchronous;
        self
    }

    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: Fn(&BatchRequest) + Send + Sync + 'static,
    {
        self.inner.state.lock().success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: Fn(&BatchRequest) + Send + Sync + 'static,
    {
        self.inner.state.lock().failure = Some(Arc::new(f));
        self
    }

    pub fn set_delegate(&self, delegate: Arc<dyn BatchDelegate>) -> &Self {
        self.inner.state.lock().delegate = Some(delegate);
        self
    }

    pub fn add_accessory(&self, accessory: Arc<dyn RequestAccessory>) -> &Self {
        self.inner.state.lock().accessories.push(accessory);
        self
    }

    /// User feedback for the whole batch; members stay silent
    pub fn set_ui_context(&self, ui: Arc<dyn UiContext>, shows_loading: bool) -> &Self {
        let mut state = self.inner.state.lock();
        state.ui = Some(ui);
        state.shows_loading = shows_loading;
        self
    }

    /// Start every member. Only the first call has effect.
    pub fn start(&self) {
        let synchronous = {
            let mut state = self.inner.state.lock();
            if state.started || state.done {
                warn!(batch_id = %self.id(), "Batch already started, ignoring start");
                return;
            }
            state.started = true;
            state.synchronous
        };

        let manager = &self.inner.manager;
        manager.register_batch(self);
        info!(batch_id = %self.id(), size = self.inner.requests.len(), synchronous, "Batch started");

        if !synchronous {
            self.launch();
            return;
        }

        let batch = self.clone();
        let gate = manager.sync_gate();
        manager.spawn(async move {
            let Ok(permit) = gate.acquire_owned().await else {
                warn!(batch_id = %batch.id(), "Synchronous gate closed");
                return;
            };
            {
                let mut state = batch.inner.state.lock();
                if state.done {
                    return;
                }
                state.permit = Some(permit);
            }
            batch.launch();
        });
    }

    fn launch(&self) {
        let manager = &self.inner.manager;
        let (accessories, ui, synchronous) = {
            let state = self.inner.state.lock();
            let ui = state.shows_loading.then(|| state.ui.clone()).flatten();
            (state.accessories.clone(), ui, state.synchronous)
        };

        let id = self.id();
        manager.main().dispatch(move || {
            if let Some(ui) = ui {
                ui.show_loading(None);
            }
            for accessory in &accessories {
                accessory.will_start(id);
            }
        });

        if self.inner.requests.is_empty() {
            let batch = self.clone();
            manager.main().dispatch(move || batch.finalize());
            return;
        }

        let delegate: Arc<dyn RequestDelegate> = Arc::new(BatchMember {
            batch: Arc::downgrade(&self.inner),
        });
        for request in &self.inner.requests {
            request.suppress_ui();
            if synchronous {
                request.gated_by_group();
            }
            request.set_delegate(delegate.clone());
        }
        for request in &self.inner.requests {
            request.start();
        }

        // Members cancelled before the batch started never report back
        if let Some(cancelled) = self.inner.requests.iter().find(|r| r.is_cancelled()) {
            let batch = self.clone();
            let cancelled = cancelled.clone();
            manager
                .main()
                .dispatch(move || batch.member_cancelled(&cancelled));
        }
    }

    /// Start and wait for the batch outcome
    pub async fn send(&self) -> Result<(), GroupError> {
        let receiver = {
            let mut state = self.inner.state.lock();
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };
        self.start();
        receiver.await.unwrap_or(Err(GroupError::Stopped))
    }

    /// Cancel every member still running and release callbacks
    pub fn stop(&self) {
        let settled = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            settle(&mut state)
        };

        for request in &self.inner.requests {
            request.cancel();
        }
        self.inner.manager.deregister_batch(self.id());
        info!(batch_id = %self.id(), "Batch stopped");

        let id = self.id();
        self.inner.manager.main().dispatch(move || {
            if settled.shows_loading {
                if let Some(ui) = &settled.ui {
                    ui.hide_loading();
                }
            }
            for accessory in &settled.accessories {
                accessory.did_stop(id);
            }
            for waiter in settled.waiters {
                let _ = waiter.send(Err(GroupError::Stopped));
            }
        });
    }

    fn member_finished(&self, request: &Request) {
        let complete = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.finished_count += 1;
            debug!(
                batch_id = %self.id(),
                request_id = %request.id(),
                finished = state.finished_count,
                "Batch member finished"
            );
            state.finished_count == self.inner.requests.len()
        };
        if complete {
            self.finalize();
        }
    }

    fn member_failed(&self, request: &Request) {
        let (complete, stop_others) = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.failed.push(request.clone());
            if state.stopped_on_failure {
                (true, true)
            } else {
                state.finished_count += 1;
                (state.finished_count == self.inner.requests.len(), false)
            }
        };

        if stop_others {
            debug!(batch_id = %self.id(), request_id = %request.id(), "Stopping batch after failure");
            for other in self.inner.requests.iter().filter(|r| *r != request) {
                other.cancel();
            }
        }
        if complete {
            self.finalize();
        }
    }

    /// A member cancelled from outside stops the batch as a failure
    fn member_cancelled(&self, request: &Request) {
        {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.failed.push(request.clone());
        }

        info!(batch_id = %self.id(), request_id = %request.id(), "Batch member cancelled, stopping batch");
        for other in self.inner.requests.iter().filter(|r| *r != request) {
            other.cancel();
        }
        self.finalize();
    }

    /// Runs on the main lane
    fn finalize(&self) {
        let (settled, failed) = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            (settle(&mut state), state.failed.clone())
        };
        self.inner.manager.deregister_batch(self.id());

        let id = self.id();
        if settled.shows_loading {
            if let Some(ui) = &settled.ui {
                ui.hide_loading();
            }
        }
        for accessory in &settled.accessories {
            accessory.will_stop(id);
        }

        let outcome = match failed.first() {
            None => {
                info!(batch_id = %id, "Batch finished");
                run_guarded("batch success", || {
                    if let Some(delegate) = &settled.delegate {
                        delegate.batch_finished(self);
                    }
                    if let Some(success) = &settled.success {
                        success(self);
                    }
                });
                Ok(())
            }
            Some(first) => {
                let error = first.failure_reason();
                warn!(batch_id = %id, failed = failed.len(), error = %error, "Batch failed");
                run_guarded("batch failure", || {
                    if let Some(delegate) = &settled.delegate {
                        delegate.batch_failed(self);
                    }
                    if let Some(failure) = &settled.failure {
                        failure(self);
                    }
                    if let Some(ui) = &settled.ui {
                        ui.show_error(&error);
                    }
                });
                Err(GroupError::Failed {
                    failed: failed.len(),
                    total: self.inner.requests.len(),
                    first: error,
                })
            }
        };

        for accessory in &settled.accessories {
            accessory.did_stop(id);
        }
        for waiter in settled.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

fn settle(state: &mut BatchState) -> Settled {
    Settled {
        success: state.success.take(),
        failure: state.failure.take(),
        delegate: state.delegate.take(),
        accessories: std::mem::take(&mut state.accessories),
        ui: state.ui.take(),
        shows_loading: state.shows_loading,
        waiters: std::mem::take(&mut state.waiters),
        permit: state.permit.take(),
    }
}

/// Member delegate; weak so members do not keep the batch alive
struct BatchMember {
    batch: Weak<BatchInner>,
}

impl BatchMember {
    fn batch(&self) -> Option<BatchRequest> {
        self.batch.upgrade().map(|inner| BatchRequest { inner })
    }
}

impl RequestDelegate for BatchMember {
    fn request_finished(&self, request: &Request) {
        if let Some(batch) = self.batch() {
            batch.member_finished(request);
        }
    }

    fn request_failed(&self, request: &Request) {
        if let Some(batch) = self.batch() {
            batch.member_failed(request);
        }
    }

    fn request_cancelled(&self, request: &Request) {
        if let Some(batch) = self.batch() {
            batch.member_cancelled(request);
        }
    }
}
