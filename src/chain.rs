//! Sequential composition of requests
//!
//! Steps run one at a time. Once the declared steps are exhausted an
//! optional request builder may synthesize more from the previous result,
//! which allows chains whose length is only known at run time.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::run_guarded;
use crate::error::GroupError;
use crate::manager::RequestManager;
use crate::request::{Request, RequestAccessory, RequestDelegate, UiContext};

type ChainFn = Arc<dyn Fn(&ChainRequest) + Send + Sync>;
type StepFn = Arc<dyn Fn(&ChainRequest, &Request) + Send + Sync>;
type BuilderFn = Arc<dyn Fn(&ChainRequest, Option<&Request>) -> Option<Request> + Send + Sync>;

/// Receives the terminal outcome of a chain
pub trait ChainDelegate: Send + Sync {
    fn chain_finished(&self, _chain: &ChainRequest) {}
    fn chain_failed(&self, _chain: &ChainRequest) {}
}

/// Runs its steps sequentially and completes once
#[derive(Clone)]
pub struct ChainRequest {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    id: Uuid,
    manager: RequestManager,
    state: Mutex<ChainState>,
}

struct ChainStep {
    request: Request,
    callback: Option<StepFn>,
}

struct ChainState {
    steps: Vec<ChainStep>,
    next_index: usize,
    builder: Option<BuilderFn>,
    stopped_on_failure: bool,
    stopped_on_success: bool,
    request_interval: Duration,
    synchronous: bool,
    permit: Option<OwnedSemaphorePermit>,
    current: Option<Request>,
    succeeded: Option<Request>,
    failed: Option<Request>,
    started: bool,
    done: bool,
    success: Option<ChainFn>,
    failure: Option<ChainFn>,
    delegate: Option<Arc<dyn ChainDelegate>>,
    accessories: Vec<Arc<dyn RequestAccessory>>,
    ui: Option<Arc<dyn UiContext>>,
    shows_loading: bool,
    waiters: Vec<oneshot::Sender<Result<(), GroupError>>>,
}

struct Settled {
    success: Option<ChainFn>,
    failure: Option<ChainFn>,
    delegate: Option<Arc<dyn ChainDelegate>>,
    accessories: Vec<Arc<dyn RequestAccessory>>,
    ui: Option<Arc<dyn UiContext>>,
    shows_loading: bool,
    waiters: Vec<oneshot::Sender<Result<(), GroupError>>>,
    permit: Option<OwnedSemaphorePermit>,
}

enum Next {
    Step(Request),
    Build(BuilderFn),
    Finish,
}

impl ChainRequest {
    pub fn new(manager: &RequestManager) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                id: Uuid::new_v4(),
                manager: manager.clone(),
                state: Mutex::new(ChainState {
                    steps: Vec::new(),
                    next_index: 0,
                    builder: None,
                    stopped_on_failure: true,
                    stopped_on_success: false,
                    request_interval: Duration::ZERO,
                    synchronous: false,
                    permit: None,
                    current: None,
                    succeeded: None,
                    failed: None,
                    started: false,
                    done: false,
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

    /// Append a step
    pub fn add_request(&self, request: Request) -> &Self {
        self.push_step(request, None)
    }

    /// Append a step whose callback runs before the chain moves on
    pub fn add_request_with<F>(&self, request: Request, callback: F) -> &Self
    where
        F: Fn(&ChainRequest, &Request) + Send + Sync + 'static,
    {
        self.push_step(request, Some(Arc::new(callback)))
    }

    fn push_step(&self, request: Request, callback: Option<StepFn>) -> &Self {
        self.inner
            .state
            .lock()
            .steps
            .push(ChainStep { request, callback });
        self
    }

    /// Called once the declared steps are exhausted; `None` ends the chain
    pub fn request_builder<F>(&self, builder: F) -> &Self
    where
        F: Fn(&ChainRequest, Option<&Request>) -> Option<Request> + Send + Sync + 'static,
    {
        self.inner.state.lock().builder = Some(Arc::new(builder));
        self
    }

    /// Default `true`
    pub fn stopped_on_failure(&self, stop: bool) -> &Self {
        self.inner.state.lock().stopped_on_failure = stop;
        self
    }

    /// Default `false`
    pub fn stopped_on_success(&self, stop: bool) -> &Self {
        self.inner.state.lock().stopped_on_success = stop;
        self
    }

    /// Delay between a step reporting and the next one starting
    pub fn request_interval(&self, interval: Duration) -> &Self {
        self.inner.state.lock().request_interval = interval;
        self
    }

    /// Run the whole chain under the manager's synchronous gate
    pub fn synchronous(&self, synchronous: bool) -> &Self {
        self.inner.state.lock().synchronous = synchronous;
        self
    }

    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: Fn(&ChainRequest) + Send + Sync + 'static,
    {
        self.inner.state.lock().success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: Fn(&ChainRequest) + Send + Sync + 'static,
    {
        self.inner.state.lock().failure = Some(Arc::new(f));
        self
    }

    pub fn set_delegate(&self, delegate: Arc<dyn ChainDelegate>) -> &Self {
        self.inner.state.lock().delegate = Some(delegate);
        self
    }

    pub fn add_accessory(&self, accessory: Arc<dyn RequestAccessory>) -> &Self {
        self.inner.state.lock().accessories.push(accessory);
        self
    }

    pub fn set_ui_context(&self, ui: Arc<dyn UiContext>, shows_loading: bool) -> &Self {
        let mut state = self.inner.state.lock();
        state.ui = Some(ui);
        state.shows_loading = shows_loading;
        self
    }

    /// Requests of the chain so far, including built ones
    pub fn requests(&self) -> Vec<Request> {
        self.inner
            .state
            .lock()
            .steps
            .iter()
            .map(|step| step.request.clone())
            .collect()
    }

    /// Index of the next step to start
    pub fn next_request_index(&self) -> usize {
        self.inner.state.lock().next_index
    }

    pub fn current_request(&self) -> Option<Request> {
        self.inner.state.lock().current.clone()
    }

    /// Most recent member that succeeded, if the last outcome was a success
    pub fn succeeded_request(&self) -> Option<Request> {
        self.inner.state.lock().succeeded.clone()
    }

    /// Most recent member that failed, if the last outcome was a failure
    pub fn failed_request(&self) -> Option<Request> {
        self.inner.state.lock().failed.clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Start the first step. Only the first call has effect.
    pub fn start(&self) {
        let synchronous = {
            let mut state = self.inner.state.lock();
            if state.started || state.done {
                warn!(chain_id = %self.id(), "Chain already started, ignoring start");
                return;
            }
            state.started = true;
            state.synchronous
        };

        let manager = &self.inner.manager;
        manager.register_chain(self);
        if !synchronous {
            self.launch();
            return;
        }

        let chain = self.clone();
        let gate = manager.sync_gate();
        manager.spawn(async move {
            let Ok(permit) = gate.acquire_owned().await else {
                warn!(chain_id = %chain.id(), "Synchronous gate closed");
                return;
            };
            {
                let mut state = chain.inner.state.lock();
                if state.done {
                    return;
                }
                state.permit = Some(permit);
            }
            chain.launch();
        });
    }

    fn launch(&self) {
        let (accessories, ui, empty) = {
            let state = self.inner.state.lock();
            let ui = state.shows_loading.then(|| state.ui.clone()).flatten();
            let empty = state.steps.is_empty() && state.builder.is_none();
            (state.accessories.clone(), ui, empty)
        };

        let manager = &self.inner.manager;
        if empty {
            warn!(chain_id = %self.id(), "Chain has no requests and no builder");
        } else {
            info!(chain_id = %self.id(), "Chain started");
        }

        let id = self.id();
        let chain = self.clone();
        manager.main().dispatch(move || {
            if let Some(ui) = ui {
                ui.show_loading(None);
            }
            for accessory in &accessories {
                accessory.will_start(id);
            }
            chain.start_next(None);
        });
    }

    /// Start and wait for the chain outcome
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

    /// Cancel the running step and release callbacks
    pub fn stop(&self) {
        let (settled, current) = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            (settle(&mut state), state.current.take())
        };

        if let Some(current) = current {
            current.cancel();
        }
        self.inner.manager.deregister_chain(self.id());
        info!(chain_id = %self.id(), "Chain stopped");

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

    /// Runs on the main lane
    fn start_next(&self, previous: Option<Request>) {
        let next = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            if let Some(step) = state.steps.get(state.next_index) {
                let request = step.request.clone();
                state.next_index += 1;
                Next::Step(request)
            } else if let Some(builder) = &state.builder {
                Next::Build(builder.clone())
            } else {
                Next::Finish
            }
        };

        let request = match next {
            Next::Step(request) => request,
            Next::Build(builder) => match builder(self, previous.as_ref()) {
                Some(request) => {
                    let mut state = self.inner.state.lock();
                    if state.done {
                        return;
                    }
                    state.steps.push(ChainStep {
                        request: request.clone(),
                        callback: None,
                    });
                    state.next_index = state.steps.len();
                    request
                }
                None => return self.finalize(),
            },
            Next::Finish => return self.finalize(),
        };

        let synchronous = {
            let mut state = self.inner.state.lock();
            state.current = Some(request.clone());
            state.synchronous
        };
        debug!(
            chain_id = %self.id(),
            request_id = %request.id(),
            index = self.next_request_index() - 1,
            "Starting chain step"
        );

        request.suppress_ui();
        if synchronous {
            request.gated_by_group();
        }
        request.set_delegate(Arc::new(ChainMember {
            chain: Arc::downgrade(&self.inner),
        }));
        request.start();

        // A step cancelled before its turn never reports back
        if request.is_cancelled() {
            self.member_cancelled(&request);
        }
    }

    /// Runs on the main lane. A member cancelled from outside ends the
    /// chain as a failure.
    fn member_cancelled(&self, request: &Request) {
        {
            let mut state = self.inner.state.lock();
            if state.done || state.current.as_ref() != Some(request) {
                return;
            }
            state.current = None;
            state.failed = Some(request.clone());
            state.succeeded = None;
        }
        info!(chain_id = %self.id(), request_id = %request.id(), "Chain step cancelled, stopping chain");
        self.finalize();
    }

    /// Runs on the main lane
    fn member_completed(&self, request: &Request, succeeded: bool) {
        let callback = {
            let mut state = self.inner.state.lock();
            if state.done {
                return;
            }
            state.current = None;
            if succeeded {
                state.succeeded = Some(request.clone());
                state.failed = None;
            } else {
                state.failed = Some(request.clone());
                state.succeeded = None;
            }
            state
                .steps
                .iter()
                .find(|step| step.request == *request)
                .and_then(|step| step.callback.clone())
        };

        if let Some(callback) = callback {
            run_guarded("chain step", || callback(self, request));
        }

        let (stop, interval) = {
            let state = self.inner.state.lock();
            if state.done {
                return;
            }
            let stop = (!succeeded && state.stopped_on_failure)
                || (succeeded && state.stopped_on_success);
            (stop, state.request_interval)
        };

        if stop {
            self.finalize();
        } else if interval.is_zero() {
            self.start_next(Some(request.clone()));
        } else {
            let chain = self.clone();
            let previous = request.clone();
            let manager = self.inner.manager.clone();
            self.inner.manager.spawn(async move {
                tokio::time::sleep(interval).await;
                manager
                    .main()
                    .dispatch(move || chain.start_next(Some(previous)));
            });
        }
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
        self.inner.manager.deregister_chain(self.id());

        let id = self.id();
        if settled.shows_loading {
            if let Some(ui) = &settled.ui {
                ui.hide_loading();
            }
        }
        for accessory in &settled.accessories {
            accessory.will_stop(id);
        }

        let outcome = match failed {
            None => {
                info!(chain_id = %id, "Chain finished");
                run_guarded("chain success", || {
                    if let Some(delegate) = &settled.delegate {
                        delegate.chain_finished(self);
                    }
                    if let Some(success) = &settled.success {
                        success(self);
                    }
                });
                Ok(())
            }
            Some(failed) => {
                let error = failed.failure_reason();
                warn!(chain_id = %id, request_id = %failed.id(), error = %error, "Chain failed");
                run_guarded("chain failure", || {
                    if let Some(delegate) = &settled.delegate {
                        delegate.chain_failed(self);
                    }
                    if let Some(failure) = &settled.failure {
                        failure(self);
                    }
                    if let Some(ui) = &settled.ui {
                        ui.show_error(&error);
                    }
                });
                Err(GroupError::Failed {
                    failed: 1,
                    total: self.next_request_index(),
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

fn settle(state: &mut ChainState) -> Settled {
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

struct ChainMember {
    chain: Weak<ChainInner>,
}

impl ChainMember {
    fn chain(&self) -> Option<ChainRequest> {
        self.chain.upgrade().map(|inner| ChainRequest { inner })
    }
}

impl RequestDelegate for ChainMember {
    fn request_finished(&self, request: &Request) {
        if let Some(chain) = self.chain() {
            chain.member_completed(request, true);
        }
    }

    fn request_failed(&self, request: &Request) {
        if let Some(chain) = self.chain() {
            chain.member_completed(request, false);
        }
    }

    fn request_cancelled(&self, request: &Request) {
        if let Some(chain) = self.chain() {
            chain.member_cancelled(request);
        }
    }
}
