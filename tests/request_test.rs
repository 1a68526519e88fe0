mod common;

use async_trait::async_trait;
use common::*;
use courier::error::{RequestError, TransportErrorKind};
use courier::manager::RequestManager;
use courier::mock::StaticMockProvider;
use courier::plugin::{HeaderPlugin, RequestPlugin};
use courier::request::{
    CachePolicy, Request, RequestConfig, RequestHooks, RequestState, RetryLimits,
};
use courier::retry::RetryFilter;
use courier::transport::{
    TaskControl, Transport, TransportBody, TransportCall, TransportResponse,
};
use courier::validator::{JsonValidator, is_not_null};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[tokio::test]
async fn test_success_delivers_payload_and_callback() {
    let transport = ScriptedTransport::new().route("users", vec![Script::ok(r#"{"users": [1, 2]}"#)]);
    let manager = manager(&transport);
    let events = Events::default();

    let request = get(&manager, "users");
    {
        let events = events.clone();
        request.on_success(move |r| {
            events.push(format!("success:{}", r.is_data_from_cache()));
        });
    }
    {
        let events = events.clone();
        request.on_failure(move |_| events.push("failure"));
    }

    let payload = request.send().await.unwrap();
    assert_eq!(payload.json().unwrap()["users"][1], 2);
    assert!(request.is_finished());
    assert_eq!(request.status_code(), Some(200));
    assert_eq!(request.attempts(), 1);
    assert_eq!(events.all(), vec!["success:false"]);
    assert_eq!(manager.active_requests(), 0);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.requests_started, 1);
    assert_eq!(metrics.requests_succeeded, 1);
}

#[tokio::test]
async fn test_invalid_status_fails() {
    let transport = ScriptedTransport::new().route("broken", vec![Script::status(500, "{}")]);
    let manager = manager(&transport);
    let events = Events::default();

    let request = get(&manager, "broken");
    {
        let events = events.clone();
        request.on_failure(move |r| {
            assert!(r.error().is_some());
            assert!(!r.is_cancelled());
            events.push("failure");
        });
    }

    let error = request.send().await.unwrap_err();
    assert!(matches!(error, RequestError::InvalidStatusCode(500)));
    assert!(error.is_request_error());
    assert!(request.is_failed());
    assert_eq!(events.count("failure"), 1);
}

#[tokio::test]
async fn test_json_validator_rejects_response() {
    let transport = ScriptedTransport::new().route("profile", vec![Script::ok(r#"{"name": null}"#)]);
    let manager = manager(&transport);

    let hooks = RequestHooks::new().json_validator(JsonValidator::map([(
        "name",
        JsonValidator::leaf(is_not_null),
    )]));
    let request = Request::with_hooks(
        &manager,
        RequestConfig::builder().path("profile").build(),
        hooks,
    );

    let error = request.send().await.unwrap_err();
    assert!(matches!(error, RequestError::InvalidResponseFormat(_)));
}

#[tokio::test]
async fn test_malformed_json_fails_but_raw_passes() {
    let transport = ScriptedTransport::new().route("page", vec![Script::ok("<html>")]);
    let manager = manager(&transport);

    let json = get(&manager, "page");
    assert!(matches!(
        json.send().await,
        Err(RequestError::InvalidResponseFormat(_))
    ));

    let raw = Request::new(
        &manager,
        RequestConfig::builder()
            .path("page")
            .response_serializer(courier::request::ResponseSerializer::Text)
            .build(),
    );
    let payload = raw.send().await.unwrap();
    assert_eq!(payload.text(), Some("<html>"));
}

#[tokio::test]
async fn test_missing_base_url_fails_without_registering() {
    let transport = ScriptedTransport::new();
    let manager = RequestManager::builder(courier::config::Config::default())
        .transport(transport.clone())
        .cache(courier::cache::CacheStore::in_memory("test"))
        .build()
        .unwrap();

    let request = get(&manager, "users");
    let error = request.send().await.unwrap_err();

    assert!(matches!(error, RequestError::InvalidUrl(_)));
    assert!(transport.calls().is_empty());
    assert_eq!(manager.active_requests(), 0);
}

#[tokio::test]
async fn test_retry_attempts_and_spacing() {
    let transport = ScriptedTransport::new().route("flaky", vec![Script::status(503, "{}")]);
    let manager = manager(&transport);
    let events = Events::default();

    let request = Request::with_hooks(
        &manager,
        RequestConfig::builder()
            .path("flaky")
            .retry(RetryLimits {
                count: 3,
                interval: Duration::from_secs(1),
                timeout: None,
            })
            .build(),
        RequestHooks::new().retry_validator(|_, _| true),
    );
    {
        let events = events.clone();
        request.on_failure(move |_| events.push("failure"));
    }

    let error = request.send().await.unwrap_err();
    assert!(matches!(error, RequestError::InvalidStatusCode(503)));

    let calls = transport.calls_to("flaky");
    assert_eq!(calls.len(), 4);
    assert_eq!(request.attempts(), 4);
    assert!(calls[3].at - calls[0].at >= Duration::from_secs(3));
    assert_eq!(events.count("failure"), 1);
    assert_eq!(manager.metrics().snapshot().retries, 3);
}

#[tokio::test]
async fn test_retry_recovers() {
    let transport = ScriptedTransport::new().route(
        "eventually",
        vec![Script::status(500, "{}"), Script::ok(r#"{"ok": true}"#)],
    );
    let manager = manager(&transport);

    let request = Request::new(
        &manager,
        RequestConfig::builder()
            .path("eventually")
            .retry(RetryLimits {
                count: 2,
                interval: Duration::from_millis(10),
                timeout: None,
            })
            .build(),
    );

    request.send().await.unwrap();
    assert_eq!(request.attempts(), 2);
    assert!(request.is_finished());
}

#[tokio::test]
async fn test_retry_processor_can_veto() {
    let transport = ScriptedTransport::new().route("flaky", vec![Script::status(500, "{}")]);
    let manager = manager(&transport);

    let request = Request::with_hooks(
        &manager,
        RequestConfig::builder()
            .path("flaky")
            .retry(RetryLimits {
                count: 5,
                interval: Duration::from_millis(1),
                timeout: None,
            })
            .build(),
        RequestHooks::new().retry_processor(|_| false),
    );

    assert!(request.send().await.is_err());
    assert_eq!(transport.calls_to("flaky").len(), 1);
}

struct NeverRetry;

#[async_trait]
impl RetryFilter for NeverRetry {
    async fn should_retry(&self, _request: &Request, error: &RequestError) -> Option<bool> {
        if error.status_code() == Some(401) {
            Some(false)
        } else {
            None
        }
    }
}

#[tokio::test]
async fn test_retry_filter_answers_first() {
    let transport = ScriptedTransport::new()
        .route("auth", vec![Script::status(401, "{}")])
        .route("busy", vec![Script::status(503, "{}"), Script::ok("{}")]);
    let manager = builder(&transport)
        .retry_filter(Arc::new(NeverRetry))
        .build()
        .unwrap();

    let limits = RetryLimits {
        count: 3,
        interval: Duration::from_millis(1),
        timeout: None,
    };
    let auth = Request::new(
        &manager,
        RequestConfig::builder().path("auth").retry(limits).build(),
    );
    let busy = Request::new(
        &manager,
        RequestConfig::builder().path("busy").retry(limits).build(),
    );

    assert!(auth.send().await.is_err());
    assert!(busy.send().await.is_ok());
    assert_eq!(transport.calls_to("auth").len(), 1);
    assert_eq!(transport.calls_to("busy").len(), 2);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let transport = ScriptedTransport::new().route(
        "slow",
        vec![Script::ok("{}").after(Duration::from_secs(5))],
    );
    let manager = manager(&transport);
    let events = Events::default();

    let request = get(&manager, "slow");
    {
        let events = events.clone();
        request.on_cancel(move |_| events.push("cancel"));
    }
    {
        let events = events.clone();
        request.on_success(move |_| events.push("success"));
    }

    request.start();
    wait_until(|| manager.active_requests() == 1).await;

    request.cancel();
    request.cancel();
    manager.flush().await;

    assert!(request.is_cancelled());
    assert_eq!(events.all(), vec!["cancel"]);
    assert_eq!(manager.active_requests(), 0);
    assert!(matches!(request.send().await, Err(RequestError::Cancelled)));
}

/// Holds the response until the test releases it
struct GatedTransport {
    returned: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn execute(&self, _call: TransportCall, _control: TaskControl) -> TransportResponse {
        self.returned.notify_one();
        self.release.notified().await;
        TransportResponse::ok(200, "{}")
    }
}

#[tokio::test]
async fn test_cancel_racing_the_pipeline_fires_one_callback() {
    let transport = Arc::new(GatedTransport {
        returned: Notify::new(),
        release: Notify::new(),
    });
    let manager = RequestManager::builder(test_config())
        .transport(transport.clone())
        .cache(courier::cache::CacheStore::in_memory("test"))
        .build()
        .unwrap();
    let events = Events::default();

    let request = get(&manager, "race");
    for event in ["success", "failure", "cancel"] {
        let events = events.clone();
        let record = move |_: &Request| events.push(event);
        match event {
            "success" => request.on_success(record),
            "failure" => request.on_failure(record),
            _ => request.on_cancel(record),
        };
    }

    request.start();
    transport.returned.notified().await;
    request.cancel();
    transport.release.notify_one();

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.flush().await;

    assert_eq!(events.all(), vec!["cancel"]);
    assert_eq!(request.state(), RequestState::Cancelled);
}

#[tokio::test]
async fn test_transport_error_is_connectivity() {
    let transport = ScriptedTransport::new().route(
        "offline",
        vec![Script::error(RequestError::transport(
            TransportErrorKind::Connect,
            "connection refused",
        ))],
    );
    let manager = manager(&transport);

    let error = get(&manager, "offline").send().await.unwrap_err();
    assert!(error.is_connectivity_error());
    assert!(!error.is_request_error());
}

#[tokio::test]
async fn test_cache_preview_fires_success_twice() {
    let transport = ScriptedTransport::new().route(
        "feed",
        vec![Script::ok(r#"{"v": 1}"#), Script::ok(r#"{"v": 2}"#)],
    );
    let manager = manager(&transport);
    let config = || {
        RequestConfig::builder()
            .path("feed")
            .cache(CachePolicy::with_ttl(60).preloaded())
            .build()
    };

    let first = Request::new(&manager, config());
    first.send().await.unwrap();
    assert!(!first.is_data_from_cache());

    let events = Events::default();
    let second = Request::new(&manager, config());
    {
        let events = events.clone();
        second.on_success(move |r| {
            let v = r.response_json().unwrap()["v"].clone();
            events.push(format!("{}:{}", r.is_data_from_cache(), v));
        });
    }

    let payload = second.send().await.unwrap();
    assert_eq!(payload.json().unwrap()["v"], 2);
    assert_eq!(events.all(), vec!["true:1", "false:2"]);
    assert!(!second.is_data_from_cache());
    assert_eq!(transport.calls_to("feed").len(), 2);

    let metrics = manager.metrics().snapshot();
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 1);
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let transport = ScriptedTransport::new().route(
        "paused",
        vec![Script::ok("{}").after(Duration::from_millis(20))],
    );
    let manager = manager(&transport);

    let request = get(&manager, "paused");
    request.start();
    request.suspend();
    assert!(request.is_suspended());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!request.is_finished());

    request.resume();
    assert_eq!(request.state(), RequestState::Started);
    request.send().await.unwrap();
    assert!(request.is_finished());
}

#[tokio::test]
async fn test_start_is_one_shot() {
    let transport = ScriptedTransport::new().route("once", vec![Script::ok("{}")]);
    let manager = manager(&transport);

    let request = get(&manager, "once");
    request.start();
    request.start();
    request.send().await.unwrap();
    request.start();
    manager.flush().await;

    assert_eq!(transport.calls_to("once").len(), 1);
}

#[tokio::test]
async fn test_synchronous_requests_do_not_overlap() {
    let transport = ScriptedTransport::new().route(
        "serial",
        vec![Script::ok("{}").after(Duration::from_millis(100))],
    );
    let manager = manager(&transport);
    let config = || RequestConfig::builder().path("serial").synchronous(true).build();

    let a = Request::new(&manager, config());
    let b = Request::new(&manager, config());
    let (ra, rb) = tokio::join!(a.send(), b.send());
    ra.unwrap();
    rb.unwrap();

    let calls = transport.calls_to("serial");
    assert_eq!(calls.len(), 2);
    let gap = if calls[1].at > calls[0].at {
        calls[1].at - calls[0].at
    } else {
        calls[0].at - calls[1].at
    };
    assert!(gap >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_mock_replaces_failure() {
    let transport = ScriptedTransport::new().route("config", vec![Script::status(502, "")]);
    let mock = StaticMockProvider::new(200).with_response("/config", r#"{"mocked": true}"#);
    let manager = builder(&transport).mock(Arc::new(mock)).build().unwrap();

    let payload = get(&manager, "config").send().await.unwrap();
    assert_eq!(payload.json().unwrap()["mocked"], true);
}

struct RejectEmpty;

impl RequestPlugin for RejectEmpty {
    fn validate(&self, request: &Request) -> Result<(), RequestError> {
        match request.response_json() {
            Some(value) if value.as_object().is_some_and(|o| o.is_empty()) => Err(
                RequestError::InvalidResponseFormat("empty object".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn test_plugins_prepare_and_validate() {
    let transport = ScriptedTransport::new()
        .route("empty", vec![Script::ok("{}")])
        .route("full", vec![Script::ok(r#"{"a": 1}"#)]);
    let manager = builder(&transport)
        .plugin(Arc::new(HeaderPlugin::new("X-Client", "courier-tests")))
        .plugin(Arc::new(RejectEmpty))
        .build()
        .unwrap();

    assert!(get(&manager, "empty").send().await.is_err());
    assert!(get(&manager, "full").send().await.is_ok());

    let call = &transport.calls_to("full")[0];
    assert!(
        call.headers
            .iter()
            .any(|(n, v)| n == "X-Client" && v == "courier-tests")
    );
}

#[tokio::test]
async fn test_model_is_decoded_before_delivery() {
    #[derive(Debug, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    let transport =
        ScriptedTransport::new().route("me", vec![Script::ok(r#"{"id": 7, "name": "ada"}"#)]);
    let manager = manager(&transport);
    let events = Events::default();

    let request = Request::with_hooks(
        &manager,
        RequestConfig::builder().path("me").build(),
        RequestHooks::new().decode_model::<User>(),
    );
    {
        let events = events.clone();
        request.on_success(move |r| {
            let user = r.model::<User>().unwrap();
            events.push(format!("{}:{}", user.id, user.name));
        });
    }

    request.send().await.unwrap();
    assert_eq!(events.all(), vec!["7:ada"]);
}

#[tokio::test]
async fn test_cancel_all_requests() {
    let transport = ScriptedTransport::new().route(
        "slow",
        vec![Script::ok("{}").after(Duration::from_secs(5))],
    );
    let manager = manager(&transport);

    let requests: Vec<Request> = (0..3).map(|_| get(&manager, "slow")).collect();
    for request in &requests {
        request.start();
    }
    wait_until(|| manager.active_requests() == 3).await;

    let started = Instant::now();
    manager.cancel_all_requests();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(manager.active_requests(), 0);
    assert!(requests.iter().all(Request::is_cancelled));
}

/// Answers every call with a 500 whose body was spooled to `file`
struct SpooledFailure {
    file: PathBuf,
}

#[async_trait]
impl Transport for SpooledFailure {
    async fn execute(&self, _call: TransportCall, _control: TaskControl) -> TransportResponse {
        TransportResponse {
            status: Some(500),
            headers: BTreeMap::new(),
            body: TransportBody::File(self.file.clone()),
            error: None,
        }
    }
}

fn spooled_manager(file: &Path) -> RequestManager {
    RequestManager::builder(test_config())
        .transport(Arc::new(SpooledFailure {
            file: file.to_path_buf(),
        }))
        .cache(courier::cache::CacheStore::in_memory("test"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_failure_removes_temporary_body_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let spooled = dir.path().join("body.tmp");
    tokio::fs::write(&spooled, b"{}").await.unwrap();
    let manager = spooled_manager(&spooled);

    let error = get(&manager, "report").send().await.unwrap_err();

    assert!(matches!(error, RequestError::InvalidStatusCode(500)));
    assert!(!spooled.exists());
}

#[tokio::test]
async fn test_failure_keeps_download_target() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("archive.zip");
    tokio::fs::write(&target, b"partial").await.unwrap();
    let manager = spooled_manager(&target);

    let request = Request::new(
        &manager,
        RequestConfig::builder()
            .path("archive.zip")
            .response_serializer(courier::request::ResponseSerializer::Raw)
            .download_path(target.clone())
            .build(),
    );

    assert!(request.send().await.is_err());
    assert!(target.exists());
}

#[tokio::test]
async fn test_panicking_callback_still_resolves_send() {
    let transport = ScriptedTransport::new().route("ok", vec![Script::ok("{}")]);
    let manager = manager(&transport);

    let request = get(&manager, "ok");
    request.on_success(|_| panic!("callback bug"));

    assert!(request.send().await.is_ok());
    assert!(request.is_finished());

    let after = get(&manager, "ok");
    assert!(after.send().await.is_ok());
}

#[tokio::test]
async fn test_cancel_notifies_delegate() {
    struct Recorder(Events);

    impl courier::request::RequestDelegate for Recorder {
        fn request_cancelled(&self, _request: &Request) {
            self.0.push("delegate-cancel");
        }
    }

    let transport = ScriptedTransport::new().route(
        "slow",
        vec![Script::ok("{}").after(Duration::from_secs(5))],
    );
    let manager = manager(&transport);
    let events = Events::default();

    let request = get(&manager, "slow");
    {
        let events = events.clone();
        request.on_cancel(move |_| events.push("cancel"));
    }
    request.set_delegate(Arc::new(Recorder(events.clone())));

    request.start();
    request.cancel();
    manager.flush().await;

    assert_eq!(events.all(), vec!["cancel", "delegate-cancel"]);
}
