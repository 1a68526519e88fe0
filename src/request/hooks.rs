//! Per-request strategy hooks
//!
//! Every hook is optional. When absent the documented default applies.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

use super::Request;
use crate::error::RequestError;
use crate::validator::{JsonValidator, is_success_status};

pub(crate) type RequestFn = Arc<dyn Fn(&Request) + Send + Sync>;
type StatusFn = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type FilterFn = Arc<dyn Fn(&Request) -> Result<(), RequestError> + Send + Sync>;
type ArgumentFn = Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;
type RetryValidatorFn = Arc<dyn Fn(&Request, Option<&RequestError>) -> bool + Send + Sync>;
type RetryProcessorFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;
pub(crate) type Model = Arc<dyn Any + Send + Sync>;
type DecoderFn = Arc<dyn Fn(&[u8]) -> Result<Model, RequestError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RequestHooks {
    json_validator: Option<JsonValidator>,
    status_validator: Option<StatusFn>,
    response_filter: Option<FilterFn>,
    cache_argument_filter: Option<ArgumentFn>,
    retry_validator: Option<RetryValidatorFn>,
    retry_processor: Option<RetryProcessorFn>,
    completion_preprocessor: Option<RequestFn>,
    completion_filter: Option<RequestFn>,
    failure_preprocessor: Option<RequestFn>,
    failure_filter: Option<RequestFn>,
    model_decoder: Option<DecoderFn>,
}

impl RequestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural check of the JSON body
    pub fn json_validator(mut self, validator: JsonValidator) -> Self {
        self.json_validator = Some(validator);
        self
    }

    /// Default accepts 200..=299
    pub fn status_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.status_validator = Some(Arc::new(f));
        self
    }

    /// Runs first on every response; an error fails the attempt
    pub fn response_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> Result<(), RequestError> + Send + Sync + 'static,
    {
        self.response_filter = Some(Arc::new(f));
        self
    }

    /// Maps the arguments before they contribute to the cache key
    pub fn cache_argument_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.cache_argument_filter = Some(Arc::new(f));
        self
    }

    /// Default retries when an error is present or the status is not 2xx
    pub fn retry_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, Option<&RequestError>) -> bool + Send + Sync + 'static,
    {
        self.retry_validator = Some(Arc::new(f));
        self
    }

    /// Last word on a retry the validator approved
    pub fn retry_processor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.retry_processor = Some(Arc::new(f));
        self
    }

    /// Runs off the main lane before success delivery
    pub fn completion_preprocessor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.completion_preprocessor = Some(Arc::new(f));
        self
    }

    /// Runs on the main lane before the delegate and success callback
    pub fn completion_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.completion_filter = Some(Arc::new(f));
        self
    }

    pub fn failure_preprocessor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.failure_preprocessor = Some(Arc::new(f));
        self
    }

    pub fn failure_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.failure_filter = Some(Arc::new(f));
        self
    }

    /// Decode the JSON body into `T` during completion preprocessing.
    /// Read it back with [`Request::model`].
    pub fn decode_model<T>(mut self) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.model_decoder = Some(Arc::new(|bytes: &[u8]| {
            serde_json::from_slice::<T>(bytes)
                .map(|model| Arc::new(model) as Model)
                .map_err(|e| RequestError::InvalidResponseFormat(e.to_string()))
        }));
        self
    }

    pub(crate) fn has_json_validator(&self) -> bool {
        self.json_validator.is_some()
    }

    pub(crate) fn validate_json(&self, value: &Value) -> bool {
        self.json_validator
            .as_ref()
            .is_none_or(|validator| validator.validate(value))
    }

    pub(crate) fn validate_status(&self, status: u16) -> bool {
        match &self.status_validator {
            Some(f) => f(status),
            None => is_success_status(status),
        }
    }

    pub(crate) fn filter_response(&self, request: &Request) -> Result<(), RequestError> {
        match &self.response_filter {
            Some(f) => f(request),
            None => Ok(()),
        }
    }

    pub(crate) fn cache_arguments(&self, arguments: Option<&Value>) -> Option<Value> {
        match &self.cache_argument_filter {
            Some(f) => f(arguments),
            None => arguments.cloned(),
        }
    }

    pub(crate) fn should_retry(&self, request: &Request, error: Option<&RequestError>) -> bool {
        match &self.retry_validator {
            Some(f) => f(request, error),
            None => {
                error.is_some()
                    || request
                        .status_code()
                        .is_some_and(|status| !is_success_status(status))
            }
        }
    }

    pub(crate) fn confirm_retry(&self, request: &Request) -> bool {
        self.retry_processor.as_ref().is_none_or(|f| f(request))
    }

    pub(crate) fn preprocess_completion(&self, request: &Request) {
        if let Some(f) = &self.completion_preprocessor {
            f(request);
        }
    }

    pub(crate) fn filter_completion(&self, request: &Request) {
        if let Some(f) = &self.completion_filter {
            f(request);
        }
    }

    pub(crate) fn preprocess_failure(&self, request: &Request) {
        if let Some(f) = &self.failure_preprocessor {
            f(request);
        }
    }

    pub(crate) fn filter_failure(&self, request: &Request) {
        if let Some(f) = &self.failure_filter {
            f(request);
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Option<Result<Model, RequestError>> {
        self.model_decoder.as_ref().map(|decoder| decoder(bytes))
    }
}

impl std::fmt::Debug for RequestHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHooks")
            .field("json_validator", &self.json_validator.is_some())
            .field("status_validator", &self.status_validator.is_some())
            .field("response_filter", &self.response_filter.is_some())
            .field("model_decoder", &self.model_decoder.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let hooks = RequestHooks::new();
        assert!(hooks.validate_status(204));
        assert!(!hooks.validate_status(404));
        assert!(hooks.validate_json(&json!(null)));
        assert_eq!(
            hooks.cache_arguments(Some(&json!({"a": 1}))),
            Some(json!({"a": 1}))
        );
        assert!(hooks.decode(b"{}").is_none());
    }

    #[test]
    fn test_overrides() {
        let hooks = RequestHooks::new()
            .status_validator(|status| status == 404)
            .cache_argument_filter(|_| None)
            .json_validator(JsonValidator::map([(
                "id",
                JsonValidator::leaf(crate::validator::is_number),
            )]));

        assert!(hooks.validate_status(404));
        assert!(!hooks.validate_status(200));
        assert!(hooks.cache_arguments(Some(&json!({"ts": 1}))).is_none());
        assert!(hooks.validate_json(&json!({"id": 1})));
        assert!(!hooks.validate_json(&json!({"id": "1"})));
    }

    #[test]
    fn test_decode_model() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct User {
            name: String,
        }

        let hooks = RequestHooks::new().decode_model::<User>();
        let model = hooks.decode(br#"{"name": "ada"}"#).unwrap().unwrap();
        let user = model.downcast::<User>().unwrap();
        assert_eq!(user.name, "ada");

        let failed = hooks.decode(b"not json").unwrap();
        assert!(matches!(failed, Err(RequestError::InvalidResponseFormat(_))));
    }
}
