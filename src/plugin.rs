//! Manager-wide request plugins

use crate::error::RequestError;
use crate::request::Request;
use crate::transport::TransportCall;

/// Hooks applied to every request a manager runs
pub trait RequestPlugin: Send + Sync {
    /// Adjust the call (e.g. add headers) before it is dispatched
    fn prepare(&self, _call: &mut TransportCall, _request: &Request) {}

    fn will_send(&self, _request: &Request) {}

    fn did_receive(&self, _request: &Request) {}

    /// Global response filter; runs on responses that passed every
    /// request-level check. An error fails the attempt.
    fn validate(&self, _request: &Request) -> Result<(), RequestError> {
        Ok(())
    }
}

/// Adds a fixed header to every call
pub struct HeaderPlugin {
    name: String,
    value: String,
}

impl HeaderPlugin {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl RequestPlugin for HeaderPlugin {
    fn prepare(&self, call: &mut TransportCall, _request: &Request) {
        call.set_header(self.name.clone(), self.value.clone());
    }
}
