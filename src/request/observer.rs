//! Observers attached to requests and request groups
//!
//! All methods are called on the main lane.

use uuid::Uuid;

use super::Request;
use crate::error::RequestError;

/// Receives the terminal outcome of a request (never the cache preview)
pub trait RequestDelegate: Send + Sync {
    fn request_finished(&self, _request: &Request) {}
    fn request_failed(&self, _request: &Request) {}
    /// Called after the cancel callback
    fn request_cancelled(&self, _request: &Request) {}
}

/// Lifecycle hooks for auxiliary UI such as network activity indicators
pub trait RequestAccessory: Send + Sync {
    fn will_start(&self, _id: Uuid) {}
    fn will_stop(&self, _id: Uuid) {}
    fn did_stop(&self, _id: Uuid) {}
}

/// Loading and error surface owned by the caller
pub trait UiContext: Send + Sync {
    fn show_loading(&self, text: Option<&str>);
    fn hide_loading(&self);
    fn show_error(&self, error: &RequestError);
}
