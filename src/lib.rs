pub mod batch;
pub mod cache;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod mock;
pub mod observability;
pub mod plugin;
pub mod request;
pub mod retry;
pub mod transport;
pub mod validator;
