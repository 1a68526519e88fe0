//! Retry decisions

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::RequestError;
use crate::request::{Request, RetryLimits};

/// Custom retry judgment consulted before the default algorithm.
/// `None` defers to the default.
#[async_trait]
pub trait RetryFilter: Send + Sync {
    async fn should_retry(&self, request: &Request, error: &RequestError) -> Option<bool>;
}

/// Decides whether a failed attempt is resubmitted
pub struct RetryPolicy {
    filter: Option<Arc<dyn RetryFilter>>,
    gate: Semaphore,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RetryPolicy {
    pub fn new(filter: Option<Arc<dyn RetryFilter>>) -> Self {
        Self {
            filter,
            gate: Semaphore::new(1),
        }
    }

    pub async fn should_retry(
        &self,
        request: &Request,
        error: &RequestError,
        limits: &RetryLimits,
    ) -> bool {
        if let Some(filter) = &self.filter {
            // One custom judgment at a time per policy
            if let Ok(_permit) = self.gate.acquire().await {
                if let Some(answer) = filter.should_retry(request, error).await {
                    debug!(request_id = %request.id(), answer, "Retry filter decided");
                    return answer;
                }
            }
        }

        let elapsed = request
            .started_at()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        if !within_budget(limits, request.attempts(), elapsed) {
            return false;
        }

        request.hooks().should_retry(request, Some(error)) && request.hooks().confirm_retry(request)
    }
}

/// Count and time budget check for a request that has made `attempts`
/// attempts and has been running for `elapsed`
pub fn within_budget(limits: &RetryLimits, attempts: u32, elapsed: Duration) -> bool {
    let remaining = i64::from(limits.count) - (i64::from(attempts) - 1);
    if limits.count >= 0 && remaining <= 0 {
        return false;
    }

    match limits.timeout {
        Some(timeout) => elapsed + limits.interval < timeout,
        None => true,
    }
}
