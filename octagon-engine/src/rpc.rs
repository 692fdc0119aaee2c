//! Retrying client for the remote peer-list service.
//!
//! Errors are classified by [`OctagonError::class`](crate::OctagonError::class):
//!
//! - retryable errors back off, starting at `initial_delay` and doubling up
//!   to `max_delay`; the first retry honours a server hint but stays within
//!   `[initial_delay, first_retry_ceiling]`
//! - transactional conflicts retry after `conflict_delay`, and the next
//!   attempt is told so it can refetch before rebuilding its request
//! - fatal errors return immediately
//!
//! Caller timeouts live on the state machine request, not here: a caller
//! that stops waiting leaves the retries running to completion.

use crate::error::{ErrorClass, OctagonResult};
use crate::service::{
    EstablishRequest, JoinRequest, PeerListChanges, PeerListService, ViableBottle,
};
use octagon_trust::PolicyDocument;
use octagon_types::ContainerName;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound for the first retry, whatever the server asks for.
    #[serde(with = "humantime_serde")]
    pub first_retry_ceiling: Duration,
    pub multiplier: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub conflict_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(32),
            first_retry_ceiling: Duration::from_secs(8),
            multiplier: 2.0,
            max_attempts: 6,
            conflict_delay: Duration::from_millis(200),
        }
    }
}

/// Passed to each attempt of a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// The previous attempt hit a transactional conflict.
    pub after_conflict: bool,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            number: 1,
            after_conflict: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `failure`-th retryable error.
    pub fn backoff(&self, failure: u32, hint: Option<Duration>) -> Duration {
        let exponent = i32::try_from(failure.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .clamp(0.0, self.max_delay.as_secs_f64());
        let computed = Duration::from_secs_f64(secs);
        if failure <= 1 {
            hint.unwrap_or(computed)
                .max(self.initial_delay)
                .min(self.first_retry_ceiling)
        } else {
            hint.map_or(computed, |h| h.max(computed)).min(self.max_delay)
        }
    }

    /// Runs `call` until it succeeds, fails fatally, or runs out of
    /// attempts. Caller deadlines are enforced by the request that owns the
    /// call; a caller giving up does not stop the retries.
    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> OctagonResult<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = OctagonResult<T>>,
    {
        let mut attempt = Attempt::first();
        let mut transient_failures = 0u32;

        loop {
            let error = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let class = error.class();
            let delay = match class {
                ErrorClass::Fatal => return Err(error),
                ErrorClass::Retryable => {
                    transient_failures += 1;
                    self.backoff(transient_failures, error.retry_after())
                }
                ErrorClass::TransactionalConflict => self.conflict_delay,
            };

            if attempt.number >= self.max_attempts {
                warn!(op, attempts = attempt.number, error = %error, "giving up");
                return Err(error);
            }
            debug!(op, attempt = attempt.number, ?delay, error = %error, "retrying");
            tokio::time::sleep(delay).await;
            attempt = Attempt {
                number: attempt.number + 1,
                after_conflict: class == ErrorClass::TransactionalConflict,
            };
        }
    }
}

/// A [`PeerListService`] whose idempotent calls are retried.
#[derive(Clone)]
pub struct RetryingRpcClient {
    service: Arc<dyn PeerListService>,
    policy: RetryPolicy,
}

impl RetryingRpcClient {
    pub fn new(service: Arc<dyn PeerListService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// The underlying service, for calls that manage their own retries.
    pub fn service(&self) -> &Arc<dyn PeerListService> {
        &self.service
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries an arbitrary call under this client's policy.
    pub async fn with_retry<T, F, Fut>(&self, op: &str, call: F) -> OctagonResult<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = OctagonResult<T>>,
    {
        self.policy.run(op, call).await
    }

    pub async fn reset(&self, container: &ContainerName) -> OctagonResult<()> {
        self.with_retry("reset", |_| self.service.reset(container)).await
    }

    pub async fn establish(
        &self,
        container: &ContainerName,
        request: &EstablishRequest,
    ) -> OctagonResult<PeerListChanges> {
        self.with_retry("establish", |_| {
            self.service.establish(container, request.clone())
        })
        .await
    }

    pub async fn join(
        &self,
        container: &ContainerName,
        request: &JoinRequest,
    ) -> OctagonResult<PeerListChanges> {
        self.with_retry("join", |_| self.service.join(container, request.clone()))
            .await
    }

    pub async fn fetch_changes(&self, container: &ContainerName) -> OctagonResult<PeerListChanges> {
        self.with_retry("fetch_changes", |_| self.service.fetch_changes(container))
            .await
    }

    pub async fn fetch_viable_bottles(
        &self,
        container: &ContainerName,
    ) -> OctagonResult<Vec<ViableBottle>> {
        self.with_retry("fetch_viable_bottles", |_| {
            self.service.fetch_viable_bottles(container)
        })
        .await
    }

    pub async fn fetch_policy_documents(
        &self,
        container: &ContainerName,
        versions: &[u64],
    ) -> OctagonResult<Vec<PolicyDocument>> {
        self.with_retry("fetch_policy_documents", |_| {
            self.service.fetch_policy_documents(container, versions)
        })
        .await
    }
}

impl std::fmt::Debug for RetryingRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingRpcClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_is_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1, None), Duration::from_secs(4));
        assert_eq!(policy.backoff(1, Some(Duration::from_secs(1))), Duration::from_secs(4));
        assert_eq!(policy.backoff(1, Some(Duration::from_secs(60))), Duration::from_secs(8));
        assert_eq!(policy.backoff(1, Some(Duration::from_secs(6))), Duration::from_secs(6));
    }

    #[test]
    fn later_retries_double_up_to_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(2, None), Duration::from_secs(8));
        assert_eq!(policy.backoff(3, None), Duration::from_secs(16));
        assert_eq!(policy.backoff(10, None), Duration::from_secs(32));
        assert_eq!(policy.backoff(2, Some(Duration::from_secs(20))), Duration::from_secs(20));
    }
}
