//! Per-call execution context.
//!
//! Options that only concern a single call (retry override, forced retry,
//! breaker override, deadline, cancellation) travel explicitly through the
//! middleware chain in a [`CallContext`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryStrategy;
use crate::{HttpClientError, Result};

/// Per-call options threaded through the middleware chain.
#[derive(Clone, Default)]
pub struct CallContext {
    retry: Option<Arc<dyn RetryStrategy>>,
    force_retry: bool,
    circuit_breaker: Option<bool>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Create an empty context: no deadline, no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the call by a timeout starting now. A zero timeout means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            self.timeout = None;
            self.deadline = None;
        } else {
            self.timeout = Some(timeout);
            self.deadline = Some(Instant::now() + timeout);
        }
        self
    }

    /// Use the caller's cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Override the retry strategy for this call.
    pub fn with_retry(mut self, strategy: Option<Arc<dyn RetryStrategy>>) -> Self {
        self.retry = strategy;
        self
    }

    /// Allow retries of non-idempotent methods.
    pub fn with_force_retry(mut self, force: bool) -> Self {
        self.force_retry = force;
        self
    }

    /// Force the circuit breaker on or off for this call.
    pub fn with_circuit_breaker(mut self, enabled: Option<bool>) -> Self {
        self.circuit_breaker = enabled;
        self
    }

    /// Retry strategy override, if any.
    pub fn retry(&self) -> Option<&Arc<dyn RetryStrategy>> {
        self.retry.as_ref()
    }

    /// Whether non-idempotent methods may be retried.
    pub fn force_retry(&self) -> bool {
        self.force_retry
    }

    /// Circuit breaker override, if any.
    pub fn circuit_breaker(&self) -> Option<bool> {
        self.circuit_breaker
    }

    /// Deadline of the call, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancellation token of the call.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Fail if the call has already been cancelled or is past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(HttpClientError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(self.deadline_error());
        }
        Ok(())
    }

    /// Wait for `delay`, aborting early on cancellation or deadline.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.check()?;
        if delay.is_zero() {
            return Ok(());
        }
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Drive `fut` to completion unless the call is cancelled or its
    /// deadline passes first. The losing future is dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(HttpClientError::Cancelled),
            _ = deadline => Err(self.deadline_error()),
            result = fut => result,
        }
    }

    fn deadline_error(&self) -> HttpClientError {
        HttpClientError::DeadlineExceeded(self.timeout.unwrap_or_default())
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("retry_override", &self.retry.is_some())
            .field("force_retry", &self.force_retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}
