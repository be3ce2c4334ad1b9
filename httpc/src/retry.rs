//! Retry configuration, policy and middleware.

use async_trait::async_trait;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::context::CallContext;
use crate::middleware::{Middleware, Next};
use crate::request::WireRequest;
use crate::response::WireResponse;
use crate::{HttpClientError, Result};

/// Fraction of the backoff added at most as jitter.
const JITTER_FRACTION: f64 = 0.2;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_backoff: Duration,
    /// Cap on the backoff before jitter.
    pub max_backoff: Duration,
    /// Status codes that should trigger a retry.
    pub retry_status_codes: Vec<u16>,
    /// Only retry idempotent methods unless the call forces it.
    pub idempotent_only: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_status_codes: vec![502, 503, 504],
            idempotent_only: true,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with exponential backoff.
    pub fn exponential(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            ..Default::default()
        }
    }

    /// Set the backoff cap.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Replace the retryable status codes.
    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }

    /// Allow retrying non-idempotent methods.
    pub fn allow_non_idempotent(mut self) -> Self {
        self.idempotent_only = false;
        self
    }

    /// Backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` is 1-based: `min(base * 2^(attempt - 1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Check if a status code should trigger a retry.
    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Outcome of a single attempt, as seen by a retry strategy.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// The attempt produced a response.
    Response(StatusCode),
    /// The attempt failed.
    Error(&'a HttpClientError),
}

/// Retry strategy trait for custom retry logic.
pub trait RetryStrategy: Send + Sync {
    /// Decide whether to run another attempt after `attempt` (1-based) and
    /// how long to wait first. `None` stops retrying.
    fn should_retry(
        &self,
        method: &Method,
        outcome: AttemptOutcome<'_>,
        attempt: u32,
        force: bool,
    ) -> Option<Duration>;
}

/// Methods retried without a force flag.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Exponential backoff policy with jitter.
///
/// The jitter source is the only mutable state; it is shared by every call
/// using the policy.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    /// Create a policy seeded from the OS.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create a policy with a deterministic jitter sequence.
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The policy configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before attempt `attempt + 1`, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self.config.delay_for_attempt(attempt);
        let factor: f64 = self.rng.lock().random_range(0.0..=JITTER_FRACTION);
        backoff + backoff.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryStrategy for RetryPolicy {
    fn should_retry(
        &self,
        method: &Method,
        outcome: AttemptOutcome<'_>,
        attempt: u32,
        force: bool,
    ) -> Option<Duration> {
        if attempt >= self.config.max_attempts {
            return None;
        }
        if self.config.idempotent_only && !force && !is_idempotent(method) {
            return None;
        }

        let retry = match outcome {
            AttemptOutcome::Error(error) => !error.is_cancellation() && error.is_transient(),
            AttemptOutcome::Response(status) => self.config.should_retry_status(status.as_u16()),
        };

        retry.then(|| self.backoff(attempt))
    }
}

/// Middleware re-running the rest of the chain per the effective strategy.
///
/// The strategy is the call's override, else the client default; without
/// either, the request is sent once.
pub struct RetryMiddleware {
    default: Option<Arc<dyn RetryStrategy>>,
}

impl RetryMiddleware {
    /// Create a retry middleware with the client's default strategy.
    pub fn new(default: Option<Arc<dyn RetryStrategy>>) -> Self {
        Self { default }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse> {
        let Some(strategy) = ctx.retry().or(self.default.as_ref()).cloned() else {
            return next.run(request, ctx).await;
        };

        let mut attempt = 1;
        let mut current = request.clone();
        loop {
            let result = next.run(current, ctx).await;

            let outcome = match &result {
                Ok(response) => AttemptOutcome::Response(response.status()),
                Err(error) => AttemptOutcome::Error(error),
            };
            let Some(delay) =
                strategy.should_retry(request.method(), outcome, attempt, ctx.force_retry())
            else {
                return result;
            };

            // Release the failed attempt's body before the next one starts.
            drop(result);

            debug!(
                method = %request.method(),
                url = %request.url(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying HTTP request"
            );

            ctx.sleep(delay).await?;
            attempt += 1;
            current = request.rebuild()?;
        }
    }
}
