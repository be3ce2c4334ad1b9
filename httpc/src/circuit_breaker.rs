//! Circuit breaker pattern implementation.
//!
//! One [`CircuitBreaker`] guards one host. The [`CircuitBreakerManager`]
//! creates breakers lazily, keyed by `host[:port]`, and keeps them for the
//! lifetime of the client that owns it.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::middleware::{Middleware, Next};
use crate::request::WireRequest;
use crate::response::WireResponse;
use crate::{HttpClientError, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests are allowed.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, a single trial request is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Callback invoked on every state transition with `(host, from, to)`.
pub type StateChangeFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures to open the circuit.
    pub failure_threshold: u32,
    /// Time to wait before letting a trial request through.
    pub reset_timeout: Duration,
    /// State transition observer.
    pub on_state_change: Option<StateChangeFn>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            ..Default::default()
        }
    }

    /// Observe state transitions.
    pub fn with_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    changed_at: Instant,
    // Bumped on every transition; outcomes from an older generation are stale.
    generation: u64,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.changed_at = Instant::now();
        self.generation += 1;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        (from, to)
    }
}

/// Per-host circuit breaker.
///
/// All state lives behind one lock, so transitions are linearizable.
pub struct CircuitBreaker {
    host: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker for `host`.
    pub fn new(host: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            host: host.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                changed_at: Instant::now(),
                generation: 0,
                trial_in_flight: false,
            }),
        }
    }

    /// Host guarded by this breaker.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Ask for admission of one call.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits the caller as its single trial. Outcomes are reported through
    /// the returned permit.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut changed = None;
        let permit = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(self.permit(inner.generation, false)),
                CircuitState::Open => {
                    if inner.changed_at.elapsed() >= self.config.reset_timeout {
                        changed = Some(inner.transition(CircuitState::HalfOpen));
                        inner.trial_in_flight = true;
                        Ok(self.permit(inner.generation, true))
                    } else {
                        Err(self.open_error())
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        Err(self.open_error())
                    } else {
                        inner.trial_in_flight = true;
                        Ok(self.permit(inner.generation, true))
                    }
                }
            }
        };

        if let Some((from, to)) = changed {
            self.notify(from, to);
        }
        permit
    }

    /// Run `fut` if admitted, recording its outcome. Any `Err` counts as a
    /// failure; responses of every status count as successes.
    pub async fn execute<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = fut.await;
        permit.record(result.is_ok());
        result
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            (inner.state != CircuitState::Closed).then(|| inner.transition(CircuitState::Closed))
        };
        if let Some((from, to)) = changed {
            self.notify(from, to);
        }
    }

    fn permit(&self, generation: u64, trial: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            generation,
            trial,
            recorded: false,
        }
    }

    fn open_error(&self) -> HttpClientError {
        HttpClientError::CircuitOpen {
            host: self.host.clone(),
        }
    }

    fn record(&self, generation: u64, success: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(host = %self.host, "Ignoring stale circuit breaker outcome");
                return;
            }
            match (inner.state, success) {
                (CircuitState::Closed, true) => {
                    inner.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, false) => {
                    inner.consecutive_failures += 1;
                    (inner.consecutive_failures >= self.config.failure_threshold)
                        .then(|| inner.transition(CircuitState::Open))
                }
                (CircuitState::HalfOpen, true) => Some(inner.transition(CircuitState::Closed)),
                (CircuitState::HalfOpen, false) => Some(inner.transition(CircuitState::Open)),
                (CircuitState::Open, _) => None,
            }
        };

        if let Some((from, to)) = changed {
            self.notify(from, to);
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                warn!(host = %self.host, %from, %to, "Circuit breaker opening")
            }
            CircuitState::Closed => {
                info!(host = %self.host, %from, %to, "Circuit breaker closing")
            }
            CircuitState::HalfOpen => {
                debug!(host = %self.host, %from, %to, "Circuit breaker transitioning to half-open")
            }
        }
        if let Some(callback) = &self.config.on_state_change {
            callback(&self.host, from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("host", &self.host)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

/// Admission granted by [`CircuitBreaker::acquire`].
///
/// Dropping a trial permit without recording frees the half-open slot and
/// leaves the state unchanged.
#[must_use = "record the outcome of the admitted call"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    recorded: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the outcome of the admitted call.
    pub fn record(mut self, success: bool) {
        self.recorded = true;
        self.breaker.record(self.generation, success);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.recorded {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// Lazily populated map of per-host breakers.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    /// Create an empty manager; new breakers use `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `host`, created on first use.
    pub fn get(&self, host: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(host) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(host, self.config.clone())))
            .clone()
    }

    /// Current state of `host`'s breaker, if one exists.
    pub fn state(&self, host: &str) -> Option<CircuitState> {
        self.breakers.read().get(host).map(|b| b.state())
    }

    /// Number of breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether no breaker exists yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Run `fut` through `host`'s breaker; without a host it runs directly.
    pub async fn execute<F, T>(&self, host: Option<&str>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match host {
            Some(host) => self.get(host).execute(fut).await,
            None => fut.await,
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("hosts", &self.len())
            .finish()
    }
}

/// Middleware gating calls through the per-host breaker.
///
/// Participation is the call's override, else the client default.
pub struct CircuitBreakerMiddleware {
    manager: Arc<CircuitBreakerManager>,
    enabled: bool,
}

impl CircuitBreakerMiddleware {
    /// Create a breaker middleware.
    pub fn new(manager: Arc<CircuitBreakerManager>, enabled: bool) -> Self {
        Self { manager, enabled }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn handle(
        &self,
        request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse> {
        if !ctx.circuit_breaker().unwrap_or(self.enabled) {
            return next.run(request, ctx).await;
        }
        let host = request.host();
        self.manager
            .execute(host.as_deref(), next.run(request, ctx))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "api.example.com",
            CircuitBreakerConfig::new(threshold, Duration::from_secs(30)),
        )
    }

    fn fail(cb: &CircuitBreaker) {
        cb.acquire().unwrap().record(false);
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.acquire().err().unwrap();
        assert!(matches!(err, HttpClientError::CircuitOpen { host } if host == "api.example.com"));
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let cb = breaker(3);
        fail(&cb);
        fail(&cb);
        cb.acquire().unwrap().record(true);

        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1);
        fail(&cb);
        assert!(cb.acquire().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = cb.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_err());

        trial.record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        cb.acquire().unwrap().record(false);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.acquire().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().unwrap().is_trial());
    }

    #[test]
    fn test_stale_outcome_is_ignored() {
        let cb = breaker(1);
        let slow = cb.acquire().unwrap();
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // Admitted while closed, reported after the breaker opened.
        slow.record(true);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_state_change_callback() {
        let transitions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let config = CircuitBreakerConfig::new(1, Duration::from_secs(30)).with_state_change(
            move |host, from, to| seen.lock().push((host.to_string(), from, to)),
        );
        let cb = CircuitBreaker::new("h:8080", config);

        fail(&cb);
        cb.reset();

        assert_eq!(
            *transitions.lock(),
            vec![
                ("h:8080".to_string(), CircuitState::Closed, CircuitState::Open),
                ("h:8080".to_string(), CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_manager_returns_same_breaker_per_host() {
        let manager = CircuitBreakerManager::default();
        let a = manager.get("a.test");
        let b = manager.get("a.test");
        assert!(Arc::ptr_eq(&a, &b));
        manager.get("b.test");
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_manager_concurrent_creation_yields_one_instance() {
        let manager = Arc::new(CircuitBreakerManager::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.get("race.test"))
            })
            .collect();
        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.iter().all(|b| Arc::ptr_eq(b, &breakers[0])));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_without_host_bypasses_breaker() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::new(1, Duration::from_secs(30)));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let result: Result<()> = manager
                .execute(None, async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HttpClientError::Connection("refused".into()))
                })
                .await;
            assert!(result.unwrap_err().is_connection());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(manager.is_empty());
    }
}
