//! Circuit breaker pattern for downstream dependency resilience.
//!
//! Each named circuit wraps exactly one logical dependency (for example the
//! classification service or a fulfillment API) and fails fast once that
//! dependency keeps failing, instead of letting slow or broken calls pin workers.
//!
//! # States
//!
//! ```text
//! ┌─────────┐     failure_threshold    ┌────────┐
//! │ CLOSED  │ ─────────────────────────│  OPEN  │
//! │(normal) │      reached             │(blocked)│
//! └─────────┘                         └────────┘
//!      ▲                                   │
//!      │  success_threshold_to_close       │ timeout_before_retry
//!      │                                   ▼
//!      │                            ┌───────────┐
//!      └────────────────────────────│ HALF_OPEN │── trial failure ──▶ OPEN
//!                                   │ (1 trial) │
//!                                   └───────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::with_name("fulfillment"));
//!
//! match breaker.call(|| client.place_order(order)).await {
//!     Ok(receipt) => receipt,
//!     Err(CircuitError::Open { .. }) => fallback(),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use convoy_common::config::{CircuitConfig, Config};

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Current state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Circuit tripped - requests blocked
    Open,
    /// Testing if the dependency recovered - one trial request at a time
    HalfOpen,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to keep the circuit open before allowing a trial
    pub timeout_before_retry: Duration,
    /// Number of successful trials needed to close the circuit from half-open
    pub success_threshold_to_close: u32,
    /// Calls running longer than this count as failures
    pub max_call_timeout: Duration,
    /// Name for logging purposes
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_settings("default", &CircuitConfig::default())
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a custom name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build from loaded settings for the named circuit.
    pub fn from_settings(name: impl Into<String>, settings: &CircuitConfig) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            timeout_before_retry: Duration::from_millis(settings.timeout_before_retry_ms),
            success_threshold_to_close: settings.success_threshold_to_close.max(1),
            max_call_timeout: Duration::from_millis(settings.max_call_timeout_ms),
            name: name.into(),
        }
    }

    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open before a trial
    pub fn timeout_before_retry(mut self, timeout: Duration) -> Self {
        self.timeout_before_retry = timeout;
        self
    }

    /// Set the success threshold
    pub fn success_threshold_to_close(mut self, threshold: u32) -> Self {
        self.success_threshold_to_close = threshold;
        self
    }

    /// Set the per-call timeout
    pub fn max_call_timeout(mut self, timeout: Duration) -> Self {
        self.max_call_timeout = timeout;
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Outcome of a call rejected or failed by the breaker.
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    /// The circuit is open; the wrapped function was not invoked.
    #[error("Circuit '{name}' is open")]
    Open { name: String },

    /// The wrapped call exceeded `max_call_timeout`.
    #[error("Call through circuit '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// The wrapped call itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Into<convoy_common::Error>> From<CircuitError<E>> for convoy_common::Error {
    fn from(e: CircuitError<E>) -> Self {
        match e {
            CircuitError::Open { name } => Self::CircuitOpen(name),
            CircuitError::Timeout { name, .. } => Self::Timeout.with_context(name),
            CircuitError::Inner(inner) => inner.into(),
        }
    }
}

// ============================================================================
// Circuit Breaker Implementation
// ============================================================================

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for protecting calls to one downstream dependency.
///
/// State lives behind a short-held mutex; it is never held across an await.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. Dropping an unsettled trial frees the slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, ok: bool) {
        self.settled = true;
        self.breaker.record(self.trial, ok);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Create a circuit breaker with default configuration and a name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls never invoke `f`. Errors and calls exceeding
    /// `max_call_timeout` count as failures.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit().ok_or_else(|| CircuitError::Open {
            name: self.config.name.clone(),
        })?;

        match tokio::time::timeout(self.config.max_call_timeout, f()).await {
            Ok(Ok(value)) => {
                permit.settle(true);
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.settle(false);
                Err(CircuitError::Inner(e))
            }
            Err(_) => {
                permit.settle(false);
                tracing::debug!(
                    circuit = %self.config.name,
                    timeout_ms = self.config.max_call_timeout.as_millis() as u64,
                    "Call exceeded max_call_timeout"
                );
                Err(CircuitError::Timeout {
                    name: self.config.name.clone(),
                    after: self.config.max_call_timeout,
                })
            }
        }
    }

    /// Get statistics about the circuit breaker
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold_to_close: self.config.success_threshold_to_close,
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
        tracing::info!(circuit = %self.config.name, "Circuit breaker manually reset");
    }

    // ========================================================================
    // Private Methods
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                tracing::trace!(circuit = %self.config.name, state = ?inner.state, "Call rejected");
                return None;
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
        if elapsed >= self.config.timeout_before_retry {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.trial_in_flight = false;
            tracing::info!(
                circuit = %self.config.name,
                "Circuit breaker transitioning to HALF_OPEN"
            );
        }
    }

    fn record(&self, trial: bool, ok: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        match (inner.state, trial, ok) {
            (CircuitState::Closed, _, true) => inner.failure_count = 0,
            (CircuitState::Closed, _, false) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            (CircuitState::HalfOpen, true, true) => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold_to_close {
                    self.close(&mut inner);
                }
            }
            (CircuitState::HalfOpen, true, false) => self.open(&mut inner),
            // Result of a call admitted under an earlier state
            _ => {}
        }

        tracing::trace!(
            circuit = %self.config.name,
            state = ?inner.state,
            ok,
            failure_count = inner.failure_count,
            "Circuit breaker recorded outcome"
        );
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.opened_at = Some(Instant::now());

        tracing::warn!(
            circuit = %self.config.name,
            failure_count = inner.failure_count,
            retry_after_ms = self.config.timeout_before_retry.as_millis() as u64,
            "Circuit breaker OPENED"
        );
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;

        tracing::info!(circuit = %self.config.name, "Circuit breaker CLOSED");
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about a circuit breaker's current state
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    /// Name of the circuit breaker
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Current consecutive failure count
    pub failure_count: u32,
    /// Current trial success count (relevant in half-open state)
    pub success_count: u32,
    /// Failure threshold to open circuit
    pub failure_threshold: u32,
    /// Success threshold to close circuit from half-open
    pub success_threshold_to_close: u32,
}

// ============================================================================
// Registry
// ============================================================================

/// Named breakers created on first use from configuration.
pub struct CircuitBreakerRegistry {
    config: Config,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, configured from the `circuits` section.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let settings = self.config.circuit(name);
        self.get_or_insert(name, || {
            CircuitBreakerConfig::from_settings(name, &settings)
        })
    }

    /// Breaker for `config.name`, created with `config` if it does not exist yet.
    pub fn get_with(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let name = config.name.clone();
        self.get_or_insert(&name, move || config)
    }

    /// Call `f` through the named circuit.
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(name).call(f).await
    }

    /// Stats for every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        let mut stats: Vec<_> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        for breaker in breakers.values() {
            breaker.reset();
        }
    }

    fn get_or_insert(
        &self,
        name: &str,
        make: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(make())))
            .clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::with_name("test")
                .failure_threshold(failures)
                .success_threshold_to_close(successes)
                .timeout_before_retry(Duration::from_secs(30))
                .max_call_timeout(Duration::from_secs(2)),
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[test]
    fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::with_name("test");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.name(), "test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_failures() {
        let b = breaker(3, 1);

        assert!(matches!(fail(&b).await, Err(CircuitError::Inner("boom"))));
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let err = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 1);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.stats().failure_count, 2);

        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_counts_as_failure() {
        let b = breaker(1, 1);
        let err = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitError::Timeout { .. }));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_and_close() {
        let b = breaker(2, 2);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(succeed(&b).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.stats().success_count, 1);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let b = breaker(1, 3);
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(succeed(&b).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_flight() {
        let b = Arc::new(breaker(1, 1));
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // A second caller fails fast while the trial is running
        assert!(succeed(&b).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_slot() {
        let b = breaker(1, 1);
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            b.call(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset() {
        let b = breaker(2, 1);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::with_name("test")
            .failure_threshold(10)
            .timeout_before_retry(Duration::from_secs(60))
            .success_threshold_to_close(5)
            .max_call_timeout(Duration::from_millis(1500));

        assert_eq!(config.name, "test");
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.timeout_before_retry, Duration::from_secs(60));
        assert_eq!(config.success_threshold_to_close, 5);
        assert_eq!(config.max_call_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = CircuitConfig {
            failure_threshold: 2,
            timeout_before_retry_ms: 500,
            success_threshold_to_close: 0,
            max_call_timeout_ms: 250,
        };
        let config = CircuitBreakerConfig::from_settings("classifier", &settings);
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.timeout_before_retry, Duration::from_millis(500));
        assert_eq!(config.success_threshold_to_close, 1);
        assert_eq!(config.max_call_timeout, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_circuits_are_independent() {
        let mut config = Config::default();
        config.circuits.insert(
            "fulfillment".into(),
            CircuitConfig {
                failure_threshold: 1,
                ..CircuitConfig::default()
            },
        );
        let registry = CircuitBreakerRegistry::new(&config);

        let err = registry
            .call("fulfillment", || async { Err::<(), _>("down") })
            .await
            .unwrap_err();
        assert!(matches!(err, CircuitError::Inner("down")));
        assert_eq!(registry.get("fulfillment").state(), CircuitState::Open);

        let ok = registry
            .call("classifier", || async { Ok::<_, &str>("intent") })
            .await
            .unwrap();
        assert_eq!(ok, "intent");
        assert!(Arc::ptr_eq(&registry.get("fulfillment"), &registry.get("fulfillment")));

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "classifier");
        assert_eq!(stats[1].state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(registry.get("fulfillment").state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_get_with_keeps_first_config() {
        let registry = CircuitBreakerRegistry::new(&Config::default());
        let first = registry.get_with(CircuitBreakerConfig::with_name("crm").failure_threshold(9));
        let second = registry.get_with(CircuitBreakerConfig::with_name("crm").failure_threshold(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 9);
    }

    #[test]
    fn test_open_maps_to_common_error() {
        let err: convoy_common::Error = CircuitError::<convoy_common::Error>::Open {
            name: "crm".into(),
        }
        .into();
        assert!(err.is_circuit_open());
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn prop_opens_exactly_at_threshold(threshold in 1u32..8, extra in 0u32..4) {
            let rt = paused_runtime();
            rt.block_on(async {
                let b = breaker(threshold, 1);
                for _ in 0..threshold - 1 {
                    fail(&b).await.unwrap_err();
                }
                prop_assert_eq!(b.state(), CircuitState::Closed);

                fail(&b).await.unwrap_err();
                prop_assert_eq!(b.state(), CircuitState::Open);

                for _ in 0..extra {
                    prop_assert!(fail(&b).await.unwrap_err().is_open());
                }
                Ok::<(), TestCaseError>(())
            })?;
        }

        #[test]
        fn prop_interleaved_success_never_opens(pattern in proptest::collection::vec(any::<bool>(), 0..40)) {
            let rt = paused_runtime();
            rt.block_on(async {
                let b = breaker(3, 1);
                let mut run = 0;
                for ok in pattern {
                    if ok {
                        succeed(&b).await.unwrap();
                        run = 0;
                    } else {
                        fail(&b).await.unwrap_err();
                        run += 1;
                    }
                    if run >= 3 {
                        prop_assert_eq!(b.state(), CircuitState::Open);
                        b.reset();
                        run = 0;
                    } else {
                        prop_assert_eq!(b.state(), CircuitState::Closed);
                    }
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
