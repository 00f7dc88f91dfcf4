//! Resilience policies for remote calls
//!
//! Every remote dependency is called through a named policy combining a
//! circuit breaker, retry with exponential backoff, and an optional fallback.
//! Calls carry a correlation id that downstream log records inherit.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};
use crate::error::{RagError, Result};

/// Well-known policy names, keyed by remote dependency
pub mod policy {
    pub const OPENAI_CHAT: &str = "openai.chat";
    pub const OPENAI_EMBED: &str = "openai.embed";
    pub const SEARCH_QUERY: &str = "search.query";
    pub const SEARCH_UPSERT: &str = "search.upsert";
    pub const DOCINTEL_ANALYZE: &str = "docintel.analyze";
    pub const WEBSEARCH_FETCH: &str = "websearch.fetch";

    pub const ALL: [&str; 6] = [
        OPENAI_CHAT,
        OPENAI_EMBED,
        SEARCH_QUERY,
        SEARCH_UPSERT,
        DOCINTEL_ANALYZE,
        WEBSEARCH_FETCH,
    ];
}

/// Opaque identifier propagated through all operations of one logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Lock-free circuit breaker
///
/// Closed -> Open at `failure_threshold` consecutive failures.
/// Open -> HalfOpen once `break_duration` has elapsed; a single probe call
/// is admitted. HalfOpen -> Closed on probe success, -> Open on probe failure.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    break_duration: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` at which the circuit last opened
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            break_duration: config.break_duration(),
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitBreakerState::Open,
            STATE_HALF_OPEN => CircuitBreakerState::HalfOpen,
            _ => CircuitBreakerState::Closed,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Admit or reject a call without invoking the underlying operation
    pub fn check(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => Ok(()),
            STATE_HALF_OPEN => Err(RagError::CircuitOpen(self.name.clone())),
            _ => {
                let opened = self.opened_at_ms.load(Ordering::Acquire);
                if self.now_ms().saturating_sub(opened) >= self.break_duration.as_millis() as u64 {
                    // Admit exactly one probe
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        debug!(breaker = %self.name, "circuit half-open, probing");
                        return Ok(());
                    }
                }
                Err(RagError::CircuitOpen(self.name.clone()))
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev != STATE_CLOSED {
            debug!(breaker = %self.name, "circuit closed");
        }
    }

    pub fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_HALF_OPEN {
            self.trip();
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.failure_threshold && state == STATE_CLOSED {
            self.trip();
        }
    }

    fn trip(&self) {
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        self.state.store(STATE_OPEN, Ordering::Release);
        warn!(breaker = %self.name, "circuit opened");
    }
}

/// A named policy: circuit breaker plus retry schedule
pub struct ResiliencePolicy {
    name: String,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl ResiliencePolicy {
    pub fn new(name: impl Into<String>, breaker: CircuitBreakerConfig, retry: RetryConfig) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), &breaker),
            name,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    /// Delay before retry `attempt` (0-based), honouring an upstream hint
    fn retry_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs_f64((secs as f64).min(self.retry.max_delay_s));
        }

        let exp = self.retry.base_delay_s * 2f64.powi(attempt as i32);
        let jitter = rand::rng().random_range(0.0..=self.retry.base_delay_s * 0.1);
        Duration::from_secs_f64((exp + jitter).min(self.retry.max_delay_s))
    }

    /// Run `op` under this policy
    ///
    /// Each attempt is admitted by the breaker and recorded into its
    /// statistics. Only `CircuitOpen`, `Timeout`, terminal upstream errors,
    /// or the final transient error leave this function.
    pub async fn execute<T, F, Fut>(&self, correlation: &CorrelationId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.retry.max_retries {
            self.breaker.check()?;

            match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 0 {
                        debug!(policy = %self.name, correlation = %correlation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    let retryable = e.is_retryable();
                    warn!(
                        policy = %self.name,
                        correlation = %correlation,
                        attempt,
                        retryable,
                        error = %e,
                        "remote call failed"
                    );

                    if !retryable {
                        return Err(e);
                    }

                    if attempt < self.retry.max_retries {
                        let delay = self.retry_delay(attempt, e.retry_after_secs());
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RagError::Internal("retry loop exited without error".to_string())))
    }

    /// Run `op` under this policy, substituting `fallback` when it gives up
    ///
    /// The failed attempts stay in the breaker statistics even when the
    /// fallback produces a value.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        correlation: &CorrelationId,
        op: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.execute(correlation, op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    policy = %self.name,
                    correlation = %correlation,
                    error = %e,
                    "policy gave up, invoking fallback"
                );
                fallback().await
            }
        }
    }
}

/// Registry of named resilience policies, one per remote dependency
pub struct ResilienceService {
    policies: HashMap<String, Arc<ResiliencePolicy>>,
    retry: RetryConfig,
}

impl ResilienceService {
    /// Build the registry with the six standard policies
    pub fn from_config(config: &ResilienceConfig) -> Self {
        let mut policies = HashMap::new();
        for name in policy::ALL {
            let breaker = config
                .circuit_breaker
                .get(name)
                .cloned()
                .unwrap_or_default();
            policies.insert(
                name.to_string(),
                Arc::new(ResiliencePolicy::new(name, breaker, config.retry.clone())),
            );
        }
        Self {
            policies,
            retry: config.retry.clone(),
        }
    }

    /// Look up a policy; unknown names get a fresh default policy
    pub fn policy(&self, name: &str) -> Arc<ResiliencePolicy> {
        self.policies.get(name).cloned().unwrap_or_else(|| {
            Arc::new(ResiliencePolicy::new(
                name,
                CircuitBreakerConfig::default(),
                self.retry.clone(),
            ))
        })
    }

    /// Breaker states of all registered policies, for health reporting
    pub fn breaker_states(&self) -> HashMap<String, CircuitBreakerState> {
        self.policies
            .iter()
            .map(|(name, p)| (name.clone(), p.breaker_state()))
            .collect()
    }
}

/// Bounded fan-out gate for outbound remote calls
///
/// Two layers of permits: one shared across the process, one per request.
/// A call holds both for its duration; dropping the permit releases them.
#[derive(Clone)]
pub struct RemoteCallGate {
    process: Arc<Semaphore>,
    request: Arc<Semaphore>,
}

pub struct RemoteCallPermit {
    _process: tokio::sync::OwnedSemaphorePermit,
    _request: tokio::sync::OwnedSemaphorePermit,
}

impl RemoteCallGate {
    pub fn new(process_limit: usize) -> Self {
        Self {
            process: Arc::new(Semaphore::new(process_limit)),
            request: Arc::new(Semaphore::new(process_limit)),
        }
    }

    /// Derive a gate for one request, sharing the process-wide layer
    pub fn for_request(&self, request_limit: usize) -> Self {
        Self {
            process: self.process.clone(),
            request: Arc::new(Semaphore::new(request_limit)),
        }
    }

    pub async fn acquire(&self) -> RemoteCallPermit {
        let request = self
            .request
            .clone()
            .acquire_owned()
            .await
            .expect("request semaphore closed");
        let process = self
            .process
            .clone()
            .acquire_owned()
            .await
            .expect("process semaphore closed");
        RemoteCallPermit {
            _process: process,
            _request: request,
        }
    }

    pub fn available(&self) -> usize {
        self.request
            .available_permits()
            .min(self.process.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_s: 0.001,
            max_delay_s: 0.01,
        }
    }

    fn breaker_config(threshold: u32, break_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            // Config is in whole seconds; tests that need sub-second breaks
            // construct the breaker directly.
            break_duration_s: break_ms / 1000,
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new("test", &breaker_config(3, 30_000));

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn test_breaker_success_resets_failures() {
        let breaker = CircuitBreaker::new("test", &breaker_config(3, 30_000));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_half_open_probe() {
        let breaker = CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                failure_threshold: 1,
                break_duration_s: 0,
            },
        );

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        // Break duration of zero elapses immediately; one probe admitted
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        // A second caller is rejected while the probe is in flight
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                failure_threshold: 1,
                break_duration_s: 0,
            },
        );

        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[tokio::test]
    async fn test_retries_then_circuit_open_without_invoking() {
        let policy = ResiliencePolicy::new(
            "openai.chat",
            CircuitBreakerConfig {
                failure_threshold: 4,
                break_duration_s: 60,
            },
            fast_retry(),
        );
        let correlation = CorrelationId::new();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .execute(&correlation, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RagError::Timeout("simulated cancellation".to_string())) }
            })
            .await;

        assert!(result.is_err());
        // Initial attempt plus three retries, each recorded as a failure
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(policy.breaker_state(), CircuitBreakerState::Open);

        // The next call inside the break window is rejected without
        // touching the underlying operation.
        let result: Result<()> = policy
            .execute(&correlation, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(RagError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let policy = ResiliencePolicy::new(
            "search.query",
            CircuitBreakerConfig::default(),
            fast_retry(),
        );
        let correlation = CorrelationId::new();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .execute(&correlation, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RagError::Index(crate::error::IndexError::Rejected {
                        status: 400,
                        message: "bad request".to_string(),
                    }))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_value_after_give_up() {
        let policy = ResiliencePolicy::new(
            "openai.embed",
            CircuitBreakerConfig {
                failure_threshold: 2,
                break_duration_s: 60,
            },
            RetryConfig {
                max_retries: 1,
                base_delay_s: 0.001,
                max_delay_s: 0.01,
            },
        );
        let correlation = CorrelationId::new();

        let result = policy
            .execute_with_fallback(
                &correlation,
                || async {
                    Err::<&str, _>(RagError::Llm(crate::error::LlmError::ConnectionFailed(
                        "refused".to_string(),
                    )))
                },
                || async { Ok("lexical-only") },
            )
            .await;

        assert_eq!(result.unwrap(), "lexical-only");
        // Both failed attempts counted towards the breaker
        assert_eq!(policy.breaker_state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_retry_delay_exponential_shape() {
        let policy = ResiliencePolicy::new(
            "test",
            CircuitBreakerConfig::default(),
            RetryConfig {
                max_retries: 3,
                base_delay_s: 2.0,
                max_delay_s: 30.0,
            },
        );

        // base * 2^n plus at most 10% jitter
        for (attempt, expected) in [(0u32, 2.0f64), (1, 4.0), (2, 8.0)] {
            let delay = policy.retry_delay(attempt, None).as_secs_f64();
            assert!(
                (expected..=expected + 0.2).contains(&delay),
                "attempt {} delay {} outside expected band",
                attempt,
                delay
            );
        }

        // Upstream Retry-After wins over the schedule
        let hinted = policy.retry_delay(0, Some(5)).as_secs_f64();
        assert!((hinted - 5.0).abs() < f64::EPSILON);

        // The cap applies to both paths
        let capped = policy.retry_delay(10, None).as_secs_f64();
        assert!(capped <= 30.0);
    }

    #[tokio::test]
    async fn test_remote_call_gate_limits() {
        let gate = RemoteCallGate::new(2).for_request(1);

        let permit = gate.acquire().await;
        assert_eq!(gate.available(), 0);
        drop(permit);
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_correlation_id_roundtrip() {
        let id = CorrelationId::new();
        let parsed = CorrelationId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(CorrelationId::parse("not-a-uuid").is_none());
    }
}
