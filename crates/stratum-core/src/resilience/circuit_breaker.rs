//! Circuit breaker for unreliable remote dependencies.
//!
//! One breaker exists per named dependency (e.g. "secret-access"). Failures
//! are counted in a rolling time window; once they reach the threshold the
//! circuit opens and calls are rejected without reaching the dependency.
//! After the reset timeout a bounded number of trial calls probe it again.
//!
//! All bookkeeping happens under one `std::sync::Mutex` per breaker. The lock
//! is never held while the wrapped call runs.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stratum_types::config::CircuitBreakerConfig;
use stratum_types::error::{ConfigError, ErrorKind, HasErrorKind};
use stratum_types::event::RuntimeEvent;
use stratum_types::status::{CircuitState, CircuitStatusInfo};
use tokio::time::Instant;

use crate::event::EventBus;

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The call was rejected without invoking the dependency.
    #[error("circuit '{name}' is open; retry after {retry_at}")]
    Open {
        name: String,
        retry_at: DateTime<Utc>,
        retry_after: Duration,
    },

    /// The wrapped call itself failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The wrapped call's error, if the call ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl<E: HasErrorKind> HasErrorKind for CircuitError<E> {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::CircuitOpen,
            Self::Inner(e) => e.error_kind(),
        }
    }
}

/// Why a call was refused.
#[derive(Debug, Clone)]
struct Rejection {
    retry_at: DateTime<Utc>,
    retry_after: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `(when, succeeded)` for calls inside the rolling window.
    window: VecDeque<(Instant, bool)>,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Trial calls admitted during the current half-open episode.
    half_open_calls: u32,
    half_open_successes: u32,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            last_failure: None,
            last_failure_at: None,
            last_error: None,
            half_open_calls: 0,
            half_open_successes: 0,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.window.front() {
            if now.saturating_duration_since(at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|(_, ok)| !ok).count()
    }
}

/// Call wrapper that stops invoking a failing dependency for a cooldown period.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    /// Create a closed breaker. Fails if the configuration could never close
    /// the circuit again (see [`CircuitBreakerConfig::validate`]).
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            event_bus: None,
        })
    }

    /// Publish state transitions on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the Open -> HalfOpen transition if the reset
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut st = self.lock_state();
        self.refresh(&mut st, Instant::now());
        st.state
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls return [`CircuitError::Open`] without invoking `f`.
    /// Only errors whose kind is in `failure_kinds` are recorded; any other
    /// error passes through untouched (e.g. a not-found lookup says nothing
    /// about the dependency's health).
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: HasErrorKind + Display,
    {
        let permit = self.try_admit()?;
        let result = f().await;
        permit.record(&result);
        result.map_err(CircuitError::Inner)
    }

    /// Admit one call without running anything yet.
    ///
    /// The caller does its own setup, runs the call and hands the result to
    /// [`CallPermit::record`]. Dropping the permit unrecorded leaves the
    /// failure window untouched and frees a half-open trial slot.
    pub fn try_admit<E>(&self) -> Result<CallPermit<'_>, CircuitError<E>> {
        self.admit().map_err(|r| CircuitError::Open {
            name: self.name.clone(),
            retry_at: r.retry_at,
            retry_after: r.retry_after,
        })
    }

    /// Snapshot for status displays.
    pub fn status(&self) -> CircuitStatusInfo {
        let mut st = self.lock_state();
        let now = Instant::now();
        self.refresh(&mut st, now);
        st.prune(now, self.config.window_size());
        CircuitStatusInfo {
            name: self.name.clone(),
            state: st.state,
            window_failures: st.window_failures(),
            window_size: st.window.len(),
            total_calls: st.total_calls,
            total_failures: st.total_failures,
            total_successes: st.total_successes,
            total_rejections: st.total_rejections,
            last_error: st.last_error.clone(),
            last_failure_at: st.last_failure_at,
        }
    }

    /// Force the circuit closed and forget the failure window.
    pub fn reset(&self) {
        let mut st = self.lock_state();
        st.window.clear();
        st.last_failure = None;
        self.transition(&mut st, CircuitState::Closed);
    }

    /// Force the circuit open as if a failure just happened.
    pub fn force_open(&self) {
        let mut st = self.lock_state();
        st.last_failure = Some(Instant::now());
        st.last_failure_at = Some(Utc::now());
        self.transition(&mut st, CircuitState::Open);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().expect("circuit breaker lock poisoned")
    }

    fn admit(&self) -> Result<CallPermit<'_>, Rejection> {
        let mut st = self.lock_state();
        let now = Instant::now();
        st.prune(now, self.config.window_size());
        self.refresh(&mut st, now);

        match st.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen if st.half_open_calls < self.config.half_open_max_calls => {
                st.half_open_calls += 1;
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                st.total_rejections += 1;
                Err(Rejection {
                    retry_at: Utc::now(),
                    retry_after: Duration::ZERO,
                })
            }
            CircuitState::Open => {
                st.total_rejections += 1;
                let retry_after = st
                    .last_failure
                    .map(|at| {
                        self.config
                            .reset_timeout()
                            .saturating_sub(now.saturating_duration_since(at))
                    })
                    .unwrap_or(Duration::ZERO);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
                tracing::debug!(
                    breaker = self.name.as_str(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "call rejected, circuit open"
                );
                Err(Rejection {
                    retry_at,
                    retry_after,
                })
            }
        }
    }

    /// Open -> HalfOpen once `reset_timeout` has passed since the last failure.
    fn refresh(&self, st: &mut BreakerState, now: Instant) {
        if st.state != CircuitState::Open {
            return;
        }
        let elapsed = st
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.reset_timeout() {
            self.transition(st, CircuitState::HalfOpen);
        }
    }

    fn on_success(&self, trial: bool) {
        let mut st = self.lock_state();
        let now = Instant::now();
        st.total_calls += 1;
        st.total_successes += 1;
        st.window.push_back((now, true));
        st.prune(now, self.config.window_size());

        if trial && st.state == CircuitState::HalfOpen {
            st.half_open_successes += 1;
            if st.half_open_successes >= self.config.success_threshold {
                st.window.clear();
                self.transition(&mut st, CircuitState::Closed);
            }
        }
    }

    fn on_failure(&self, message: String) {
        let mut st = self.lock_state();
        let now = Instant::now();
        st.total_calls += 1;
        st.total_failures += 1;
        st.window.push_back((now, false));
        st.prune(now, self.config.window_size());
        st.last_failure = Some(now);
        st.last_failure_at = Some(Utc::now());

        tracing::debug!(
            breaker = self.name.as_str(),
            error = message.as_str(),
            "failure recorded"
        );
        st.last_error = Some(message);

        match st.state {
            CircuitState::Closed => {
                if st.window_failures() >= self.config.failure_threshold as usize {
                    self.transition(&mut st, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut st, CircuitState::Open),
            // A straggler admitted before the circuit opened; the timer was
            // already pushed forward above.
            CircuitState::Open => {}
        }
    }

    /// Give back a trial slot without recording an outcome.
    fn release_trial(&self) {
        let mut st = self.lock_state();
        if st.state == CircuitState::HalfOpen {
            st.half_open_calls = st.half_open_calls.saturating_sub(1);
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        st.half_open_calls = 0;
        st.half_open_successes = 0;

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = self.name.as_str(),
                from = from.as_str(),
                failures = st.window_failures(),
                "circuit opened"
            ),
            _ => tracing::info!(
                breaker = self.name.as_str(),
                from = from.as_str(),
                to = to.as_str(),
                "circuit state changed"
            ),
        }

        if let Some(bus) = &self.event_bus {
            bus.publish(RuntimeEvent::CircuitStateChanged {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.lock_state().state)
            .finish()
    }
}

/// Admission ticket for one call.
///
/// Dropping it without settling (the caller's future was cancelled) gives a
/// half-open trial slot back.
/// Admission to make one call through a [`CircuitBreaker`].
#[must_use = "an unrecorded permit counts for nothing"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Settle the permit with the call's outcome, classified by the
    /// breaker's `failure_kinds`.
    pub fn record<T, E: HasErrorKind + Display>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if self.breaker.config.counts_as_failure(e.error_kind()) => {
                self.failure(e.to_string())
            }
            Err(_) => self.neutral(),
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failure(mut self, message: String) {
        self.settled = true;
        self.breaker.on_failure(message);
    }

    fn neutral(self) {
        // Drop does the slot release.
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stratum_types::error::AdapterError;

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            reset_timeout_ms: 1_000,
            half_open_max_calls: 1,
            window_size_ms: 10_000,
            ..Default::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<AdapterError>> {
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AdapterError::Timeout("secret read".to_string()))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<u32, CircuitError<AdapterError>> {
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AdapterError>(7)
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new("secret-access", config(3)).unwrap();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let err = fail(&breaker, &calls).await.unwrap_err();
            assert!(!err.is_open());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = fail(&breaker, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(err.error_kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "4th call must not run");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_circuit() {
        let breaker = CircuitBreaker::new("secret-access", config(3)).unwrap();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&breaker, &calls).await;
        }

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().window_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new("object-storage", config(1)).unwrap();
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted at the trial failure.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_error_carries_reset_time() {
        let breaker = CircuitBreaker::new("secret-access", config(1)).unwrap();
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;

        tokio::time::advance(Duration::from_millis(400)).await;
        match fail(&breaker, &calls).await.unwrap_err() {
            CircuitError::Open {
                name, retry_after, ..
            } => {
                assert_eq!(name, "secret-access");
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("secret-access", config(2)).unwrap();
        for _ in 0..5 {
            let err = breaker
                .execute(|| async { Err::<(), _>(AdapterError::NotFound("db-password".into())) })
                .await
                .unwrap_err();
            assert!(matches!(err, CircuitError::Inner(AdapterError::NotFound(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.status().total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_pruned() {
        let mut cfg = config(2);
        cfg.window_size_ms = 1_000;
        let breaker = CircuitBreaker::new("secret-access", cfg).unwrap();
        let calls = AtomicU32::new(0);

        let _ = fail(&breaker, &calls).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_bounded_trials() {
        let breaker = CircuitBreaker::new("secret-access", config(1)).unwrap();
        breaker.force_open();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let permit = breaker.admit().unwrap();
        assert!(breaker.admit().is_err(), "second trial exceeds half_open_max_calls");

        // A cancelled trial gives its slot back.
        drop(permit);
        assert!(breaker.admit().is_ok());
        assert_eq!(breaker.status().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_multiple_trials() {
        let cfg = CircuitBreakerConfig {
            success_threshold: 2,
            half_open_max_calls: 2,
            ..config(1)
        };
        let breaker = CircuitBreaker::new("model-calls", cfg).unwrap();
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_and_status() {
        let breaker = CircuitBreaker::new("secret-access", config(1)).unwrap();
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;

        let status = breaker.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.total_calls, 1);
        assert!(status.last_error.unwrap().contains("secret read"));
        assert!(status.last_failure_at.is_some());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker, &calls).await.is_ok());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let breaker = CircuitBreaker::new("secret-access", config(1))
            .unwrap()
            .with_event_bus(bus);
        let calls = AtomicU32::new(0);
        let _ = fail(&breaker, &calls).await;

        match rx.recv().await.unwrap() {
            RuntimeEvent::CircuitStateChanged { name, from, to } => {
                assert_eq!(name, "secret-access");
                assert_eq!(from, CircuitState::Closed);
                assert_eq!(to, CircuitState::Open);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(CircuitBreaker::new("bad", cfg).is_err());
    }
}
