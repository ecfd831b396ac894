//! Three-state circuit breaker guarding calls into the distributed backend.
//! Closed admits everything and counts consecutive failures; open rejects
//! outright until a reset timer expires; half-open admits exactly one probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open (failures={failure_count}, reset in {reset_timeout_ms}ms)")]
    Open {
        state: BreakerState,
        failure_count: u32,
        last_failure: Option<Instant>,
        reset_timeout_ms: u64,
    },

    #[error(transparent)]
    Inner(#[from] E),
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Transition callbacks. Invoked best-effort: a panic or long callback must
/// never be allowed to corrupt the state machine, so callers get a plain
/// closure, invoked outside the state lock.
pub type Callback = Arc<dyn Fn(BreakerState) + Send + Sync>;

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    probe_in_flight: AtomicBool,
    on_open: Option<Callback>,
    on_close: Option<Callback>,
    on_half_open: Option<Callback>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                opened_at: None,
            }),
            probe_in_flight: AtomicBool::new(false),
            on_open: None,
            on_close: None,
            on_half_open: None,
        }
    }

    pub fn with_callbacks(
        mut self,
        on_open: Option<Callback>,
        on_close: Option<Callback>,
        on_half_open: Option<Callback>,
    ) -> Self {
        self.on_open = on_open;
        self.on_close = on_close;
        self.on_half_open = on_half_open;
        self
    }

    pub async fn state(&self) -> BreakerState {
        self.settle().await
    }

    pub async fn stats(&self) -> BreakerStats {
        self.settle().await;
        let inner = self.inner.lock().await;
        BreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }

    /// Runs `op` under the breaker. Rejects immediately with `CircuitError::Open`
    /// while open or while a half-open probe is already in flight.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let admitted_as_probe = self.admit().await?;

        let result = op().await;

        match &result {
            Ok(_) => self.on_success(admitted_as_probe).await,
            Err(_) => self.on_failure(admitted_as_probe).await,
        }

        result.map_err(CircuitError::Inner)
    }

    /// Moves `open` to `half-open` if the reset timer has expired. Always
    /// called before inspecting state so external observers see a timely
    /// transition even without a call in flight.
    async fn settle(&self) -> BreakerState {
        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    drop(inner);
                    self.probe_in_flight.store(false, Ordering::SeqCst);
                    self.invoke(&self.on_half_open, BreakerState::HalfOpen);
                    return BreakerState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Returns whether this call is the half-open probe, or an error if the
    /// breaker is rejecting.
    async fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let state = self.settle().await;
        match state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let inner = self.inner.lock().await;
                Err(CircuitError::Open {
                    state: inner.state,
                    failure_count: inner.failure_count,
                    last_failure: inner.last_failure,
                    reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
                })
            }
            BreakerState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Ok(true)
                } else {
                    let inner = self.inner.lock().await;
                    Err(CircuitError::Open {
                        state: inner.state,
                        failure_count: inner.failure_count,
                        last_failure: inner.last_failure,
                        reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    async fn on_success(&self, was_probe: bool) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                // successThreshold == 0 is treated as "close on the first
                // probe success" rather than rejected or left ambiguous.
                if inner.success_count >= self.config.success_threshold.max(1)
                    || self.config.success_threshold == 0
                {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    drop(inner);
                    if was_probe {
                        self.probe_in_flight.store(false, Ordering::SeqCst);
                    }
                    self.invoke(&self.on_close, BreakerState::Closed);
                    return;
                }
            }
            BreakerState::Open => {}
        }
        drop(inner);
        if was_probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    async fn on_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                self.transition_to_open(&mut inner);
            }
            BreakerState::Open => {}
        }
        drop(inner);
        if was_probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    fn transition_to_open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.success_count = 0;
        if self.config.reset_timeout.is_zero() {
            inner.state = BreakerState::HalfOpen;
            inner.opened_at = None;
        }
        self.invoke(&self.on_open, BreakerState::Open);
    }

    /// Force-opens the breaker, arming the reset timer as if a failure just
    /// tripped it.
    pub async fn open(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        drop(inner);
        self.invoke(&self.on_open, BreakerState::Open);
    }

    /// Force-closes the breaker, clearing counters and any pending timer.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        drop(inner);
        self.probe_in_flight.store(false, Ordering::SeqCst);
        self.invoke(&self.on_close, BreakerState::Closed);
    }

    fn invoke(&self, cb: &Option<Callback>, state: BreakerState) {
        if let Some(cb) = cb {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(state)));
            if result.is_err() {
                warn!(?state, "circuit breaker transition callback panicked");
            } else {
                debug!(?state, "circuit breaker transitioned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, reset_timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            success_threshold: 1,
            reset_timeout,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_secs(30)));
        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>("boom") })
                .await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);

        let result = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
    }

    #[tokio::test]
    async fn zero_reset_timeout_transitions_immediately() {
        let breaker = CircuitBreaker::new(config(1, Duration::ZERO));
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(config(1, Duration::ZERO));
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let probe_one = breaker.admit::<&str>();
        let probe_two = breaker.admit::<&str>();
        let (first, second) = tokio::join!(probe_one, probe_two);
        let admitted = [first, second].into_iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn probe_success_closes_breaker() {
        let breaker = CircuitBreaker::new(config(1, Duration::ZERO));
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let result = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        let stats = breaker.stats().await;
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn manual_open_and_close() {
        let breaker = CircuitBreaker::new(config(5, Duration::from_secs(30)));
        breaker.open().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        breaker.close().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }
}
