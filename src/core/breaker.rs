//! Per-service circuit breaker.
//!
//! State machine: Closed → Open → HalfOpen → Closed. In Closed the breaker
//! counts requests and failures over a rolling interval and trips once the
//! request floor is met and the failure ratio reaches 60%. Open fails fast
//! until the timeout elapses, then HalfOpen admits a bounded number of
//! concurrent trial requests: any trial failure re-opens, a full streak of
//! trial successes closes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::core::error::{ProxyError, ProxyResult};

/// Failure ratio that trips a Closed breaker, once the request floor is met.
const FAILURE_RATE_TO_OPEN: f64 = 0.6;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum requests in the rolling window before the ratio applies
    pub failure_threshold: u64,
    /// Consecutive HalfOpen successes needed to close (also the trial budget)
    pub success_threshold: u32,
    /// How long Open lasts before probing via HalfOpen
    pub timeout: Duration,
    /// Rolling window for the Closed-state counters
    pub interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    requests: u64,
    failures: u64,
}

pub struct CircuitBreaker {
    service_id: String,
    config: BreakerConfig,
    state: AtomicU8,
    window: Mutex<Window>,
    opened_at: Mutex<Option<Instant>>,
    trials_in_flight: AtomicU32,
    trial_successes: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(service_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service_id: service_id.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            window: Mutex::new(Window {
                started: Instant::now(),
                requests: 0,
                failures: 0,
            }),
            opened_at: Mutex::new(None),
            trials_in_flight: AtomicU32::new(0),
            trial_successes: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    /// Force the breaker back to Closed and clear all counters.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.trials_in_flight.store(0, Ordering::Release);
        self.trial_successes.store(0, Ordering::Release);
        *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.started = Instant::now();
        window.requests = 0;
        window.failures = 0;
    }

    /// Admission check. On success the returned [`Passage`] must be resolved
    /// with `success()` or `failure()`; dropping it unresolved (cancelled
    /// request) releases any trial slot without recording a signal.
    pub fn try_acquire(&self) -> ProxyResult<Passage<'_>> {
        match self.state() {
            BreakerState::Closed => Ok(Passage {
                breaker: self,
                trial: false,
                resolved: false,
            }),
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed < self.config.timeout {
                    return Err(ProxyError::CircuitBreakerOpen(self.service_id.clone()));
                }
                self.transition(STATE_OPEN, STATE_HALF_OPEN);
                self.acquire_trial()
            }
            BreakerState::HalfOpen => self.acquire_trial(),
        }
    }

    fn acquire_trial(&self) -> ProxyResult<Passage<'_>> {
        let budget = self.config.success_threshold;
        let admitted = self
            .trials_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < budget).then_some(n + 1)
            })
            .is_ok();
        if admitted {
            Ok(Passage {
                breaker: self,
                trial: true,
                resolved: false,
            })
        } else {
            Err(ProxyError::CircuitBreakerOpen(self.service_id.clone()))
        }
    }

    /// Run `op` behind the breaker; `Err` counts as a failure.
    pub async fn execute<F, Fut, T>(&self, op: F) -> ProxyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<T>>,
    {
        let passage = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                passage.success();
                Ok(value)
            }
            Err(e) => {
                passage.failure();
                Err(e)
            }
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        let moved = self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            match to {
                STATE_OPEN => {
                    *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(Instant::now());
                    self.trials_in_flight.store(0, Ordering::Release);
                    self.trial_successes.store(0, Ordering::Release);
                    tracing::warn!(service = %self.service_id, "circuit breaker opened");
                }
                STATE_HALF_OPEN => {
                    self.trials_in_flight.store(0, Ordering::Release);
                    self.trial_successes.store(0, Ordering::Release);
                    tracing::info!(service = %self.service_id, "circuit breaker half-open");
                }
                _ => {
                    let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                    window.started = Instant::now();
                    window.requests = 0;
                    window.failures = 0;
                    tracing::info!(service = %self.service_id, "circuit breaker closed");
                }
            }
            crate::metrics::set_breaker_state(&self.service_id, BreakerState::from(to));
        }
        moved
    }

    fn on_success(&self, trial: bool) {
        if trial {
            self.trials_in_flight.fetch_sub(1, Ordering::AcqRel);
            let successes = self.trial_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold {
                self.transition(STATE_HALF_OPEN, STATE_CLOSED);
            }
            return;
        }
        self.record_closed(false);
    }

    fn on_failure(&self, trial: bool) {
        if trial {
            self.trials_in_flight.fetch_sub(1, Ordering::AcqRel);
            // One failed trial re-opens and restarts the timer.
            self.transition(STATE_HALF_OPEN, STATE_OPEN);
            return;
        }
        self.record_closed(true);
    }

    fn record_closed(&self, failed: bool) {
        let should_open = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            if window.started.elapsed() >= self.config.interval {
                window.started = Instant::now();
                window.requests = 0;
                window.failures = 0;
            }
            window.requests += 1;
            if failed {
                window.failures += 1;
            }
            window.requests >= self.config.failure_threshold
                && window.failures as f64 / window.requests as f64 >= FAILURE_RATE_TO_OPEN
        };
        if should_open {
            self.transition(STATE_CLOSED, STATE_OPEN);
        }
    }
}

/// Admission token for one request through a breaker.
pub struct Passage<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Passage<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Passage<'_> {
    fn drop(&mut self) {
        // Cancelled request: release the trial slot, record nothing.
        if !self.resolved && self.trial {
            self.breaker.trials_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Breakers keyed by service id, created on demand.
pub struct MultiCircuitBreaker {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl MultiCircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Double-checked get-or-create: read lock first, write lock only on
    /// first sight of a service.
    pub fn breaker_for(&self, service_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
        {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service_id, self.config.clone()))
            })
            .clone()
    }

    pub fn remove(&self, service_id: &str) {
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 10,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            interval: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(ProxyError::Upstream("boom".into())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<_, ProxyError>(()) }).await;
    }

    #[tokio::test]
    async fn opens_after_threshold_of_consecutive_failures() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        for _ in 0..9 {
            fail(&breaker).await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Fails fast without running the operation.
        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .execute(|| async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, ProxyError>(())
            })
            .await;
        assert!(matches!(result, Err(ProxyError::CircuitBreakerOpen(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn does_not_open_below_failure_ratio() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        // 10 requests, 5 failures: ratio 0.5 < 0.6.
        for _ in 0..5 {
            fail(&breaker).await;
            succeed(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_streak() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // The timer restarted: still failing fast immediately after.
        let result = breaker
            .execute(|| async { Ok::<_, ProxyError>(()) })
            .await;
        assert!(matches!(result, Err(ProxyError::CircuitBreakerOpen(_))));
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_trials() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let first = breaker.try_acquire().expect("first trial admitted");
        let second = breaker.try_acquire().expect("second trial admitted");
        assert!(matches!(
            breaker.try_acquire(),
            Err(ProxyError::CircuitBreakerOpen(_))
        ));
        drop(first);
        drop(second);
        // Dropped (cancelled) trials release their slots.
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let breaker = CircuitBreaker::new("s1", quick_config());
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        succeed(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn manager_reuses_breaker_per_service() {
        let manager = MultiCircuitBreaker::new(quick_config());
        let a = manager.breaker_for("s1");
        let b = manager.breaker_for("s1");
        assert!(Arc::ptr_eq(&a, &b));
        let c = manager.breaker_for("s2");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
