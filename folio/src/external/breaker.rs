use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Circuit breaker thresholds. `interval` clears the failure count in the
/// closed state after a quiet period; `timeout` is how long the circuit
/// stays open before probing.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub max_requests: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            max_requests: 3,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    window_started: Instant,
    half_open_inflight: u32,
}

/// One breaker guards one external endpoint. State transitions are logged;
/// the shared state sits under a mutex that is only held for bookkeeping,
/// never across the guarded call.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                window_started: Instant::now(),
                half_open_inflight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) {
        if inner.state != next {
            log::warn!("circuit breaker {}: {:?} -> {:?}", self.name, inner.state, next);
            inner.state = next;
        }
        match next {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                inner.half_open_inflight = 0;
            }
            BreakerState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.half_open_inflight = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.window_started = Instant::now();
            }
        }
    }

    /// Admission check. Either reserves a slot for the call or rejects with
    /// `CircuitOpen`.
    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                if inner.window_started.elapsed() >= self.config.interval {
                    inner.window_started = Instant::now();
                    inner.consecutive_failures = 0;
                }
                Ok(())
            }
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_inflight = 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_inflight >= self.config.max_requests {
                    Err(Error::CircuitOpen(self.name.clone()))
                } else {
                    inner.half_open_inflight += 1;
                    Ok(())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // A single failed probe re-opens the circuit.
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn release(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    /// Wraps one call to the guarded endpoint. Transient failures count
    /// against the breaker; a clean NotFound is a healthy response and a
    /// cancellation says nothing about the endpoint.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err @ Error::TransientIo(_)) => {
                self.on_failure();
                Err(err)
            }
            Err(err @ Error::Cancelled(_)) => {
                self.release();
                Err(err)
            }
            Err(err) => {
                self.on_success();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BreakerConfig, BreakerState, CircuitBreaker};
    use crate::error::Error;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(10),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), Error> {
        breaker
            .call(|| async { Err::<(), _>(Error::TransientIo("down".to_string())) })
            .await
            .map(|_| ())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, Error> {
        breaker.call(|| async { Ok(1u32) }).await
    }

    #[tokio::test]
    async fn test_that_consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("svc", config());
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_that_open_circuit_recovers_through_half_open() {
        let breaker = CircuitBreaker::new("svc", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_that_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_that_not_found_does_not_trip_the_breaker() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..5 {
            let err = breaker
                .call(|| async { Err::<(), _>(Error::not_found("portfolio", "P1")) })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NotFound { .. }));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
