//! Circuit breaker guarding the collector link.
//!
//! Tri-state machine: CLOSED passes calls through and counts consecutive
//! failures; OPEN rejects immediately until the recovery timeout elapses;
//! the first call after that is the HALF_OPEN probe. Every state change
//! goes through `call` — there is no background timer.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Failing, requests are rejected without touching the network.
    Open,
    /// Testing recovery.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures (while CLOSED) before opening.
    pub failure_threshold: u32,
    /// Cooldown before the HALF_OPEN probe is allowed.
    pub timeout: Duration,
    /// Consecutive successes (while HALF_OPEN) before closing.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Rejection or passthrough error from a guarded call. Callers must be able
/// to tell a proactive rejection apart from a real send failure — the two
/// get different handling and different counters.
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + 'static,
{
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: &'static str, retry_in: Duration },
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Read-only stats snapshot for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: &'static str,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: f64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `op` under breaker protection. The admission check and the
    /// result recording each take the lock briefly; the lock is never held
    /// across the await.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force CLOSED unconditionally (operator override). Idempotent.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name,
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_secs: self.config.timeout.as_secs_f64(),
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>>
    where
        E: std::error::Error + 'static,
    {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = self.name, "circuit transitioning to half-open");
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name,
                        retry_in: self.config.timeout - elapsed,
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(breaker = self.name, "circuit closed after recovery");
                }
            }
            // Consecutive-failure semantics: any success clears the streak.
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(breaker = self.name, "circuit reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }
}
