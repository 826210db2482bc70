//! Per-backend circuit breaker.
//!
//! Legal transitions only: CLOSED -> OPEN, OPEN -> HALF_OPEN,
//! HALF_OPEN -> {CLOSED, OPEN}. An open breaker rejects immediately without
//! touching the backend; after the cooldown a bounded number of probes test
//! recovery. Call outcomes are reported through an RAII guard so a cancelled
//! call can never leave the probe accounting corrupted: a guard dropped
//! without an explicit outcome counts as failure.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Breaker tuning. Values are deployment configuration; these defaults track
/// the gateway's documented behavior.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures only count toward the threshold while they are consecutive
    /// within this window.
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Concurrent probes permitted in HALF_OPEN (1..=3).
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
    /// Probe successes required to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    10
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_half_open_probes() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            half_open_probes: default_half_open_probes(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
        streak_started: Option<Instant>,
    },
    Open {
        opened_at: Instant,
    },
    HalfOpen {
        in_flight: u32,
        successes: u32,
    },
}

/// Snapshot for the metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub retry_after_secs: u64,
}

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
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
                streak_started: None,
            }),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs)
    }

    fn failure_window(&self) -> Duration {
        Duration::from_secs(self.config.failure_window_secs)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Try to start a call. `Err` carries the remaining cooldown; the caller
    /// must not perform any I/O in that case.
    pub fn acquire(&self) -> Result<CallGuard<'_>, Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { opened_at } => {
                let elapsed = now.saturating_duration_since(*opened_at);
                if elapsed >= self.cooldown() {
                    tracing::info!(backend = %self.name, "circuit half-open, probing");
                    *inner = Inner::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(self.cooldown() - elapsed)
                }
            }
            Inner::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.half_open_probes {
                    *in_flight += 1;
                    Ok(())
                } else {
                    // Probes saturated; tell callers to come back shortly.
                    Err(Duration::from_secs(1))
                }
            }
        }
        .map(|()| CallGuard {
            breaker: self,
            outcome_recorded: false,
        })
    }

    pub fn state(&self) -> BreakerState {
        match &*self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let (state, failure_count, half_open_successes, retry_after_secs) = match &*inner {
            Inner::Closed {
                consecutive_failures,
                ..
            } => (BreakerState::Closed, *consecutive_failures, 0, 0),
            Inner::Open { opened_at } => {
                let remaining = self
                    .cooldown()
                    .saturating_sub(opened_at.elapsed())
                    .as_secs();
                (
                    BreakerState::Open,
                    self.config.failure_threshold,
                    0,
                    remaining,
                )
            }
            Inner::HalfOpen { successes, .. } => (BreakerState::HalfOpen, 0, *successes, 0),
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count,
            half_open_successes,
            retry_after_secs,
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
                streak_started,
            } => {
                *consecutive_failures = 0;
                *streak_started = None;
            }
            Inner::HalfOpen {
                in_flight,
                successes,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    tracing::info!(backend = %self.name, "circuit closed after recovery");
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                        streak_started: None,
                    };
                }
            }
            // A success can only be reported by a call that held a guard, so
            // OPEN is unreachable here; keep it inert regardless.
            Inner::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
                streak_started,
            } => {
                let window = self.failure_window();
                match streak_started {
                    Some(started) if now.saturating_duration_since(*started) < window => {
                        *consecutive_failures += 1;
                    }
                    _ => {
                        *streak_started = Some(now);
                        *consecutive_failures = 1;
                    }
                }
                if *consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        backend = %self.name,
                        failures = *consecutive_failures,
                        "circuit opened"
                    );
                    *inner = Inner::Open { opened_at: now };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!(backend = %self.name, "probe failed, circuit reopened");
                *inner = Inner::Open { opened_at: now };
            }
            Inner::Open { .. } => {}
        }
    }
}

/// Outcome reporter for one call admitted by `acquire`. Dropping the guard
/// without reporting counts as a failure, which keeps half-open probe slots
/// consistent even when the call future is cancelled mid-flight.
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    outcome_recorded: bool,
}

impl CallGuard<'_> {
    pub fn success(mut self) {
        self.outcome_recorded = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.outcome_recorded = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.outcome_recorded {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "srv-a",
            BreakerConfig {
                failure_threshold: 5,
                failure_window_secs: 10,
                cooldown_secs: 0,
                half_open_probes: 1,
                success_threshold: 2,
            },
        )
    }

    fn fail_once(breaker: &CircuitBreaker) {
        breaker.acquire().expect("breaker admits").failure();
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let breaker = CircuitBreaker::new("srv-a", BreakerConfig::default());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // The sixth call is rejected without any I/O.
        let rejected = breaker.acquire();
        assert!(rejected.is_err());
        let retry_after = rejected.err().unwrap();
        assert!(retry_after <= Duration::from_secs(30));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new("srv-a", BreakerConfig::default());
        for _ in 0..4 {
            fail_once(&breaker);
        }
        breaker.acquire().unwrap().success();
        for _ in 0..4 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn after_cooldown_exactly_one_probe_is_admitted() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail_once(&breaker);
        }
        // cooldown_secs = 0, so the next acquire transitions to half-open.
        let probe = breaker.acquire().expect("probe admitted");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // A second caller while the probe is in flight is rejected.
        assert!(breaker.acquire().is_err());
        probe.success();
    }

    #[test]
    fn probe_failure_reopens_the_circuit() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail_once(&breaker);
        }
        let probe = breaker.acquire().expect("probe admitted");
        probe.failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn a_run_of_probe_successes_closes_the_circuit() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail_once(&breaker);
        }
        breaker.acquire().expect("first probe").success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.acquire().expect("second probe").success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn dropped_guard_counts_as_failure() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            fail_once(&breaker);
        }
        {
            let _probe = breaker.acquire().expect("probe admitted");
            // Cancelled mid-flight: guard dropped with no outcome.
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn stale_failures_outside_the_window_start_a_new_streak() {
        let breaker = CircuitBreaker::new(
            "srv-a",
            BreakerConfig {
                failure_window_secs: 0,
                ..BreakerConfig::default()
            },
        );
        // Each failure lands outside the zero-width window of the previous
        // one, so the streak never accumulates.
        for _ in 0..10 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn snapshot_reports_remaining_cooldown() {
        let breaker = CircuitBreaker::new("srv-a", BreakerConfig::default());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        let snap = breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Open);
        assert!(snap.retry_after_secs <= 30);
    }
}
