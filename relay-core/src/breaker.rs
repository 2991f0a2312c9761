//! Per-upstream circuit breakers.
//!
//! One breaker guards each registered upstream. The state machine:
//!
//! - `Closed`: calls flow; consecutive transport failures accumulate.
//!   Reaching `failure_threshold` opens the circuit.
//! - `Open`: calls are rejected without touching the adapter. Once
//!   `recovery_timeout` has elapsed since the circuit opened, the next
//!   `can_execute` check moves to `HalfOpen` and admits the caller.
//! - `HalfOpen`: trial traffic is admitted best-effort (every caller that
//!   observes this state may proceed; there is no single-flight gate).
//!   The first success closes the circuit; the first failure re-opens it
//!   and restarts the recovery clock.
//!
//! Only adapter-level transport failures count. An upstream that answers
//! with a JSON-RPC `error` payload has still answered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Breaker tuning, shared by every breaker in a registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive transport failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting trial traffic.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    /// Set whenever the circuit opens; cleared on close.
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

/// Introspection snapshot for health and stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub failures: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

/// Circuit breaker for one upstream.
#[derive(Debug)]
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
                opened_at: None,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// In `Open`, an elapsed recovery timeout transitions to `HalfOpen`
    /// as a side effect and admits the caller.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = inner.opened_at.expect("open breaker has opened_at");
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: the circuit closes and counters reset.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.last_success = Some(Utc::now());
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
        inner.opened_at = None;
    }

    /// Record a transport failure.
    ///
    /// In `Closed`, reaching the threshold opens the circuit. In
    /// `HalfOpen`, a single failure re-opens it and restarts the clock.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Utc::now());
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, applying the open→half-open timeout transition.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open {
            let opened_at = inner.opened_at.expect("open breaker has opened_at");
            if opened_at.elapsed() >= self.config.recovery_timeout {
                self.transition(&mut inner, BreakerState::HalfOpen);
            }
        }
        inner.state
    }

    /// Milliseconds until the circuit would admit trial traffic.
    ///
    /// Zero when the breaker is not open.
    pub fn retry_after_ms(&self) -> u64 {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) => self
                .config
                .recovery_timeout
                .saturating_sub(opened_at.elapsed())
                .as_millis() as u64,
            _ => 0,
        }
    }

    /// Manually reset to `Closed` with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    /// Snapshot for health endpoints.
    pub fn status(&self) -> BreakerStatus {
        // Apply the timeout transition first so introspection never shows
        // a stale Open past its recovery window.
        let state = self.state();
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStatus {
            name: self.name.clone(),
            state,
            failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        if inner.state != to {
            info!(breaker = %self.name, from = %inner.state, to = %to, "circuit breaker transition");
            inner.state = to;
        }
    }
}

/// All breakers for a registry, one per upstream name.
///
/// The map is built once at startup and never mutated afterward, so
/// lookups need no lock.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Build one breaker per server name.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, config: BreakerConfig) -> Self {
        let breakers = names
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    Arc::new(CircuitBreaker::new(name, config.clone())),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn all_status(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<_> = self.breakers.values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
    }
}
