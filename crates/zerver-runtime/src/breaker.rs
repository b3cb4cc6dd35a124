//! Circuit Breaker
//!
//! Three-state guard (`Closed` / `Open` / `HalfOpen`) that short-circuits
//! calls to a failing upstream. One breaker per service name, shared
//! process-wide through a pool. All time arithmetic takes explicit
//! millisecond clocks so tests never sleep, and saturates on clock
//! regression.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use zerver_telemetry::now_ms;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Thresholds and recovery timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before opening.
    pub failure_threshold: u32,
    /// Successes in `HalfOpen` before closing again.
    pub success_threshold: u32,
    /// How long `Open` rejects before admitting a probe.
    pub timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_state_change_ms: u64,
}

/// Per-service circuit breaker. Every public method takes the mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_state_change_ms: now_ms(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may proceed right now.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(now_ms())
    }

    /// Deterministic-clock variant of `can_execute`.
    ///
    /// In `Open`, exactly one caller is admitted once the recovery timeout
    /// elapses; that admission transitions to `HalfOpen`, which subsequent
    /// callers observe. Clock regression keeps the breaker open.
    pub fn can_execute_at(&self, now: u64) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if now <= inner.last_state_change_ms {
                    // Regressed or unmoved clock never reopens.
                    return false;
                }
                let elapsed = now - inner.last_state_change_ms;
                if elapsed > self.config.timeout_ms {
                    tracing::info!(breaker = %self.name, "admitting half-open probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.last_state_change_ms = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.record_success_at(now_ms());
    }

    pub fn record_success_at(&self, now: u64) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(breaker = %self.name, "closing after successful probes");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_state_change_ms = now;
                }
            }
            // A straggler success while open changes nothing.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(now_ms());
    }

    pub fn record_failure_at(&self, now: u64) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "opening"
                    );
                    inner.state = BreakerState::Open;
                    inner.success_count = 0;
                    inner.last_state_change_ms = now;
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed; reopening");
                inner.state = BreakerState::Open;
                inner.success_count = 0;
                inner.last_state_change_ms = now;
            }
            BreakerState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_state_change_ms: inner.last_state_change_ms,
        }
    }

    /// Force a state, for operational overrides and tests.
    pub fn force_state(&self, state: BreakerState, now: u64) {
        let mut inner = self.lock();
        inner.state = state;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_state_change_ms = now;
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_state_change_ms: u64,
}

/// Process-wide pool of breakers, one per service name.
#[derive(Debug, Default)]
pub struct BreakerPool {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerPool {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get the breaker for a service, creating it with the pool default
    /// config when absent.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with(name, self.default_config)
    }

    pub fn get_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.lock();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// The breaker for a service, only if one was registered.
    pub fn lookup(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.lock().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
