//! Per-device circuit breaker.
//!
//! The breaker has three states:
//!
//! 1. **Closed**: the device is online. Commands are attempted and failures are counted.
//! 2. **Open**: the device is offline. Commands stay queued. After `open_duration`
//!    the breaker lets one reachability probe through.
//! 3. **HalfOpen**: a probe is in flight. Success closes the breaker, failure reopens it.
//!
//! State lives in atomics so status reads never contend with the device worker.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Default number of consecutive failed attempts before a device is marked offline.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default delay between reachability probes while open, in milliseconds.
pub const DEFAULT_OPEN_DURATION_MS: u64 = 30_000;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Commands flow.
    Closed,
    /// Commands are held back.
    Open,
    /// A probe is allowed.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open.
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_duration: Duration::from_millis(DEFAULT_OPEN_DURATION_MS),
        }
    }
}

/// A thread-safe circuit breaker.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    opened_at_ms: AtomicU64,
    epoch: Instant,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn open(&self) {
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        self.state.store(STATE_OPEN, Ordering::Release);
    }

    /// Returns `true` if a request may proceed.
    ///
    /// An open breaker whose `open_duration` has elapsed moves to half-open and
    /// admits exactly one caller.
    pub fn can_execute(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                if self.remaining_open() > Duration::ZERO {
                    return false;
                }
                self.state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            }
            _ => false,
        }
    }

    /// Time left before an open breaker admits a probe; zero when not open.
    pub fn remaining_open(&self) -> Duration {
        if self.state.load(Ordering::Acquire) != STATE_OPEN {
            return Duration::ZERO;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = self.now_ms().saturating_sub(opened_at);
        let open_ms = self.config.open_duration.as_millis() as u64;
        Duration::from_millis(open_ms.saturating_sub(elapsed))
    }

    /// Records a success. Closes the breaker from any state.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Records a failure. Returns `true` if this call opened the breaker.
    ///
    /// A failure while half-open reopens immediately and restarts the open timer.
    pub fn record_failure(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let prev = self.failure_count.fetch_add(1, Ordering::AcqRel);
                if prev + 1 >= self.config.failure_threshold {
                    self.open();
                    true
                } else {
                    false
                }
            }
            STATE_HALF_OPEN => {
                self.failure_count.fetch_add(1, Ordering::AcqRel);
                self.open();
                false
            }
            _ => {
                self.failure_count.fetch_add(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Consecutive failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
