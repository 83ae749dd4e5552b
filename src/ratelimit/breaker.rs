//! Per-topic circuit breaker
//!
//! - **Closed**: calls pass; `failure_threshold` consecutive failures open it
//! - **Open**: calls are rejected until `open_duration` has elapsed
//! - **HalfOpen**: calls pass; `success_threshold` successes close it, any
//!   failure opens it again

use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    success_threshold: u32,
    open_duration: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_duration,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    /// State as of `now`, moving Open to HalfOpen once the open period is over
    pub fn state_at(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.open_duration {
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
            }
        }
        self.state
    }

    /// Whether a call may go through at `now`
    pub fn allows(&mut self, now: Instant) -> bool {
        self.state_at(now) != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.success_threshold {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.consecutive_successes = 0;
            }
        }
    }

    /// Record a failure; returns true when this failure opened the circuit
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_successes = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.open(now);
                true
            }
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.open(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_failures = 0;
    }
}
