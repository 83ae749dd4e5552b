//! Token bucket with sub-second refill

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    /// Capacity for a steady `rate` with bursts of `burst_multiplier` times it
    pub fn capacity_for(rate: f64, burst_multiplier: f64) -> u32 {
        let burst = (rate * burst_multiplier).ceil();
        if burst.is_finite() && burst >= 1.0 {
            burst.min(f64::from(u32::MAX)) as u32
        } else {
            1
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = self.last_refill.max(now);
        self.tokens = (self.tokens + self.refill_rate * elapsed.as_secs_f64()).min(self.capacity);
    }

    /// Take `n` tokens if all of them are available
    pub fn try_acquire(&mut self, n: u32, now: Instant) -> bool {
        self.refill(now);
        let needed = f64::from(n);
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Give back tokens taken by a call that was not carried out
    pub fn refund(&mut self, n: u32) {
        self.tokens = (self.tokens + f64::from(n)).min(self.capacity);
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}
