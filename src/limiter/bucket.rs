//! Token Bucket Primitive
//!
//! Classic bucket with lazy refill: tokens are credited on access from the
//! elapsed time since the last refill, capped at capacity. No blocking wait.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::config::BucketConfig;

#[derive(Debug)]
struct BucketState {
    capacity: u64,
    refill_per_second: f64,
    /// Fractional internally; observed as whole tokens.
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// New buckets start full (credit-on-arrival).
    pub fn new(config: BucketConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                capacity: config.capacity,
                refill_per_second: config.refill_per_second,
                tokens: config.capacity as f64,
                last_refill: now,
                last_used: now,
            }),
        }
    }

    /// Take `n` tokens if available. A zero-capacity bucket rejects everything.
    pub fn allow(&self, n: u64) -> bool {
        self.allow_at(n, Instant::now())
    }

    pub(crate) fn allow_at(&self, n: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.last_used = now;
        Self::refill(&mut state, now);
        let need = n as f64;
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Return tokens taken by a request that was rejected at a later level.
    pub fn refund(&self, n: u64) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + n as f64).min(state.capacity as f64);
    }

    /// Atomic reconfiguration; a capacity decrease truncates current tokens.
    pub fn reconfigure(&self, config: BucketConfig) {
        let mut state = self.state.lock();
        let now = Instant::now();
        Self::refill(&mut state, now);
        state.capacity = config.capacity;
        state.refill_per_second = config.refill_per_second;
        state.tokens = state.tokens.min(config.capacity as f64);
    }

    /// Drain to zero.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = 0.0;
        state.last_refill = Instant::now();
    }

    /// Fill to capacity.
    pub fn fill(&self) {
        let mut state = self.state.lock();
        state.tokens = state.capacity as f64;
        state.last_refill = Instant::now();
    }

    /// Whole tokens currently available.
    pub fn tokens(&self) -> u64 {
        let mut state = self.state.lock();
        Self::refill(&mut state, Instant::now());
        state.tokens as u64
    }

    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock();
        state.last_used.elapsed()
    }

    fn refill(state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let credit = elapsed.as_secs_f64() * state.refill_per_second;
        state.tokens = (state.tokens + credit).min(state.capacity as f64);
        state.last_refill = now;
    }
}
