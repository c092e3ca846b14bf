use std::sync::atomic::{AtomicU64, Ordering};

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Backoff shape for one recovery phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the deterministic delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_fraction: 0.2,
        }
    }
}

/// Attempt accounting for one phase of a single task.
///
/// Owned exclusively by that phase: a fallback switch starts a fresh
/// scheduler rather than inheriting this one's counters.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    attempts_made: u32,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts_made: 0,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.policy.max_attempts
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Increments the attempt counter and returns the new value.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.attempts_made
    }

    /// Next delay: exponential in the attempt count, capped, jittered,
    /// and floored by any provider-suggested wait.
    pub fn next_delay_ms(&self, retry_after_floor_ms: Option<u64>) -> u64 {
        let shift = self.attempts_made.min(16);
        let exponential = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.policy.max_delay_ms.max(self.policy.base_delay_ms));
        let jittered = apply_symmetric_jitter(exponential, self.policy.jitter_fraction);
        match retry_after_floor_ms {
            Some(floor) => jittered.max(floor),
            None => jittered,
        }
    }
}

// Counter-mixed jitter keeps retries desynchronized across tasks without
// pulling in an RNG dependency.
fn apply_symmetric_jitter(delay_ms: u64, fraction: f64) -> u64 {
    if !(fraction > 0.0) || delay_ms == 0 {
        return delay_ms;
    }
    let spread = (delay_ms as f64 * fraction.min(1.0)) as u64;
    if spread == 0 {
        return delay_ms;
    }
    let seed = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17) ^ 0xA24B_AED4_963E_E407;
    let offset = mixed % spread.saturating_mul(2).saturating_add(1);
    delay_ms.saturating_sub(spread).saturating_add(offset)
}
