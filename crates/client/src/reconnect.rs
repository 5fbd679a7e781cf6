//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

use dl_domain::config::ReconnectConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Controls how the supervisor retries after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Jitter as a fraction of the raw delay; `0.25` adds up to 25%.
    pub jitter: f64,
    /// Consecutive failures before giving up.  `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.25,
            max_attempts: 0, // unlimited
        }
    }
}

impl From<&ReconnectConfig> for ReconnectBackoff {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
            backoff_factor: cfg.factor.max(1.0),
            jitter: cfg.jitter.clamp(0.0, 1.0),
            max_attempts: cfg.max_attempts,
        }
    }
}

impl ReconnectBackoff {
    /// Un-jittered delay for the given attempt number (0-indexed), capped.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exp = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.backoff_factor.powi(exp);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Jittered delay for the given attempt, never above `max_delay`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.raw_delay(attempt);
        let fraction: f64 = if self.jitter > 0.0 {
            rng.gen_range(0.0..self.jitter)
        } else {
            0.0
        };
        let jittered = raw.mul_f64(1.0 + fraction);
        jittered.min(self.max_delay)
    }

    /// Whether the given number of consecutive failures exceeds the max.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Per-outage retry state.
///
/// Successive delays never shrink and never exceed the cap; the sequence
/// restarts from the base after [`reset`](Self::reset).
#[derive(Debug)]
pub struct BackoffState {
    policy: ReconnectBackoff,
    attempt: u32,
    last: Duration,
    rng: StdRng,
}

impl BackoffState {
    pub fn new(policy: ReconnectBackoff) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(policy: ReconnectBackoff, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: ReconnectBackoff, rng: StdRng) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
            rng,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let candidate = self.policy.delay_for_attempt(self.attempt, &mut self.rng);
        let delay = candidate.max(self.last).min(self.policy.max_delay);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
