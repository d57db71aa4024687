//! Backoff policy for re-establishing the relay connection

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a session retries the relay after it drops mid-call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectionPolicy {
    /// Attempts before the session stays in `SignalingError` (0 disables)
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay, before jitter
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Add up to 25% random jitter so a room does not reconnect in lockstep
    pub jitter: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Short, deterministic delays (tests and local relays)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Never reconnect
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before attempt `n` (0-based), without jitter
    pub fn base_delay(&self, n: u32) -> Duration {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let ms = (self.initial_delay_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Fresh schedule for one outage
    pub fn schedule(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Iterator over `(attempt, delay)` for one outage; attempts count from 1
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectionPolicy,
    attempt: u32,
}

impl Backoff {
    /// Attempts handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for Backoff {
    type Item = (u32, Duration);

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }

        let base = self.policy.base_delay(self.attempt);
        self.attempt += 1;

        let delay = if self.policy.jitter {
            base + base.mul_f64(jitter_fraction() * 0.25)
        } else {
            base
        };
        Some((self.attempt, delay))
    }
}

/// Uniform value in [0, 1)
fn jitter_fraction() -> f64 {
    rand::random::<f64>()
}
