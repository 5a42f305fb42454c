//! Bounded fixed-delay reconnection.
//!
//! [`ReconnectPolicy`] is the static configuration; [`Backoff`] is one
//! reconnection episode.  Each call to [`Backoff::next_attempt`] yields the
//! attempt number and the delay to wait before dialing, until the attempt
//! budget is spent.  The delay is awaited on the tokio clock, so tests run
//! with paused time.

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            delay: Duration::from_millis(config.delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 0,
            delay: Duration::ZERO,
        }
    }

    /// Begin a new reconnection episode.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Attempt counter for one reconnection episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// `(attempt, delay)` for the next try, 1-based, or `None` once
    /// `max_attempts` tries have been handed out.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if !self.policy.enabled || self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.policy.delay))
    }

    /// Attempts handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        !self.policy.enabled || self.attempt >= self.policy.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
