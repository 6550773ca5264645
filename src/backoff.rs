//! Bounded exponential backoff shared by the feed and broker reconnect loops.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay curve: `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`.
///
/// Attempt 0 is the very first connect and never waits.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_ms as f64) as u64)
    }

    pub fn validate(&self, section: &str) -> Result<(), String> {
        if self.initial_ms == 0 {
            return Err(format!("{section}.initial_ms must be greater than zero"));
        }
        if self.max_ms < self.initial_ms {
            return Err(format!("{section}.max_ms must not be below initial_ms"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(format!("{section}.multiplier must be a finite number >= 1.0"));
        }
        Ok(())
    }
}
