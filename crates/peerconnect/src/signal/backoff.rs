//! Reconnection backoff for the signal channel
//!
//! After an abnormal close the signal channel waits
//! `min(base * multiplier^min(attempt, 32), max)` before the next attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest exponent applied to the multiplier
const MAX_EXPONENT: u32 = 32;

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are made when the signaling
/// connection drops for any reason other than a normal close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry in milliseconds (default: 5000ms)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds (default: 25000ms)
    pub max_delay_ms: u64,
    /// Growth factor per failed attempt (default: 1.5)
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (default: u32::MAX)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5000,
            max_delay_ms: 25000,
            multiplier: 1.5,
            max_attempts: u32::MAX,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Calculate the delay before retrying after `attempt` failures
    ///
    /// # Arguments
    /// * `attempt` - Number of failed attempts so far (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let delay_ms = (self.base_delay_ms as f64) * self.multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }

    /// Check if another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
