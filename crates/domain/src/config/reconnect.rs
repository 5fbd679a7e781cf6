use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "d_base")]
    pub base_delay_ms: u64,
    #[serde(default = "d_max")]
    pub max_delay_ms: u64,
    #[serde(default = "d_factor")]
    pub factor: f64,
    /// Upper bound of the random extra delay, as a fraction of the
    /// un-jittered delay.
    #[serde(default = "d_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up (`Failed`).
    /// `0` means retry forever.
    #[serde(default)]
    pub max_attempts: u32,
    /// Consecutive authentication rejections before giving up.
    #[serde(default = "d_auth")]
    pub max_auth_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: d_base(),
            max_delay_ms: d_max(),
            factor: d_factor(),
            jitter: d_jitter(),
            max_attempts: 0,
            max_auth_failures: d_auth(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn d_base() -> u64 {
    1_000
}
fn d_max() -> u64 {
    60_000
}
fn d_factor() -> f64 {
    2.0
}
fn d_jitter() -> f64 {
    0.25
}
fn d_auth() -> u32 {
    2
}
