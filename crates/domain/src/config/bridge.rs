use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Messages held while offline.
    #[serde(default = "d_64")]
    pub pending_capacity: usize,
    /// Frames buffered between the bridge and the socket writer.
    #[serde(default = "d_64")]
    pub outbound_buffer: usize,
    /// Undecodable frames tolerated within `protocol_error_window_secs`
    /// before the connection is recycled.
    #[serde(default = "d_5")]
    pub protocol_error_threshold: usize,
    #[serde(default = "d_60")]
    pub protocol_error_window_secs: u64,
    #[serde(default = "d_4")]
    pub max_concurrent_commands: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 64,
            outbound_buffer: 64,
            protocol_error_threshold: 5,
            protocol_error_window_secs: 60,
            max_concurrent_commands: 4,
        }
    }
}

impl BridgeConfig {
    pub fn protocol_error_window(&self) -> Duration {
        Duration::from_secs(self.protocol_error_window_secs)
    }
}

fn d_64() -> usize {
    64
}
fn d_5() -> usize {
    5
}
fn d_60() -> u64 {
    60
}
fn d_4() -> usize {
    4
}
