use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Desktop monitor (state sampler)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Sampling period.
    #[serde(default = "d_60")]
    pub report_interval_secs: u64,
    /// Minimum spacing between reports whose window did not change.
    /// Defaults to `report_interval_secs` when unset.
    #[serde(default)]
    pub unchanged_report_interval_secs: Option<u64>,
    #[serde(default = "d_true")]
    pub screenshot_enabled: bool,
    #[serde(default = "d_800")]
    pub screenshot_width: u32,
    #[serde(default = "d_600")]
    pub screenshot_height: u32,
    /// Upper bound for one capture (window query + screenshot).
    #[serde(default = "d_10")]
    pub capture_timeout_secs: u64,
    #[serde(default = "d_50")]
    pub max_running_apps: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_secs: 60,
            unchanged_report_interval_secs: None,
            screenshot_enabled: true,
            screenshot_width: 800,
            screenshot_height: 600,
            capture_timeout_secs: 10,
            max_running_apps: 50,
        }
    }
}

impl MonitorConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn unchanged_report_interval(&self) -> Duration {
        Duration::from_secs(
            self.unchanged_report_interval_secs
                .unwrap_or(self.report_interval_secs),
        )
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

fn d_true() -> bool {
    true
}
fn d_60() -> u64 {
    60
}
fn d_800() -> u32 {
    800
}
fn d_600() -> u32 {
    600
}
fn d_10() -> u64 {
    10
}
fn d_50() -> usize {
    50
}
