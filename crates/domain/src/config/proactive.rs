use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Proactive conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Period of the background eligibility check.
    #[serde(default = "d_600")]
    pub check_interval_secs: u64,
    #[serde(default = "d_probability")]
    pub trigger_probability: f64,
    /// Minimum spacing between two fires.
    #[serde(default = "d_600")]
    pub cooldown_secs: u64,
    #[serde(default = "d_true")]
    pub require_user_active: bool,
    /// Idle time above which the user counts as away.
    #[serde(default = "d_60")]
    pub idle_threshold_secs: u64,
    #[serde(default)]
    pub time_range_enabled: bool,
    #[serde(default = "d_start")]
    pub time_range_start: String,
    #[serde(default = "d_end")]
    pub time_range_end: String,
    #[serde(default = "d_prompt")]
    pub prompt_template: String,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: 600,
            trigger_probability: d_probability(),
            cooldown_secs: 600,
            require_user_active: true,
            idle_threshold_secs: 60,
            time_range_enabled: false,
            time_range_start: d_start(),
            time_range_end: d_end(),
            prompt_template: d_prompt(),
        }
    }
}

impl ProactiveConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

fn d_true() -> bool {
    true
}
fn d_600() -> u64 {
    600
}
fn d_60() -> u64 {
    60
}
fn d_probability() -> f64 {
    0.2
}
fn d_start() -> String {
    "09:00".into()
}
fn d_end() -> String {
    "22:00".into()
}
fn d_prompt() -> String {
    "You are the user's desktop companion. Based on what is currently on their screen, \
     open a short, natural conversation: greet them or comment briefly on what they are \
     doing, offer help if it fits, and keep it to two or three relaxed sentences."
        .into()
}
