mod bridge;
mod monitor;
mod proactive;
mod reconnect;
mod server;

pub use bridge::*;
pub use monitor::*;
pub use proactive::*;
pub use reconnect::*;
pub use server::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Conversation session to resume; assigned by the server when absent.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Config {
    /// Load from a TOML file.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            Error::ConfigParse { message, .. } => Error::ConfigParse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigParse {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.url.is_empty() {
            errors.push(ConfigError::error("server.url", "url must not be empty"));
        } else if !(self.server.url.starts_with("http://")
            || self.server.url.starts_with("https://"))
        {
            errors.push(ConfigError::error(
                "server.url",
                "url must start with http:// or https://",
            ));
        }

        if let Some(ws) = &self.server.ws_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                errors.push(ConfigError::error(
                    "server.ws_url",
                    "ws_url must start with ws:// or wss://",
                ));
            }
        }

        if self.server.resolve_token().is_none()
            && (self.server.username.is_empty() || self.server.password.is_empty())
        {
            errors.push(ConfigError::warning(
                "server",
                "no token and no username/password configured; connecting unauthenticated",
            ));
        }

        if self.server.heartbeat_timeout_secs <= self.server.heartbeat_interval_secs {
            errors.push(ConfigError::error(
                "server.heartbeat_timeout_secs",
                "heartbeat timeout must exceed the heartbeat interval",
            ));
        }

        if self.reconnect.base_delay_ms == 0 {
            errors.push(ConfigError::error(
                "reconnect.base_delay_ms",
                "base delay must be greater than 0",
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            errors.push(ConfigError::error(
                "reconnect.max_delay_ms",
                "max delay must be at least the base delay",
            ));
        }
        if self.reconnect.factor < 1.0 {
            errors.push(ConfigError::error(
                "reconnect.factor",
                "factor must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            errors.push(ConfigError::error(
                "reconnect.jitter",
                "jitter must be within 0.0..=1.0",
            ));
        }

        if self.monitor.report_interval_secs == 0 {
            errors.push(ConfigError::error(
                "monitor.report_interval_secs",
                "report interval must be greater than 0",
            ));
        }
        if self.monitor.screenshot_enabled
            && (self.monitor.screenshot_width == 0 || self.monitor.screenshot_height == 0)
        {
            errors.push(ConfigError::error(
                "monitor.screenshot_width",
                "screenshot size must be non-zero when screenshots are enabled",
            ));
        }

        if !(0.0..=1.0).contains(&self.proactive.trigger_probability) {
            errors.push(ConfigError::error(
                "proactive.trigger_probability",
                "probability must be within 0.0..=1.0",
            ));
        }
        if self.proactive.check_interval_secs == 0 {
            errors.push(ConfigError::error(
                "proactive.check_interval_secs",
                "check interval must be greater than 0",
            ));
        }
        if self.proactive.time_range_enabled {
            if parse_hhmm(&self.proactive.time_range_start).is_none() {
                errors.push(ConfigError::error(
                    "proactive.time_range_start",
                    "expected HH:MM",
                ));
            }
            if parse_hhmm(&self.proactive.time_range_end).is_none() {
                errors.push(ConfigError::error(
                    "proactive.time_range_end",
                    "expected HH:MM",
                ));
            }
        }
        if self.proactive.enabled && !self.monitor.enabled {
            errors.push(ConfigError::warning(
                "proactive.enabled",
                "proactive triggers only see periodic checks while the monitor is disabled",
            ));
        }

        if self.bridge.pending_capacity == 0 {
            errors.push(ConfigError::error(
                "bridge.pending_capacity",
                "pending queue must hold at least one message",
            ));
        }
        if self.bridge.protocol_error_threshold == 0 {
            errors.push(ConfigError::error(
                "bridge.protocol_error_threshold",
                "threshold must be greater than 0",
            ));
        }

        errors
    }

    /// Whether any validation issue is a hard error.
    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error)
    }
}

/// Parse `"HH:MM"` into a wall-clock time.
pub fn parse_hhmm(raw: &str) -> Option<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_without_errors() {
        let config = Config::default();
        assert!(!config.has_errors(), "{:?}", config.validate());
    }

    #[test]
    fn bad_probability_is_error() {
        let mut config = Config::default();
        config.proactive.trigger_probability = 1.5;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "proactive.trigger_probability"
                && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn cap_below_base_is_error() {
        let mut config = Config::default();
        config.reconnect.base_delay_ms = 5_000;
        config.reconnect.max_delay_ms = 1_000;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.field == "reconnect.max_delay_ms"));
    }

    #[test]
    fn malformed_time_range_reported_only_when_enabled() {
        let mut config = Config::default();
        config.proactive.time_range_start = "nine".into();
        assert!(!config
            .validate()
            .iter()
            .any(|e| e.field == "proactive.time_range_start"));

        config.proactive.time_range_enabled = true;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.field == "proactive.time_range_start"));
    }

    #[test]
    fn ws_url_scheme_checked() {
        let mut config = Config::default();
        config.server.ws_url = Some("http://example.com/ws".into());
        assert!(config.validate().iter().any(|e| e.field == "server.ws_url"));
    }

    #[test]
    fn parse_hhmm_accepts_padded_times() {
        assert!(parse_hhmm("09:00").is_some());
        assert!(parse_hhmm(" 22:30 ").is_some());
        assert!(parse_hhmm("25:00").is_none());
    }

    #[test]
    fn display_includes_severity_tag() {
        let e = ConfigError::warning("server", "unauthenticated");
        assert_eq!(e.to_string(), "[WARN] server: unauthenticated");
    }
}
