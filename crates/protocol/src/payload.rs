//! Typed `data` payloads for the known message types.

use serde::{Deserialize, Serialize};

/// `desktop_state` payload.  Field names are normative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesktopStatePayload {
    /// ISO-8601 wall-clock capture time.
    pub timestamp: String,
    #[serde(default)]
    pub active_window_title: String,
    #[serde(default)]
    pub active_window_process: String,
    #[serde(default)]
    pub active_window_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_height: Option<u32>,
    #[serde(default)]
    pub running_apps: Vec<RunningApp>,
    #[serde(default)]
    pub window_changed: bool,
    #[serde(default)]
    pub previous_window_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningApp {
    pub pid: u32,
    pub name: String,
}

/// `chat` payload, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Server → Client: more chunks of the same reply follow.
    #[serde(default)]
    pub streaming: bool,
    /// Server → Client: last chunk of a reply.
    #[serde(default)]
    pub is_complete: bool,
}

/// `proactive_chat` payload: the client asks the assistant to open a
/// conversation about what is on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProactiveChatPayload {
    pub prompt: String,
    /// Probability the trigger was drawn against (1.0 for manual triggers).
    pub probability: f64,
    pub manual: bool,
    pub desktop: DesktopStatePayload,
}

/// `command` payload (Server → Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// `command_result` payload (Client → Server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub command: String,
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `hello` payload: identifies the session on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub client_id: String,
    pub client_version: String,
    /// True when this connection replaces an earlier one.
    #[serde(default)]
    pub resumed: bool,
    /// Remote commands this client can execute.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `welcome` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub server_version: String,
    /// Server-preferred heartbeat cadence, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
}

/// `heartbeat` / `heartbeat_ack` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}
