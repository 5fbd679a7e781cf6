use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP base URL of the assistant service (e.g. `http://localhost:6185`).
    #[serde(default = "d_url")]
    pub url: String,
    /// Explicit streaming endpoint.  When unset it is derived from `url`
    /// as `ws(s)://<host>/ws/client`.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Bearer token.  Takes precedence over `token_env` and over logging in
    /// with `username`/`password`.
    #[serde(default)]
    pub token: Option<String>,
    /// Environment variable consulted when `token` is unset.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Stable identifier reported in `hello`.  Defaults to the hostname.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "d_30000")]
    pub request_timeout_ms: u64,
    #[serde(default = "d_10000")]
    pub connect_timeout_ms: u64,
    #[serde(default = "d_10000")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "d_5000")]
    pub send_timeout_ms: u64,
    #[serde(default = "d_25")]
    pub heartbeat_interval_secs: u64,
    /// No inbound frame for this long counts as a dead connection.
    #[serde(default = "d_100")]
    pub heartbeat_timeout_secs: u64,
    /// Inbound frames larger than this are rejected before parsing.
    #[serde(default = "d_max_frame")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            ws_url: None,
            username: String::new(),
            password: String::new(),
            token: None,
            token_env: d_token_env(),
            client_id: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 100,
            max_frame_bytes: d_max_frame(),
        }
    }
}

impl ServerConfig {
    /// The configured token, falling back to the `token_env` variable.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(&self.token_env).ok().filter(|t| !t.is_empty()))
    }

    /// Streaming endpoint without query parameters.
    pub fn stream_url(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        let (scheme, rest) = match self.url.split_once("://") {
            Some(("https", rest)) => ("wss", rest),
            Some((_, rest)) => ("ws", rest),
            None => ("ws", self.url.as_str()),
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        format!("{scheme}://{authority}/ws/client")
    }

    /// HTTP base without a trailing slash.
    pub fn http_base(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_url() -> String {
    "http://localhost:6185".into()
}
fn d_token_env() -> String {
    "DESKLINK_TOKEN".into()
}
fn d_30000() -> u64 {
    30_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_25() -> u64 {
    25
}
fn d_100() -> u64 {
    100
}
fn d_max_frame() -> usize {
    10 * 1024 * 1024
}
