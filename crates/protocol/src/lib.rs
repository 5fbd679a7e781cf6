//! Desktop bridge protocol: envelope framing, message types, and payloads.
//!
//! Every frame on the streaming channel is a JSON [`Envelope`]:
//!
//! ```json
//! { "type": "desktop_state", "data": { ... }, "correlation_id": "req-1" }
//! ```
//!
//! The `type` tag is mandatory.  Tags outside the known vocabulary decode to
//! [`MessageType::Other`] so newer peers can introduce message kinds without
//! breaking older clients.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod payload;

pub use payload::*;

/// Bumped on incompatible changes to the handshake or envelope shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes the server uses in `error` envelopes to reject credentials.
pub const AUTH_REJECTED_CODES: &[&str] = &["auth_rejected", "unauthorized", "invalid_token"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `type` tag of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Client → Server: periodic or on-demand desktop snapshot.
    DesktopState,
    /// Bidirectional: conversational text.
    Chat,
    /// Client → Server: a conversation opened by the client on its own.
    ProactiveChat,
    /// Server → Client: execute a named command.
    Command,
    /// Client → Server: outcome of a `command`.
    CommandResult,
    /// Bidirectional: acknowledgement of a correlated envelope.
    Ack,
    /// Bidirectional: error report.
    Error,
    /// Client → Server: session identification, sent first on every connection.
    Hello,
    /// Server → Client: handshake accepted.
    Welcome,
    /// Client → Server: application-level keepalive.
    Heartbeat,
    /// Server → Client: keepalive response.
    HeartbeatAck,
    /// Any tag this client does not know about.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DesktopState => "desktop_state",
            Self::Chat => "chat",
            Self::ProactiveChat => "proactive_chat",
            Self::Command => "command",
            Self::CommandResult => "command_result",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Hello => "hello",
            Self::Welcome => "welcome",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Other(tag) => tag,
        }
    }

    /// Connection-scoped traffic that is meaningless after a reconnect and
    /// therefore never queued while offline.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Hello | Self::Welcome | Self::Heartbeat | Self::HeartbeatAck
        )
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "desktop_state" => Self::DesktopState,
            "chat" => Self::Chat,
            "proactive_chat" => Self::ProactiveChat,
            "command" => Self::Command,
            "command_result" => Self::CommandResult,
            "ack" => Self::Ack,
            "error" => Self::Error,
            "hello" => Self::Hello,
            "welcome" => Self::Welcome,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_ack" => Self::HeartbeatAck,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors produced while encoding or decoding frames.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has an empty type tag")]
    EmptyType,
    #[error("payload for {kind}: {source}")]
    Payload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The typed wire message unit exchanged over the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageType, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            correlation_id: None,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_value(payload).map_err(CodecError::Encode)?;
        Ok(Self::new(kind, data))
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(CodecError::Malformed)?;
        if envelope.kind.as_str().is_empty() {
            return Err(CodecError::EmptyType);
        }
        Ok(envelope)
    }

    /// Encode to a text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Interpret `data` as a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.data.clone()).map_err(|source| CodecError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    /// Whether this is an `error` envelope carrying an authentication rejection.
    pub fn is_auth_rejection(&self) -> bool {
        if self.kind != MessageType::Error {
            return false;
        }
        self.payload::<ErrorPayload>()
            .map(|e| AUTH_REJECTED_CODES.contains(&e.code.as_str()))
            .unwrap_or(false)
    }
}
