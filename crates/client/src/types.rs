//! Core types: command context, results, and the error taxonomy.

use std::time::Duration;

use dl_protocol::{CodecError, MessageType};
use tokio_util::sync::CancellationToken;

/// Context provided to every remote command invocation.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Correlation ID; echoed back in the `command_result`.
    pub request_id: String,
    /// Command name as sent by the server.
    pub command: String,
    /// Cancelled when the client shuts down.
    pub cancel: CancellationToken,
}

/// Result type for command handlers.
pub type CommandResult = Result<serde_json::Value, CommandError>;

/// Errors a command handler can return.
///
/// Translated into a `command_result` with `success: false` and the
/// rendered message in `error_message`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CommandError {
    #[error("invalid_args: {0}")]
    InvalidArgs(String),
    #[error("not_allowed: {0}")]
    NotAllowed(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("not_found: {0}")]
    NotFound(String),
}

/// Why a single connection attempt failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("timed out while {0}")]
    Timeout(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
}

impl ConnectError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

/// Why an outbound envelope could not be delivered or queued.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected; {0} is never queued")]
    NotConnected(MessageType),
    #[error("pending queue full; {0} rejected")]
    QueueFull(MessageType),
    #[error("send timed out")]
    Timeout,
}

/// Failures of a capture collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no active window")]
    NoActiveWindow,
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
    #[error("capture failed: {0}")]
    Failed(String),
    #[error("capture timed out")]
    Timeout,
}

/// Problems with inbound frames.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    Oversized { size: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{count} protocol errors within {window:?}")]
    ThresholdExceeded { count: usize, window: Duration },
}

/// Errors surfaced by [`MessageBridge::send`](crate::bridge::MessageBridge::send).
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Top-level client error.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_renders_kind_prefix() {
        let e = CommandError::NotFound("unknown command: zoom".into());
        assert_eq!(e.to_string(), "not_found: unknown command: zoom");
    }

    #[test]
    fn only_auth_rejection_is_auth() {
        assert!(ConnectError::AuthRejected("bad token".into()).is_auth());
        assert!(!ConnectError::Timeout("connecting").is_auth());
        assert!(!ConnectError::Unreachable("refused".into()).is_auth());
    }

    #[test]
    fn send_error_names_message_type() {
        let e = SendError::QueueFull(MessageType::Chat);
        assert_eq!(e.to_string(), "pending queue full; chat rejected");
    }
}
