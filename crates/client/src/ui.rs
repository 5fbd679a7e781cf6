//! Events surfaced to the presentation layer, and the built-in handlers
//! that produce them.

use dl_protocol::{ChatPayload, Envelope, ErrorPayload};

use crate::bridge::MessageBridge;
use crate::handler::MessageHandler;
use crate::state::ConnectionState;

/// Everything a UI needs to react to.  Delivered on a broadcast channel
/// (see [`ClientHandle::subscribe`](crate::client::ClientHandle::subscribe)).
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Inbound chat text (possibly one chunk of a streamed reply).
    Chat(ChatPayload),
    /// A remote command started executing.
    CommandStarted { command: String, request_id: String },
    /// A remote command finished and its result was submitted.
    CommandCompleted {
        command: String,
        request_id: String,
        success: bool,
    },
    /// The server reported an error.
    ServerError(ErrorPayload),
    /// An envelope of a type nothing is registered for.
    Opaque(Envelope),
    StateChanged(ConnectionState),
    /// Credentials were rejected and the supervisor gave up.
    AuthRequired(String),
    /// Too many malformed frames; a reconnect was forced.
    ProtocolError(String),
}

/// Forwards `chat` envelopes to the UI.
pub struct ChatForwarder;

#[async_trait::async_trait]
impl MessageHandler for ChatForwarder {
    async fn handle(&self, bridge: &MessageBridge, envelope: Envelope) {
        match envelope.payload::<ChatPayload>() {
            Ok(chat) => {
                tracing::debug!(
                    chars = chat.text.len(),
                    streaming = chat.streaming,
                    complete = chat.is_complete,
                    "chat received"
                );
                bridge.emit(UiEvent::Chat(chat));
            }
            Err(e) => tracing::warn!(error = %e, "dropping unreadable chat payload"),
        }
    }
}

/// Forwards `error` envelopes to the UI.
pub struct ErrorForwarder;

#[async_trait::async_trait]
impl MessageHandler for ErrorForwarder {
    async fn handle(&self, bridge: &MessageBridge, envelope: Envelope) {
        let payload = envelope.payload::<ErrorPayload>().unwrap_or_else(|_| ErrorPayload {
            code: "unknown".into(),
            message: envelope.data.to_string(),
        });
        tracing::warn!(code = %payload.code, message = %payload.message, "server reported error");
        bridge.emit(UiEvent::ServerError(payload));
    }
}

/// Acknowledgements and heartbeat replies only feed liveness tracking.
pub struct AckLogger;

#[async_trait::async_trait]
impl MessageHandler for AckLogger {
    async fn handle(&self, _bridge: &MessageBridge, envelope: Envelope) {
        tracing::trace!(
            kind = %envelope.kind,
            correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
            "ack received"
        );
    }
}

/// Catch-all: logs and hands the raw envelope to the UI.
pub struct OpaqueForwarder;

#[async_trait::async_trait]
impl MessageHandler for OpaqueForwarder {
    async fn handle(&self, bridge: &MessageBridge, envelope: Envelope) {
        tracing::info!(kind = %envelope.kind, "no handler for message type, forwarding as opaque");
        bridge.emit(UiEvent::Opaque(envelope));
    }
}
