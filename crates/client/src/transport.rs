//! Streaming transport: connect, identify, and wait for `welcome`.

use std::time::Duration;

use dl_protocol::{Envelope, MessageType, WelcomePayload};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::types::ConnectError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// TCP/TLS/upgrade.
    pub connect: Duration,
    /// From `hello` sent to `welcome` received.
    pub handshake: Duration,
}

/// A connection that completed the handshake.
pub struct Session {
    pub welcome: WelcomePayload,
    pub ws: WsStream,
}

/// Append auth and session query parameters to the stream endpoint.
pub fn build_url(
    base: &str,
    token: Option<&str>,
    session_id: Option<&str>,
    client_id: &str,
) -> String {
    let mut params = Vec::new();
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        params.push(format!("token={token}"));
    }
    if let Some(session_id) = session_id.filter(|s| !s.is_empty()) {
        params.push(format!("session_id={session_id}"));
    }
    params.push(format!("client_id={client_id}"));

    let sep = if base.contains('?') { "&" } else { "?" };
    format!("{base}{sep}{}", params.join("&"))
}

/// Open the socket, send `hello`, and wait for `welcome`.
///
/// Fails the attempt on anything else: a timeout, an `error` envelope, an
/// undecodable frame, or the peer closing first.  Auth rejections (HTTP
/// 401/403 on upgrade, or an auth error code) map to
/// [`ConnectError::AuthRejected`].
pub async fn connect(url: &str, hello: &Envelope, timeouts: Timeouts) -> Result<Session, ConnectError> {
    let (mut ws, _response) = match tokio::time::timeout(
        timeouts.connect,
        tokio_tungstenite::connect_async(url),
    )
    .await
    {
        Err(_) => return Err(ConnectError::Timeout("connecting")),
        Ok(Err(e)) => return Err(classify(e)),
        Ok(Ok(pair)) => pair,
    };

    let frame = hello
        .encode()
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;
    ws.send(Message::Text(frame)).await.map_err(classify)?;

    let welcome = tokio::time::timeout(timeouts.handshake, await_welcome(&mut ws))
        .await
        .map_err(|_| ConnectError::Timeout("waiting for welcome"))??;

    Ok(Session { welcome, ws })
}

async fn await_welcome(ws: &mut WsStream) -> Result<WelcomePayload, ConnectError> {
    while let Some(msg) = ws.next().await {
        let text = match msg.map_err(classify)? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(ConnectError::Handshake(format!(
                    "closed during handshake: {reason}"
                )));
            }
            _ => continue,
        };

        let envelope = Envelope::decode(&text)
            .map_err(|e| ConnectError::Handshake(format!("malformed handshake response: {e}")))?;
        match envelope.kind {
            MessageType::Welcome => {
                return envelope
                    .payload::<WelcomePayload>()
                    .map_err(|e| ConnectError::Handshake(format!("malformed welcome: {e}")));
            }
            MessageType::Error if envelope.is_auth_rejection() => {
                return Err(ConnectError::AuthRejected(error_message(&envelope)));
            }
            MessageType::Error => {
                return Err(ConnectError::Handshake(error_message(&envelope)));
            }
            other => {
                tracing::debug!(kind = %other, "ignoring message before welcome");
            }
        }
    }
    Err(ConnectError::Handshake("connection closed before welcome".into()))
}

fn error_message(envelope: &Envelope) -> String {
    envelope
        .payload::<dl_protocol::ErrorPayload>()
        .map(|e| format!("{}: {}", e.code, e.message))
        .unwrap_or_else(|_| envelope.data.to_string())
}

fn classify(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                ConnectError::AuthRejected(format!("HTTP {status}"))
            } else {
                ConnectError::Handshake(format!("HTTP {status}"))
            }
        }
        tungstenite::Error::Io(e) => ConnectError::Unreachable(e.to_string()),
        tungstenite::Error::Url(e) => ConnectError::Unreachable(format!("bad url: {e}")),
        other => ConnectError::Handshake(other.to_string()),
    }
}
