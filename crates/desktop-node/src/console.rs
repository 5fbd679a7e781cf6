//! Line-oriented stand-in for the chat window.
//!
//! Plain lines are sent as chat.  Lines starting with `/` are local
//! commands; see [`HELP`].

use dl_client::{ClientHandle, UiEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const HELP: &str = "\
/connect    connect (or retry after giving up)
/close      disconnect
/capture    capture and report the desktop now
/proactive  start a proactive conversation now
/stats      connection counters
/quit       exit";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Connect,
    Close,
    Capture,
    Proactive,
    Stats,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(cmd) = line.strip_prefix('/') else {
        return Input::Chat(line.to_string());
    };
    match cmd.split_whitespace().next().unwrap_or("") {
        "connect" => Input::Connect,
        "close" => Input::Close,
        "capture" => Input::Capture,
        "proactive" => Input::Proactive,
        "stats" => Input::Stats,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

/// Read stdin until EOF, `/quit`, or shutdown.
pub async fn read_input(handle: ClientHandle, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.cancelled() => return,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdin closed");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reading stdin failed");
                return;
            }
        };

        match parse(&line) {
            Input::Chat(text) => {
                if let Err(e) = handle.send_chat(text).await {
                    tracing::warn!(error = %e, "chat not sent");
                }
            }
            Input::Connect => handle.connect(),
            Input::Close => handle.close(),
            Input::Capture => match handle.capture_now().await {
                Ok(state) => println!("captured: {}", state.title()),
                Err(e) => tracing::warn!(error = %e, "capture failed"),
            },
            Input::Proactive => match handle.trigger_proactive().await {
                Some(ctx) => println!("proactive request sent ({})", ctx.state.title()),
                None => println!("proactive trigger is cooling down"),
            },
            Input::Stats => {
                let stats = handle.stats();
                println!(
                    "state={} reconnects={} protocol_errors={} dropped={} sent={} queued={}",
                    handle.state(),
                    stats.total_reconnects,
                    stats.protocol_errors,
                    stats.dropped_messages,
                    stats.sent,
                    stats.queued,
                );
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => {
                shutdown.cancel();
                return;
            }
            Input::Unknown(cmd) => println!("unknown command /{cmd}; /help lists commands"),
            Input::Empty => {}
        }
    }
}

/// Render client events until the channel closes or shutdown.
pub async fn show_events(mut events: broadcast::Receiver<UiEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            e = events.recv() => e,
            _ = shutdown.cancelled() => return,
        };
        match event {
            Ok(UiEvent::Chat(chat)) => {
                if chat.streaming && !chat.is_complete {
                    print!("{}", chat.text);
                } else {
                    println!("{}", chat.text);
                }
            }
            Ok(UiEvent::StateChanged(state)) => tracing::info!(%state, "connection state"),
            Ok(UiEvent::AuthRequired(reason)) => {
                println!("authentication rejected ({reason}); fix credentials and /connect");
            }
            Ok(UiEvent::ServerError(err)) => println!("server error [{}]: {}", err.code, err.message),
            Ok(UiEvent::CommandStarted { command, request_id }) => {
                tracing::info!(%command, %request_id, "remote command started");
            }
            Ok(UiEvent::CommandCompleted {
                command,
                request_id,
                success,
            }) => tracing::info!(%command, %request_id, success, "remote command finished"),
            Ok(UiEvent::ProtocolError(reason)) => tracing::warn!(%reason, "protocol error"),
            Ok(UiEvent::Opaque(envelope)) => {
                tracing::debug!(kind = %envelope.kind, "unhandled message from server");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "console fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
