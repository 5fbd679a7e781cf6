//! `dl-client`: desktop state synchronization and messaging bridge.
//!
//! Keeps a desktop companion connected to the assistant service, reports
//! what is on screen, relays chat both ways, runs server-issued commands,
//! and occasionally opens a conversation on its own.
//!
//! # Architecture
//!
//! ```text
//!  CaptureSource ──► StateSampler ──┐          ┌──► handlers (chat, error,
//!                        │          │          │     command router, UI)
//!                        ▼          ▼          │
//!              ProactiveTrigger ─► MessageBridge ◄── ClientHandle (UI)
//!                                   │    ▲
//!                     pending queue │    │ dispatch
//!                                   ▼    │
//!                       writer task ◄── Supervisor ──► ConnectionState
//!                             │            │
//!                             ▼            ▼
//!                          socket ◄──── transport / http
//! ```
//!
//! # Connection flow
//!
//! 1. Obtain a token (configured, or `POST /api/auth/login`)
//! 2. Open the socket with `token`/`session_id`/`client_id` query params
//! 3. Send `hello { session_id, client_id, resumed, capabilities }`
//! 4. Wait for `welcome { session_id, server_version }`
//! 5. Flush the pending queue in submission order, then run the read loop
//!    and the heartbeat
//! 6. On loss: `Reconnecting`, jittered back-off, retry
//!
//! Only the writer task touches the socket's sink; everything else goes
//! through [`MessageBridge`].

pub mod bridge;
pub mod builder;
pub mod capture;
pub mod client;
pub mod commands;
pub mod handler;
pub mod http;
pub mod proactive;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod sampler;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod ui;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use bridge::{BridgeSettings, BridgeStats, Delivery, MessageBridge};
pub use builder::DesktopClientBuilder;
pub use capture::{ActiveWindow, CaptureReason, CaptureSource, CapturedImage, DesktopState, NoCapture};
pub use client::{ClientHandle, ClientStats, DesktopClient};
pub use handler::{HandlerRegistry, MessageHandler};
pub use proactive::{ProactiveSettings, ProactiveTrigger, TriggerContext, TriggerDecision};
pub use reconnect::{BackoffState, ReconnectBackoff};
pub use registry::{CommandRegistry, CommandRouter, DesktopCommand};
pub use sampler::{SamplerSettings, StateSampler};
pub use state::ConnectionState;
pub use types::{
    BridgeError, CaptureError, ClientError, CommandContext, CommandError, CommandResult,
    ConnectError, ProtocolError, SendError,
};
pub use ui::UiEvent;

// Re-export the wire types so hosts never need to depend on dl-protocol.
pub use dl_protocol::{Envelope, MessageType, RunningApp};
