//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                     │    ▲              │
//!      │ close (any)    error│    │timer         │socket error
//!      │                     ▼    │              ▼
//!      └──────────────── Reconnecting ◀──────────┘
//!                             │ budget exhausted / auth
//!                             ▼
//!                           Failed ──connect──▶ Connecting
//! ```
//!
//! The supervisor is the only writer; everything else observes.

use std::fmt;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Failed)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holder of the current [`ConnectionState`].
///
/// `watch` gives late observers the latest value; the `broadcast` side
/// delivers every individual transition for consumers that must not
/// miss intermediate states.
#[derive(Debug)]
pub struct StateCell {
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        Self {
            current,
            transitions,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Apply a transition.  Returns `false` if the edge is illegal, in
    /// which case the state is left untouched.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = next;
        let applied = self.current.send_if_modified(|state| {
            from = *state;
            if *state == next || !state.can_transition_to(next) {
                return false;
            }
            *state = next;
            true
        });

        if applied {
            tracing::debug!(from = %from, to = %next, "connection state changed");
            let _ = self.transitions.send(next);
            true
        } else if from == next {
            true
        } else {
            tracing::warn!(from = %from, to = %next, "refusing illegal state transition");
            false
        }
    }
}
