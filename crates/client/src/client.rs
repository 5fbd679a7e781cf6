//! The assembled client and the handle the UI side talks to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dl_protocol::{ChatPayload, CommandPayload, CommandResultPayload, Envelope, MessageType};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::bridge::{Delivery, MessageBridge};
use crate::capture::DesktopState;
use crate::handler::MessageHandler;
use crate::proactive::{ProactiveTrigger, TriggerContext};
use crate::sampler::{SamplerSettings, StateSampler};
use crate::state::{ConnectionState, StateCell};
use crate::supervisor::{Supervisor, SupervisorControl};
use crate::types::{BridgeError, CaptureError, ClientError};
use crate::ui::UiEvent;

/// A fully-wired client ready to run.
///
/// Create via [`DesktopClientBuilder`](crate::builder::DesktopClientBuilder).
/// Grab a [`ClientHandle`] with [`handle`](Self::handle) before calling
/// [`run`](Self::run).
pub struct DesktopClient {
    pub(crate) monitor_enabled: bool,
    pub(crate) sampler_settings: SamplerSettings,
    pub(crate) state: Arc<StateCell>,
    pub(crate) bridge: MessageBridge,
    pub(crate) sampler: StateSampler,
    pub(crate) proactive: ProactiveTrigger,
    pub(crate) control: SupervisorControl,
    pub(crate) reconnects: Arc<AtomicU64>,
    pub(crate) supervisor: Supervisor,
    pub(crate) commands_cancel: CancellationToken,
}

impl DesktopClient {
    pub fn builder(config: dl_domain::config::Config) -> crate::builder::DesktopClientBuilder {
        crate::builder::DesktopClientBuilder::new(config)
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            state: self.state.clone(),
            bridge: self.bridge.clone(),
            sampler: self.sampler.clone(),
            proactive: self.proactive.clone(),
            control: self.control.clone(),
            reconnects: self.reconnects.clone(),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Starts the sampler and the proactive engine, then hands control to
    /// the supervisor.  Everything started here is stopped before
    /// returning, and in-flight commands are cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let forward = tokio::spawn(forward_transitions(
            self.state.subscribe(),
            self.bridge.clone(),
        ));

        if self.monitor_enabled {
            self.sampler.start(self.sampler_settings.clone());
        } else {
            tracing::info!("desktop monitoring disabled");
        }
        if self.proactive.settings().enabled {
            self.proactive.start();
        }

        let result = self.supervisor.run(shutdown).await;

        self.proactive.stop();
        self.sampler.stop();
        self.commands_cancel.cancel();
        forward.abort();

        match result {
            Ok(()) | Err(ClientError::Shutdown) => {
                tracing::info!("client stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Same as [`run`](Self::run), on a spawned task.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<(), ClientError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

async fn forward_transitions(mut rx: broadcast::Receiver<ConnectionState>, bridge: MessageBridge) {
    loop {
        match rx.recv().await {
            Ok(state) => bridge.emit(UiEvent::StateChanged(state)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "state observer lagged");
                bridge.emit(UiEvent::StateChanged(bridge.state()));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Counters for a status view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub total_reconnects: u64,
    pub protocol_errors: u64,
    pub dropped_messages: u64,
    pub sent: u64,
    pub queued: u64,
}

/// Cheap, cloneable access to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    state: Arc<StateCell>,
    bridge: MessageBridge,
    sampler: StateSampler,
    proactive: ProactiveTrigger,
    control: SupervisorControl,
    reconnects: Arc<AtomicU64>,
}

impl ClientHandle {
    /// Send user-typed chat text in the current session.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<Delivery, BridgeError> {
        let payload = ChatPayload {
            text: text.into(),
            session_id: self.bridge.session_id(),
            streaming: false,
            is_complete: true,
        };
        self.bridge.send_payload(MessageType::Chat, &payload).await
    }

    /// Send an arbitrary envelope through the bridge.
    pub async fn send_message(&self, envelope: Envelope) -> Result<Delivery, BridgeError> {
        self.bridge.send_envelope(envelope).await
    }

    /// Ask the server to run a command.  Returns the generated request id,
    /// which the server echoes as the correlation id of its reply.
    pub async fn send_command(
        &self,
        command: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<String, BridgeError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = CommandPayload {
            command: command.into(),
            request_id: request_id.clone(),
            params,
        };
        let envelope = Envelope::from_payload(MessageType::Command, &payload)?
            .with_correlation_id(request_id.clone());
        self.bridge.send_envelope(envelope).await?;
        Ok(request_id)
    }

    /// Report the outcome of a command handled outside the registry.
    pub async fn send_command_result(
        &self,
        command: impl Into<String>,
        request_id: impl Into<String>,
        outcome: Result<serde_json::Value, String>,
    ) -> Result<Delivery, BridgeError> {
        let request_id = request_id.into();
        let (success, result, error_message) = match outcome {
            Ok(value) => (true, value, None),
            Err(message) => (false, serde_json::Value::Null, Some(message)),
        };
        let payload = CommandResultPayload {
            command: command.into(),
            request_id: request_id.clone(),
            success,
            result,
            error_message,
        };
        let envelope = Envelope::from_payload(MessageType::CommandResult, &payload)?
            .with_correlation_id(request_id);
        self.bridge.send_envelope(envelope).await
    }

    /// Fire a proactive conversation now.  `None` while cooling down.
    pub async fn trigger_proactive(&self) -> Option<TriggerContext> {
        self.proactive.trigger_manual().await
    }

    /// Capture and report the desktop immediately.
    pub async fn capture_now(&self) -> Result<Arc<DesktopState>, CaptureError> {
        self.sampler.capture_and_report().await
    }

    /// Request a connection; restarts the cycle from `Failed`.
    pub fn connect(&self) {
        self.control.connect();
    }

    /// Close the connection.  Idempotent.
    pub fn close(&self) {
        self.control.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Every transition, in order.
    pub fn observe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The latest state only.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.bridge.subscribe()
    }

    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.bridge.register_handler(kind, handler);
    }

    pub fn session_id(&self) -> Option<String> {
        self.bridge.session_id()
    }

    pub fn stats(&self) -> ClientStats {
        let bridge = self.bridge.stats();
        ClientStats {
            total_reconnects: self.reconnects.load(Ordering::Relaxed),
            protocol_errors: bridge.protocol_errors,
            dropped_messages: bridge.dropped,
            sent: bridge.sent,
            queued: bridge.queued,
        }
    }
}
