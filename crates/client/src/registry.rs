//! Remote command registry and the `command` envelope handler.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dl_protocol::{CommandPayload, CommandResultPayload, Envelope, MessageType};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::bridge::MessageBridge;
use crate::handler::MessageHandler;
use crate::types::{CommandContext, CommandError, CommandResult};
use crate::ui::UiEvent;

/// Implement this trait to execute a named command sent by the server.
///
/// # Example
///
/// ```rust,no_run
/// use dl_client::{CommandContext, CommandResult, DesktopCommand};
///
/// struct Ping;
///
/// #[async_trait::async_trait]
/// impl DesktopCommand for Ping {
///     async fn call(&self, _ctx: CommandContext, _params: serde_json::Value) -> CommandResult {
///         Ok(serde_json::json!({ "pong": true }))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait DesktopCommand: Send + Sync + 'static {
    async fn call(&self, ctx: CommandContext, params: serde_json::Value) -> CommandResult;
}

/// Registry of command handlers, keyed by lowercase name.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn DesktopCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command.  Names are case-insensitive.
    pub fn register<T: DesktopCommand>(&mut self, name: impl Into<String>, command: T) -> &mut Self {
        self.commands
            .insert(name.into().to_ascii_lowercase(), Arc::new(command));
        self
    }

    /// Register a pre-wrapped command handler.
    pub fn register_boxed(
        &mut self,
        name: impl Into<String>,
        command: Arc<dyn DesktopCommand>,
    ) -> &mut Self {
        self.commands.insert(name.into().to_ascii_lowercase(), command);
        self
    }

    /// All registered command names (sorted).  Advertised in `hello`.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DesktopCommand>> {
        self.commands.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Handles `command` envelopes.
///
/// Each command runs on its own task, bounded by a semaphore, so the read
/// loop is never blocked.  Every command gets exactly one `command_result`,
/// including unknown commands and handlers that panic.
pub struct CommandRouter {
    registry: Arc<CommandRegistry>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl CommandRouter {
    pub fn new(registry: CommandRegistry, max_concurrent: usize, cancel: CancellationToken) -> Self {
        Self {
            registry: Arc::new(registry),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for CommandRouter {
    async fn handle(&self, bridge: &MessageBridge, envelope: Envelope) {
        let correlation_id = envelope.correlation_id.clone();
        let request = match envelope.payload::<CommandPayload>() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable command payload");
                let request_id = correlation_id.clone().unwrap_or_default();
                let result = CommandResultPayload {
                    command: String::new(),
                    request_id,
                    success: false,
                    result: serde_json::Value::Null,
                    error_message: Some(CommandError::InvalidArgs(e.to_string()).to_string()),
                };
                submit(bridge, result, correlation_id).await;
                return;
            }
        };

        tracing::debug!(
            request_id = %request.request_id,
            command = %request.command,
            "received command"
        );
        bridge.emit(UiEvent::CommandStarted {
            command: request.command.clone(),
            request_id: request.request_id.clone(),
        });

        let registry = self.registry.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.child_token();
        let bridge = bridge.clone();

        tokio::spawn(async move {
            // Closed only if the router is torn down; run anyway.
            let _permit = permits.acquire_owned().await.ok();

            let CommandPayload {
                command,
                request_id,
                params,
            } = request;
            let ctx = CommandContext {
                request_id: request_id.clone(),
                command: command.clone(),
                cancel,
            };

            let outcome = match registry.get(&command) {
                Some(handler) => {
                    match AssertUnwindSafe(handler.call(ctx, params)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_panic) => {
                            tracing::error!(
                                command = %command,
                                request_id = %request_id,
                                "command handler panicked"
                            );
                            Err(CommandError::Failed("command handler panicked".into()))
                        }
                    }
                }
                None => {
                    tracing::warn!(command = %command, "no handler registered for command");
                    Err(CommandError::NotFound(format!("unknown command: {command}")))
                }
            };

            let success = outcome.is_ok();
            let (result, error_message) = match outcome {
                Ok(value) => (value, None),
                Err(e) => (serde_json::Value::Null, Some(e.to_string())),
            };
            let payload = CommandResultPayload {
                command: command.clone(),
                request_id: request_id.clone(),
                success,
                result,
                error_message,
            };
            submit(&bridge, payload, correlation_id).await;
            bridge.emit(UiEvent::CommandCompleted {
                command,
                request_id,
                success,
            });
        });
    }
}

async fn submit(bridge: &MessageBridge, payload: CommandResultPayload, correlation_id: Option<String>) {
    let envelope = match Envelope::from_payload(MessageType::CommandResult, &payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode command_result");
            return;
        }
    };
    let correlation = correlation_id.unwrap_or_else(|| payload.request_id.clone());
    let envelope = if correlation.is_empty() {
        envelope
    } else {
        envelope.with_correlation_id(correlation)
    };
    if let Err(e) = bridge.send_envelope(envelope).await {
        tracing::warn!(
            request_id = %payload.request_id,
            error = %e,
            "failed to submit command_result"
        );
    }
}
