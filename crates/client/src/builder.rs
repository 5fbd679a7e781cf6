//! Builder for assembling a [`DesktopClient`].

use std::sync::Arc;

use dl_domain::config::{Config, ConfigSeverity};
use dl_protocol::MessageType;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeSettings, MessageBridge};
use crate::capture::{CaptureSource, NoCapture};
use crate::client::DesktopClient;
use crate::commands::{CaptureStateCommand, ScreenshotCommand};
use crate::handler::MessageHandler;
use crate::proactive::{ProactiveSettings, ProactiveTrigger};
use crate::registry::{CommandRegistry, CommandRouter, DesktopCommand};
use crate::sampler::{SamplerSettings, StateSampler};
use crate::state::StateCell;
use crate::supervisor::{Supervisor, SupervisorControl, SupervisorSettings};
use crate::types::ClientError;

/// Fluent builder for [`DesktopClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use dl_client::DesktopClientBuilder;
/// # use dl_domain::config::Config;
/// let client = DesktopClientBuilder::new(Config::default())
///     .client_version(env!("CARGO_PKG_VERSION"))
///     .autoconnect(true)
///     .build()
///     .unwrap();
/// ```
pub struct DesktopClientBuilder {
    config: Config,
    client_version: String,
    source: Option<Arc<dyn CaptureSource>>,
    commands: CommandRegistry,
    handlers: Vec<(MessageType, Arc<dyn MessageHandler>)>,
    fallback: Option<Arc<dyn MessageHandler>>,
    autoconnect: bool,
    proactive_seed: Option<u64>,
}

impl DesktopClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client_version: env!("CARGO_PKG_VERSION").into(),
            source: None,
            commands: CommandRegistry::new(),
            handlers: Vec::new(),
            fallback: None,
            autoconnect: true,
            proactive_seed: None,
        }
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Platform capture backend.  Without one the sampler never runs and
    /// snapshots come back empty.
    pub fn capture_source(mut self, source: Arc<dyn CaptureSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Extra remote command.  Registered after the built-ins, so a name
    /// collision replaces the built-in.
    pub fn command<T: DesktopCommand>(mut self, name: impl Into<String>, command: T) -> Self {
        self.commands.register(name, command);
        self
    }

    /// Route an inbound message type to `handler`.  Overrides the default
    /// handler for that type.
    pub fn handler(mut self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Handler for message types nothing else claims.
    pub fn fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Connect as soon as the client runs (default `true`).  When `false`
    /// the client idles in `Disconnected` until `connect()` is called.
    pub fn autoconnect(mut self, yes: bool) -> Self {
        self.autoconnect = yes;
        self
    }

    /// Deterministic proactive draws.
    pub fn proactive_seed(mut self, seed: u64) -> Self {
        self.proactive_seed = Some(seed);
        self
    }

    /// Validate the configuration and wire the components together.
    pub fn build(self) -> Result<DesktopClient, ClientError> {
        let problems: Vec<String> = self
            .config
            .validate()
            .into_iter()
            .filter_map(|issue| match issue.severity {
                ConfigSeverity::Error => Some(issue.to_string()),
                ConfigSeverity::Warning => {
                    tracing::warn!(field = %issue.field, "{}", issue.message);
                    None
                }
            })
            .collect();
        if !problems.is_empty() {
            return Err(ClientError::Config(problems.join("; ")));
        }

        let config = self.config;
        let state = Arc::new(StateCell::new());

        let bridge = MessageBridge::new(BridgeSettings::from_config(&config), state.watch());
        bridge.set_session_id(config.session_id.clone());
        for (kind, handler) in self.handlers {
            bridge.register_handler(kind, handler);
        }
        if let Some(fallback) = self.fallback {
            bridge.set_fallback(fallback);
        }

        let has_source = self.source.is_some();
        let source = self.source.unwrap_or_else(|| Arc::new(NoCapture));
        let sampler_settings = SamplerSettings::from(&config.monitor);
        let sampler = StateSampler::new(source, sampler_settings.clone(), bridge.clone());

        let proactive_settings = ProactiveSettings::from(&config.proactive);
        let proactive = match self.proactive_seed {
            Some(seed) => ProactiveTrigger::with_seed(
                proactive_settings,
                sampler.clone(),
                bridge.clone(),
                seed,
            ),
            None => ProactiveTrigger::new(proactive_settings, sampler.clone(), bridge.clone()),
        };

        let mut registry = CommandRegistry::new();
        registry
            .register("screenshot", ScreenshotCommand::new(sampler.clone()))
            .register("capture_state", CaptureStateCommand::new(sampler.clone()));
        for name in self.commands.names() {
            if let Some(command) = self.commands.get(&name) {
                registry.register_boxed(name, command);
            }
        }
        let capabilities = registry.names();

        let commands_cancel = CancellationToken::new();
        let router = CommandRouter::new(
            registry,
            config.bridge.max_concurrent_commands,
            commands_cancel.clone(),
        );
        bridge.register_handler(MessageType::Command, Arc::new(router));

        let control = SupervisorControl::new(self.autoconnect);
        let supervisor = Supervisor::new(
            SupervisorSettings::from_config(&config, &self.client_version),
            state.clone(),
            bridge.clone(),
            control.clone(),
            capabilities,
        )?;

        Ok(DesktopClient {
            monitor_enabled: config.monitor.enabled && has_source,
            sampler_settings,
            state,
            bridge,
            sampler,
            proactive,
            control,
            reconnects: supervisor.reconnect_counter(),
            supervisor,
            commands_cancel,
        })
    }
}
