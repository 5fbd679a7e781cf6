//! Reconnection supervisor: owns the connection lifecycle.
//!
//! One task drives [`ConnectionState`] through connect, handshake, the
//! message loop, and jittered back-off.  It is the only writer of the
//! state; the bridge, sampler and UI observe it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dl_domain::config::Config;
use dl_protocol::{Envelope, HeartbeatPayload, HelloPayload, MessageType, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::bridge::MessageBridge;
use crate::http::HttpChannel;
use crate::reconnect::{BackoffState, ReconnectBackoff};
use crate::state::{ConnectionState, StateCell};
use crate::transport::{self, Session, Timeouts};
use crate::types::{ClientError, ConnectError, ProtocolError};
use crate::ui::UiEvent;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Streaming endpoint without query parameters.
    pub stream_url: String,
    pub http_base: String,
    pub token: Option<String>,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_version: String,
    pub backoff: ReconnectBackoff,
    pub max_auth_failures: u32,
    pub timeouts: Timeouts,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No inbound traffic for this long drops the connection.
    pub heartbeat_timeout: Duration,
    pub outbound_buffer: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config, client_version: &str) -> Self {
        let server = &config.server;
        Self {
            stream_url: server.stream_url(),
            http_base: server.http_base().to_string(),
            token: server.resolve_token(),
            username: server.username.clone(),
            password: server.password.clone(),
            client_id: server
                .client_id
                .clone()
                .unwrap_or_else(|| format!("desklink-{}", uuid::Uuid::new_v4().simple())),
            client_version: client_version.to_string(),
            backoff: ReconnectBackoff::from(&config.reconnect),
            max_auth_failures: config.reconnect.max_auth_failures.max(1),
            timeouts: Timeouts {
                connect: Duration::from_millis(server.connect_timeout_ms),
                handshake: Duration::from_millis(server.handshake_timeout_ms),
            },
            request_timeout: Duration::from_millis(server.request_timeout_ms),
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs.max(1)),
            outbound_buffer: config.bridge.outbound_buffer.max(1),
        }
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// What the application has asked for.  `epoch` bumps on every `connect()`
/// so a request made while `Failed` is distinguishable from the one that
/// led there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intent {
    pub connect: bool,
    pub epoch: u64,
}

/// Application-side control of the supervisor.
#[derive(Clone)]
pub struct SupervisorControl {
    intent: Arc<watch::Sender<Intent>>,
}

impl SupervisorControl {
    pub fn new(autoconnect: bool) -> Self {
        let initial = Intent {
            connect: autoconnect,
            epoch: u64::from(autoconnect),
        };
        let (tx, _) = watch::channel(initial);
        Self {
            intent: Arc::new(tx),
        }
    }

    /// Request a connection.  Leaves `Failed` or `Disconnected`; a no-op
    /// while already connected or retrying.
    pub fn connect(&self) {
        self.intent.send_modify(|i| {
            i.connect = true;
            i.epoch += 1;
        });
    }

    /// Request a graceful close.  Idempotent.
    pub fn close(&self) {
        self.intent.send_if_modified(|i| std::mem::replace(&mut i.connect, false));
    }

    fn subscribe(&self) -> watch::Receiver<Intent> {
        self.intent.subscribe()
    }
}

enum CycleEnd {
    Closed,
    Shutdown,
    Failed(String),
}

enum SessionEnd {
    Closed,
    Shutdown,
    Lost(String),
}

async fn close_requested(mut intent: watch::Receiver<Intent>) {
    let _ = intent.wait_for(|i| !i.connect).await;
}

pub struct Supervisor {
    settings: SupervisorSettings,
    state: Arc<StateCell>,
    bridge: MessageBridge,
    control: SupervisorControl,
    http: Option<HttpChannel>,
    capabilities: Vec<String>,
    login_token: Option<String>,
    connected_once: bool,
    served_epoch: u64,
    reconnects: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        state: Arc<StateCell>,
        bridge: MessageBridge,
        control: SupervisorControl,
        capabilities: Vec<String>,
    ) -> Result<Self, ClientError> {
        let http = if settings.token.is_none() && settings.has_credentials() {
            Some(HttpChannel::new(&settings.http_base, settings.request_timeout)?)
        } else {
            None
        };
        Ok(Self {
            settings,
            state,
            bridge,
            control,
            http,
            capabilities,
            login_token: None,
            connected_once: false,
            served_epoch: 0,
            reconnects: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shared counter of successful reconnects (connections after the first).
    pub fn reconnect_counter(&self) -> Arc<AtomicU64> {
        self.reconnects.clone()
    }

    /// Drive the lifecycle until `shutdown` is cancelled.
    ///
    /// Between connection cycles (after `close()` or in `Failed`) the
    /// supervisor idles until the next `connect()`.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let mut intent = self.control.subscribe();
        loop {
            // Idle until a fresh connect request arrives.
            let epoch = loop {
                let current = *intent.borrow_and_update();
                if current.connect && current.epoch != self.served_epoch {
                    break current.epoch;
                }
                if !current.connect {
                    self.state.transition(ConnectionState::Disconnected);
                }
                let changed = tokio::select! {
                    r = intent.changed() => r.is_ok(),
                    _ = shutdown.cancelled() => false,
                };
                if !changed {
                    self.state.transition(ConnectionState::Disconnected);
                    return Err(ClientError::Shutdown);
                }
            };
            self.served_epoch = epoch;

            let end = self.cycle(&shutdown).await;
            // Requests made while the cycle ran are already served.
            self.served_epoch = intent.borrow_and_update().epoch;
            match end {
                CycleEnd::Closed => {
                    self.state.transition(ConnectionState::Disconnected);
                    tracing::info!("connection closed");
                }
                CycleEnd::Shutdown => {
                    self.state.transition(ConnectionState::Disconnected);
                    tracing::info!("shutdown requested");
                    return Err(ClientError::Shutdown);
                }
                CycleEnd::Failed(reason) => {
                    self.state.transition(ConnectionState::Failed);
                    tracing::error!(reason = %reason, "giving up until connect is requested again");
                }
            }
        }
    }

    /// One run of connect / session / back-off, until closed or given up.
    async fn cycle(&mut self, shutdown: &CancellationToken) -> CycleEnd {
        self.state.transition(ConnectionState::Connecting);
        let mut backoff = BackoffState::new(self.settings.backoff.clone());
        let mut failures: u32 = 0;
        let mut auth_failures: u32 = 0;

        loop {
            let closed = close_requested(self.control.subscribe());
            let attempt = tokio::select! {
                r = self.attempt() => r,
                _ = closed => return CycleEnd::Closed,
                _ = shutdown.cancelled() => return CycleEnd::Shutdown,
            };

            match attempt {
                Ok(session) => {
                    self.state.transition(ConnectionState::Connected);
                    backoff.reset();
                    failures = 0;
                    auth_failures = 0;
                    if self.connected_once {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    self.connected_once = true;

                    match self.run_session(session, shutdown).await {
                        SessionEnd::Closed => return CycleEnd::Closed,
                        SessionEnd::Shutdown => return CycleEnd::Shutdown,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "connection lost");
                        }
                    }
                }
                Err(ConnectError::AuthRejected(reason)) => {
                    failures += 1;
                    auth_failures += 1;
                    self.login_token = None;
                    tracing::warn!(reason = %reason, auth_failures, "authentication rejected");
                    if auth_failures >= self.settings.max_auth_failures {
                        self.state.transition(ConnectionState::Reconnecting);
                        self.bridge.emit(UiEvent::AuthRequired(reason.clone()));
                        return CycleEnd::Failed(format!("authentication rejected: {reason}"));
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "connection attempt failed");
                }
            }

            self.state.transition(ConnectionState::Reconnecting);
            if self.settings.backoff.should_give_up(failures) {
                return CycleEnd::Failed(format!("{failures} consecutive failed attempts"));
            }

            let delay = backoff.next_delay();
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = close_requested(self.control.subscribe()) => return CycleEnd::Closed,
                _ = shutdown.cancelled() => return CycleEnd::Shutdown,
            }
            self.state.transition(ConnectionState::Connecting);
        }
    }

    async fn attempt(&mut self) -> Result<Session, ConnectError> {
        let token = self.token().await?;
        let session_id = self.bridge.session_id();
        let url = transport::build_url(
            &self.settings.stream_url,
            token.as_deref(),
            session_id.as_deref(),
            &self.settings.client_id,
        );
        let hello = Envelope::from_payload(
            MessageType::Hello,
            &HelloPayload {
                protocol_version: PROTOCOL_VERSION,
                session_id,
                client_id: self.settings.client_id.clone(),
                client_version: self.settings.client_version.clone(),
                resumed: self.connected_once,
                capabilities: self.capabilities.clone(),
            },
        )
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        tracing::info!(
            url = %self.settings.stream_url,
            client_id = %self.settings.client_id,
            resumed = self.connected_once,
            "connecting"
        );
        let session = transport::connect(&url, &hello, self.settings.timeouts).await?;
        if let Some(id) = session.welcome.session_id.clone().filter(|s| !s.is_empty()) {
            self.bridge.set_session_id(Some(id));
        }
        Ok(session)
    }

    /// Configured token, else a cached or fresh login token, else none.
    async fn token(&mut self) -> Result<Option<String>, ConnectError> {
        if let Some(token) = &self.settings.token {
            return Ok(Some(token.clone()));
        }
        if let Some(token) = &self.login_token {
            return Ok(Some(token.clone()));
        }
        let Some(http) = &self.http else {
            return Ok(None);
        };
        let token = http
            .login(&self.settings.username, &self.settings.password)
            .await?;
        self.login_token = Some(token.clone());
        Ok(Some(token))
    }

    async fn run_session(&mut self, session: Session, shutdown: &CancellationToken) -> SessionEnd {
        let Session { welcome, ws } = session;
        let heartbeat_every = welcome
            .heartbeat_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.heartbeat_interval);
        tracing::info!(
            server_version = %welcome.server_version,
            session_id = welcome.session_id.as_deref().unwrap_or(""),
            heartbeat_secs = heartbeat_every.as_secs(),
            "connected"
        );

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<String>(self.settings.outbound_buffer);

        // The only code that writes to the socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::debug!(error = %e, "socket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let heartbeat = tokio::spawn(heartbeat_loop(tx.clone(), heartbeat_every));

        let end = match self.bridge.attach(tx).await {
            Err(e) => SessionEnd::Lost(format!("flushing pending queue: {e}")),
            Ok(_) => self.read_loop(&mut stream, shutdown).await,
        };

        self.bridge.detach().await;
        heartbeat.abort();
        match end {
            SessionEnd::Lost(_) => writer.abort(),
            // Let the writer drain and send a close frame.
            _ => {
                if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
                    tracing::debug!("writer did not finish in time");
                }
            }
        }
        end
    }

    async fn read_loop<S>(&self, stream: &mut S, shutdown: &CancellationToken) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let timeout = self.settings.heartbeat_timeout;
        let mut liveness = tokio::time::interval((timeout / 4).max(Duration::from_millis(100)));
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if let Err(ProtocolError::ThresholdExceeded { count, window }) =
                            self.bridge.dispatch(&text).await
                        {
                            return SessionEnd::Lost(format!(
                                "{count} protocol errors within {}s",
                                window.as_secs()
                            ));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("closed by server".into());
                    }
                    Some(Ok(_)) => last_inbound = Instant::now(),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                },
                _ = liveness.tick() => {
                    if last_inbound.elapsed() > timeout {
                        return SessionEnd::Lost(format!(
                            "no traffic for {}s",
                            timeout.as_secs()
                        ));
                    }
                }
                _ = close_requested(self.control.subscribe()) => return SessionEnd::Closed,
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
            }
        }
    }
}

/// Periodic `heartbeat` frames, straight to the writer and never queued.
async fn heartbeat_loop(tx: mpsc::Sender<String>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let beat = HeartbeatPayload {
            timestamp: Utc::now().timestamp_millis(),
        };
        let frame = match Envelope::from_payload(MessageType::Heartbeat, &beat).and_then(|e| e.encode()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode heartbeat");
                continue;
            }
        };
        if tx.send(frame).await.is_err() {
            break;
        }
    }
}
