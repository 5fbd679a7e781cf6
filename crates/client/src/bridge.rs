//! Message bridge: the single path for outbound envelopes and the router
//! for inbound ones.
//!
//! Outbound traffic is serialized through one async mutex that owns both
//! the pending queue and the writer channel of the live connection.  A
//! send either lands on the writer (and from there on the socket, in call
//! order) or in the pending queue, which is flushed in submission order
//! when the next connection attaches.  While the queue is non-empty a
//! connected send drains it into the writer before its own frame.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dl_domain::config::Config;
use dl_protocol::{Envelope, MessageType};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::handler::{HandlerRegistry, MessageHandler};
use crate::queue::{Enqueued, PendingQueue};
use crate::state::{ConnectionState, StateCell};
use crate::types::{BridgeError, ProtocolError, SendError};
use crate::ui::{AckLogger, ChatForwarder, ErrorForwarder, OpaqueForwarder, UiEvent};

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub pending_capacity: usize,
    /// Bound on handing one frame to the writer.
    pub send_timeout: Duration,
    /// Inbound frames above this size are protocol errors.
    pub max_frame_bytes: usize,
    /// Protocol errors inside `protocol_error_window` that force a reconnect.
    pub protocol_error_threshold: usize,
    pub protocol_error_window: Duration,
    pub ui_buffer: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pending_capacity: config.bridge.pending_capacity,
            send_timeout: Duration::from_millis(config.server.send_timeout_ms),
            max_frame_bytes: config.server.max_frame_bytes,
            protocol_error_threshold: config.bridge.protocol_error_threshold.max(1),
            protocol_error_window: config.bridge.protocol_error_window(),
            ui_buffer: 256,
        }
    }
}

/// Where an accepted envelope went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the live connection's writer.
    Sent,
    /// Held in the pending queue until the next connection.
    Queued,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub sent: u64,
    pub queued: u64,
    /// Envelopes evicted from or rejected by the pending queue.
    pub dropped: u64,
    pub protocol_errors: u64,
}

struct Outbox {
    pending: PendingQueue,
    writer: Option<mpsc::Sender<String>>,
}

enum FlushStop {
    Timeout,
    Closed,
}

/// Sliding window of recent protocol error timestamps.
struct ErrorWindow {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl ErrorWindow {
    fn record(&mut self, now: Instant) -> usize {
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.push_back(now);
        self.hits.len()
    }
}

struct Inner {
    settings: BridgeSettings,
    outbox: tokio::sync::Mutex<Outbox>,
    state: watch::Receiver<ConnectionState>,
    handlers: RwLock<HandlerRegistry>,
    ui: broadcast::Sender<UiEvent>,
    errors: Mutex<ErrorWindow>,
    session_id: RwLock<Option<String>>,
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Clone)]
pub struct MessageBridge {
    inner: Arc<Inner>,
}

impl MessageBridge {
    /// Create a bridge that follows the given connection state.
    pub fn new(settings: BridgeSettings, state: watch::Receiver<ConnectionState>) -> Self {
        let mut handlers = HandlerRegistry::new(Arc::new(OpaqueForwarder));
        handlers
            .register(MessageType::Chat, Arc::new(ChatForwarder))
            .register(MessageType::Error, Arc::new(ErrorForwarder))
            .register(MessageType::Ack, Arc::new(AckLogger))
            .register(MessageType::HeartbeatAck, Arc::new(AckLogger));

        let (ui, _) = broadcast::channel(settings.ui_buffer.max(1));
        let errors = ErrorWindow {
            window: settings.protocol_error_window,
            hits: VecDeque::new(),
        };
        Self {
            inner: Arc::new(Inner {
                outbox: tokio::sync::Mutex::new(Outbox {
                    pending: PendingQueue::new(settings.pending_capacity),
                    writer: None,
                }),
                settings,
                state,
                handlers: RwLock::new(handlers),
                ui,
                errors: Mutex::new(errors),
                session_id: RwLock::new(None),
                sent: AtomicU64::new(0),
                queued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                protocol_errors: AtomicU64::new(0),
            }),
        }
    }

    /// A bridge with no connection behind it; every send queues.
    pub fn offline(pending_capacity: usize) -> Self {
        let state = StateCell::new();
        Self::new(
            BridgeSettings {
                pending_capacity,
                ..Default::default()
            },
            state.watch(),
        )
    }

    // ── Outbound ────────────────────────────────────────────────────

    pub async fn send(
        &self,
        kind: MessageType,
        data: serde_json::Value,
    ) -> Result<Delivery, BridgeError> {
        self.send_envelope(Envelope::new(kind, data)).await
    }

    pub async fn send_payload<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
    ) -> Result<Delivery, BridgeError> {
        self.send_envelope(Envelope::from_payload(kind, payload)?).await
    }

    /// Deliver or queue one envelope.
    ///
    /// Transient types (heartbeats, handshake frames) are never queued and
    /// fail with [`SendError::NotConnected`] while offline.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<Delivery, BridgeError> {
        let frame = envelope.encode()?;
        let mut outbox = self.inner.outbox.lock().await;

        if self.is_connected() {
            if let Some(writer) = outbox.writer.clone() {
                // Anything left behind by an earlier timeout goes out first.
                let drained = match self.flush_backlog(&mut outbox, &writer).await {
                    Ok(_) => true,
                    Err(FlushStop::Closed) => {
                        tracing::debug!(kind = %envelope.kind, "writer gone, queueing");
                        outbox.writer = None;
                        false
                    }
                    Err(FlushStop::Timeout) => {
                        tracing::warn!(kind = %envelope.kind, "backlog still stuck, queueing");
                        false
                    }
                };
                if drained {
                    match tokio::time::timeout(self.inner.settings.send_timeout, writer.send(frame))
                        .await
                    {
                        Ok(Ok(())) => {
                            self.inner.sent.fetch_add(1, Ordering::Relaxed);
                            return Ok(Delivery::Sent);
                        }
                        Ok(Err(_)) => {
                            tracing::debug!(kind = %envelope.kind, "writer gone, queueing");
                            outbox.writer = None;
                        }
                        Err(_) => {
                            tracing::warn!(kind = %envelope.kind, "send timed out, queueing");
                        }
                    }
                }
            }
        }

        let kind = envelope.kind.clone();
        match outbox.pending.push(envelope) {
            Ok(Enqueued::Queued) => {
                self.inner.queued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(kind = %kind, pending = outbox.pending.len(), "envelope queued");
                Ok(Delivery::Queued)
            }
            Ok(Enqueued::Evicted(old)) => {
                self.inner.queued.fetch_add(1, Ordering::Relaxed);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = %kind,
                    evicted = %old.kind,
                    "pending queue full, evicted oldest entry"
                );
                Ok(Delivery::Queued)
            }
            Err(e @ SendError::NotConnected(_)) => Err(e.into()),
            Err(e) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %kind, "pending queue full, rejecting envelope");
                Err(e.into())
            }
        }
    }

    /// Bind a fresh connection's writer and flush the pending queue into it,
    /// oldest first.  Sends issued meanwhile wait on the outbox lock, so
    /// they land after the backlog.
    pub async fn attach(&self, writer: mpsc::Sender<String>) -> Result<usize, SendError> {
        let mut outbox = self.inner.outbox.lock().await;
        let flushed = self
            .flush_backlog(&mut outbox, &writer)
            .await
            .map_err(|_| SendError::Timeout)?;
        outbox.writer = Some(writer);
        if flushed > 0 {
            tracing::info!(flushed, "pending queue flushed");
        }
        Ok(flushed)
    }

    /// Move the pending queue into `writer`, oldest first.  On failure the
    /// unsent remainder goes back to the front of the queue.
    async fn flush_backlog(
        &self,
        outbox: &mut Outbox,
        writer: &mpsc::Sender<String>,
    ) -> Result<usize, FlushStop> {
        if outbox.pending.is_empty() {
            return Ok(0);
        }
        let backlog = outbox.pending.drain();
        let mut flushed = 0usize;
        let mut iter = backlog.into_iter();

        while let Some(envelope) = iter.next() {
            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(kind = %envelope.kind, error = %e, "dropping unencodable envelope");
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let sent =
                tokio::time::timeout(self.inner.settings.send_timeout, writer.send(frame)).await;
            let stop = match sent {
                Ok(Ok(())) => {
                    flushed += 1;
                    self.inner.sent.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Err(_)) => FlushStop::Closed,
                Err(_) => FlushStop::Timeout,
            };
            let mut rest = vec![envelope];
            rest.extend(iter);
            tracing::warn!(flushed, remaining = rest.len(), "flush interrupted, keeping backlog");
            outbox.pending.restore(rest);
            return Err(stop);
        }
        Ok(flushed)
    }

    /// Unbind the writer; subsequent sends queue.
    pub async fn detach(&self) {
        self.inner.outbox.lock().await.writer = None;
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.outbox.lock().await.pending.len()
    }

    /// Snapshot of the pending queue, oldest first.
    pub async fn pending(&self) -> Vec<Envelope> {
        self.inner.outbox.lock().await.pending.iter().cloned().collect()
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Decode one inbound text frame and route it.
    ///
    /// Bad frames are counted in a sliding window; once the window holds
    /// `protocol_error_threshold` errors this returns
    /// [`ProtocolError::ThresholdExceeded`] and the caller is expected to
    /// drop the connection.
    pub async fn dispatch(&self, raw: &str) -> Result<(), ProtocolError> {
        let max = self.inner.settings.max_frame_bytes;
        if raw.len() > max {
            return self.protocol_error(ProtocolError::Oversized {
                size: raw.len(),
                max,
            });
        }
        match Envelope::decode(raw) {
            Ok(envelope) => {
                self.route(envelope).await;
                Ok(())
            }
            Err(e) => self.protocol_error(e.into()),
        }
    }

    /// Invoke the handler registered for the envelope's type (or the fallback).
    pub async fn route(&self, envelope: Envelope) {
        let kind = envelope.kind.clone();
        let handler = self.inner.handlers.read().resolve(&kind);
        let outcome = AssertUnwindSafe(handler.handle(self, envelope))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(kind = %kind, "message handler panicked");
        }
    }

    fn protocol_error(&self, err: ProtocolError) -> Result<(), ProtocolError> {
        self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
        let threshold = self.inner.settings.protocol_error_threshold;
        let window = self.inner.settings.protocol_error_window;

        let count = {
            let mut errors = self.inner.errors.lock();
            let count = errors.record(Instant::now());
            if count >= threshold {
                errors.hits.clear();
            }
            count
        };

        tracing::warn!(error = %err, count, threshold, "discarding bad inbound frame");
        if count >= threshold {
            self.emit(UiEvent::ProtocolError(format!(
                "{count} bad frames within {}s",
                window.as_secs()
            )));
            return Err(ProtocolError::ThresholdExceeded { count, window });
        }
        Err(err)
    }

    pub fn register_handler(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().register(kind, handler);
    }

    pub fn set_fallback(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().set_fallback(handler);
    }

    // ── Shared state ────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn emit(&self, event: UiEvent) {
        // No subscribers is fine.
        let _ = self.inner.ui.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.inner.ui.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    pub fn set_session_id(&self, id: Option<String>) {
        *self.inner.session_id.write() = id;
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            queued: self.inner.queued.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            protocol_errors: self.inner.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionState::*;
    use serde_json::json;

    fn connected_bridge(settings: BridgeSettings) -> (MessageBridge, StateCell) {
        let cell = StateCell::new();
        cell.transition(Connecting);
        cell.transition(Connected);
        (MessageBridge::new(settings, cell.watch()), cell)
    }

    fn texts(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| Envelope::decode(f).unwrap().data["text"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn offline_sends_are_queued() {
        let bridge = MessageBridge::offline(8);
        let d = bridge
            .send(MessageType::Chat, json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Queued);
        assert_eq!(bridge.pending_len().await, 1);
        assert_eq!(bridge.stats().queued, 1);
    }

    #[tokio::test]
    async fn heartbeat_is_never_queued() {
        let bridge = MessageBridge::offline(8);
        let err = bridge
            .send(MessageType::Heartbeat, json!({"timestamp": 1}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Send(SendError::NotConnected(MessageType::Heartbeat))
        ));
        assert_eq!(bridge.pending_len().await, 0);
    }

    #[tokio::test]
    async fn attach_flushes_backlog_before_new_sends() {
        let (bridge, cell) = connected_bridge(BridgeSettings::default());
        cell.transition(Reconnecting);

        for text in ["a", "b", "c"] {
            bridge
                .send(MessageType::Chat, json!({"text": text}))
                .await
                .unwrap();
        }

        cell.transition(Connecting);
        cell.transition(Connected);
        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(bridge.attach(tx).await.unwrap(), 3);

        let d = bridge
            .send(MessageType::Chat, json!({"text": "d"}))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Sent);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(texts(&frames), vec!["a", "b", "c", "d"]);
        assert_eq!(bridge.pending_len().await, 0);
        assert_eq!(bridge.stats().sent, 4);
    }

    #[tokio::test]
    async fn closed_writer_falls_back_to_queue() {
        let (bridge, _cell) = connected_bridge(BridgeSettings::default());
        let (tx, rx) = mpsc::channel(4);
        bridge.attach(tx).await.unwrap();
        drop(rx);

        let d = bridge
            .send(MessageType::Chat, json!({"text": "late"}))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Queued);
        assert_eq!(bridge.pending_len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_send_keeps_submission_order() {
        let (bridge, _cell) = connected_bridge(BridgeSettings {
            send_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(1);
        bridge.attach(tx).await.unwrap();

        let send = |text: &'static str| {
            let bridge = bridge.clone();
            async move {
                bridge
                    .send(MessageType::Chat, json!({"text": text}))
                    .await
                    .unwrap()
            }
        };

        assert_eq!(send("a").await, Delivery::Sent);
        // Writer is full and nobody reads it.
        assert_eq!(send("b").await, Delivery::Queued);

        let mut frames = vec![rx.recv().await.unwrap()];
        // "b" must be drained ahead of "c"; "c" then waits behind it.
        assert_eq!(send("c").await, Delivery::Queued);
        frames.push(rx.recv().await.unwrap());
        assert_eq!(texts(&frames), vec!["a", "b"]);
        assert_eq!(bridge.pending_len().await, 1);

        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(bridge.attach(tx).await.unwrap(), 1);
        assert_eq!(send("d").await, Delivery::Sent);
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(texts(&frames), vec!["a", "b", "c", "d"]);
        assert_eq!(bridge.pending_len().await, 0);
    }

    #[tokio::test]
    async fn writer_ignored_unless_connected() {
        let (bridge, cell) = connected_bridge(BridgeSettings::default());
        let (tx, mut rx) = mpsc::channel(4);
        bridge.attach(tx).await.unwrap();
        cell.transition(Reconnecting);

        let d = bridge
            .send(MessageType::Chat, json!({"text": "x"}))
            .await
            .unwrap();
        assert_eq!(d, Delivery::Queued);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_of_states_rejects_chat() {
        let bridge = MessageBridge::offline(2);
        for seq in 0..2 {
            bridge
                .send(MessageType::DesktopState, json!({"seq": seq}))
                .await
                .unwrap();
        }
        let err = bridge
            .send(MessageType::Chat, json!({"text": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Send(SendError::QueueFull(_))));
        assert_eq!(bridge.stats().dropped, 1);
    }

    #[tokio::test]
    async fn unknown_type_reaches_fallback() {
        let bridge = MessageBridge::offline(2);
        let mut events = bridge.subscribe();
        bridge
            .dispatch(r#"{"type":"screen_annotation","data":{"x":1}}"#)
            .await
            .unwrap();
        match events.try_recv().unwrap() {
            UiEvent::Opaque(env) => assert_eq!(env.kind.as_str(), "screen_annotation"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_errors_past_threshold_force_reconnect() {
        let settings = BridgeSettings {
            protocol_error_threshold: 3,
            protocol_error_window: Duration::from_secs(10),
            ..Default::default()
        };
        let (bridge, _cell) = connected_bridge(settings);

        assert!(matches!(
            bridge.dispatch("not json").await,
            Err(ProtocolError::Codec(_))
        ));
        assert!(matches!(
            bridge.dispatch("{}").await,
            Err(ProtocolError::Codec(_))
        ));
        assert!(matches!(
            bridge.dispatch("[1,2]").await,
            Err(ProtocolError::ThresholdExceeded { count: 3, .. })
        ));
        assert_eq!(bridge.stats().protocol_errors, 3);

        // The window restarts after tripping.
        assert!(matches!(
            bridge.dispatch("???").await,
            Err(ProtocolError::Codec(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sparse_protocol_errors_age_out() {
        let settings = BridgeSettings {
            protocol_error_threshold: 2,
            protocol_error_window: Duration::from_secs(5),
            ..Default::default()
        };
        let (bridge, _cell) = connected_bridge(settings);

        for _ in 0..4 {
            assert!(matches!(
                bridge.dispatch("garbage").await,
                Err(ProtocolError::Codec(_))
            ));
            tokio::time::advance(Duration::from_secs(6)).await;
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_a_protocol_error() {
        let settings = BridgeSettings {
            max_frame_bytes: 16,
            ..Default::default()
        };
        let (bridge, _cell) = connected_bridge(settings);
        let err = bridge
            .dispatch(r#"{"type":"chat","data":{"text":"far too long"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { max: 16, .. }));
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl MessageHandler for Panicky {
        async fn handle(&self, _bridge: &MessageBridge, _envelope: Envelope) {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let bridge = MessageBridge::offline(2);
        bridge.register_handler(MessageType::Ack, Arc::new(Panicky));
        bridge.dispatch(r#"{"type":"ack"}"#).await.unwrap();
        bridge.dispatch(r#"{"type":"ack"}"#).await.unwrap();
    }
}
