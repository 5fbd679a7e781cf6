//! Inbound message routing by envelope type.

use std::collections::HashMap;
use std::sync::Arc;

use dl_protocol::{Envelope, MessageType};

use crate::bridge::MessageBridge;

/// Handles inbound envelopes of one [`MessageType`].
///
/// Handlers run inline on the read loop, one envelope at a time in arrival
/// order, so they must return promptly.  Long-running work belongs in a
/// spawned task (see [`CommandRouter`](crate::registry::CommandRouter)).
///
/// The bridge is passed in so a handler can reply.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, bridge: &MessageBridge, envelope: Envelope);
}

/// Map from message type to handler, plus a catch-all fallback for
/// types nothing has registered for.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
    fallback: Arc<dyn MessageHandler>,
}

impl HandlerRegistry {
    pub fn new(fallback: Arc<dyn MessageHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> &mut Self {
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::debug!(kind = %kind, "replaced message handler");
        }
        self
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.fallback = handler;
        self
    }

    /// Handler for `kind`, or the fallback.
    pub fn resolve(&self, kind: &MessageType) -> Arc<dyn MessageHandler> {
        self.handlers
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn contains(&self, kind: &MessageType) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered type tags (sorted).
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        kinds
    }
}
