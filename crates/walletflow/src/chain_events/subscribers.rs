//! In-process observers of chain events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain_events::error::ListenerError;
use crate::chain_events::event::Event;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Registry of event handlers, keyed by event type, plus handlers that see
/// every event. Built once at startup and shared read-only.
#[derive(Default, Clone)]
pub struct Subscribers {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    global: Vec<Arc<dyn EventHandler>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.by_type.entry(event_type.into()).or_default().push(handler);
    }

    pub fn subscribe_all(&mut self, handler: Arc<dyn EventHandler>) {
        self.global.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.by_type.values().all(Vec::is_empty)
    }

    /// Deliver `event` to its type handlers, then to the global ones, in
    /// registration order. Stops at the first handler error.
    pub async fn publish(&self, event: &Event) -> Result<(), ListenerError> {
        let typed = self
            .by_type
            .get(&event.event_type)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for handler in typed.iter().chain(self.global.iter()) {
            handler
                .handle(event)
                .await
                .map_err(|source| ListenerError::Subscriber {
                    event_type: event.event_type.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}
