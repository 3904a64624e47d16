use async_trait::async_trait;

use crate::chain_events::error::ChainError;
use crate::chain_events::event::BlockEvents;

/// The part of a chain access node the listener needs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Height of the latest sealed block.
    async fn latest_block_height(&self) -> Result<u64, ChainError>;

    /// Events of `event_type` in blocks `start..=end`.
    async fn events_for_height_range(
        &self,
        event_type: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<BlockEvents>, ChainError>;
}

/// Source of the event types to poll for, consulted once per tick.
#[async_trait]
pub trait EventTypeProvider: Send + Sync {
    async fn event_types(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticEventTypes(pub Vec<String>);

impl StaticEventTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(types.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl EventTypeProvider for StaticEventTypes {
    async fn event_types(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}
