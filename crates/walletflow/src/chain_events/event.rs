use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chain event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Fully qualified event type, e.g. `A.0ae53cb6e3f42a79.FlowToken.TokensDeposited`.
    pub event_type: String,
    pub block_height: u64,
    pub transaction_id: String,
    pub transaction_index: u32,
    pub event_index: u32,
    pub payload: Value,
}

/// Events of one block, as returned by a range query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvents {
    pub block_id: String,
    pub block_height: u64,
    pub events: Vec<Event>,
}
