//! Error types for chain event polling.

use std::time::Duration;

use thiserror::Error;

use crate::db;

/// Errors reported by a [`ChainClient`](crate::chain_events::ChainClient).
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain rpc error: {0}")]
    Rpc(String),

    /// The node has no data at this height (pruned, or before the
    /// current network epoch).
    #[error("chain data unavailable at height {height}: {message}")]
    DataUnavailable { height: u64, message: String },

    #[error("chain rpc timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    /// Another instance holds the status row. Not a failure: that
    /// instance is handling this round.
    #[error("listener status is locked by another instance")]
    Locked,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("could not resolve event types: {0:#}")]
    EventTypes(#[source] anyhow::Error),

    #[error("event subscriber failed on {event_type}: {source:#}")]
    Subscriber {
        event_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("height {0} does not fit the status column")]
    HeightOutOfRange(u64),

    #[error("listener stopped")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ListenerError {
    pub fn is_locked(&self) -> bool {
        matches!(self, ListenerError::Locked)
    }

    /// Storage reported row contention while fetching or dispatching.
    /// The tick is skipped and retried on the next one.
    pub fn is_transient_lock(&self) -> bool {
        match self {
            ListenerError::Database(e) => db::is_lock_contention(e),
            ListenerError::Subscriber { source, .. } => {
                source
                    .chain()
                    .any(|cause| match cause.downcast_ref::<sqlx::Error>() {
                        Some(e) => db::is_lock_contention(e),
                        None => false,
                    })
                    // Subscribers may write to their own store, e.g. SQLite.
                    || format!("{source:#}").contains("database is locked")
            }
            _ => false,
        }
    }

    /// The node lacks history for the requested range.
    pub fn is_data_unavailable(&self) -> bool {
        match self {
            ListenerError::Chain(ChainError::DataUnavailable { .. }) => true,
            other => other.to_string().contains("key not found"),
        }
    }
}
