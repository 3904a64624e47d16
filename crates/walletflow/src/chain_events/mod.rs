//! Chain event polling.
//!
//! A [`Listener`] keeps a single cursor (`chain_events_status.latest_height`)
//! and on every tick fetches the events of the configured types for the
//! blocks past it, publishes them to [`Subscribers`] and moves the cursor.
//! The read-fetch-advance cycle happens under a row lock, so any number of
//! replicas can run a listener against the same database and each block
//! range is handled by exactly one of them.

pub mod client;
pub mod error;
pub mod event;
pub mod listener;
pub mod status;
pub mod subscribers;

pub use client::{ChainClient, EventTypeProvider, StaticEventTypes};
pub use error::{ChainError, ListenerError};
pub use event::{BlockEvents, Event};
pub use listener::{catch_up_window, Listener, ListenerConfig, TickOutcome};
pub use status::{ListenerStatus, ListenerStatusRepo, LockedStatus};
pub use subscribers::{EventHandler, Subscribers};
