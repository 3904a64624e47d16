//! The polling loop.
//!
//! # Tick
//! 1. Skip entirely while maintenance mode is on.
//! 2. Lock the status row (`FOR UPDATE NOWAIT`). If a peer holds it, skip.
//! 3. Ask the node for its latest height; if the cursor is behind, fetch
//!    events of every configured type for at most `max_blocks` heights past
//!    the cursor, publish them in fetch order and move the cursor to the end
//!    of the window.
//! 4. Commit. Any failure rolls back, so the same window is retried on the
//!    next tick (events may be redelivered, never skipped).

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain_events::client::{ChainClient, EventTypeProvider};
use crate::chain_events::error::{ChainError, ListenerError};
use crate::chain_events::status::ListenerStatusRepo;
use crate::chain_events::subscribers::Subscribers;
use crate::system::MaintenanceMode;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub interval: Duration,
    /// Most heights handled in one tick.
    pub max_blocks: u64,
    /// First height to fetch on a fresh install; 0 means "start at the
    /// chain's current height".
    pub starting_height: u64,
    pub rpc_timeout: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_blocks: 100,
            starting_height: 0,
            rpc_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Maintenance,
    /// Another instance holds the status row this round.
    PeerHoldsLock,
    UpToDate { height: u64 },
    Advanced { from: u64, to: u64, events: usize },
    /// Storage reported lock contention mid-tick; cursor unchanged.
    Contended,
}

/// The inclusive height range to handle next, or `None` when the cursor has
/// caught up with `latest`. The window never spans more than `max_blocks`
/// heights.
pub fn catch_up_window(cursor: u64, latest: u64, max_blocks: u64) -> Option<(u64, u64)> {
    if latest <= cursor {
        return None;
    }
    let start = cursor + 1;
    let end = latest.min(start.saturating_add(max_blocks.max(1) - 1));
    Some((start, end))
}

#[derive(Clone)]
struct ListenerCore {
    config: ListenerConfig,
    client: Arc<dyn ChainClient>,
    status: ListenerStatusRepo,
    event_types: Arc<dyn EventTypeProvider>,
    subscribers: Arc<Subscribers>,
    maintenance: Option<Arc<dyn MaintenanceMode>>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Listener {
    core: Arc<ListenerCore>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        client: Arc<dyn ChainClient>,
        status: ListenerStatusRepo,
        event_types: Arc<dyn EventTypeProvider>,
        subscribers: Arc<Subscribers>,
    ) -> Self {
        Self {
            core: Arc::new(ListenerCore {
                config,
                client,
                status,
                event_types,
                subscribers,
                maintenance: None,
            }),
            running: Mutex::new(None),
        }
    }

    /// Skip ticks while `maintenance` reports maintenance mode. Call before
    /// [`Listener::start`].
    pub fn with_maintenance(self, maintenance: Arc<dyn MaintenanceMode>) -> Self {
        let mut core = ListenerCore::clone(&self.core);
        core.maintenance = Some(maintenance);
        Self {
            core: Arc::new(core),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.core.config
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Initialise the cursor, then poll every `interval` until stopped.
    /// Calling it on a running listener does nothing.
    pub async fn start(&self) -> Result<(), ListenerError> {
        if self.is_running() {
            return Ok(());
        }

        match self.core.init_height().await {
            Ok(height) => info!(latest_height = height, "listener cursor initialised"),
            // A peer is initialising right now.
            Err(ListenerError::Locked) => debug!("listener status locked by peer during init"),
            Err(e) => return Err(e),
        }

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.core.clone(), cancel.clone()));
        *running = Some(Running { cancel, task });

        info!(
            interval_ms = self.core.config.interval.as_millis() as u64,
            max_blocks = self.core.config.max_blocks,
            "chain event listener started"
        );
        Ok(())
    }

    /// Signal the loop to exit and return immediately. A tick in progress
    /// finishes (or is abandoned at its next RPC call) and its transaction
    /// is closed before the loop exits.
    pub fn stop(&self) {
        if let Some(running) = self.take_running() {
            info!("stopping chain event listener");
            running.cancel.cancel();
        }
    }

    /// Like [`Listener::stop`], but waits for the loop task to finish.
    pub async fn stop_and_wait(&self) {
        if let Some(running) = self.take_running() {
            info!("stopping chain event listener");
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!(error = %e, "chain event listener task ended abnormally");
            }
        }
    }

    /// Lock the cursor and fast-forward it to the configured starting height,
    /// or to the chain head on a fresh install.
    pub async fn init_height(&self) -> Result<u64, ListenerError> {
        self.core.init_height().await
    }

    /// Run one tick now, outside the timer.
    pub async fn poll_once(&self) -> Result<TickOutcome, ListenerError> {
        self.core.tick(&CancellationToken::new()).await
    }

    fn take_running(&self) -> Option<Running> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.take_running() {
            running.cancel.cancel();
        }
    }
}

async fn run_loop(core: Arc<ListenerCore>, cancel: CancellationToken) {
    let interval = core.config.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match core.tick(&cancel).await {
                Ok(outcome) => debug!(?outcome, "listener tick"),
                Err(ListenerError::Cancelled) => break,
                Err(e) => core.handle_error(&e),
            },
        }
    }

    info!("chain event listener stopped");
}

impl ListenerCore {
    async fn in_maintenance(&self) -> bool {
        match &self.maintenance {
            Some(m) => m.is_maintenance_mode().await,
            None => false,
        }
    }

    /// Await a chain call, bounded by the configured timeout and by `cancel`.
    async fn rpc<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, ChainError>>,
    ) -> Result<T, ListenerError> {
        let bounded = async {
            match self.config.rpc_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(res) => res,
                    Err(_) => Err(ChainError::Timeout(limit)),
                },
                None => call.await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ListenerError::Cancelled),
            res = bounded => res.map_err(ListenerError::from),
        }
    }

    async fn init_height(&self) -> Result<u64, ListenerError> {
        let mut locked = self.status.lock().await?;

        let starting_height = self.config.starting_height;
        if starting_height > 0 && locked.latest_height() < starting_height - 1 {
            locked.set_latest_height(starting_height - 1);
        }

        // Nothing below the current network epoch can be fetched, so a fresh
        // install starts from the head.
        if locked.latest_height() == 0 {
            let latest = self
                .rpc(&CancellationToken::new(), self.client.latest_block_height())
                .await?;
            locked.set_latest_height(latest);
        }

        let status = locked.commit().await?;
        Ok(status.latest_height)
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome, ListenerError> {
        if self.in_maintenance().await {
            return Ok(TickOutcome::Maintenance);
        }

        let mut locked = match self.status.lock().await {
            Ok(locked) => locked,
            Err(ListenerError::Locked) => return Ok(TickOutcome::PeerHoldsLock),
            Err(e) => return Err(e),
        };

        let cursor = locked.latest_height();
        let latest = self
            .rpc(cancel, self.client.latest_block_height())
            .await?;

        let Some((start, end)) = catch_up_window(cursor, latest, self.config.max_blocks) else {
            locked.rollback().await?;
            return Ok(TickOutcome::UpToDate { height: cursor });
        };

        match self.fetch_and_dispatch(cancel, start, end).await {
            Ok(events) => {
                locked.set_latest_height(end);
                locked.commit().await?;
                info!(from = start, to = end, events, "chain events processed");
                Ok(TickOutcome::Advanced {
                    from: start,
                    to: end,
                    events,
                })
            }
            Err(e) if e.is_transient_lock() => {
                debug!(error = %e, from = start, to = end, "storage busy, retrying next tick");
                drop(locked);
                Ok(TickOutcome::Contended)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_and_dispatch(
        &self,
        cancel: &CancellationToken,
        start: u64,
        end: u64,
    ) -> Result<usize, ListenerError> {
        let event_types = self
            .event_types
            .event_types()
            .await
            .map_err(ListenerError::EventTypes)?;

        let mut events = Vec::new();
        for event_type in &event_types {
            let blocks = self
                .rpc(
                    cancel,
                    self.client.events_for_height_range(event_type, start, end),
                )
                .await?;
            events.extend(blocks.into_iter().flat_map(|block| block.events));
        }

        for event in &events {
            self.subscribers.publish(event).await?;
        }

        Ok(events.len())
    }

    fn handle_error(&self, err: &ListenerError) {
        error!(error = %err, "chain event listener tick failed");
        if err.is_data_unavailable() {
            warn!(
                starting_height = self.config.starting_height,
                "chain data is not available at this height, set the starting height manually \
                 (WALLETFLOW_EVENTS_STARTING_HEIGHT or `walletctl set-cursor`)"
            );
        }
    }
}
