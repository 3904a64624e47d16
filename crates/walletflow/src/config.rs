use std::time::Duration;

use crate::chain_events::ListenerConfig;
use crate::jobs::WorkerConfig;

// Config is the single place runtime settings are read from the environment.
// Every value has a WALLETFLOW_ prefixed name and an unprefixed fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub migrate_on_startup: bool,
    pub log_json: bool,

    pub worker_count: usize,
    pub worker_queue_capacity: usize,
    pub accepted_grace_period: Duration,
    pub reschedulable_grace_period: Duration,
    pub max_exec_count: i32,
    pub schedule_interval: Duration,

    pub events_interval: Duration,
    pub events_max_blocks: u64,
    pub events_starting_height: u64,
    pub events_rpc_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("WALLETFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let migrate_on_startup = env_bool("WALLETFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);
        let log_json = env_bool("WALLETFLOW_LOG_JSON").unwrap_or(false);

        let worker_count = env_parse("WALLETFLOW_WORKER_COUNT", "WORKER_COUNT")?
            .unwrap_or(4usize)
            .max(1);
        let worker_queue_capacity =
            env_parse("WALLETFLOW_WORKER_QUEUE_CAPACITY", "WORKER_QUEUE_CAPACITY")?
                .unwrap_or(64usize)
                .max(1);

        let accepted_grace_period = Duration::from_secs(
            env_parse("WALLETFLOW_ACCEPTED_GRACE_SECS", "ACCEPTED_GRACE_SECS")?.unwrap_or(180),
        );
        let reschedulable_grace_period = Duration::from_secs(
            env_parse("WALLETFLOW_RESCHEDULABLE_GRACE_SECS", "RESCHEDULABLE_GRACE_SECS")?
                .unwrap_or(600),
        );
        let max_exec_count =
            env_parse("WALLETFLOW_MAX_EXEC_COUNT", "MAX_EXEC_COUNT")?.unwrap_or(10i32);
        let schedule_interval = Duration::from_millis(
            env_parse("WALLETFLOW_SCHEDULE_INTERVAL_MS", "SCHEDULE_INTERVAL_MS")?
                .unwrap_or(10_000u64)
                .max(10),
        );

        let events_interval = Duration::from_millis(
            env_parse("WALLETFLOW_EVENTS_INTERVAL_MS", "EVENTS_INTERVAL_MS")?
                .unwrap_or(10_000u64)
                .max(10),
        );
        let events_max_blocks =
            env_parse("WALLETFLOW_EVENTS_MAX_BLOCKS", "EVENTS_MAX_BLOCKS")?.unwrap_or(100u64);
        let events_starting_height =
            env_parse("WALLETFLOW_EVENTS_STARTING_HEIGHT", "EVENTS_STARTING_HEIGHT")?
                .unwrap_or(0u64);
        let events_rpc_timeout =
            env_parse("WALLETFLOW_EVENTS_RPC_TIMEOUT_SECS", "EVENTS_RPC_TIMEOUT_SECS")?
                .unwrap_or(30u64);
        let events_rpc_timeout = (events_rpc_timeout > 0).then(|| Duration::from_secs(events_rpc_timeout));

        Ok(Self {
            database_url,
            worker_id,
            migrate_on_startup,
            log_json,
            worker_count,
            worker_queue_capacity,
            accepted_grace_period,
            reschedulable_grace_period,
            max_exec_count,
            schedule_interval,
            events_interval,
            events_max_blocks,
            events_starting_height,
            events_rpc_timeout,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone(),
            worker_count: self.worker_count,
            queue_capacity: self.worker_queue_capacity,
            accepted_grace_period: self.accepted_grace_period,
            reschedulable_grace_period: self.reschedulable_grace_period,
            max_exec_count: self.max_exec_count,
            schedule_interval: self.schedule_interval,
            ..WorkerConfig::default()
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            interval: self.events_interval,
            max_blocks: self.events_max_blocks,
            starting_height: self.events_starting_height,
            rpc_timeout: self.events_rpc_timeout,
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T>(primary: &str, fallback: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_or_fallback(primary, fallback) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{primary}={raw:?} is invalid: {e}")),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
