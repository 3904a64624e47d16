pub mod chain_events;
pub mod config;
pub mod db;
pub mod jobs;
pub mod system;
pub mod telemetry;
