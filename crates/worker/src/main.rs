use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use walletflow::config;
use walletflow::db;
use walletflow::jobs::{JobsRepo, WorkerPool};
use walletflow::system::SystemRepo;
use walletflow::telemetry;

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init(cfg.log_json);

    tracing::info!(
        worker_id = %cfg.worker_id,
        worker_count = cfg.worker_count,
        queue_capacity = cfg.worker_queue_capacity,
        accepted_grace_secs = cfg.accepted_grace_period.as_secs(),
        reschedulable_grace_secs = cfg.reschedulable_grace_period.as_secs(),
        max_exec_count = cfg.max_exec_count,
        schedule_interval_ms = cfg.schedule_interval.as_millis() as u64,
        migrate_on_startup = cfg.migrate_on_startup,
        "walletflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs_repo = JobsRepo::new(pool.clone());
    let system_repo = SystemRepo::new(pool.clone());

    let worker_pool = WorkerPool::new(jobs_repo, build_registry(), cfg.worker_config())
        .with_maintenance(Arc::new(system_repo));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "could not listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    worker_pool.run(shutdown).await?;

    tracing::info!("walletflow worker stopped");
    Ok(())
}
