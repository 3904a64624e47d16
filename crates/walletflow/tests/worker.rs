mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{insert_job, set_updated_at_age, setup_db};

use serial_test::serial;
use tokio_util::sync::CancellationToken;
use walletflow::jobs::handlers::{boxed, parse_payload};
use walletflow::jobs::{
    Dispatch, HandlerRegistry, JobError, JobOutput, JobState, JobsRepo, ProcessOutcome,
    WorkerConfig, WorkerPool,
};
use walletflow::system::MaintenanceFlag;

#[derive(serde::Deserialize)]
struct Transfer {
    to: String,
}

fn registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("transfer", |job, _ctx| {
        boxed(async move {
            let payload: Transfer = parse_payload(job)?;
            Ok(JobOutput {
                result: Some(format!("sent to {}", payload.to)),
                transaction_id: Some("0xabc".into()),
            })
        })
    });
    registry.register("flaky", |_job, _ctx| {
        boxed(async move { Err(JobError::new("RPC_UNAVAILABLE", "node unreachable")) })
    });
    Arc::new(registry)
}

fn config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "worker-test".into(),
        worker_count: 1,
        queue_capacity: 1,
        accepted_grace_period: Duration::ZERO,
        schedule_interval: Duration::from_millis(50),
        schedule_jitter: Duration::ZERO,
        ..WorkerConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn successful_handler_completes_the_job() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(repo.clone(), registry(), config());

    let job = repo
        .enqueue("transfer", serde_json::json!({"to": "0x01"}))
        .await
        .unwrap();

    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Complete);

    let stored = repo.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.exec_count, 1);
    assert_eq!(stored.result.as_deref(), Some("sent to 0x01"));
    assert_eq!(stored.transaction_id.as_deref(), Some("0xabc"));
    assert!(stored.error.is_none());
}

#[tokio::test]
#[serial]
async fn retryable_error_is_rescheduled_until_the_budget_runs_out() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(
        repo.clone(),
        registry(),
        WorkerConfig {
            max_exec_count: 2,
            ..config()
        },
    );

    let job = insert_job(&repo, "flaky").await;

    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Errored);
    let stored = repo.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Error);
    assert_eq!(
        stored.error.as_deref(),
        Some("RPC_UNAVAILABLE: node unreachable")
    );

    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Failed);
    let stored = repo.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.exec_count, 2);
}

#[tokio::test]
#[serial]
async fn unknown_job_type_fails_immediately() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(repo.clone(), registry(), config());

    let job = insert_job(&repo, "mint").await;
    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Failed);
    assert_eq!(repo.get_job(job.id).await.unwrap().state, JobState::Failed);
}

#[tokio::test]
#[serial]
async fn job_claimed_elsewhere_is_skipped() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(
        repo.clone(),
        registry(),
        WorkerConfig {
            accepted_grace_period: Duration::from_secs(180),
            ..config()
        },
    );

    let job = insert_job(&repo, "transfer").await;
    repo.accept_job(job.id, Duration::from_secs(180)).await.unwrap();

    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Skipped);
    let stored = repo.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Accepted);
    assert_eq!(stored.exec_count, 1);
}

#[tokio::test]
#[serial]
async fn full_channel_marks_jobs_no_available_workers() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(repo.clone(), registry(), config());

    for _ in 0..3 {
        insert_job(&repo, "transfer").await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Nobody drains the capacity-1 channel.
    let report = worker.schedule_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.no_available_workers, 2);

    let status = repo.status().await.unwrap();
    let count_of = |state| {
        status
            .iter()
            .find(|s| s.state == state)
            .map(|s| s.count)
            .unwrap_or(0)
    };
    assert_eq!(count_of(JobState::NoAvailableWorkers), 2);
    assert_eq!(count_of(JobState::Init), 1);
}

#[tokio::test]
#[serial]
async fn full_channel_never_resets_a_job_finished_meanwhile() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(repo.clone(), registry(), config());

    let job = repo
        .enqueue("transfer", serde_json::json!({"to": "0x03"}))
        .await
        .unwrap();
    // The copy a scheduler sweep would hold while another worker runs the job.
    let stale = job.clone();
    assert_eq!(worker.process(job.clone()).await.unwrap(), ProcessOutcome::Complete);

    let filler = insert_job(&repo, "transfer").await;
    assert_eq!(worker.dispatch(filler).await.unwrap(), Dispatch::Queued);
    assert_eq!(worker.dispatch(stale).await.unwrap(), Dispatch::Stale);

    let stored = repo.get_job(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.exec_count, 1);
    assert_eq!(stored.transaction_id.as_deref(), Some("0xabc"));
    assert_eq!(stored.result.as_deref(), Some("sent to 0x03"));
}

#[tokio::test]
#[serial]
async fn parking_requires_an_unchanged_row() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);

    let job = insert_job(&repo, "transfer").await;
    let accepted = repo.accept_job(job.id, Duration::from_secs(180)).await.unwrap();

    assert!(!repo.mark_no_available_workers(&job).await.unwrap());
    assert_eq!(repo.get_job(job.id).await.unwrap().state, JobState::Accepted);

    assert!(repo.mark_no_available_workers(&accepted).await.unwrap());
    let parked = repo.get_job(job.id).await.unwrap();
    assert_eq!(parked.state, JobState::NoAvailableWorkers);
    assert_eq!(parked.exec_count, 1);
}

#[tokio::test]
#[serial]
async fn maintenance_mode_pauses_scheduling() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let flag = MaintenanceFlag::new(true);
    let worker =
        WorkerPool::new(repo.clone(), registry(), config()).with_maintenance(Arc::new(flag.clone()));

    insert_job(&repo, "transfer").await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = worker.schedule_once().await.unwrap();
    assert_eq!(report.dispatched, 0);

    flag.set(false);
    let report = worker.schedule_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
#[serial]
async fn added_jobs_run_without_waiting_for_a_sweep() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let worker = WorkerPool::new(
        repo.clone(),
        registry(),
        WorkerConfig {
            accepted_grace_period: Duration::from_secs(180),
            schedule_interval: Duration::from_secs(3600),
            ..config()
        },
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(shutdown.clone()));

    let job = worker
        .add_job("transfer", serde_json::json!({"to": "0x02"}))
        .await
        .unwrap();

    let mut state = JobState::Init;
    for _ in 0..100 {
        state = repo.get_job(job.id).await.unwrap().state;
        if state == JobState::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, JobState::Complete);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
#[serial]
async fn sweep_recovers_stalled_jobs() {
    let Some(pool) = setup_db().await else { return };
    let repo = JobsRepo::new(pool);
    let grace = Duration::from_secs(180);
    let worker = WorkerPool::new(
        repo.clone(),
        registry(),
        WorkerConfig {
            accepted_grace_period: grace,
            ..config()
        },
    );

    // Claimed by a worker that died before recording an outcome.
    let job = repo
        .enqueue("transfer", serde_json::json!({"to": "0x04"}))
        .await
        .unwrap();
    repo.accept_job(job.id, grace).await.unwrap();
    set_updated_at_age(repo.pool(), job.id, grace + Duration::from_secs(1)).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let mut stored = repo.get_job(job.id).await.unwrap();
    for _ in 0..100 {
        stored = repo.get_job(job.id).await.unwrap();
        if stored.state == JobState::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.exec_count, 2);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();
}
