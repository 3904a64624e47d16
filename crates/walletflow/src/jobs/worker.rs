use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::error::JobStoreError;
use crate::jobs::handlers::{HandlerRegistry, JobContext};
use crate::jobs::model::{Job, JobState, ListOptions};
use crate::jobs::repo::JobsRepo;
use crate::system::MaintenanceMode;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub accepted_grace_period: Duration,
    pub reschedulable_grace_period: Duration,
    /// Executions allowed before a retryable error becomes FAILED.
    pub max_exec_count: i32,
    pub schedule_interval: Duration,
    /// Upper bound of the random delay added to each scheduling sleep so
    /// replicas started together do not poll in lockstep.
    pub schedule_jitter: Duration,
    pub schedule_page_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            worker_count: 4,
            queue_capacity: 64,
            accepted_grace_period: Duration::from_secs(180),
            reschedulable_grace_period: Duration::from_secs(600),
            max_exec_count: 10,
            schedule_interval: Duration::from_secs(10),
            schedule_jitter: Duration::from_millis(500),
            schedule_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another worker owns the job right now.
    Skipped,
    Complete,
    /// Retryable failure; the scheduler picks it up after the cooldown.
    Errored,
    Failed,
}

/// Where a job ended up after a hand-off attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Channel full; the row now waits out the reschedulable grace period.
    NoAvailableWorkers,
    /// Channel full, but the row had already moved on (accepted or
    /// finished elsewhere), so it was left alone.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub dispatched: usize,
    pub no_available_workers: usize,
}

/// Scheduler plus a fixed set of workers fed through one bounded channel.
///
/// New jobs go straight to the channel via [`WorkerPool::add_job`]; the
/// periodic sweep only recovers stalled claims and retries. Clones share the
/// channel, so a clone can keep adding jobs while another runs the pool.
#[derive(Clone)]
pub struct WorkerPool {
    jobs: JobsRepo,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    maintenance: Option<Arc<dyn MaintenanceMode>>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl WorkerPool {
    pub fn new(jobs: JobsRepo, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            jobs,
            registry,
            config,
            maintenance: None,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn with_maintenance(mut self, maintenance: Arc<dyn MaintenanceMode>) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    async fn in_maintenance(&self) -> bool {
        match &self.maintenance {
            Some(m) => m.is_maintenance_mode().await,
            None => false,
        }
    }

    /// Store a new job and hand it to the workers right away.
    pub async fn add_job(&self, job_type: &str, payload: Value) -> Result<Job, JobStoreError> {
        let job = self.jobs.enqueue(job_type, payload).await?;
        let dispatch = self.dispatch(job.clone()).await?;
        debug!(job_id = %job.id, job_type, ?dispatch, "job added");
        Ok(job)
    }

    /// Offer `job` to the worker channel without waiting. A full channel
    /// parks the row in NO_AVAILABLE_WORKERS, unless the row changed since
    /// `job` was read.
    pub async fn dispatch(&self, job: Job) -> Result<Dispatch, JobStoreError> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(Dispatch::Queued),
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => {
                if self.jobs.mark_no_available_workers(&job).await? {
                    Ok(Dispatch::NoAvailableWorkers)
                } else {
                    debug!(job_id = %job.id, "job changed before it could be parked");
                    Ok(Dispatch::Stale)
                }
            }
        }
    }

    /// Claim, execute and record the outcome of one job.
    pub async fn process(&self, job: Job) -> Result<ProcessOutcome, JobStoreError> {
        let accepted = match self
            .jobs
            .accept_job(job.id, self.config.accepted_grace_period)
            .await
        {
            Ok(j) => j,
            Err(e) if e.is_contention() => {
                debug!(worker_id = %self.config.worker_id, job_id = %job.id, error = %e, "job claimed elsewhere");
                return Ok(ProcessOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        debug!(
            worker_id = %self.config.worker_id,
            job_id = %accepted.id,
            job_type = %accepted.job_type,
            exec_count = accepted.exec_count,
            "job accepted"
        );

        let ctx = JobContext {
            jobs: self.jobs.clone(),
            worker_id: self.config.worker_id.clone(),
        };

        let mut finished = accepted.clone();
        let outcome = match self.registry.execute(&accepted, &ctx).await {
            Ok(output) => {
                finished.state = JobState::Complete;
                finished.error = None;
                finished.result = output.result;
                finished.transaction_id = output.transaction_id;
                ProcessOutcome::Complete
            }
            Err(err) => {
                finished.error = Some(err.to_string());
                if err.is_retryable() && accepted.exec_count < self.config.max_exec_count {
                    finished.state = JobState::Error;
                    ProcessOutcome::Errored
                } else {
                    finished.state = JobState::Failed;
                    ProcessOutcome::Failed
                }
            }
        };

        self.jobs.update_job(&finished).await?;

        match outcome {
            ProcessOutcome::Complete => info!(
                job_id = %finished.id,
                job_type = %finished.job_type,
                "job complete"
            ),
            _ => warn!(
                job_id = %finished.id,
                job_type = %finished.job_type,
                exec_count = finished.exec_count,
                state = %finished.state,
                error = finished.error.as_deref().unwrap_or_default(),
                "job did not complete"
            ),
        }

        Ok(outcome)
    }

    /// One scheduling sweep: offer every schedulable job to the workers.
    pub async fn schedule_once(&self) -> Result<ScheduleReport, JobStoreError> {
        let mut report = ScheduleReport::default();

        if self.in_maintenance().await {
            debug!("maintenance mode, skipping schedule");
            return Ok(report);
        }

        let schedulable = self
            .jobs
            .schedulable_jobs(
                self.config.accepted_grace_period,
                self.config.reschedulable_grace_period,
                ListOptions::new(self.config.schedule_page_size, 0),
            )
            .await?;

        // A job may be sent again before a worker accepted it; the second
        // accept loses on the version check and is skipped.
        for job in schedulable {
            match self.dispatch(job).await? {
                Dispatch::Queued => report.dispatched += 1,
                Dispatch::NoAvailableWorkers => report.no_available_workers += 1,
                Dispatch::Stale => {}
            }
        }

        if report.dispatched > 0 || report.no_available_workers > 0 {
            debug!(
                dispatched = report.dispatched,
                no_available_workers = report.no_available_workers,
                "schedule sweep"
            );
        }

        Ok(report)
    }

    fn next_sleep(&self) -> Duration {
        let jitter_ms = self.config.schedule_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        self.config.schedule_interval + Duration::from_millis(jitter)
    }

    /// Run the scheduler and `worker_count` workers until `shutdown` fires.
    ///
    /// Workers finish the job in hand and exit; jobs still queued in the
    /// channel keep their row state and are picked up by a later sweep.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            job_types = ?self.registry.job_types(),
            "worker pool starting"
        );

        let mut workers = JoinSet::new();
        for n in 0..self.config.worker_count.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => None,
                        next = async { pool.receiver.lock().await.recv().await } => next,
                    };
                    let Some(job) = next else { break };
                    let job_id = job.id;
                    if let Err(e) = pool.process(job).await {
                        error!(worker = n, %job_id, error = %e, "job processing failed");
                    }
                }
            });
        }

        loop {
            if let Err(e) = self.schedule_once().await {
                error!(error = %e, "schedule sweep failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.next_sleep()) => {}
            }
        }

        info!("worker pool stopping, waiting for in-flight jobs");
        while let Some(joined) = workers.join_next().await {
            joined?;
        }

        Ok(())
    }
}
