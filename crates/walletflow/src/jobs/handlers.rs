use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio::{sync::Semaphore, time::timeout};

use crate::jobs::model::Job;
use crate::jobs::repo::JobsRepo;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn = dyn for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, Result<JobOutput, JobError>>
    + Send
    + Sync;

pub const UNKNOWN_JOB_TYPE: &str = "UNKNOWN_JOB_TYPE";
pub const BAD_PAYLOAD: &str = "BAD_PAYLOAD";
pub const TIMEOUT: &str = "TIMEOUT";

#[derive(Debug)]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Deterministic failures go straight to FAILED instead of waiting out
    /// the reschedule grace period.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.code, UNKNOWN_JOB_TYPE | BAD_PAYLOAD)
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// What a successful handler reports back onto the job row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub result: Option<String>,
    pub transaction_id: Option<String>,
}

#[derive(Clone)]
pub struct JobContext {
    pub jobs: JobsRepo,
    pub worker_id: String,
}

/// A registered handler together with its execution limits.
#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    /// Shared by every execution of this job type.
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

/// Maps a job type to the code that runs it.
///
/// Built once at startup and shared by all workers behind an `Arc`. Jobs
/// whose type has no entry fail with [`UNKNOWN_JOB_TYPE`], which is not
/// retryable.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: &str, handler: F)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, Result<JobOutput, JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    /// Register `handler` for `job_type`, replacing any earlier entry.
    ///
    /// `opts.max_concurrency` caps how many jobs of this type run at once
    /// across the pool; `opts.timeout` turns a slow run into a retryable
    /// [`TIMEOUT`] error.
    pub fn register_with_options<F>(&mut self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a Job, &'a JobContext) -> BoxFuture<'a, Result<JobOutput, JobError>>
            + Send
            + Sync
            + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the handler registered for `job.job_type`.
    pub async fn execute(&self, job: &Job, ctx: &JobContext) -> Result<JobOutput, JobError> {
        match self.handler_for(&job.job_type) {
            Some(entry) => entry.run(job, ctx).await,
            None => Err(JobError::new(
                UNKNOWN_JOB_TYPE,
                format!("no handler for job_type={}", job.job_type),
            )),
        }
    }
}

/// Per job type limits. Both default to unbounded.
#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl HandlerEntry {
    /// Wait for a concurrency permit, then run the handler under the timeout.
    pub async fn run(&self, job: &Job, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::new("WORKER_SHUTDOWN", "handler semaphore closed"))?,
            ),
            None => None,
        };

        let fut = (self.handler)(job, ctx);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(JobError::new(
                    TIMEOUT,
                    format!("handler timeout after {}ms", dur.as_millis()),
                )),
            },
            None => fut.await,
        }
    }
}

pub fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| JobError::new(BAD_PAYLOAD, e.to_string()))
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sqlx::postgres::PgPoolOptions;

    fn ctx() -> JobContext {
        // Lazy pool: never connects unless a handler touches the database.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/walletflow_unused")
            .unwrap();
        JobContext {
            jobs: JobsRepo::new(pool),
            worker_id: "test-worker".into(),
        }
    }

    #[derive(Deserialize)]
    struct TransferPayload {
        amount: String,
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("transfer", |job, _ctx| {
            boxed(async move {
                let payload: TransferPayload = parse_payload(job)?;
                Ok(JobOutput {
                    result: Some(payload.amount),
                    transaction_id: Some("0xabc".into()),
                })
            })
        });
        registry.register_with_options(
            "slow",
            |_job, _ctx| {
                boxed(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(JobOutput::default())
                })
            },
            HandlerOptions::new().timeout(Duration::from_millis(20)),
        );
        registry
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let job = Job::new("transfer", serde_json::json!({"amount": "12.5"}));
        let out = registry().execute(&job, &ctx()).await.unwrap();
        assert_eq!(out.result.as_deref(), Some("12.5"));
        assert_eq!(out.transaction_id.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn unknown_job_type_is_not_retryable() {
        let job = Job::new("mint", serde_json::json!({}));
        let err = registry().execute(&job, &ctx()).await.unwrap_err();
        assert_eq!(err.code, UNKNOWN_JOB_TYPE);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn bad_payload_is_not_retryable() {
        let job = Job::new("transfer", serde_json::json!({"amount": 3}));
        let err = registry().execute(&job, &ctx()).await.unwrap_err();
        assert_eq!(err.code, BAD_PAYLOAD);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_is_retryable() {
        let job = Job::new("slow", serde_json::json!({}));
        let err = registry().execute(&job, &ctx()).await.unwrap_err();
        assert_eq!(err.code, TIMEOUT);
        assert!(err.is_retryable());
    }

    #[test]
    fn job_types_are_sorted() {
        assert_eq!(registry().job_types(), vec!["slow", "transfer"]);
    }
}
