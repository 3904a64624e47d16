// crates/walletflow/src/jobs/repo.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::jobs::error::JobStoreError;
use crate::jobs::model::{Job, JobState, ListOptions, StatusQuery};

/// `now - grace`, saturating at the unix epoch.
pub fn grace_cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Create the row for `job`. The caller supplies the id and state;
    /// timestamps are set here.
    pub async fn insert_job(&self, job: &Job) -> Result<Job, JobStoreError> {
        let now = Utc::now();

        let stored = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, job_type, state, exec_count, payload,
                error, result, transaction_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.state.as_str())
        .bind(job.exec_count)
        .bind(&job.payload)
        .bind(&job.error)
        .bind(&job.result)
        .bind(&job.transaction_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    pub async fn enqueue(&self, job_type: &str, payload: Value) -> Result<Job, JobStoreError> {
        let job = self.insert_job(&Job::new(job_type, payload)).await?;
        tracing::debug!(job_id = %job.id, job_type, "job enqueued");
        Ok(job)
    }

    /// Overwrite the mutable columns of `job` (last writer wins).
    ///
    /// `exec_count` and `created_at` are never written here: only
    /// [`JobsRepo::accept_job`] moves the execution counter.
    pub async fn update_job(&self, job: &Job) -> Result<Job, JobStoreError> {
        let stored = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET job_type = $2,
                state = $3,
                payload = $4,
                error = $5,
                result = $6,
                transaction_id = $7,
                updated_at = $8
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.state.as_str())
        .bind(&job.payload)
        .bind(&job.error)
        .bind(&job.result)
        .bind(&job.transaction_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        stored.ok_or(JobStoreError::NotFound(job.id))
    }

    /// Move `job` to `NO_AVAILABLE_WORKERS`, but only if the row still
    /// matches the copy the caller holds (`state`, `updated_at`).
    ///
    /// Returns `false` when the row moved on in the meantime, e.g. a worker
    /// accepted or finished it, and leaves it untouched.
    pub async fn mark_no_available_workers(&self, job: &Job) -> Result<bool, JobStoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                updated_at = $3
            WHERE id = $1
              AND state = $4
              AND updated_at = $5
            "#,
        )
        .bind(job.id)
        .bind(JobState::NoAvailableWorkers.as_str())
        .bind(Utc::now())
        .bind(job.state.as_str())
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    /// Claim `job_id` for execution.
    ///
    /// The row is re-read inside the transaction. Finished jobs are never
    /// claimed again, and a claim younger than `accepted_grace_period` is
    /// still owned by someone else. Otherwise the
    /// row moves to `ACCEPTED` and `exec_count` is bumped, guarded by the
    /// `(exec_count, updated_at)` pair that was read: if another writer got
    /// there first the update matches nothing and the transaction is rolled
    /// back.
    pub async fn accept_job(
        &self,
        job_id: Uuid,
        accepted_grace_period: Duration,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if current.state.is_terminal() {
            tx.rollback().await?;
            return Err(JobStoreError::AlreadyFinished(job_id));
        }

        let now = Utc::now();
        if current.state == JobState::Accepted
            && current.updated_at > grace_cutoff(now, accepted_grace_period)
        {
            tx.rollback().await?;
            return Err(JobStoreError::AlreadyAccepted(job_id));
        }

        let accepted = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = $2,
                exec_count = exec_count + 1,
                updated_at = $3
            WHERE id = $1
              AND exec_count = $4
              AND updated_at = $5
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(JobState::Accepted.as_str())
        .bind(now)
        .bind(current.exec_count)
        .bind(current.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(accepted) = accepted else {
            tx.rollback().await?;
            return Err(JobStoreError::ConcurrencyConflict(job_id));
        };

        tx.commit().await?;
        Ok(accepted)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, JobStoreError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    /// Jobs ordered newest-created first.
    pub async fn list_jobs(&self, opts: ListOptions) -> Result<Vec<Job>, JobStoreError> {
        let opts = opts.clamped();

        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(opts.limit)
        .bind(opts.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Jobs the scheduler may hand to a worker.
    ///
    /// - INIT/ACCEPTED untouched for longer than `accepted_grace_period`
    ///   (never started, or the claim expired without an outcome)
    /// - ERROR/NO_AVAILABLE_WORKERS untouched for longer than
    ///   `reschedulable_grace_period` (retry after cooldown)
    pub async fn schedulable_jobs(
        &self,
        accepted_grace_period: Duration,
        reschedulable_grace_period: Duration,
        opts: ListOptions,
    ) -> Result<Vec<Job>, JobStoreError> {
        let opts = opts.clamped();
        let now = Utc::now();

        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE (state IN ('INIT', 'ACCEPTED') AND updated_at < $1)
               OR (state IN ('ERROR', 'NO_AVAILABLE_WORKERS') AND updated_at < $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(grace_cutoff(now, accepted_grace_period))
        .bind(grace_cutoff(now, reschedulable_grace_period))
        .bind(opts.limit)
        .bind(opts.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Job count per state.
    pub async fn status(&self) -> Result<Vec<StatusQuery>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count
            FROM jobs
            GROUP BY state
            ORDER BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StatusQuery, JobStoreError> {
                let state: String = row.try_get("state")?;
                let state = state.parse::<JobState>().map_err(|e| {
                    sqlx::Error::ColumnDecode {
                        index: "state".to_string(),
                        source: Box::new(e),
                    }
                })?;
                Ok(StatusQuery {
                    state,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }
}
