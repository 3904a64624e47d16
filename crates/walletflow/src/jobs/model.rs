use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Init,
    Accepted,
    Error,
    NoAvailableWorkers,
    Complete,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Init,
        JobState::Accepted,
        JobState::Error,
        JobState::NoAvailableWorkers,
        JobState::Complete,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Init => "INIT",
            JobState::Accepted => "ACCEPTED",
            JobState::Error => "ERROR",
            JobState::NoAvailableWorkers => "NO_AVAILABLE_WORKERS",
            JobState::Complete => "COMPLETE",
            JobState::Failed => "FAILED",
        }
    }

    /// Terminal states are never picked up by the scheduler again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0:?}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub state: JobState,
    pub exec_count: i32,
    pub payload: Value,

    pub error: Option<String>,
    pub result: Option<String>,
    pub transaction_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh job in `INIT` with a new id. Timestamps are placeholders
    /// until the store writes the row.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            state: JobState::Init,
            exec_count: 0,
            payload,
            error: None,
            result: None,
            transaction_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl<'r> FromRow<'r, PgRow> for Job {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = state.parse().map_err(|e| sqlx::Error::ColumnDecode {
            index: "state".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            state,
            exec_count: row.try_get("exec_count")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            result: row.try_get("result")?,
            transaction_id: row.try_get("transaction_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One row of the per-state aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusQuery {
    pub state: JobState,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: i64,
    pub offset: i64,
}

impl ListOptions {
    pub const MAX_LIMIT: i64 = 500;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    pub(crate) fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
            offset: self.offset.max(0),
        }
    }
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_text_round_trips_for_every_variant() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = "RUNNING".parse::<JobState>().unwrap_err();
        assert_eq!(err, UnknownJobState("RUNNING".into()));
    }

    #[test]
    fn only_complete_and_failed_are_terminal() {
        let terminal: Vec<_> = JobState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![JobState::Complete, JobState::Failed]);
    }

    #[test]
    fn list_options_are_clamped() {
        assert_eq!(ListOptions::new(0, -5).clamped(), ListOptions::new(1, 0));
        assert_eq!(ListOptions::new(10_000, 3).clamped(), ListOptions::new(500, 3));
    }

    #[test]
    fn new_job_starts_in_init() {
        let job = Job::new("transfer", serde_json::json!({"amount": "1.0"}));
        assert_eq!(job.state, JobState::Init);
        assert_eq!(job.exec_count, 0);
        assert!(job.error.is_none());
    }
}
