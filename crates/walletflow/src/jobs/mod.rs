pub mod error;
pub mod handlers;
pub mod model;
pub mod repo;
pub mod worker;

pub use error::JobStoreError;
pub use handlers::{HandlerOptions, HandlerRegistry, JobContext, JobError, JobOutput};
pub use model::{Job, JobState, ListOptions, StatusQuery};
pub use repo::JobsRepo;
pub use worker::{Dispatch, ProcessOutcome, ScheduleReport, WorkerConfig, WorkerPool};
