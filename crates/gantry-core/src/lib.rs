//! Core contract between a job worker and its store.

pub mod clock;
pub mod config;
mod executor;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use clock::{Clock, SimClock, WallClock};
pub use config::{ConfigError, WorkerConfig};
pub use registry::{JobRunner, Registry};
pub use store::{GraphNode, JobDescription, JobSpec, Store, WorkerHeartbeat};
pub use worker::{InlineSpawner, JobSpawner, Worker, WorkerError, WorkerWithGracefulShutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Terminal-or-retry state a job reports back to the store.
pub enum JobState {
    /// The job completed; dependents may become ready.
    Finished,
    /// Run the same logical job again at [`JobResult::due_time`].
    Reschedule,
    /// The job failed. The store decides whether it is re-presented.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
/// Outcome of one job execution, persisted by the store on release.
pub struct JobResult {
    pub state: JobState,
    /// For [`JobState::Reschedule`], the next earliest run instant. For
    /// [`JobState::Error`], the original due time so a retry policy can
    /// reattempt.
    pub due_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Free-form diagnostics (panic message, user message).
    pub status_info: Option<String>,
    /// Wall duration of the invocation, stamped by the executor.
    pub execution_time: std::time::Duration,
}

impl JobResult {
    pub fn finished() -> Self {
        Self {
            state: JobState::Finished,
            due_time: None,
            status_info: None,
            execution_time: std::time::Duration::ZERO,
        }
    }

    pub fn reschedule(due_time: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            state: JobState::Reschedule,
            due_time: Some(due_time),
            status_info: None,
            execution_time: std::time::Duration::ZERO,
        }
    }

    pub fn error(status_info: impl Into<String>) -> Self {
        Self {
            state: JobState::Error,
            due_time: None,
            status_info: Some(status_info.into()),
            execution_time: std::time::Duration::ZERO,
        }
    }
}
