//! Runs one leased job and maps whatever happens to a [`JobResult`].
//!
//! Invariant: every leased job produces exactly one `release_job` call, no
//! matter how resolution, decoding, or the job itself fails.

use crate::registry::{JobRunner, Registry};
use crate::store::{JobDescription, Store};
use crate::{JobResult, JobState};
use futures::FutureExt as _;

pub(crate) async fn execute_job<S>(
    store: S,
    registry: std::sync::Arc<Registry>,
    job: JobDescription,
) where
    S: Store,
{
    let started = std::time::Instant::now();
    let mut result = run_job(&registry, &job).await;
    result.execution_time = started.elapsed();
    if result.state == JobState::Error && result.due_time.is_none() {
        // Keep the original due time so a store retry policy can reattempt.
        result.due_time = Some(job.due_time);
    }

    if let Err(error) = store.release_job(job.id, result).await {
        // Not retried: the store reclaims the lease via its own deadline.
        tracing::error!(error = %error, job_id = %job.id, "failed to release job");
    }
}

async fn run_job(registry: &Registry, job: &JobDescription) -> JobResult {
    let invocation = match registry.runner(&job.job_type) {
        None => {
            return JobResult::error(format!("no job registered for type `{}`", job.job_type));
        }
        Some(JobRunner::Untyped(run)) => run(),
        Some(JobRunner::Typed(run)) => {
            let input = job.input.clone().unwrap_or(serde_json::Value::Null);
            match run(input) {
                Ok(invocation) => invocation,
                Err(error) => {
                    return JobResult::error(format!(
                        "failed to decode input for `{}`: {error}",
                        job.job_type
                    ));
                }
            }
        }
    };

    tracing::trace!(job_id = %job.id, job_type = %job.job_type, "start job");
    let result = match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(job_id = %job.id, message = %message, "job panicked");
            JobResult::error(message)
        }
    };
    tracing::trace!(job_id = %job.id, job_type = %job.job_type, "finish job");
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
