//! Explicit job-type registry.
//!
//! Maps the symbolic `job_type` carried by a [`JobDescription`] to the code
//! that runs it. Registration happens once at startup; resolution is a pure
//! lookup, safe from any execution task. Services a job needs are captured
//! by its closure at registration time.
//!
//! [`JobDescription`]: crate::store::JobDescription

use crate::JobResult;
use serde::de::DeserializeOwned;

/// Erased job invocation.
pub type JobFuture = futures::future::BoxFuture<'static, JobResult>;

#[derive(Clone)]
/// How a registered job consumes its input. The executor dispatches on the
/// variant: untyped jobs never look at the payload, typed jobs decode it
/// first and fail the run when decoding fails.
pub enum JobRunner {
    Untyped(std::sync::Arc<dyn Fn() -> JobFuture + Send + Sync>),
    Typed(
        std::sync::Arc<
            dyn Fn(serde_json::Value) -> Result<JobFuture, serde_json::Error> + Send + Sync,
        >,
    ),
}

#[derive(Clone, Default)]
pub struct Registry {
    runners: std::collections::HashMap<String, JobRunner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that takes no input. Re-registering a name replaces
    /// the previous runner.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        use futures::FutureExt as _;
        self.runners.insert(
            job_type.into(),
            JobRunner::Untyped(std::sync::Arc::new(move || handler().boxed())),
        );
    }

    /// Register a job whose input is decoded from the stored payload. A
    /// missing payload decodes as JSON `null`.
    pub fn register_typed<T, F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        use futures::FutureExt as _;
        self.runners.insert(
            job_type.into(),
            JobRunner::Typed(std::sync::Arc::new(move |value| {
                let data = serde_json::from_value::<T>(value)?;
                Ok(handler(data).boxed())
            })),
        );
    }

    pub fn runner(&self, job_type: &str) -> Option<&JobRunner> {
        self.runners.get(job_type)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("job_types", &self.runners.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobState;

    #[tokio::test]
    async fn untyped_runner_ignores_payload() {
        let mut registry = Registry::new();
        registry.register("noop", || async { JobResult::finished() });

        let Some(JobRunner::Untyped(run)) = registry.runner("noop") else {
            panic!("expected an untyped runner");
        };
        assert_eq!(run().await.state, JobState::Finished);
    }

    #[tokio::test]
    async fn typed_runner_decodes_payload() {
        let mut registry = Registry::new();
        registry.register_typed::<u64, _, _>("double", |n| async move {
            JobResult::error(format!("doubled to {}", n * 2))
        });

        let Some(JobRunner::Typed(run)) = registry.runner("double") else {
            panic!("expected a typed runner");
        };
        let result = run(serde_json::json!(21)).expect("payload decodes").await;
        assert_eq!(result.status_info.as_deref(), Some("doubled to 42"));
    }

    #[tokio::test]
    async fn typed_runner_rejects_bad_payload() {
        let mut registry = Registry::new();
        registry.register_typed::<u64, _, _>("double", |_| async { JobResult::finished() });

        let Some(JobRunner::Typed(run)) = registry.runner("double") else {
            panic!("expected a typed runner");
        };
        assert!(run(serde_json::json!("not a number")).is_err());
    }

    #[test]
    fn unknown_type_resolves_to_none() {
        assert!(Registry::new().runner("missing").is_none());
    }
}
