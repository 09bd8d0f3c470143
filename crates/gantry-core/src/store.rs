//! Store-facing contract: lease jobs, persist outcomes, advertise workers.
//!
//! The worker drives; the store owns every durable mutation and all graph
//! accounting. The worker only ever sees leaf [`JobDescription`] records:
//! sequences and sets exist purely on the store side.

use chrono::{DateTime, Utc};
use uuid::Uuid;

mod tmp {
    use super::{GraphNode, JobDescription, WorkerHeartbeat};
    use crate::JobResult;
    use uuid::Uuid;

    /// Durable queue of jobs with lease, heartbeat, and dependency
    /// accounting.
    ///
    /// A handed-out record is exclusively owned by the worker until
    /// `release_job` is called; the store reclaims abandoned leases on its
    /// own schedule.
    #[trait_variant::make(Store: Send)]
    pub trait LocalStore {
        type Error: std::error::Error + Send + 'static;

        /// Lease the next ready leaf (`due_time` reached, dependencies
        /// satisfied), or `None` when nothing is ready.
        #[allow(unused)]
        async fn acquire_job(&self) -> Result<Option<JobDescription>, Self::Error>;

        /// Apply a result to a leased job and re-evaluate its dependents.
        #[allow(unused)]
        async fn release_job(&self, job_id: Uuid, result: JobResult) -> Result<(), Self::Error>;

        /// Record that this worker is alive so dead workers can be expired.
        #[allow(unused)]
        async fn heartbeat(&self, beat: WorkerHeartbeat) -> Result<(), Self::Error>;

        /// Add a graph of work. Used by schedulers, not by the worker loops.
        #[allow(unused)]
        async fn enqueue(&self, node: GraphNode) -> Result<(), Self::Error>;
    }
}

pub use tmp::Store;

#[derive(Debug, Clone, PartialEq)]
/// Leaf job record handed out under lease.
pub struct JobDescription {
    pub id: Uuid,
    /// Symbolic type resolved through the registry.
    pub job_type: String,
    /// Serialized input, if the job takes one.
    pub input: Option<serde_json::Value>,
    /// Earliest instant the job may run; the store never hands a record out
    /// before this.
    pub due_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a worker advertises about itself, keyed by `machine_name`.
pub struct WorkerHeartbeat {
    pub machine_name: String,
    pub parallelism: usize,
    pub polling_frequency: std::time::Duration,
    pub heartbeat_frequency: std::time::Duration,
}

#[derive(Debug, Clone)]
/// Leaf job to schedule. The id is minted at construction so the caller
/// holds the logical identity before the store ever sees it; reschedules
/// keep that identity.
pub struct JobSpec {
    pub id: Uuid,
    pub job_type: String,
    pub input: Option<serde_json::Value>,
    /// Earliest run instant; `None` means "as soon as possible".
    pub due_time: Option<DateTime<Utc>>,
    /// Executions the store may grant before an error becomes terminal.
    pub max_attempts: u16,
}

impl JobSpec {
    pub const DEFAULT_MAX_ATTEMPTS: u16 = 1;

    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            input: None,
            due_time: None,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Clone)]
/// Unit of scheduling: a leaf, an ordered chain, or an unordered set.
pub enum GraphNode {
    Single(JobSpec),
    /// Child `i + 1` becomes ready only once child `i` has finished.
    Sequence(Vec<GraphNode>),
    /// All children are ready concurrently; the set completes when every
    /// child has finished.
    Set(Vec<GraphNode>),
}

impl GraphNode {
    pub fn single(spec: JobSpec) -> Self {
        GraphNode::Single(spec)
    }

    pub fn sequence(nodes: impl IntoIterator<Item = GraphNode>) -> Self {
        GraphNode::Sequence(nodes.into_iter().collect())
    }

    pub fn set(nodes: impl IntoIterator<Item = GraphNode>) -> Self {
        GraphNode::Set(nodes.into_iter().collect())
    }
}

impl From<JobSpec> for GraphNode {
    fn from(spec: JobSpec) -> Self {
        GraphNode::Single(spec)
    }
}
