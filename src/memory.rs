//! In-memory reference store with dependency-graph accounting.
//!
//! One mutex around the whole state keeps lease handout atomic: a job is
//! never leased to two workers. Graphs are flattened at enqueue time into
//! leaf records plus wait-sets; the worker loops only ever see ready
//! leaves.

use chrono::{DateTime, Utc};
use gantry_core::{
    Clock, GraphNode, JobDescription, JobResult, JobSpec, JobState, Store, WallClock,
    WorkerHeartbeat,
};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Contract violations a mis-behaving worker can commit against the store.
pub enum ErrorKind {
    /// The released id was never enqueued here.
    UnknownJob,
    /// The job exists but this release does not hold its lease.
    NotLeased,
}

#[derive(Debug)]
pub struct MemoryError {
    kind: ErrorKind,
    job_id: Uuid,
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ErrorKind::UnknownJob => write!(f, "job {} is not queued here", self.job_id),
            ErrorKind::NotLeased => write!(f, "job {} was released without a lease", self.job_id),
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Leased { until: DateTime<Utc> },
    Finished,
    Failed,
}

#[derive(Debug)]
struct JobRecord {
    job_type: String,
    input: Option<serde_json::Value>,
    due_time: DateTime<Utc>,
    /// Leaf ids that must finish before this one becomes ready.
    waiting_on: HashSet<Uuid>,
    phase: Phase,
    attempts: u16,
    max_attempts: u16,
    /// Insertion order, the tie-break between equally due jobs.
    seq: u64,
    last_result: Option<JobResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Last advertised state of a worker, plus how often it has reported.
pub struct WorkerRecord {
    pub parallelism: usize,
    pub polling_frequency: std::time::Duration,
    pub heartbeat_frequency: std::time::Duration,
    pub last_seen: DateTime<Utc>,
    pub beats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Externally visible lifecycle of a queued leaf.
pub enum JobPhase {
    Pending,
    Leased,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
/// Snapshot of one leaf for tests and operators.
pub struct JobStatus {
    pub phase: JobPhase,
    pub due_time: DateTime<Utc>,
    pub waiting_on: usize,
    pub attempts: u16,
    pub last_result: Option<JobResult>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, JobRecord>,
    /// Reverse dependency index: finished-id to the leaves waiting on it.
    dependents: HashMap<Uuid, Vec<Uuid>>,
    workers: HashMap<String, WorkerRecord>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
/// Reference [`Store`]: complete graph protocol, no durability.
///
/// Leases expire after [`lease_time`](MemoryStore::lease_time); an expired
/// lease is reclaimed on the next acquire so a crashed worker's jobs are
/// handed out again.
pub struct MemoryStore<C = WallClock> {
    inner: std::sync::Arc<std::sync::Mutex<Inner>>,
    clock: C,
    lease_time: std::time::Duration,
}

impl MemoryStore<WallClock> {
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }
}

impl Default for MemoryStore<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MemoryStore<C>
where
    C: Clock,
{
    pub const DEFAULT_LEASE_TIME: std::time::Duration = std::time::Duration::from_secs(300);

    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(Inner::default())),
            clock,
            lease_time: Self::DEFAULT_LEASE_TIME,
        }
    }

    /// How long a handed-out job stays owned by its worker before the store
    /// takes it back.
    pub fn lease_time(mut self, lease_time: std::time::Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        let inner = self.lock();
        inner.jobs.get(&job_id).map(|job| JobStatus {
            phase: match job.phase {
                Phase::Pending => JobPhase::Pending,
                Phase::Leased { .. } => JobPhase::Leased,
                Phase::Finished => JobPhase::Finished,
                Phase::Failed => JobPhase::Failed,
            },
            due_time: job.due_time,
            waiting_on: job.waiting_on.len(),
            attempts: job.attempts,
            last_result: job.last_result.clone(),
        })
    }

    pub fn workers(&self) -> HashMap<String, WorkerRecord> {
        self.lock().workers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flatten a graph into leaf records. Returns the node's completion
    /// set: the leaf ids that must all finish for the node to count as
    /// finished. A sequence threads each child's completion set into the
    /// next child's wait-set; a set fans the incoming wait-set out to every
    /// child and unions their completion sets.
    fn insert_node(
        inner: &mut Inner,
        node: GraphNode,
        waiting_on: HashSet<Uuid>,
        now: DateTime<Utc>,
    ) -> HashSet<Uuid> {
        match node {
            GraphNode::Single(spec) => {
                let JobSpec {
                    id,
                    job_type,
                    input,
                    due_time,
                    max_attempts,
                } = spec;
                for dep in &waiting_on {
                    inner.dependents.entry(*dep).or_default().push(id);
                }
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.jobs.insert(
                    id,
                    JobRecord {
                        job_type,
                        input,
                        due_time: due_time.unwrap_or(now),
                        waiting_on,
                        phase: Phase::Pending,
                        attempts: 0,
                        max_attempts,
                        seq,
                        last_result: None,
                    },
                );
                HashSet::from([id])
            }
            GraphNode::Sequence(children) => {
                let mut completion = waiting_on;
                for child in children {
                    completion = Self::insert_node(inner, child, completion, now);
                }
                completion
            }
            GraphNode::Set(children) => {
                let mut completion = HashSet::new();
                for child in children {
                    completion.extend(Self::insert_node(inner, child, waiting_on.clone(), now));
                }
                completion
            }
        }
    }
}

impl<C> Store for MemoryStore<C>
where
    C: Clock + Sync,
{
    type Error = MemoryError;

    async fn acquire_job(&self) -> Result<Option<JobDescription>, MemoryError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        // Reclaim abandoned leases before picking, so a crashed worker's
        // jobs are eligible again.
        for job in inner.jobs.values_mut() {
            if let Phase::Leased { until } = job.phase {
                if until <= now {
                    job.phase = Phase::Pending;
                }
            }
        }

        let candidate = inner
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.phase == Phase::Pending && job.waiting_on.is_empty() && job.due_time <= now
            })
            .min_by_key(|(_, job)| (job.due_time, job.seq))
            .map(|(id, _)| *id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let lease = chrono::Duration::from_std(self.lease_time).unwrap_or(chrono::Duration::MAX);
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.phase = Phase::Leased {
            until: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        job.attempts += 1;
        Ok(Some(JobDescription {
            id,
            job_type: job.job_type.clone(),
            input: job.input.clone(),
            due_time: job.due_time,
        }))
    }

    async fn release_job(&self, job_id: Uuid, result: JobResult) -> Result<(), MemoryError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Inner {
            jobs, dependents, ..
        } = &mut *inner;

        let job = jobs.get_mut(&job_id).ok_or(MemoryError {
            kind: ErrorKind::UnknownJob,
            job_id,
        })?;
        if !matches!(job.phase, Phase::Leased { .. }) {
            return Err(MemoryError {
                kind: ErrorKind::NotLeased,
                job_id,
            });
        }

        match result.state {
            JobState::Finished => {
                job.phase = Phase::Finished;
                job.last_result = Some(result);
                for dependent in dependents.remove(&job_id).unwrap_or_default() {
                    if let Some(waiting) = jobs.get_mut(&dependent) {
                        waiting.waiting_on.remove(&job_id);
                    }
                }
            }
            JobState::Reschedule => {
                // Same logical job, new due time; the attempt budget starts
                // over for the next cycle.
                job.phase = Phase::Pending;
                job.due_time = result.due_time.unwrap_or(now);
                job.attempts = 0;
                job.last_result = Some(result);
            }
            JobState::Error => {
                if job.attempts < job.max_attempts {
                    // Re-present: the worker sees a fresh lease of the same
                    // record.
                    job.phase = Phase::Pending;
                    job.due_time = result.due_time.unwrap_or(job.due_time);
                } else {
                    // Terminal. Dependents keep waiting forever: a failed
                    // prerequisite never unblocks its sequence.
                    job.phase = Phase::Failed;
                }
                job.last_result = Some(result);
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, beat: WorkerHeartbeat) -> Result<(), MemoryError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let beats = inner
            .workers
            .get(&beat.machine_name)
            .map(|record| record.beats + 1)
            .unwrap_or(1);
        inner.workers.insert(
            beat.machine_name,
            WorkerRecord {
                parallelism: beat.parallelism,
                polling_frequency: beat.polling_frequency,
                heartbeat_frequency: beat.heartbeat_frequency,
                last_seen: now,
                beats,
            },
        );
        Ok(())
    }

    async fn enqueue(&self, node: GraphNode) -> Result<(), MemoryError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        Self::insert_node(&mut inner, node, HashSet::new(), now);
        Ok(())
    }
}
