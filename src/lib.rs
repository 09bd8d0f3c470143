//! Durable background-job runner.
//!
//! Jobs, sequences, and sets are enqueued against a [`Store`]; a worker
//! leases ready leaves under a bounded parallelism budget, executes them
//! through an explicit type [`Registry`], and reports results back. This
//! crate bundles the runtime-agnostic core with a Tokio [`Engine`] facade
//! and the in-memory reference store.

pub mod client;
pub mod engine;
pub mod memory;

pub use client::{Client, Error as ClientError};
pub use engine::Engine;
pub use memory::{JobPhase, JobStatus, MemoryError, MemoryStore, WorkerRecord};

pub use gantry_core::{
    Clock, ConfigError, GraphNode, InlineSpawner, JobDescription, JobResult, JobRunner, JobSpawner,
    JobSpec, JobState, Registry, SimClock, Store, TokioSpawner, WallClock, Worker, WorkerConfig,
    WorkerError, WorkerHeartbeat,
};
