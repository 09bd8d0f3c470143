//! Typed enqueue client.
//!
//! Thin convenience over [`Store::enqueue`]: serializes the payload and
//! builds the graph node so callers never touch `serde_json` directly.

use gantry_core::{GraphNode, JobSpec, Store};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// The store rejected the enqueue.
    Store,
    /// The payload did not serialize.
    Encode,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct Client<S> {
    store: S,
}

impl<S> Client<S>
where
    S: Store,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Enqueue one job with a serialized payload. Returns the id the store
    /// will report results under.
    pub async fn enqueue<T>(&self, job_type: &str, data: &T) -> Result<Uuid, Error>
    where
        T: Serialize,
    {
        let spec = JobSpec::new(job_type).input(serde_json::to_value(data)?);
        let id = spec.id;
        self.enqueue_graph(spec.into()).await?;
        Ok(id)
    }

    /// Enqueue a pre-built leaf, keeping its minted id.
    pub async fn enqueue_job(&self, spec: JobSpec) -> Result<Uuid, Error> {
        let id = spec.id;
        self.enqueue_graph(spec.into()).await?;
        Ok(id)
    }

    /// Enqueue a whole graph (sequences, sets, or a mix).
    pub async fn enqueue_graph(&self, node: GraphNode) -> Result<(), Error> {
        self.store.enqueue(node).await.map_err(|error| Error {
            kind: ErrorKind::Store,
            inner: Box::new(error),
        })
    }
}
