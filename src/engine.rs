//! Start/stop lifecycle over the core worker, bound to the Tokio runtime.
//!
//! The worker future itself is runtime-agnostic; this facade owns spawning
//! it, signalling shutdown, and waiting for the drain.

use gantry_core::{
    Clock, ConfigError, Registry, Store, TokioSpawner, WallClock, Worker, WorkerConfig,
    WorkerError,
};

/// Handle to a running worker: heartbeat loop plus dispatch loop sharing
/// one shutdown signal.
#[derive(Debug)]
pub struct Engine {
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    worker: Option<tokio::task::JoinHandle<Result<(), WorkerError>>>,
}

impl Engine {
    /// Validate the configuration and start both loops on the current Tokio
    /// runtime. Returns immediately; invalid configuration is fatal.
    pub fn start<S>(store: S, registry: Registry, config: WorkerConfig) -> Result<Self, ConfigError>
    where
        S: Store + Clone + Send + Sync + 'static,
    {
        Self::start_with_clock(store, registry, WallClock, config)
    }

    /// Same as [`Engine::start`] with an injected clock (simulated time in
    /// tests).
    pub fn start_with_clock<S, C>(
        store: S,
        registry: Registry,
        clock: C,
        config: WorkerConfig,
    ) -> Result<Self, ConfigError>
    where
        S: Store + Clone + Send + Sync + 'static,
        C: Clock + Clone + Sync + 'static,
    {
        let worker = Worker::new(store, registry, config)?
            .clock(clock)
            .job_spawner(TokioSpawner);

        let (shutdown, signal) = tokio::sync::oneshot::channel::<()>();
        // Dropping the engine without `stop` also ends the worker: a closed
        // channel reads the same as a fired one.
        let signal = async move {
            let _ = signal.await;
        };
        let handle = tokio::spawn(worker.with_graceful_shutdown(signal).run());

        Ok(Self {
            shutdown: Some(shutdown),
            worker: Some(handle),
        })
    }

    /// Signal shutdown and wait for both loops to finish; the dispatch loop
    /// drains in-flight jobs first. Idempotent: the second call is a no-op.
    /// Surfaces a dispatch-fatal store error if one ended the loop early.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.await {
            Ok(result) => result,
            Err(error) => {
                // The worker task itself died (cancelled or panicked); there
                // is nothing left to drain.
                tracing::error!(error = %error, "worker task did not finish cleanly");
                Ok(())
            }
        }
    }
}
