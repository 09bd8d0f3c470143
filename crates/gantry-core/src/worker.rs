//! Worker engine: bounded-concurrency dispatch plus worker heartbeats.
//!
//! Two loops share one cancellation signal. The dispatch loop leases jobs
//! while it has free capacity and hands them to the executor without
//! awaiting them; the heartbeat loop advertises the worker so the store can
//! expire dead ones. Shutdown stops leasing and drains every in-flight job
//! before returning. Spawning is pluggable.

use crate::clock::{Clock, WallClock};
use crate::config::{ConfigError, WorkerConfig};
use crate::executor::execute_job;
use crate::registry::Registry;
use crate::store::{Store, WorkerHeartbeat};
use futures::FutureExt as _;
use futures::StreamExt as _;
use futures::future::Shared;

/// How job futures are executed (inline, Tokio, etc.).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Minimal spawner that runs jobs inline (deterministic tests, no runtime).
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

#[derive(Debug)]
/// The store broke its contract while the dispatch loop was leasing.
///
/// Job failures never produce this; they are mapped to error results and
/// released. A `WorkerError` means the worker cannot trust the store and
/// has stopped dispatching.
pub struct WorkerError {
    inner: Box<dyn std::error::Error + Send>,
}

impl WorkerError {
    fn acquire(error: impl std::error::Error + Send + 'static) -> Self {
        Self {
            inner: Box::new(error),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store failed during job acquisition: {}", self.inner)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Store + registry + clock + validated config.
pub struct Worker<S, C = WallClock, Sp = InlineSpawner> {
    store: S,
    registry: std::sync::Arc<Registry>,
    clock: C,
    config: WorkerConfig,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<S> Worker<S>
where
    S: Store,
{
    /// Validates the configuration up front; invalid values are fatal here
    /// rather than surprising at runtime.
    pub fn new(store: S, registry: Registry, config: WorkerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            registry: std::sync::Arc::new(registry),
            clock: WallClock,
            config,
            marker: std::marker::PhantomData,
        })
    }
}

impl<S, C, Sp> Worker<S, C, Sp>
where
    S: Store + Clone + Send + Sync + 'static,
    C: Clock + Clone + Sync,
    Sp: JobSpawner,
{
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Replace the clock (simulated time in tests).
    pub fn clock<C2>(self, clock: C2) -> Worker<S, C2, Sp>
    where
        C2: Clock + Clone + Sync,
    {
        let Self {
            store,
            registry,
            clock: _,
            config,
            marker: _,
        } = self;
        Worker {
            store,
            registry,
            clock,
            config,
            marker: std::marker::PhantomData,
        }
    }

    /// Choose how to spawn jobs (inline, Tokio, ...).
    pub fn job_spawner<Sp2>(self, _spawner: Sp2) -> Worker<S, C, Sp2>
    where
        Sp2: JobSpawner,
    {
        let Self {
            store,
            registry,
            clock,
            config,
            marker: _,
        } = self;
        Worker {
            store,
            registry,
            clock,
            config,
            marker: std::marker::PhantomData,
        }
    }

    /// Add a shutdown signal; in-flight jobs drain before the run ends.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<S, C, Signal, Sp>
    where
        Signal: Future<Output = ()> + Send,
    {
        let Self {
            store,
            registry,
            clock,
            config,
            marker: _,
        } = self;
        WorkerWithGracefulShutdown {
            store,
            registry,
            clock,
            config,
            signal,
            marker: std::marker::PhantomData,
        }
    }

    /// Run forever. A store contract failure ends dispatch, but heartbeats
    /// keep the worker advertised; use [`Worker::with_graceful_shutdown`]
    /// to stop and observe the failure.
    pub fn run(self) -> impl Future<Output = Result<(), WorkerError>> + Send {
        run_worker::<_, _, _, Sp>(
            self.store,
            self.registry,
            self.clock,
            self.config,
            std::future::pending::<()>(),
        )
    }
}

/// Worker variant that reacts to a shutdown signal and drains jobs.
pub struct WorkerWithGracefulShutdown<S, C, Signal, Sp>
where
    Signal: Future<Output = ()> + Send,
{
    store: S,
    registry: std::sync::Arc<Registry>,
    clock: C,
    config: WorkerConfig,
    signal: Signal,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<S, C, Signal, Sp> WorkerWithGracefulShutdown<S, C, Signal, Sp>
where
    S: Store + Clone + Send + Sync + 'static,
    C: Clock + Clone + Sync,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    /// Run until shutdown, then drain.
    pub fn run(self) -> impl Future<Output = Result<(), WorkerError>> + Send {
        run_worker::<_, _, _, Sp>(self.store, self.registry, self.clock, self.config, self.signal)
    }
}

/// Fan one signal out to both loops and fan their completions back in. The
/// heartbeat loop keeps running after a dispatch failure so the store still
/// sees this worker until it is stopped.
async fn run_worker<S, C, Signal, Sp>(
    store: S,
    registry: std::sync::Arc<Registry>,
    clock: C,
    config: WorkerConfig,
    signal: Signal,
) -> Result<(), WorkerError>
where
    S: Store + Clone + Send + Sync + 'static,
    C: Clock + Clone + Sync,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    let signal = signal.shared();
    let beat = WorkerHeartbeat {
        machine_name: config.machine_name.clone(),
        parallelism: config.parallelism,
        polling_frequency: config.polling_frequency,
        heartbeat_frequency: config.heartbeat_frequency,
    };

    let heartbeat = heartbeat_loop(
        store.clone(),
        clock.clone(),
        beat,
        config.heartbeat_frequency,
        signal.clone(),
    );
    let dispatch = dispatch_loop::<_, _, _, Sp>(
        store,
        registry,
        clock,
        config.parallelism,
        config.polling_frequency,
        signal,
    );

    let (result, ()) = futures::join!(dispatch, heartbeat);
    result
}

/// Advertise this worker once per interval. Store errors are logged and
/// swallowed; the next tick retries. No state is carried between ticks.
async fn heartbeat_loop<S, C, Signal>(
    store: S,
    clock: C,
    beat: WorkerHeartbeat,
    frequency: std::time::Duration,
    mut signal: Shared<Signal>,
) where
    S: Store,
    C: Clock + Sync,
    Signal: Future<Output = ()>,
{
    loop {
        // Report before the first full interval so the store learns about
        // this worker promptly. An in-flight call completes even when the
        // signal fires; the loop notices on the next select.
        if let Err(error) = store.heartbeat(beat.clone()).await {
            tracing::error!(error = %error, machine_name = %beat.machine_name, "heartbeat failed");
        }

        let sleep = clock.sleep(frequency).fuse();
        futures::pin_mut!(sleep);
        futures::select! {
            _ = sleep => {}
            _ = signal => break,
        }
    }
}

/// The bounded-concurrency pump. In-flight executions live in a set of
/// spawner handles; a completed handle is a freed slot, so capacity can
/// never leak. Store failures stop the pump after a drain; cancellation
/// stops leasing and drains.
async fn dispatch_loop<S, C, Signal, Sp>(
    store: S,
    registry: std::sync::Arc<Registry>,
    clock: C,
    parallelism: usize,
    polling_frequency: std::time::Duration,
    mut signal: Shared<Signal>,
) -> Result<(), WorkerError>
where
    S: Store + Clone + Send + Sync + 'static,
    C: Clock + Sync,
    Signal: Future<Output = ()>,
    Sp: JobSpawner,
{
    let mut tasks = futures::stream::FuturesUnordered::new();

    let failure = 'dispatch: loop {
        // A free execution slot first.
        while tasks.len() >= parallelism {
            futures::select! {
                _ = tasks.next() => {}
                _ = signal => break 'dispatch None,
            }
        }

        // Stop leasing as soon as shutdown is requested.
        if signal.clone().now_or_never().is_some() {
            break None;
        }

        match store.acquire_job().await {
            Ok(Some(job)) => {
                tracing::trace!(job_id = %job.id, job_type = %job.job_type, "leased job");
                let execution = execute_job(store.clone(), registry.clone(), job);
                tasks.push(<Sp as JobSpawner>::spawn(execution));
            }
            Ok(None) => {
                // Nothing ready; poll again after a sleep. In-flight jobs
                // keep progressing meanwhile (the inline spawner has no
                // runtime of its own), but an empty task set must not be
                // polled: it reports exhaustion immediately on every pass
                // and would spin this loop hot.
                let sleep = clock.sleep(polling_frequency).fuse();
                futures::pin_mut!(sleep);
                loop {
                    if tasks.is_empty() {
                        futures::select! {
                            _ = sleep => break,
                            _ = signal => break 'dispatch None,
                        }
                    } else {
                        futures::select! {
                            _ = sleep => break,
                            _ = tasks.next() => {}
                            _ = signal => break 'dispatch None,
                        }
                    }
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to acquire job, dispatch stops");
                break Some(WorkerError::acquire(error));
            }
        }
    };

    // Drain: every in-flight job must release its slot before we return.
    tracing::trace!(in_flight = tasks.len(), "dispatch stopping, draining jobs");
    while tasks.next().await.is_some() {}

    match failure {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GraphNode, JobDescription};
    use crate::{JobResult, JobState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug)]
    struct StoreFailure;

    impl std::fmt::Display for StoreFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("store unavailable")
        }
    }

    impl std::error::Error for StoreFailure {}

    #[derive(Default)]
    struct ScriptedInner {
        queue: VecDeque<JobDescription>,
        released: Vec<(Uuid, JobResult)>,
        beats: Vec<WorkerHeartbeat>,
        fail_acquire: bool,
        fail_heartbeat: bool,
    }

    /// FIFO store stub; graph semantics live in the reference store, not
    /// here.
    #[derive(Clone, Default)]
    struct ScriptedStore {
        inner: Arc<Mutex<ScriptedInner>>,
    }

    impl ScriptedStore {
        fn push_job(&self, job_type: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.inner.lock().unwrap().queue.push_back(JobDescription {
                id,
                job_type: job_type.to_string(),
                input: None,
                due_time: chrono::Utc::now(),
            });
            id
        }

        fn released(&self) -> Vec<(Uuid, JobResult)> {
            self.inner.lock().unwrap().released.clone()
        }

        fn beats(&self) -> Vec<WorkerHeartbeat> {
            self.inner.lock().unwrap().beats.clone()
        }

        fn fail_acquire(&self) {
            self.inner.lock().unwrap().fail_acquire = true;
        }

        fn fail_heartbeat(&self) {
            self.inner.lock().unwrap().fail_heartbeat = true;
        }
    }

    impl Store for ScriptedStore {
        type Error = StoreFailure;

        async fn acquire_job(&self) -> Result<Option<JobDescription>, StoreFailure> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_acquire {
                return Err(StoreFailure);
            }
            Ok(inner.queue.pop_front())
        }

        async fn release_job(&self, job_id: Uuid, result: JobResult) -> Result<(), StoreFailure> {
            self.inner.lock().unwrap().released.push((job_id, result));
            Ok(())
        }

        async fn heartbeat(&self, beat: WorkerHeartbeat) -> Result<(), StoreFailure> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_heartbeat {
                return Err(StoreFailure);
            }
            inner.beats.push(beat);
            Ok(())
        }

        async fn enqueue(&self, _node: GraphNode) -> Result<(), StoreFailure> {
            Ok(())
        }
    }

    fn config(parallelism: usize, poll_ms: u64, heartbeat_ms: u64) -> WorkerConfig {
        WorkerConfig::new()
            .machine_name("test-worker")
            .parallelism(parallelism)
            .polling_frequency(Duration::from_millis(poll_ms))
            .heartbeat_frequency(Duration::from_millis(heartbeat_ms))
    }

    fn after(ms: u64) -> impl Future<Output = ()> + Send {
        async move { futures_timer::Delay::new(Duration::from_millis(ms)).await }
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let registry = Registry::new();
        let result = Worker::new(ScriptedStore::default(), registry, config(0, 10, 10));
        assert_eq!(result.err(), Some(ConfigError::Parallelism));
    }

    #[tokio::test]
    async fn runs_queued_jobs_and_releases_each_exactly_once() {
        let store = ScriptedStore::default();
        let ids = [
            store.push_job("tick"),
            store.push_job("tick"),
            store.push_job("tick"),
        ];

        let runs = Arc::new(AtomicUsize::new(0));
        let observed = runs.clone();
        let mut registry = Registry::new();
        registry.register("tick", move || {
            let runs = observed.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                JobResult::finished()
            }
        });

        Worker::new(store.clone(), registry, config(2, 10, 50))
            .unwrap()
            .with_graceful_shutdown(after(120))
            .run()
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let released = store.released();
        assert_eq!(released.len(), 3);
        for id in ids {
            let count = released.iter().filter(|(seen, _)| *seen == id).count();
            assert_eq!(count, 1, "one release per lease");
        }
        assert!(released.iter().all(|(_, r)| r.state == JobState::Finished));
    }

    #[tokio::test]
    async fn in_flight_jobs_never_exceed_parallelism() {
        let store = ScriptedStore::default();
        for _ in 0..6 {
            store.push_job("slow");
        }

        let gauge = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (gauge_in, peak_in) = (gauge.clone(), peak.clone());
        let mut registry = Registry::new();
        registry.register("slow", move || {
            let (gauge, peak) = (gauge_in.clone(), peak_in.clone());
            async move {
                let in_flight = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(in_flight, Ordering::SeqCst);
                futures_timer::Delay::new(Duration::from_millis(40)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                JobResult::finished()
            }
        });

        Worker::new(store.clone(), registry, config(2, 5, 500))
            .unwrap()
            .with_graceful_shutdown(after(300))
            .run()
            .await
            .unwrap();

        assert_eq!(store.released().len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "parallelism budget held");
        assert_eq!(gauge.load(Ordering::SeqCst), 0, "all jobs drained");
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs() {
        let store = ScriptedStore::default();
        let id = store.push_job("slow");

        let mut registry = Registry::new();
        registry.register("slow", || async {
            futures_timer::Delay::new(Duration::from_millis(80)).await;
            JobResult::finished()
        });

        // The signal fires while the job is still running.
        Worker::new(store.clone(), registry, config(1, 5, 100))
            .unwrap()
            .with_graceful_shutdown(after(20))
            .run()
            .await
            .unwrap();

        let released = store.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, id);
    }

    #[tokio::test]
    async fn acquire_failure_stops_dispatch_but_heartbeat_outlives_it() {
        let store = ScriptedStore::default();
        store.fail_acquire();

        let result = Worker::new(store.clone(), Registry::new(), config(1, 5, 20))
            .unwrap()
            .with_graceful_shutdown(after(110))
            .run()
            .await;

        assert!(result.is_err(), "store contract failure surfaces");
        // Dispatch died immediately, yet heartbeats kept flowing until stop.
        assert!(store.beats().len() >= 3, "beats: {}", store.beats().len());
    }

    #[tokio::test]
    async fn heartbeat_failures_are_swallowed() {
        let store = ScriptedStore::default();
        store.fail_heartbeat();
        let id = store.push_job("tick");

        let mut registry = Registry::new();
        registry.register("tick", || async { JobResult::finished() });

        Worker::new(store.clone(), registry, config(1, 5, 10))
            .unwrap()
            .with_graceful_shutdown(after(60))
            .run()
            .await
            .unwrap();

        // Jobs still ran even though every heartbeat errored.
        assert_eq!(store.released().len(), 1);
        assert_eq!(store.released()[0].0, id);
    }

    #[tokio::test]
    async fn heartbeat_advertises_configured_identity() {
        let store = ScriptedStore::default();

        Worker::new(store.clone(), Registry::new(), config(3, 25, 15))
            .unwrap()
            .with_graceful_shutdown(after(80))
            .run()
            .await
            .unwrap();

        let beats = store.beats();
        assert!(beats.len() >= 4, "beats: {}", beats.len());
        assert!(beats.iter().all(|beat| {
            beat.machine_name == "test-worker"
                && beat.parallelism == 3
                && beat.polling_frequency == Duration::from_millis(25)
                && beat.heartbeat_frequency == Duration::from_millis(15)
        }));
    }
}
