//! Demultiplexer facade.
//!
//! [`AgentDemultiplexer`] wires together the aggregation shards, the check payload buffer, the DogStatsD listener, the
//! sender registry, and the flush coordinator, and drives their lifecycle.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::AcqRel},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, SystemTime},
};

use futures::{future::BoxFuture, FutureExt as _};
use tokio::{
    select,
    sync::{mpsc, Mutex as AsyncMutex},
    task::{Id, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::GenericError,
    flush::{check_payload_buffer, CheckPayloadBuffer, FlushCoordinator, FlushSummary},
    generic_error,
    listener::{run_worker, DogStatsDListener},
    metrics::{MetricSample, MetricSampleBatch, MetricSamplePool},
    router::SampleRouter,
    sampler::{shard_channel, ShardHandle, ShardMessage, TimeSamplerShard},
    sender::{CheckId, Sender, SenderError, SenderRegistry},
    serializer::MetricSerializer,
    task::JoinSetExt as _,
    time::get_unix_timestamp,
    topology::Topology,
};

mod config;
pub use self::config::DemultiplexerConfiguration;

/// Lifecycle state of a demultiplexer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DemultiplexerState {
    /// Built, but not yet running. Ingested data is queued until [`run`][AgentDemultiplexer::run] is called.
    Created,

    /// Routines are running and flushes happen periodically.
    Running,

    /// Stopped for good.
    Stopped,
}

impl fmt::Display for DemultiplexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

// Receiving ends held until the routines that own them are spawned.
struct PendingRoutines {
    shards: Vec<(usize, mpsc::Receiver<ShardMessage>)>,
    payload_buffer: CheckPayloadBuffer,
}

struct Inner {
    config: DemultiplexerConfiguration,
    topology: Topology,
    pool: MetricSamplePool,
    router: SampleRouter,
    registry: Arc<SenderRegistry>,
    flusher: Arc<FlushCoordinator>,
    state: Mutex<DemultiplexerState>,
    pending: Mutex<Option<PendingRoutines>>,
    tasks: AsyncMutex<(JoinSet<()>, HashMap<Id, String>)>,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

/// Central routing and aggregation context.
///
/// Producers hand samples to the demultiplexer, either directly or through per-producer [`Sender`]s, and the
/// demultiplexer routes them to a fixed set of aggregation shards. Periodic flushes stream the aggregated series and
/// sketches to the serializer.
///
/// Cloning is cheap, and every clone refers to the same demultiplexer.
#[derive(Clone)]
pub struct AgentDemultiplexer {
    inner: Arc<Inner>,
}

impl AgentDemultiplexer {
    /// Creates a new `AgentDemultiplexer`, sizing its topology from the host.
    pub fn new(config: DemultiplexerConfiguration, serializer: Arc<dyn MetricSerializer>) -> Self {
        let (pipeline_count, auto_adjust) = config.pipelines();
        let topology = Topology::from_host(pipeline_count, auto_adjust);
        Self::with_topology(config, topology, serializer)
    }

    /// Creates a new `AgentDemultiplexer` with the given topology.
    pub fn with_topology(
        config: DemultiplexerConfiguration, topology: Topology, serializer: Arc<dyn MetricSerializer>,
    ) -> Self {
        let pool = MetricSamplePool::new(config.metric_sample_pool_batch_size, config.metric_sample_pool_max_idle);

        let (handles, receivers): (Vec<ShardHandle>, Vec<_>) = (0..topology.pipeline_count())
            .map(|id| {
                let (handle, rx) = shard_channel(id, config.shard_queue_size);
                (handle, (id, rx))
            })
            .unzip();

        let (payloads_tx, payloads, payload_buffer) = check_payload_buffer(config.shard_queue_size);
        let router = SampleRouter::new(handles.clone(), pool.clone(), payloads_tx);
        let flusher = FlushCoordinator::new(handles, serializer, payloads, config.flush_settings());
        let registry = SenderRegistry::new(
            router.clone(),
            &config.hostname,
            Duration::from_secs(config.sender_expiry_seconds),
        );

        debug!(%topology, "Created demultiplexer.");

        Self {
            inner: Arc::new(Inner {
                config,
                topology,
                pool,
                router,
                registry: Arc::new(registry),
                flusher: Arc::new(flusher),
                state: Mutex::new(DemultiplexerState::Created),
                pending: Mutex::new(Some(PendingRoutines {
                    shards: receivers,
                    payload_buffer,
                })),
                tasks: AsyncMutex::new((JoinSet::new(), HashMap::new())),
                stopping: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, DemultiplexerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DemultiplexerState {
        *self.state_guard()
    }

    /// Topology the demultiplexer runs with.
    pub fn topology(&self) -> Topology {
        self.inner.topology
    }

    /// Serializer flushed data is handed to.
    pub fn serializer(&self) -> Arc<dyn MetricSerializer> {
        Arc::clone(self.inner.flusher.serializer())
    }

    /// Sample batch pool shared by every ingestion path.
    pub fn metric_sample_pool(&self) -> &MetricSamplePool {
        &self.inner.pool
    }

    /// Starts every routine: the aggregation shards, the check payload buffer, the DogStatsD listener and its workers
    /// when enabled, and the periodic flush loop.
    ///
    /// Returns once the routines are spawned.
    ///
    /// # Errors
    ///
    /// If the demultiplexer is not in the `Created` state, or the DogStatsD listener cannot be bound, an error is
    /// returned and the demultiplexer is left as it was.
    pub async fn run(&self) -> Result<(), GenericError> {
        let state = self.state();
        if state != DemultiplexerState::Created {
            return Err(generic_error!("Demultiplexer cannot be started while {}.", state));
        }

        let listener_settings = self.inner.config.listener_settings();
        let listener = match listener_settings.listen_address() {
            Some(address) => Some(DogStatsDListener::bind(address, &listener_settings).await?),
            None => {
                info!("DogStatsD listener disabled.");
                None
            }
        };

        let pending = {
            let mut state = self.state_guard();
            let pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            match pending {
                Some(pending) if *state == DemultiplexerState::Created => {
                    *state = DemultiplexerState::Running;
                    pending
                }
                _ => return Err(generic_error!("Demultiplexer was started concurrently.")),
            }
        };

        let shutdown = &self.inner.shutdown;
        let mut guard = self.inner.tasks.lock().await;
        let (tasks, task_names) = &mut *guard;
        let mut spawn = |name: String, f: BoxFuture<'static, ()>| {
            let handle = tasks.spawn_traced(f);
            task_names.insert(handle.id(), name);
        };

        for (id, rx) in pending.shards {
            let shard = TimeSamplerShard::new(id, self.inner.config.bucket_width_secs(), self.inner.pool.clone());
            spawn(format!("shard-{}", id), shard.run(rx, shutdown.clone()).boxed());
        }

        spawn(
            "check-payload-buffer".to_string(),
            pending.payload_buffer.run(shutdown.clone()).boxed(),
        );

        if let Some((listener, packets)) = listener {
            info!(address = ?listener.local_addr().ok(), "DogStatsD listener bound.");
            spawn("dogstatsd-listener".to_string(), listener.run(shutdown.clone()).boxed());

            for worker_id in 0..self.inner.topology.worker_count() {
                spawn(
                    format!("dogstatsd-worker-{}", worker_id),
                    run_worker(worker_id, Arc::clone(&packets), self.inner.router.clone(), shutdown.clone()).boxed(),
                );
            }
        }

        spawn(
            "flush-loop".to_string(),
            run_flush_loop(
                Arc::clone(&self.inner.flusher),
                Arc::clone(&self.inner.registry),
                self.inner.config.flush_interval(),
                shutdown.clone(),
            )
            .boxed(),
        );

        info!(
            topology = %self.inner.topology,
            flush_interval = ?self.inner.config.flush_interval(),
            "Demultiplexer started."
        );

        Ok(())
    }

    /// Stops the demultiplexer, waiting for every routine to finish.
    ///
    /// When `flush` is `true` and the demultiplexer is running, everything aggregated so far, including the windows
    /// still open, is flushed to the serializer first. Calling this more than once has no further effect.
    pub async fn stop(&self, flush: bool) {
        if self.inner.stopping.swap(true, AcqRel) {
            debug!("Demultiplexer is already stopping.");
            return;
        }

        if flush && self.state() == DemultiplexerState::Running {
            // Flushing ahead of the current time closes the windows still open.
            let bucket_width = Duration::from_secs(self.inner.config.bucket_width_secs());
            let start = SystemTime::now() + bucket_width * 2;
            if let Some(summary) = self.inner.flusher.force_flush_to_serializer(start, true).await {
                info!(
                    series = summary.series,
                    sketches = summary.sketches,
                    "Flushed remaining data before stopping."
                );
            }
        }

        *self.state_guard() = DemultiplexerState::Stopped;
        self.inner.registry.close();
        self.inner.shutdown.cancel();

        // Never started: dropping the receivers releases producers blocked on a full queue.
        let pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if pending.is_some() {
            debug!("Demultiplexer stopped before running. Discarding queued samples.");
        }
        drop(pending);

        let mut guard = self.inner.tasks.lock().await;
        let (tasks, task_names) = &mut *guard;
        while let Some(result) = tasks.join_next_with_id().await {
            match result {
                Ok((id, ())) => {
                    if let Some(name) = task_names.remove(&id) {
                        debug!(routine = %name, "Routine stopped.");
                    }
                }
                Err(e) => {
                    let name = task_names.remove(&e.id()).unwrap_or_default();
                    error!(routine = %name, error = %e, "Routine failed while stopping.");
                }
            }
        }

        info!("Demultiplexer stopped.");
    }

    fn accepts_ingestion(&self) -> bool {
        let state = self.state();
        if state == DemultiplexerState::Stopped {
            warn!("Demultiplexer is stopped. Dropping samples.");
            return false;
        }
        true
    }

    /// Adds a sample to the first shard.
    pub async fn add_time_sample(&self, sample: MetricSample) {
        let mut batch = self.inner.pool.get();
        batch.push(sample);
        self.add_time_sample_batch(0, batch).await;
    }

    /// Adds a batch of samples to a shard.
    ///
    /// Shard identifiers beyond the shard count wrap around. Waits for capacity if the shard is busy.
    pub async fn add_time_sample_batch(&self, shard: usize, batch: MetricSampleBatch) {
        if !self.accepts_ingestion() {
            self.inner.pool.put(batch);
            return;
        }

        self.inner.router.send_samples(shard, batch).await;
    }

    /// Adds timestamped samples, each routed by context to the shard that owns it.
    ///
    /// Late metrics are never aggregated. Each is flushed as-is on the next flush, with its own timestamp.
    pub async fn add_late_metrics(&self, mut batch: MetricSampleBatch) {
        if self.accepts_ingestion() {
            self.inner.router.route_late_by_context(batch.drain(..)).await;
        }

        self.inner.pool.put(batch);
    }

    /// Flushes every shard at the logical time `start`.
    ///
    /// See [`FlushCoordinator::force_flush_to_serializer`]. If the demultiplexer is not running, nothing is flushed and
    /// `None` is returned.
    pub async fn force_flush_to_serializer(&self, start: SystemTime, wait_for_serializer: bool) -> Option<FlushSummary> {
        let state = self.state();
        if state != DemultiplexerState::Running {
            warn!(%state, "Demultiplexer is not running. Skipping flush.");
            return None;
        }

        self.inner
            .flusher
            .force_flush_to_serializer(start, wait_for_serializer)
            .await
    }

    /// Gets the sender registered for `id`.
    ///
    /// # Errors
    ///
    /// If no sender is registered for `id`, `SenderError::NotFound` is returned.
    pub fn get_sender(&self, id: &CheckId) -> Result<Sender, SenderError> {
        self.inner.registry.get_sender(id)
    }

    /// Registers `sender` under `id`.
    ///
    /// # Errors
    ///
    /// If a sender is already registered for `id`, `SenderError::AlreadyExists` is returned.
    pub fn set_sender(&self, sender: Sender, id: CheckId) -> Result<(), SenderError> {
        self.inner.registry.set_sender(sender, id)
    }

    /// Creates a sender for `id` and registers it.
    ///
    /// # Errors
    ///
    /// If a sender is already registered for `id`, `SenderError::AlreadyExists` is returned.
    pub fn create_sender(&self, id: CheckId) -> Result<Sender, SenderError> {
        self.inner.registry.create_sender(id)
    }

    /// Removes the sender registered for `id`, if any.
    pub fn destroy_sender(&self, id: &CheckId) {
        self.inner.registry.destroy_sender(id)
    }

    /// Gets the default sender, creating it on first use.
    ///
    /// # Errors
    ///
    /// If the demultiplexer was stopped before the default sender was ever created, an error is returned.
    pub fn get_default_sender(&self) -> Result<Sender, GenericError> {
        self.inner.registry.get_default_sender()
    }

    /// Changes the default hostname of every sender.
    pub fn change_all_senders_default_hostname(&self, hostname: &str) {
        self.inner.registry.change_all_senders_default_hostname(hostname)
    }
}

impl fmt::Debug for AgentDemultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDemultiplexer")
            .field("state", &self.state())
            .field("topology", &self.inner.topology)
            .finish_non_exhaustive()
    }
}

async fn run_flush_loop(
    flusher: Arc<FlushCoordinator>, registry: Arc<SenderRegistry>, flush_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(?flush_interval, "Flush loop started.");

    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(summary) = flusher.force_flush_to_serializer(SystemTime::now(), true).await {
                    debug!(series = summary.series, sketches = summary.sketches, "Periodic flush complete.");
                }
                registry.clean_senders(get_unix_timestamp());
            }
        }
    }

    debug!("Flush loop stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::{Event, MetricType, SerieKind},
        test_util::RecordingSerializer,
        topology::worker_and_pipeline_count,
    };

    fn demultiplexer(
        config: DemultiplexerConfiguration, pipeline_count: i64,
    ) -> (AgentDemultiplexer, Arc<RecordingSerializer>) {
        let serializer = Arc::new(RecordingSerializer::default());
        let topology = worker_and_pipeline_count(8, pipeline_count, false);
        let demux = AgentDemultiplexer::with_topology(config.with_dogstatsd_port(0), topology, serializer.clone());
        (demux, serializer)
    }

    fn later(secs: u64) -> SystemTime {
        SystemTime::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn lifecycle() {
        let (demux, _serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 2);
        assert_eq!(demux.state(), DemultiplexerState::Created);
        assert_eq!(demux.topology().pipeline_count(), 2);
        assert!(demux.serializer().are_series_enabled());

        demux.run().await.unwrap();
        assert_eq!(demux.state(), DemultiplexerState::Running);
        assert!(demux.run().await.is_err());

        demux.stop(false).await;
        assert_eq!(demux.state(), DemultiplexerState::Stopped);
        demux.stop(true).await;
        assert!(demux.run().await.is_err());
    }

    #[tokio::test]
    async fn waited_flush_without_data_is_empty() {
        let (demux, serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 3);
        demux.run().await.unwrap();

        let summary = demux.force_flush_to_serializer(SystemTime::now(), true).await.unwrap();
        assert_eq!(summary.series, 0);
        assert_eq!(summary.sketches, 0);
        assert_eq!(summary.shards_completed, 3);
        assert!(serializer.series().is_empty());

        demux.stop(false).await;
    }

    #[tokio::test]
    async fn flush_before_run_is_skipped() {
        let (demux, _serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 1);
        assert_eq!(demux.force_flush_to_serializer(SystemTime::now(), true).await, None);
    }

    #[tokio::test]
    async fn late_metrics_are_flushed_apart_from_windows() {
        let (demux, serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 2);
        demux.run().await.unwrap();

        demux
            .add_time_sample(MetricSample::new("queue.depth", 3.0, MetricType::Gauge))
            .await;
        let late = MetricSampleBatch::from(vec![
            MetricSample::new("queue.depth", 9.0, MetricType::Gauge).with_timestamp(1_000),
            MetricSample::new("jobs.done", 2.0, MetricType::Counter).with_timestamp(1_005),
        ]);
        demux.add_late_metrics(late).await;

        demux.force_flush_to_serializer(SystemTime::now(), true).await.unwrap();
        let series = serializer.series();
        let late_depth = series
            .iter()
            .find(|serie| serie.name == "queue.depth" && serie.points == vec![(1_000, 9.0)]);
        assert!(late_depth.is_some());
        let jobs = series.iter().find(|serie| serie.name == "jobs.done").unwrap();
        assert_eq!(jobs.kind, SerieKind::Count);
        assert_eq!(jobs.points, vec![(1_005, 2.0)]);

        demux.force_flush_to_serializer(later(20), true).await.unwrap();
        let windowed = serializer
            .series()
            .into_iter()
            .filter(|serie| serie.name == "queue.depth" && serie.points[0].0 != 1_000)
            .collect::<Vec<_>>();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].points[0].1, 3.0);
        assert_eq!(windowed[0].points[0].0 % 10, 0);

        demux.stop(false).await;
    }

    #[tokio::test]
    async fn batches_wrap_around_shards() {
        let (demux, serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 2);
        demux.run().await.unwrap();

        let batch = MetricSampleBatch::from(vec![MetricSample::new("temp", 21.5, MetricType::Gauge)]);
        demux.add_time_sample_batch(7, batch).await;

        let summary = demux.force_flush_to_serializer(later(20), true).await.unwrap();
        assert_eq!(summary.series, 1);
        assert_eq!(serializer.series()[0].name, "temp");

        demux.stop(false).await;
    }

    #[tokio::test]
    async fn sender_commit_reaches_serializer() {
        let config = DemultiplexerConfiguration::with_defaults().with_hostname("web-1");
        let (demux, serializer) = demultiplexer(config, 2);
        demux.run().await.unwrap();

        let id = CheckId::new("nginx:abc");
        let sender = demux.create_sender(id.clone()).unwrap();
        assert!(demux.get_sender(&id).unwrap().ptr_eq(&sender));
        assert!(matches!(
            demux.set_sender(sender.clone(), id.clone()),
            Err(SenderError::AlreadyExists { .. })
        ));

        sender.gauge("nginx.connections", 12.0, &["port:80"]);
        sender.event(Event {
            title: "Reloaded".to_string(),
            text: "nginx configuration reloaded".to_string(),
            tags: Vec::new(),
            host: None,
            timestamp: 1,
        });
        sender.commit().await;

        let summary = demux.force_flush_to_serializer(later(20), true).await.unwrap();
        assert_eq!(summary.series, 1);
        assert_eq!(summary.events, 1);

        let series = serializer.series();
        assert_eq!(series[0].host.as_deref(), Some("web-1"));
        let events = serializer.events.lock().unwrap().clone();
        assert_eq!(events[0].host.as_deref(), Some("web-1"));

        demux.destroy_sender(&id);
        assert!(demux.get_sender(&id).is_err());

        demux.stop(false).await;
    }

    #[tokio::test]
    async fn default_sender_and_hostname_change() {
        let (demux, _serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 1);

        let first = demux.get_default_sender().unwrap();
        let second = demux.get_default_sender().unwrap();
        assert!(first.ptr_eq(&second));

        demux.change_all_senders_default_hostname("db-7");
        assert_eq!(first.default_hostname(), "db-7");
    }

    #[tokio::test]
    async fn stop_with_flush_sends_open_windows() {
        let (demux, serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 2);
        demux.run().await.unwrap();

        demux
            .add_time_sample(MetricSample::new("requests", 30.0, MetricType::Counter))
            .await;
        demux.stop(true).await;

        let series = serializer.series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].kind, SerieKind::Rate);
        assert_eq!(series[0].points[0].1, 3.0);
    }

    #[tokio::test]
    async fn ingestion_after_stop_is_dropped() {
        let (demux, serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 1);
        demux.run().await.unwrap();
        demux.stop(false).await;

        demux
            .add_time_sample(MetricSample::new("requests", 1.0, MetricType::Counter))
            .await;
        demux
            .add_late_metrics(MetricSampleBatch::from(vec![
                MetricSample::new("requests", 1.0, MetricType::Counter).with_timestamp(5),
            ]))
            .await;

        assert_eq!(demux.force_flush_to_serializer(later(20), true).await, None);
        assert!(serializer.series().is_empty());
        assert!(demux.metric_sample_pool().idle_len() > 0);
        assert!(demux.get_default_sender().is_err());
    }

    #[tokio::test]
    async fn stop_before_run_releases_blocked_producers() {
        let (demux, _serializer) = demultiplexer(DemultiplexerConfiguration::with_defaults(), 1);

        for i in 0..DemultiplexerConfiguration::with_defaults().shard_queue_size {
            demux
                .add_time_sample(MetricSample::new("queue.depth", i as f64, MetricType::Gauge))
                .await;
        }

        let producer = {
            let demux = demux.clone();
            tokio::spawn(async move {
                demux
                    .add_time_sample(MetricSample::new("queue.depth", 0.0, MetricType::Gauge))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        demux.stop(false).await;
        assert_eq!(demux.state(), DemultiplexerState::Stopped);

        let finished = tokio::time::timeout(Duration::from_secs(2), producer).await;
        assert!(matches!(finished, Ok(Ok(()))));
        assert!(demux.metric_sample_pool().idle_len() > 0);
    }

    #[tokio::test]
    async fn periodic_flush_runs_while_running() {
        let config = DemultiplexerConfiguration::with_defaults().with_flush_interval(Duration::from_secs(1));
        let (demux, serializer) = demultiplexer(config, 1);
        demux.run().await.unwrap();

        demux
            .add_late_metrics(MetricSampleBatch::from(vec![
                MetricSample::new("uptime", 60.0, MetricType::Gauge).with_timestamp(1_700_000_000),
            ]))
            .await;

        let flushed = tokio::time::timeout(Duration::from_secs(5), async {
            while serializer.series().is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(flushed.is_ok());
        assert_eq!(serializer.series()[0].points, vec![(1_700_000_000, 60.0)]);

        demux.stop(false).await;
    }
}
