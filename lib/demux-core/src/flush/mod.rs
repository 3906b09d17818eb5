//! Flush coordination.
//!
//! A flush fans a trigger out to every shard, with a pair of freshly created iterable sinks per shard. Each sink is
//! drained toward the serializer by its own send routine while the shard is still producing into it, so the full
//! output of a flush is never held in memory at once.
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use metrics::{counter, histogram, Counter, Histogram};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::GenericError,
    metrics::{
        iterable::{iterable, IterableSource, ItemCallback},
        Serie, SketchSeries,
    },
    sampler::{FlushTrigger, ShardFlushStats, ShardHandle, ShardMessage, Trigger},
    serializer::MetricSerializer,
    task::spawn_traced,
    time::unix_timestamp_from,
};

mod payloads;
pub use self::payloads::{check_payload_buffer, BufferedPayloads, CheckPayloadBuffer, CheckPayloadBufferHandle};

/// Result of a flush that was waited on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushSummary {
    /// Logical flush time, as a Unix timestamp in seconds.
    pub timestamp: u64,

    /// Number of series consumed by the serializer.
    pub series: u64,

    /// Number of sketch series consumed by the serializer.
    pub sketches: u64,

    /// Number of series discarded after a serializer failure.
    pub series_dropped: u64,

    /// Number of sketch series discarded after a serializer failure.
    pub sketches_dropped: u64,

    /// Number of events flushed.
    pub events: usize,

    /// Number of service checks flushed.
    pub service_checks: usize,

    /// Number of shards that reported completion.
    pub shards_completed: usize,

    /// Time taken by the flush.
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, Default)]
struct SendOutcome {
    processed: u64,
    dropped: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct PayloadOutcome {
    events: usize,
    service_checks: usize,
}

#[derive(Clone)]
struct Telemetry {
    flushes: Counter,
    series: Counter,
    sketches: Counter,
    series_dropped: Counter,
    sketches_dropped: Counter,
    events: Counter,
    service_checks: Counter,
    flush_duration: Histogram,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            flushes: counter!("demultiplexer_flushes_total"),
            series: counter!("demultiplexer_flushed_series_total"),
            sketches: counter!("demultiplexer_flushed_sketches_total"),
            series_dropped: counter!("demultiplexer_dropped_series_total"),
            sketches_dropped: counter!("demultiplexer_dropped_sketches_total"),
            events: counter!("demultiplexer_flushed_events_total"),
            service_checks: counter!("demultiplexer_flushed_service_checks_total"),
            flush_duration: histogram!("demultiplexer_flush_duration_seconds"),
        }
    }
}

/// Flush settings.
#[derive(Clone, Copy, Debug)]
pub struct FlushSettings {
    /// Number of items handed over per iterable sink chunk.
    pub buffer_size: usize,

    /// Number of chunks an iterable sink may hold before the producer waits.
    pub channel_size: usize,

    /// Whether every flushed series and sketch is logged.
    pub log_payloads: bool,
}

/// Drives flushes from the shards to the serializer.
pub struct FlushCoordinator {
    shards: Vec<ShardHandle>,
    serializer: Arc<dyn MetricSerializer>,
    payloads: CheckPayloadBufferHandle,
    settings: FlushSettings,
    series_callback: Option<ItemCallback<Serie>>,
    sketches_callback: Option<ItemCallback<SketchSeries>>,
    telemetry: Telemetry,
}

impl FlushCoordinator {
    /// Creates a coordinator flushing `shards` into `serializer`.
    pub fn new(
        shards: Vec<ShardHandle>, serializer: Arc<dyn MetricSerializer>, payloads: CheckPayloadBufferHandle,
        settings: FlushSettings,
    ) -> Self {
        let (series_callback, sketches_callback) = if settings.log_payloads {
            let series_callback: ItemCallback<Serie> = Arc::new(|serie: &Serie| info!(serie = %serie, "Flushing serie."));
            let sketches_callback: ItemCallback<SketchSeries> =
                Arc::new(|sketch: &SketchSeries| info!(sketch = %sketch, "Flushing sketch."));
            (Some(series_callback), Some(sketches_callback))
        } else {
            (None, None)
        };

        Self {
            shards,
            serializer,
            payloads,
            settings,
            series_callback,
            sketches_callback,
            telemetry: Telemetry::new(),
        }
    }

    /// Serializer flushed data is handed to.
    pub fn serializer(&self) -> &Arc<dyn MetricSerializer> {
        &self.serializer
    }

    /// Flushes every shard at the logical time `start`.
    ///
    /// Every bucket that closed before `start` is flushed, along with every late metric and every buffered event and
    /// service check. When `wait_for_serializer` is `true`, this returns once every shard has reported completion and
    /// the serializer has consumed everything, along with a summary of the flush. Otherwise, this returns `None` as
    /// soon as the triggers are dispatched and the flush completes in the background.
    ///
    /// There is no implicit timeout: a waited flush takes as long as the serializer does.
    pub async fn force_flush_to_serializer(&self, start: SystemTime, wait_for_serializer: bool) -> Option<FlushSummary> {
        let started = Instant::now();
        let timestamp = unix_timestamp_from(start);
        let series_enabled = self.serializer.are_series_enabled();
        let sketches_enabled = self.serializer.are_sketches_enabled();

        self.telemetry.flushes.increment(1);

        let mut completions = Vec::with_capacity(self.shards.len());
        let mut series_routines = Vec::new();
        let mut sketches_routines = Vec::new();

        for shard in &self.shards {
            let series_sink = series_enabled.then(|| {
                let (sink, source) = iterable(
                    self.series_callback.clone(),
                    self.settings.buffer_size,
                    self.settings.channel_size,
                );
                series_routines.push(self.spawn_series_routine(source));
                sink
            });
            let sketches_sink = sketches_enabled.then(|| {
                let (sink, source) = iterable(
                    self.sketches_callback.clone(),
                    self.settings.buffer_size,
                    self.settings.channel_size,
                );
                sketches_routines.push(self.spawn_sketches_routine(source));
                sink
            });

            let (block_tx, block_rx) = if wait_for_serializer {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let flush_trigger = FlushTrigger {
                trigger: Trigger {
                    time: timestamp,
                    block_tx,
                    wait_for_serializer,
                },
                series_sink,
                sketches_sink,
            };

            // A rejected trigger is dropped here, which closes its sinks and lets the send routines finish.
            if shard.send(ShardMessage::Flush(flush_trigger)).await.is_err() {
                warn!(shard = shard.id(), "Shard is not running. Skipping it for this flush.");
                continue;
            }

            if let Some(block_rx) = block_rx {
                completions.push((shard.id(), block_rx));
            }
        }

        let payloads_routine = spawn_traced(flush_check_payloads(
            Arc::clone(&self.serializer),
            self.payloads.clone(),
            self.telemetry.clone(),
        ));

        if !wait_for_serializer {
            debug!(timestamp, shards = self.shards.len(), "Dispatched flush triggers.");
            return None;
        }

        let mut summary = FlushSummary {
            timestamp,
            ..Default::default()
        };

        for (shard_id, block_rx) in completions {
            match block_rx.await {
                Ok(ShardFlushStats { .. }) => summary.shards_completed += 1,
                Err(_) => warn!(shard = shard_id, "Shard stopped before completing the flush."),
            }
        }

        for outcome in join_outcomes("series", series_routines).await {
            summary.series += outcome.processed;
            summary.series_dropped += outcome.dropped;
        }
        for outcome in join_outcomes("sketches", sketches_routines).await {
            summary.sketches += outcome.processed;
            summary.sketches_dropped += outcome.dropped;
        }

        match payloads_routine.await {
            Ok(outcome) => {
                summary.events = outcome.events;
                summary.service_checks = outcome.service_checks;
            }
            Err(e) => error!(error = %e, "Check payload flush routine failed."),
        }

        summary.elapsed = started.elapsed();
        self.telemetry.flush_duration.record(summary.elapsed.as_secs_f64());

        debug!(
            timestamp,
            series = summary.series,
            sketches = summary.sketches,
            series_dropped = summary.series_dropped,
            sketches_dropped = summary.sketches_dropped,
            events = summary.events,
            service_checks = summary.service_checks,
            elapsed = ?summary.elapsed,
            "Flush complete."
        );

        Some(summary)
    }

    fn spawn_series_routine(&self, mut source: IterableSource<Serie>) -> JoinHandle<SendOutcome> {
        let serializer = Arc::clone(&self.serializer);
        let telemetry = self.telemetry.clone();
        spawn_traced(async move {
            let result = serializer.send_iterable_series(&mut source).await;
            let outcome = finish_send("series", result, &mut source).await;
            telemetry.series.increment(outcome.processed);
            telemetry.series_dropped.increment(outcome.dropped);
            outcome
        })
    }

    fn spawn_sketches_routine(&self, mut source: IterableSource<SketchSeries>) -> JoinHandle<SendOutcome> {
        let serializer = Arc::clone(&self.serializer);
        let telemetry = self.telemetry.clone();
        spawn_traced(async move {
            let result = serializer.send_iterable_sketches(&mut source).await;
            let outcome = finish_send("sketches", result, &mut source).await;
            telemetry.sketches.increment(outcome.processed);
            telemetry.sketches_dropped.increment(outcome.dropped);
            outcome
        })
    }
}

/// Settles a send routine: whatever the serializer left in the source is discarded so the producing shard never stalls.
async fn finish_send<T>(kind: &'static str, result: Result<(), GenericError>, source: &mut IterableSource<T>) -> SendOutcome {
    let dropped = source.drain().await;
    match result {
        Ok(()) if dropped > 0 => warn!(kind, dropped, "Serializer returned before consuming every item."),
        Ok(()) => {}
        Err(e) => error!(kind, error = %e, processed = source.count(), dropped, "Failed to send payloads."),
    }

    SendOutcome {
        processed: source.count(),
        dropped,
    }
}

async fn join_outcomes(kind: &'static str, routines: Vec<JoinHandle<SendOutcome>>) -> Vec<SendOutcome> {
    let mut outcomes = Vec::with_capacity(routines.len());
    for routine in routines {
        match routine.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => error!(kind, error = %e, "Send routine failed."),
        }
    }
    outcomes
}

async fn flush_check_payloads(
    serializer: Arc<dyn MetricSerializer>, payloads: CheckPayloadBufferHandle, telemetry: Telemetry,
) -> PayloadOutcome {
    let BufferedPayloads { events, service_checks } = payloads.take().await;
    let mut outcome = PayloadOutcome::default();

    if !events.is_empty() {
        let events_len = events.len();
        match serializer.send_events(events).await {
            Ok(()) => {
                outcome.events = events_len;
                telemetry.events.increment(events_len as u64);
            }
            Err(e) => error!(error = %e, events = events_len, "Failed to send events."),
        }
    }

    if !service_checks.is_empty() {
        let service_checks_len = service_checks.len();
        match serializer.send_service_checks(service_checks).await {
            Ok(()) => {
                outcome.service_checks = service_checks_len;
                telemetry.service_checks.increment(service_checks_len as u64);
            }
            Err(e) => error!(error = %e, service_checks = service_checks_len, "Failed to send service checks."),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        metrics::{MetricSample, MetricSampleBatch, MetricSamplePool, MetricType},
        sampler::{shard_channel, TimeSamplerShard},
        test_util::RecordingSerializer,
    };

    struct Harness {
        coordinator: FlushCoordinator,
        shards: Vec<ShardHandle>,
        shutdown: CancellationToken,
    }

    fn harness(serializer: Arc<RecordingSerializer>, shard_count: usize) -> Harness {
        let pool = MetricSamplePool::new(8, 8);
        let shutdown = CancellationToken::new();

        let mut shards = Vec::new();
        for id in 0..shard_count {
            let (handle, rx) = shard_channel(id, 16);
            tokio::spawn(TimeSamplerShard::new(id, 10, pool.clone()).run(rx, shutdown.clone()));
            shards.push(handle);
        }

        let (_payloads_tx, payloads, buffer) = check_payload_buffer(16);
        tokio::spawn(buffer.run(shutdown.clone()));

        let settings = FlushSettings {
            buffer_size: 2,
            channel_size: 1,
            log_payloads: true,
        };
        let coordinator = FlushCoordinator::new(shards.clone(), serializer, payloads, settings);

        Harness {
            coordinator,
            shards,
            shutdown,
        }
    }

    fn late_batch(count: usize) -> MetricSampleBatch {
        (0..count)
            .map(|i| MetricSample::new(format!("late.{}", i), 1.0, MetricType::Gauge).with_timestamp(1_000 + i as u64))
            .collect()
    }

    #[tokio::test]
    async fn waited_flush_with_nothing_buffered_reports_zero() {
        let serializer = Arc::new(RecordingSerializer::default());
        let harness = harness(Arc::clone(&serializer), 3);

        let summary = harness
            .coordinator
            .force_flush_to_serializer(SystemTime::now(), true)
            .await
            .unwrap();

        assert_eq!(summary.series, 0);
        assert_eq!(summary.sketches, 0);
        assert_eq!(summary.shards_completed, 3);
        assert!(serializer.series().is_empty());

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn waited_flush_streams_every_shard() {
        let serializer = Arc::new(RecordingSerializer::default());
        let harness = harness(Arc::clone(&serializer), 2);

        for shard in &harness.shards {
            assert!(shard.send(ShardMessage::LateMetrics(late_batch(5))).await.is_ok());
        }

        let summary = harness
            .coordinator
            .force_flush_to_serializer(SystemTime::now(), true)
            .await
            .unwrap();

        assert_eq!(summary.series, 10);
        assert_eq!(summary.series_dropped, 0);
        assert_eq!(serializer.series().len(), 10);

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn serializer_failure_drains_remaining_series() {
        let serializer = Arc::new(RecordingSerializer {
            fail_series_after: Some(2),
            ..Default::default()
        });
        let harness = harness(Arc::clone(&serializer), 1);

        assert!(harness.shards[0]
            .send(ShardMessage::LateMetrics(late_batch(7)))
            .await
            .is_ok());

        let summary = harness
            .coordinator
            .force_flush_to_serializer(SystemTime::now(), true)
            .await
            .unwrap();

        assert_eq!(summary.series, 2);
        assert_eq!(summary.series_dropped, 5);
        assert_eq!(summary.shards_completed, 1);

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn unwaited_flush_completes_in_background() {
        let serializer = Arc::new(RecordingSerializer {
            sketches_disabled: true,
            ..Default::default()
        });
        let harness = harness(Arc::clone(&serializer), 2);

        for shard in &harness.shards {
            assert!(shard.send(ShardMessage::LateMetrics(late_batch(3))).await.is_ok());
        }

        assert!(harness
            .coordinator
            .force_flush_to_serializer(SystemTime::now(), false)
            .await
            .is_none());

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while serializer.series().len() < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(serializer.series().len(), 6);
        assert!(serializer.sketches().is_empty());

        harness.shutdown.cancel();
    }
}
