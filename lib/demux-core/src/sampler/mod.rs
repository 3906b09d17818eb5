//! Time sampler shards.
//!
//! Each shard owns a time-bucketed aggregation state and runs on its own task. Everything a shard does happens in
//! response to a message on its bounded channel: samples are aggregated, late metrics are queued for pass-through, and
//! flush triggers drain closed buckets into the trigger's sinks. Since the channel is FIFO, a flush always observes
//! every sample enqueued before its trigger.
use std::time::Instant;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    metrics::{
        iterable::{SerieSink, SketchesSink},
        MetricSampleBatch, MetricSamplePool,
    },
    time::get_unix_timestamp,
};

mod state;
use self::state::{flush_late_metric, AggregationState, Flushed};

mod trigger;
pub use self::trigger::{FlushTrigger, ShardFlushStats, Trigger};

/// A message processed by a shard.
pub enum ShardMessage {
    /// Samples to aggregate into the current window.
    Samples(MetricSampleBatch),

    /// Timestamped samples to forward as-is on the next flush.
    LateMetrics(MetricSampleBatch),

    /// A flush request.
    Flush(FlushTrigger),
}

/// Sending half of a shard's channel.
#[derive(Clone)]
pub struct ShardHandle {
    id: usize,
    tx: mpsc::Sender<ShardMessage>,
}

impl ShardHandle {
    /// Shard identifier.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Sends a message to the shard, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// If the shard has stopped, the message is handed back.
    pub async fn send(&self, message: ShardMessage) -> Result<(), ShardMessage> {
        self.tx.send(message).await.map_err(|e| e.0)
    }
}

/// Creates the channel for a shard, returning the handle used to feed it and the receiver the shard runs on.
pub fn shard_channel(id: usize, queue_size: usize) -> (ShardHandle, mpsc::Receiver<ShardMessage>) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    (ShardHandle { id, tx }, rx)
}

#[derive(Clone)]
struct Telemetry {
    samples_received: Counter,
    samples_dropped: Counter,
    late_metrics_received: Counter,
    series_flushed: Counter,
    sketches_flushed: Counter,
    active_contexts: Gauge,
    flush_duration: Histogram,
}

impl Telemetry {
    fn new(shard_id: usize) -> Self {
        let shard = shard_id.to_string();
        Self {
            samples_received: counter!("aggregator_samples_received_total", "shard" => shard.clone()),
            samples_dropped: counter!("aggregator_samples_dropped_total", "shard" => shard.clone()),
            late_metrics_received: counter!("aggregator_late_metrics_received_total", "shard" => shard.clone()),
            series_flushed: counter!("aggregator_series_flushed_total", "shard" => shard.clone()),
            sketches_flushed: counter!("aggregator_sketches_flushed_total", "shard" => shard.clone()),
            active_contexts: gauge!("aggregator_active_contexts", "shard" => shard.clone()),
            flush_duration: histogram!("aggregator_shard_flush_duration_seconds", "shard" => shard),
        }
    }

    #[cfg(test)]
    fn noop() -> Self {
        Self {
            samples_received: Counter::noop(),
            samples_dropped: Counter::noop(),
            late_metrics_received: Counter::noop(),
            series_flushed: Counter::noop(),
            sketches_flushed: Counter::noop(),
            active_contexts: Gauge::noop(),
            flush_duration: Histogram::noop(),
        }
    }
}

/// A single aggregation pipeline.
pub struct TimeSamplerShard {
    id: usize,
    state: AggregationState,
    pool: MetricSamplePool,
    telemetry: Telemetry,
}

impl TimeSamplerShard {
    /// Creates a shard aggregating into windows of `bucket_width_secs`, returning consumed batches to `pool`.
    pub fn new(id: usize, bucket_width_secs: u64, pool: MetricSamplePool) -> Self {
        Self {
            id,
            state: AggregationState::new(bucket_width_secs),
            pool,
            telemetry: Telemetry::new(id),
        }
    }

    /// Processes messages until the channel closes or `shutdown` is cancelled.
    ///
    /// Pending flush triggers are dropped on shutdown, which releases any requester waiting on them.
    pub async fn run(mut self, mut messages: mpsc::Receiver<ShardMessage>, shutdown: CancellationToken) {
        debug!(shard = self.id, "Time sampler shard started.");

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                maybe_message = messages.recv() => match maybe_message {
                    Some(message) => self.process_message(message).await,
                    None => break,
                },
            }
        }

        debug!(shard = self.id, "Time sampler shard stopped.");
    }

    async fn process_message(&mut self, message: ShardMessage) {
        match message {
            ShardMessage::Samples(batch) => self.insert_samples(get_unix_timestamp(), batch),
            ShardMessage::LateMetrics(batch) => self.insert_late_metrics(get_unix_timestamp(), batch),
            ShardMessage::Flush(trigger) => {
                self.flush(trigger).await;
            }
        }
    }

    fn insert_samples(&mut self, timestamp: u64, mut batch: MetricSampleBatch) {
        self.telemetry.samples_received.increment(batch.len() as u64);

        for sample in batch.drain(..) {
            if sample.is_late() {
                self.telemetry.late_metrics_received.increment(1);
                self.state.insert_late(sample);
            } else if !self.state.insert(timestamp, sample) {
                trace!(shard = self.id, "Dropping sample with conflicting metric type.");
                self.telemetry.samples_dropped.increment(1);
            }
        }

        self.telemetry.active_contexts.set(self.state.active_contexts() as f64);
        self.pool.put(batch);
    }

    fn insert_late_metrics(&mut self, timestamp: u64, mut batch: MetricSampleBatch) {
        self.telemetry.late_metrics_received.increment(batch.len() as u64);

        // Late metrics without a timestamp are stamped with their receive time.
        for mut sample in batch.drain(..) {
            sample.timestamp.get_or_insert(timestamp);
            self.state.insert_late(sample);
        }

        self.pool.put(batch);
    }

    async fn flush(&mut self, flush_trigger: FlushTrigger) -> ShardFlushStats {
        let started = Instant::now();
        let FlushTrigger {
            trigger,
            mut series_sink,
            mut sketches_sink,
        } = flush_trigger;

        let (buckets, late) = self.state.take_closed(trigger.time);
        let bucket_width = self.state.bucket_width();

        let mut stats = ShardFlushStats {
            buckets: buckets.len(),
            late_metrics: late.len(),
            ..Default::default()
        };
        let mut flushed = Vec::new();

        for bucket in buckets {
            let bucket_start = bucket.start();
            for (context, metric) in bucket.into_contexts() {
                metric.flush_into(context, bucket_start, bucket_width, &mut flushed);
                emit(&mut flushed, &mut series_sink, &mut sketches_sink, &mut stats).await;
            }
        }

        for sample in late {
            if !flush_late_metric(sample, &mut flushed) {
                self.telemetry.samples_dropped.increment(1);
            }
            emit(&mut flushed, &mut series_sink, &mut sketches_sink, &mut stats).await;
        }

        if let Some(sink) = series_sink {
            sink.sender_stopped().await;
        }
        if let Some(sink) = sketches_sink {
            sink.sender_stopped().await;
        }

        self.telemetry.series_flushed.increment(stats.series);
        self.telemetry.sketches_flushed.increment(stats.sketches);
        self.telemetry.active_contexts.set(self.state.active_contexts() as f64);
        self.telemetry.flush_duration.record(started.elapsed().as_secs_f64());

        debug!(
            shard = self.id,
            timestamp = trigger.time,
            buckets = stats.buckets,
            late_metrics = stats.late_metrics,
            series = stats.series,
            sketches = stats.sketches,
            wait_for_serializer = trigger.wait_for_serializer,
            "Flushed shard."
        );

        if let Some(block_tx) = trigger.block_tx {
            if block_tx.send(stats).is_err() {
                warn!(shard = self.id, "Flush requester went away before the flush completed.");
            }
        }

        stats
    }
}

async fn emit(
    flushed: &mut Vec<Flushed>, series_sink: &mut Option<SerieSink>, sketches_sink: &mut Option<SketchesSink>,
    stats: &mut ShardFlushStats,
) {
    for item in flushed.drain(..) {
        match item {
            Flushed::Series(serie) => {
                if let Some(sink) = series_sink {
                    sink.append(serie).await;
                    stats.series += 1;
                }
            }
            Flushed::Sketch(sketch) => {
                if let Some(sink) = sketches_sink {
                    sink.append(sketch).await;
                    stats.sketches += 1;
                }
            }
        }
    }
}
