//! Routing of samples and check payloads into the aggregation pipelines.
use std::sync::Arc;

use metrics::{counter, Counter};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    metrics::{CheckPayload, MetricSample, MetricSampleBatch, MetricSamplePool},
    sampler::{ShardHandle, ShardMessage},
};

#[derive(Clone)]
struct Telemetry {
    samples_dropped: Counter,
    payloads_dropped: Counter,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            samples_dropped: counter!("demultiplexer_samples_dropped_total"),
            payloads_dropped: counter!("demultiplexer_check_payloads_dropped_total"),
        }
    }
}

/// Hands samples to shards and check payloads to the check payload buffer.
///
/// Cloning is cheap. Every producer path (senders, listener workers, direct ingestion) goes through a router, so a
/// given context always lands on the same shard.
#[derive(Clone)]
pub struct SampleRouter {
    shards: Arc<[ShardHandle]>,
    pool: MetricSamplePool,
    payloads: mpsc::Sender<CheckPayload>,
    telemetry: Telemetry,
}

impl SampleRouter {
    /// Creates a router over the given shards.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is empty.
    pub fn new(shards: Vec<ShardHandle>, pool: MetricSamplePool, payloads: mpsc::Sender<CheckPayload>) -> Self {
        assert!(!shards.is_empty(), "at least one shard is required");

        Self {
            shards: shards.into(),
            pool,
            payloads,
            telemetry: Telemetry::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &MetricSamplePool {
        &self.pool
    }

    /// Returns the shard a context hash maps to.
    pub fn shard_for_hash(&self, context_hash: u64) -> usize {
        (context_hash % self.shards.len() as u64) as usize
    }

    /// Sends a batch of windowed samples to a shard.
    ///
    /// Shard identifiers beyond the shard count wrap around. If the shard has stopped, the samples are dropped and the
    /// batch returned to the pool.
    pub async fn send_samples(&self, shard: usize, batch: MetricSampleBatch) {
        self.send_batch(shard, batch, ShardMessage::Samples).await
    }

    /// Sends a batch of late metrics to a shard.
    pub async fn send_late_metrics(&self, shard: usize, batch: MetricSampleBatch) {
        self.send_batch(shard, batch, ShardMessage::LateMetrics).await
    }

    async fn send_batch<F>(&self, shard: usize, batch: MetricSampleBatch, wrap: F)
    where
        F: FnOnce(MetricSampleBatch) -> ShardMessage,
    {
        if batch.is_empty() {
            self.pool.put(batch);
            return;
        }

        let handle = &self.shards[shard % self.shards.len()];
        if let Err(message) = handle.send(wrap(batch)).await {
            if let ShardMessage::Samples(batch) | ShardMessage::LateMetrics(batch) = message {
                debug!(
                    shard = handle.id(),
                    samples = batch.len(),
                    "Shard is not running. Dropping samples."
                );
                self.telemetry.samples_dropped.increment(batch.len() as u64);
                self.pool.put(batch);
            }
        }
    }

    /// Routes samples to shards by context hash.
    ///
    /// Samples with an explicit timestamp take the late metric path. Samples are grouped into pooled batches, one per
    /// destination shard and path, which are sent as they fill up.
    pub async fn route_by_context<I>(&self, samples: I)
    where
        I: IntoIterator<Item = MetricSample>,
    {
        self.route_with(samples, false).await
    }

    /// Routes samples to shards by context hash, sending all of them down the late metric path.
    pub async fn route_late_by_context<I>(&self, samples: I)
    where
        I: IntoIterator<Item = MetricSample>,
    {
        self.route_with(samples, true).await
    }

    async fn route_with<I>(&self, samples: I, force_late: bool)
    where
        I: IntoIterator<Item = MetricSample>,
    {
        let shard_count = self.shards.len();
        let batch_capacity = self.pool.batch_capacity();
        let mut windowed: Vec<Option<MetricSampleBatch>> = (0..shard_count).map(|_| None).collect();
        let mut late: Vec<Option<MetricSampleBatch>> = (0..shard_count).map(|_| None).collect();

        for sample in samples {
            let shard = self.shard_for_hash(sample.context_hash());
            let is_late = force_late || sample.is_late();
            let pending = if is_late { &mut late[shard] } else { &mut windowed[shard] };

            let batch = pending.get_or_insert_with(|| self.pool.get());
            batch.push(sample);

            if batch.len() >= batch_capacity {
                if let Some(full) = pending.take() {
                    if is_late {
                        self.send_late_metrics(shard, full).await;
                    } else {
                        self.send_samples(shard, full).await;
                    }
                }
            }
        }

        for (shard, batch) in windowed.into_iter().enumerate() {
            if let Some(batch) = batch {
                self.send_samples(shard, batch).await;
            }
        }
        for (shard, batch) in late.into_iter().enumerate() {
            if let Some(batch) = batch {
                self.send_late_metrics(shard, batch).await;
            }
        }
    }

    /// Hands events and service checks to the check payload buffer.
    pub async fn send_check_payloads<I>(&self, payloads: I)
    where
        I: IntoIterator<Item = CheckPayload>,
    {
        for payload in payloads {
            if self.payloads.send(payload).await.is_err() {
                debug!("Check payload buffer is not running. Dropping payload.");
                self.telemetry.payloads_dropped.increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::MetricType, sampler::shard_channel};

    fn router(shard_count: usize) -> (SampleRouter, Vec<mpsc::Receiver<ShardMessage>>, mpsc::Receiver<CheckPayload>) {
        let (handles, receivers) = (0..shard_count).map(|id| shard_channel(id, 64)).unzip::<_, _, Vec<_>, Vec<_>>();
        let (payloads_tx, payloads_rx) = mpsc::channel(8);
        let router = SampleRouter::new(handles, MetricSamplePool::new(2, 8), payloads_tx);
        (router, receivers, payloads_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ShardMessage>) -> (Vec<MetricSample>, Vec<MetricSample>) {
        let mut windowed = Vec::new();
        let mut late = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                ShardMessage::Samples(batch) => windowed.extend(batch.into_inner()),
                ShardMessage::LateMetrics(batch) => late.extend(batch.into_inner()),
                ShardMessage::Flush(_) => panic!("unexpected flush"),
            }
        }
        (windowed, late)
    }

    #[tokio::test]
    async fn same_context_lands_on_same_shard() {
        let (router, mut receivers, _payloads) = router(4);

        let samples = (0..10).map(|i| {
            MetricSample::new("requests", i as f64, MetricType::Counter).with_tags(if i % 2 == 0 {
                ["a:1", "b:2"]
            } else {
                ["b:2", "a:1"]
            })
        });
        router.route_by_context(samples).await;

        let counts = receivers
            .iter_mut()
            .map(|rx| drain(rx).0.len())
            .collect::<Vec<_>>();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert_eq!(counts.iter().filter(|count| **count > 0).count(), 1);
    }

    #[tokio::test]
    async fn timestamped_samples_take_late_path() {
        let (router, mut receivers, _payloads) = router(1);

        router
            .route_by_context([
                MetricSample::new("a", 1.0, MetricType::Gauge),
                MetricSample::new("b", 1.0, MetricType::Gauge).with_timestamp(10),
                MetricSample::new("c", 1.0, MetricType::Gauge).with_timestamp(11),
            ])
            .await;

        let (windowed, late) = drain(&mut receivers[0]);
        assert_eq!(windowed.len(), 1);
        assert_eq!(late.len(), 2);
    }

    #[tokio::test]
    async fn late_routing_ignores_timestamps() {
        let (router, mut receivers, _payloads) = router(1);

        router
            .route_late_by_context([
                MetricSample::new("a", 1.0, MetricType::Gauge),
                MetricSample::new("b", 1.0, MetricType::Gauge).with_timestamp(10),
            ])
            .await;

        let (windowed, late) = drain(&mut receivers[0]);
        assert!(windowed.is_empty());
        assert_eq!(late.len(), 2);
    }

    #[tokio::test]
    async fn stopped_shard_drops_and_recycles_batch() {
        let (router, receivers, _payloads) = router(2);
        drop(receivers);

        let batch = MetricSampleBatch::from(vec![MetricSample::new("a", 1.0, MetricType::Gauge)]);
        router.send_samples(5, batch).await;
        assert_eq!(router.pool().idle_len(), 1);
    }

    #[tokio::test]
    async fn check_payloads_are_forwarded() {
        use crate::metrics::{ServiceCheck, ServiceCheckStatus};

        let (router, _receivers, mut payloads) = router(1);
        let check = ServiceCheck {
            name: "db.can_connect".to_string(),
            status: ServiceCheckStatus::Ok,
            tags: Vec::new(),
            host: None,
            message: None,
            timestamp: 1,
        };
        router.send_check_payloads([CheckPayload::ServiceCheck(check.clone())]).await;

        assert_eq!(payloads.recv().await, Some(CheckPayload::ServiceCheck(check)));
    }
}
