use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use metrics::{counter, gauge, Counter, Gauge};

use super::MetricSample;

/// A batch of metric samples headed for the same shard.
///
/// Batches are acquired from a [`MetricSamplePool`] and are exclusively owned by whoever holds them. Returning a batch
/// with [`MetricSamplePool::put`] moves it back into the pool, so nothing else can observe the storage afterwards.
#[derive(Debug, Default, PartialEq)]
pub struct MetricSampleBatch {
    samples: Vec<MetricSample>,
}

impl MetricSampleBatch {
    /// Creates an empty batch with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Consumes the batch, returning the underlying samples.
    pub fn into_inner(self) -> Vec<MetricSample> {
        self.samples
    }
}

impl From<Vec<MetricSample>> for MetricSampleBatch {
    fn from(samples: Vec<MetricSample>) -> Self {
        Self { samples }
    }
}

impl Deref for MetricSampleBatch {
    type Target = Vec<MetricSample>;

    fn deref(&self) -> &Self::Target {
        &self.samples
    }
}

impl DerefMut for MetricSampleBatch {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.samples
    }
}

impl FromIterator<MetricSample> for MetricSampleBatch {
    fn from_iter<I: IntoIterator<Item = MetricSample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone)]
struct PoolTelemetry {
    acquired: Counter,
    reused: Counter,
    released: Counter,
    discarded: Counter,
    idle: Gauge,
}

impl PoolTelemetry {
    fn new() -> Self {
        Self {
            acquired: counter!("metric_sample_pool_acquired_total"),
            reused: counter!("metric_sample_pool_reused_total"),
            released: counter!("metric_sample_pool_released_total"),
            discarded: counter!("metric_sample_pool_discarded_total"),
            idle: gauge!("metric_sample_pool_idle_batches"),
        }
    }
}

struct PoolState {
    idle: Mutex<Vec<Vec<MetricSample>>>,
    batch_capacity: usize,
    max_idle: usize,
    telemetry: PoolTelemetry,
}

/// A pool of reusable metric sample batches.
///
/// The ingestion path acquires a batch, fills it, and hands it to a shard; the shard returns it once every sample has
/// been consumed. Reusing the storage avoids allocating a fresh buffer for every batch on a path that handles a high
/// volume of samples. The pool holds at most `max_idle` batches: anything returned beyond that is dropped.
///
/// Cloning the pool is cheap and yields a handle to the same storage.
#[derive(Clone)]
pub struct MetricSamplePool {
    state: Arc<PoolState>,
}

impl MetricSamplePool {
    /// Creates a new pool handing out batches with room for `batch_capacity` samples, retaining at most `max_idle`
    /// returned batches.
    pub fn new(batch_capacity: usize, max_idle: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                idle: Mutex::new(Vec::new()),
                batch_capacity: batch_capacity.max(1),
                max_idle,
                telemetry: PoolTelemetry::new(),
            }),
        }
    }

    /// Capacity of freshly allocated batches.
    pub fn batch_capacity(&self) -> usize {
        self.state.batch_capacity
    }

    /// Acquires an empty batch, reusing a returned one if available.
    pub fn get(&self) -> MetricSampleBatch {
        let telemetry = &self.state.telemetry;
        telemetry.acquired.increment(1);

        let maybe_idle = {
            let mut idle = self.state.idle.lock().unwrap_or_else(|e| e.into_inner());
            let maybe_idle = idle.pop();
            telemetry.idle.set(idle.len() as f64);
            maybe_idle
        };

        match maybe_idle {
            Some(mut samples) => {
                telemetry.reused.increment(1);

                // Batches are cleared on return, but an acquired batch must never expose a previous owner's samples.
                samples.clear();
                MetricSampleBatch { samples }
            }
            None => MetricSampleBatch::with_capacity(self.state.batch_capacity),
        }
    }

    /// Returns a batch to the pool.
    ///
    /// The batch is cleared before being stored.
    pub fn put(&self, batch: MetricSampleBatch) {
        let telemetry = &self.state.telemetry;
        telemetry.released.increment(1);

        let mut samples = batch.samples;
        samples.clear();

        let mut idle = self.state.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.state.max_idle {
            idle.push(samples);
        } else {
            telemetry.discarded.increment(1);
        }
        telemetry.idle.set(idle.len() as f64);
    }

    /// Number of batches currently held by the pool.
    pub fn idle_len(&self) -> usize {
        self.state.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricType;

    #[test]
    fn fresh_batch_is_empty_with_capacity() {
        let pool = MetricSamplePool::new(16, 4);
        let batch = pool.get();

        assert!(batch.is_empty());
        assert!(batch.capacity() >= 16);
    }

    #[test]
    fn returned_batch_is_reused_without_residual_samples() {
        let pool = MetricSamplePool::new(4, 4);

        let mut batch = pool.get();
        for i in 0..100 {
            batch.push(MetricSample::new("queue.depth", i as f64, MetricType::Gauge));
        }
        let grown_capacity = batch.capacity();
        let storage = batch.as_ptr();
        pool.put(batch);
        assert_eq!(pool.idle_len(), 1);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), grown_capacity);
        assert_eq!(reused.as_ptr(), storage);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn idle_batches_are_bounded() {
        let pool = MetricSamplePool::new(4, 2);
        let batches = (0..5).map(|_| pool.get()).collect::<Vec<_>>();
        for batch in batches {
            pool.put(batch);
        }

        assert_eq!(pool.idle_len(), 2);
    }

    #[test]
    fn clones_share_storage() {
        let pool = MetricSamplePool::new(4, 2);
        let other = pool.clone();

        pool.put(pool.get());
        assert_eq!(other.idle_len(), 1);
    }
}
