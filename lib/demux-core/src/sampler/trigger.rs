use tokio::sync::oneshot;

use crate::metrics::iterable::{SerieSink, SketchesSink};

/// Per-shard outcome of a flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ShardFlushStats {
    /// Number of series appended to the series sink.
    pub series: u64,

    /// Number of sketch series appended to the sketches sink.
    pub sketches: u64,

    /// Number of closed buckets drained.
    pub buckets: usize,

    /// Number of late metrics drained.
    pub late_metrics: usize,
}

/// A request to act at a given point in time.
#[derive(Debug)]
pub struct Trigger {
    /// Logical flush time, as a Unix timestamp in seconds.
    pub time: u64,

    /// Completion channel, if the requester waits for the flush to complete.
    pub block_tx: Option<oneshot::Sender<ShardFlushStats>>,

    /// Whether the requester also waits for the serializer to consume the flushed data.
    pub wait_for_serializer: bool,
}

/// A flush request sent to a single shard.
///
/// Sinks are absent when the serializer has disabled the corresponding payload kind.
pub struct FlushTrigger {
    /// Timing and completion contract.
    pub trigger: Trigger,

    /// Destination for flushed series.
    pub series_sink: Option<SerieSink>,

    /// Destination for flushed sketches.
    pub sketches_sink: Option<SketchesSink>,
}
