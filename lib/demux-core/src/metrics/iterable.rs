//! Streaming hand-off between a flush and the serializer.
//!
//! A flush produces series incrementally while a separate routine sends them, so the full flush output never needs to
//! be materialized in memory. The producing half ([`IterableSink`]) accumulates items into small buffers and pushes
//! full buffers over a bounded channel; the consuming half ([`IterableSource`]) yields items one at a time. Memory is
//! bounded by `buffer_size * (channel_size + 2)` items regardless of how many items are flushed in total.
//!
//! The producer signals that no more items are coming by calling [`IterableSink::sender_stopped`]. The consumer sees
//! the end of the stream once that has happened and every buffered item has been yielded, at which point
//! [`IterableSource::count`] is final.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use super::{Serie, SketchSeries};

/// Callback invoked for every item yielded by an [`IterableSource`].
pub type ItemCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Producing half for series.
pub type SerieSink = IterableSink<Serie>;

/// Consuming half for series.
pub type SerieSource = IterableSource<Serie>;

/// Producing half for sketches.
pub type SketchesSink = IterableSink<SketchSeries>;

/// Consuming half for sketches.
pub type SketchesSource = IterableSource<SketchSeries>;

/// Creates a connected sink/source pair.
///
/// Items are handed over in buffers of `buffer_size` items, with at most `channel_size` buffers in flight. Both values
/// are clamped to at least one. The callback, if any, is invoked for each item as it is yielded by the source.
pub fn iterable<T>(
    callback: Option<ItemCallback<T>>, buffer_size: usize, channel_size: usize,
) -> (IterableSink<T>, IterableSource<T>) {
    let buffer_size = buffer_size.max(1);
    let (tx, rx) = mpsc::channel(channel_size.max(1));

    let sink = IterableSink {
        tx,
        buffer: Vec::with_capacity(buffer_size),
        buffer_size,
    };
    let source = IterableSource {
        rx,
        current: Vec::new().into_iter(),
        callback,
        count: 0,
    };

    (sink, source)
}

/// Producing half of an iterable hand-off.
pub struct IterableSink<T> {
    tx: mpsc::Sender<Vec<T>>,
    buffer: Vec<T>,
    buffer_size: usize,
}

impl<T> IterableSink<T> {
    /// Appends an item.
    ///
    /// Waits for the consumer to make room if the channel is full.
    pub async fn append(&mut self, item: T) {
        self.buffer.push(item);
        if self.buffer.len() >= self.buffer_size {
            self.send_buffer().await;
        }
    }

    /// Signals that no more items will be appended, handing over any partially-filled buffer.
    ///
    /// The source observes the end of the stream once it has yielded every item appended before this call.
    pub async fn sender_stopped(mut self) {
        if !self.buffer.is_empty() {
            self.send_buffer().await;
        }
    }

    async fn send_buffer(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.buffer_size));
        let buffer_len = buffer.len();
        if self.tx.send(buffer).await.is_err() {
            debug!(dropped = buffer_len, "Iterable source dropped before sink was stopped. Discarding items.");
        }
    }
}

impl<T> Drop for IterableSink<T> {
    fn drop(&mut self) {
        // Only reachable with a non-empty buffer if the sink was dropped without `sender_stopped`.
        if !self.buffer.is_empty() {
            let buffer = std::mem::take(&mut self.buffer);
            let buffer_len = buffer.len();
            if self.tx.try_send(buffer).is_err() {
                debug!(dropped = buffer_len, "Iterable sink dropped with pending items. Discarding items.");
            }
        }
    }
}

/// Consuming half of an iterable hand-off.
pub struct IterableSource<T> {
    rx: mpsc::Receiver<Vec<T>>,
    current: std::vec::IntoIter<T>,
    callback: Option<ItemCallback<T>>,
    count: u64,
}

impl<T> IterableSource<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the sink has been stopped (or dropped) and every item has been yielded.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.current.next() {
                self.count += 1;
                if let Some(callback) = &self.callback {
                    callback(&item);
                }
                return Some(item);
            }

            match self.rx.recv().await {
                Some(buffer) => self.current = buffer.into_iter(),
                None => return None,
            }
        }
    }

    /// Number of items yielded so far.
    ///
    /// Final once [`next`][Self::next] has returned `None`.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Discards every remaining item without yielding it, waiting for the sink to stop.
    ///
    /// Returns the number of items discarded. Discarded items do not contribute to [`count`][Self::count].
    pub async fn drain(&mut self) -> u64 {
        let mut discarded = self.current.len() as u64;
        self.current = Vec::new().into_iter();

        while let Some(buffer) = self.rx.recv().await {
            discarded += buffer.len() as u64;
        }

        discarded
    }
}
