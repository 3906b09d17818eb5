//! Serializer boundary.
use async_trait::async_trait;

use crate::{
    error::GenericError,
    metrics::{
        iterable::{SerieSource, SketchesSource},
        Event, ServiceCheck,
    },
};

/// Consumer of flushed data.
///
/// Implementations encode and forward payloads. Series and sketches are streamed: the serializer pulls from the source
/// until it is exhausted, while the flush that feeds it is still running.
#[async_trait]
pub trait MetricSerializer: Send + Sync {
    /// Whether series should be produced at all.
    fn are_series_enabled(&self) -> bool {
        true
    }

    /// Whether sketches should be produced at all.
    fn are_sketches_enabled(&self) -> bool {
        true
    }

    /// Consumes a stream of series.
    ///
    /// # Errors
    ///
    /// If the series cannot be sent, an error is returned. Any items left in the source are then discarded by the
    /// caller.
    async fn send_iterable_series(&self, series: &mut SerieSource) -> Result<(), GenericError>;

    /// Consumes a stream of sketches.
    ///
    /// # Errors
    ///
    /// If the sketches cannot be sent, an error is returned. Any items left in the source are then discarded by the
    /// caller.
    async fn send_iterable_sketches(&self, sketches: &mut SketchesSource) -> Result<(), GenericError>;

    /// Sends events.
    ///
    /// # Errors
    ///
    /// If the events cannot be sent, an error is returned.
    async fn send_events(&self, events: Vec<Event>) -> Result<(), GenericError>;

    /// Sends service checks.
    ///
    /// # Errors
    ///
    /// If the service checks cannot be sent, an error is returned.
    async fn send_service_checks(&self, service_checks: Vec<ServiceCheck>) -> Result<(), GenericError>;
}
