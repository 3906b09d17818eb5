use async_trait::async_trait;
use demux_core::{
    error::GenericError,
    metrics::{
        iterable::{SerieSource, SketchesSource},
        Event, ServiceCheck,
    },
    serializer::MetricSerializer,
};
use tracing::{debug, info};

/// Serializer that writes everything it is handed to the log.
pub struct LoggingSerializer;

#[async_trait]
impl MetricSerializer for LoggingSerializer {
    async fn send_iterable_series(&self, series: &mut SerieSource) -> Result<(), GenericError> {
        while let Some(serie) = series.next().await {
            debug!(serie = %serie, "Serie.");
        }

        info!(series = series.count(), "Flushed series.");
        Ok(())
    }

    async fn send_iterable_sketches(&self, sketches: &mut SketchesSource) -> Result<(), GenericError> {
        while let Some(sketch) = sketches.next().await {
            debug!(sketch = %sketch, "Sketch.");
        }

        info!(sketches = sketches.count(), "Flushed sketches.");
        Ok(())
    }

    async fn send_events(&self, events: Vec<Event>) -> Result<(), GenericError> {
        for event in &events {
            debug!(title = %event.title, host = ?event.host, "Event.");
        }

        info!(events = events.len(), "Flushed events.");
        Ok(())
    }

    async fn send_service_checks(&self, service_checks: Vec<ServiceCheck>) -> Result<(), GenericError> {
        for service_check in &service_checks {
            debug!(name = %service_check.name, status = ?service_check.status, "Service check.");
        }

        info!(service_checks = service_checks.len(), "Flushed service checks.");
        Ok(())
    }
}
