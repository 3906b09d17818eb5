use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    error::GenericError,
    generic_error,
    metrics::{
        iterable::{SerieSource, SketchesSource},
        Event, Serie, ServiceCheck, SketchSeries,
    },
    serializer::MetricSerializer,
};

/// Serializer that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingSerializer {
    pub series: Mutex<Vec<Serie>>,
    pub sketches: Mutex<Vec<SketchSeries>>,
    pub events: Mutex<Vec<Event>>,
    pub service_checks: Mutex<Vec<ServiceCheck>>,

    /// Series consumed before failing, if set.
    pub fail_series_after: Option<usize>,
    pub sketches_disabled: bool,
}

impl RecordingSerializer {
    pub fn series(&self) -> Vec<Serie> {
        self.series.lock().unwrap().clone()
    }

    pub fn sketches(&self) -> Vec<SketchSeries> {
        self.sketches.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricSerializer for RecordingSerializer {
    fn are_sketches_enabled(&self) -> bool {
        !self.sketches_disabled
    }

    async fn send_iterable_series(&self, series: &mut SerieSource) -> Result<(), GenericError> {
        let mut consumed = 0;
        while let Some(serie) = series.next().await {
            self.series.lock().unwrap().push(serie);
            consumed += 1;
            if self.fail_series_after == Some(consumed) {
                return Err(generic_error!("intake unavailable"));
            }
        }
        Ok(())
    }

    async fn send_iterable_sketches(&self, sketches: &mut SketchesSource) -> Result<(), GenericError> {
        while let Some(sketch) = sketches.next().await {
            self.sketches.lock().unwrap().push(sketch);
        }
        Ok(())
    }

    async fn send_events(&self, events: Vec<Event>) -> Result<(), GenericError> {
        self.events.lock().unwrap().extend(events);
        Ok(())
    }

    async fn send_service_checks(&self, service_checks: Vec<ServiceCheck>) -> Result<(), GenericError> {
        self.service_checks.lock().unwrap().extend(service_checks);
        Ok(())
    }
}
