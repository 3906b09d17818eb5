//! Internal telemetry.
//!
//! Metrics emitted by the demultiplexer are captured by an in-process recorder and periodically written to the log.

use std::time::Duration;

use demux_core::{error::GenericError, generic_error};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshot, Snapshotter};
use tokio::time::sleep;
use tracing::debug;

/// Installs the global metrics recorder, returning a handle for reading its current state.
///
/// Must be called before the demultiplexer is built, as metric handles are registered against whichever recorder is
/// installed at that point.
///
/// ## Errors
///
/// If a global recorder was already installed, an error is returned.
pub fn initialize_metrics() -> Result<Snapshotter, GenericError> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .map_err(|_| generic_error!("Global metrics recorder already installed."))?;

    Ok(snapshotter)
}

/// Writes every recorded metric to the log, once per `interval`.
pub async fn report_metrics(snapshotter: Snapshotter, interval: Duration) {
    loop {
        sleep(interval).await;

        for (name, value) in render_snapshot(snapshotter.snapshot()) {
            debug!(metric = %name, value = %value, "Internal metric.");
        }
    }
}

fn render_snapshot(snapshot: Snapshot) -> Vec<(String, String)> {
    let mut rendered = snapshot
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| {
            let key = key.key();
            let mut name = key.name().to_string();
            let labels = key
                .labels()
                .map(|label| format!("{}:{}", label.key(), label.value()))
                .collect::<Vec<_>>();
            if !labels.is_empty() {
                name = format!("{}{{{}}}", name, labels.join(","));
            }

            let value = match value {
                DebugValue::Counter(value) => value.to_string(),
                DebugValue::Gauge(value) => value.into_inner().to_string(),
                DebugValue::Histogram(values) => {
                    let sum = values.iter().map(|v| v.into_inner()).sum::<f64>();
                    format!("count={} sum={}", values.len(), sum)
                }
            };

            (name, value)
        })
        .collect::<Vec<_>>();
    rendered.sort();
    rendered
}

#[cfg(test)]
mod tests {
    use demux_core::metrics::MetricSamplePool;
    use metrics::{counter, histogram};

    use super::*;

    fn find<'a>(rendered: &'a [(String, String)], name: &str) -> &'a str {
        rendered
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("no metric named {}", name))
    }

    #[test]
    fn renders_recorded_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let pool = MetricSamplePool::new(8, 4);
            let batch = pool.get();
            pool.put(batch);

            counter!("listener_packets_total", "listener" => "udp").increment(3);
            histogram!("flush_duration_seconds").record(0.5);
            histogram!("flush_duration_seconds").record(1.5);
        });

        let rendered = render_snapshot(snapshotter.snapshot());
        assert_eq!(find(&rendered, "metric_sample_pool_acquired_total"), "1");
        assert_eq!(find(&rendered, "metric_sample_pool_released_total"), "1");
        assert_eq!(find(&rendered, "listener_packets_total{listener:udp}"), "3");
        assert_eq!(find(&rendered, "flush_duration_seconds"), "count=2 sum=2");

        let mut names = rendered.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
        names.dedup();
        assert_eq!(names.len(), rendered.len());
    }
}
