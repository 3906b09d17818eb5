//! Sizing of the ingestion and aggregation routines.
use std::fmt;

use tracing::{info, warn};

const MINIMUM_WORKER_COUNT: usize = 2;
const MINIMUM_PIPELINE_COUNT: usize = 1;

/// How many ingestion workers and aggregation pipelines (time sampler shards) to run.
///
/// Always holds `worker_count >= 2` and `pipeline_count >= 1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Topology {
    worker_count: usize,
    pipeline_count: usize,
}

impl Topology {
    /// Computes the topology for the current host.
    ///
    /// The vCPU count is read from the host, while the pipeline settings come from configuration.
    pub fn from_host(manual_pipeline_count: i64, auto_adjust: bool) -> Self {
        let vcpus = num_cpus::get();
        let topology = worker_and_pipeline_count(vcpus, manual_pipeline_count, auto_adjust);

        info!(
            vcpus,
            auto_adjust,
            worker_count = topology.worker_count,
            pipeline_count = topology.pipeline_count,
            "Computed demultiplexer topology."
        );

        topology
    }

    /// Number of ingestion worker routines.
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of aggregation pipelines (time sampler shards).
    pub const fn pipeline_count(&self) -> usize {
        self.pipeline_count
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workers={} pipelines={}", self.worker_count, self.pipeline_count)
    }
}

/// Computes how many ingestion workers and aggregation pipelines to run for the given number of vCPUs.
///
/// Without auto-adjustment, the configured pipeline count is used as-is (a non-positive value falls back to a single
/// pipeline), one core is left for the listener, one per pipeline, and the remaining cores go to workers.
///
/// With auto-adjustment, half of the cores go to workers and one fewer than that to pipelines. Any manually configured
/// pipeline count is ignored.
pub fn worker_and_pipeline_count(vcpus: usize, manual_pipeline_count: i64, auto_adjust: bool) -> Topology {
    if !auto_adjust {
        let pipeline_count = if manual_pipeline_count <= 0 {
            MINIMUM_PIPELINE_COUNT
        } else {
            usize::try_from(manual_pipeline_count).unwrap_or(usize::MAX)
        };

        let worker_count = vcpus.saturating_sub(1).saturating_sub(pipeline_count);

        return Topology {
            worker_count: worker_count.max(MINIMUM_WORKER_COUNT),
            pipeline_count,
        };
    }

    let worker_count = (vcpus / 2).max(MINIMUM_WORKER_COUNT);
    let pipeline_count = (worker_count - 1).max(MINIMUM_PIPELINE_COUNT);

    if manual_pipeline_count > 1 {
        warn!(
            configured = manual_pipeline_count,
            pipeline_count, "DogStatsD pipeline count value ignored since 'dogstatsd_pipeline_autoadjust' is enabled."
        );
    }

    Topology {
        worker_count,
        pipeline_count,
    }
}
