use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{
    config::GenericConfiguration, error::GenericError, flush::FlushSettings, listener::ListenerSettings,
};

const fn default_pipeline_count() -> i64 {
    1
}

const fn default_flush_interval_secs() -> u64 {
    15
}

const fn default_bucket_width_secs() -> u64 {
    10
}

const fn default_shard_queue_size() -> usize {
    100
}

const fn default_flush_buffer_size() -> usize {
    4000
}

const fn default_flush_channel_size() -> usize {
    200
}

const fn default_pool_batch_size() -> usize {
    32
}

const fn default_pool_max_idle() -> usize {
    1024
}

const fn default_dogstatsd_port() -> u16 {
    8125
}

const fn default_dogstatsd_buffer_size() -> usize {
    8192
}

const fn default_dogstatsd_queue_size() -> usize {
    1024
}

/// Demultiplexer configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct DemultiplexerConfiguration {
    /// Number of aggregation pipelines to run when not auto-adjusting.
    ///
    /// Non-positive values fall back to a single pipeline.
    ///
    /// Defaults to 1.
    #[serde(
        rename = "dogstatsd_pipeline_count",
        alias = "pipeline_count",
        default = "default_pipeline_count"
    )]
    pub(super) pipeline_count: i64,

    /// Whether to size the pipelines from the number of vCPUs, ignoring `dogstatsd_pipeline_count`.
    ///
    /// Defaults to `false`.
    #[serde(rename = "dogstatsd_pipeline_autoadjust", alias = "pipeline_autoadjust", default)]
    pub(super) pipeline_autoadjust: bool,

    /// How often to flush, in seconds.
    ///
    /// Defaults to 15 seconds.
    #[serde(rename = "aggregator_flush_interval", default = "default_flush_interval_secs")]
    pub(super) flush_interval_secs: u64,

    /// Width of the aggregation windows, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "aggregator_bucket_width", default = "default_bucket_width_secs")]
    pub(super) bucket_width_secs: u64,

    /// Number of messages queued per shard before producers wait.
    ///
    /// Defaults to 100.
    #[serde(rename = "aggregator_shard_queue_size", default = "default_shard_queue_size")]
    pub(super) shard_queue_size: usize,

    /// Number of flushed items handed to the serializer at a time.
    ///
    /// Defaults to 4000.
    #[serde(
        rename = "aggregator_flush_metrics_and_serialize_in_parallel_buffer_size",
        default = "default_flush_buffer_size"
    )]
    pub(super) flush_buffer_size: usize,

    /// Number of item chunks in flight between a shard and the serializer before the shard waits.
    ///
    /// Defaults to 200.
    #[serde(
        rename = "aggregator_flush_metrics_and_serialize_in_parallel_chan_size",
        default = "default_flush_channel_size"
    )]
    pub(super) flush_channel_size: usize,

    /// Whether to log every flushed series and sketch.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub(super) log_payloads: bool,

    /// Default hostname attached to sender submissions that carry none.
    ///
    /// Defaults to empty, which attaches nothing.
    #[serde(default)]
    pub(super) hostname: String,

    /// How long a sender may go without committing before it is removed, in seconds.
    ///
    /// Defaults to 0, which never removes senders.
    #[serde(default)]
    pub(super) sender_expiry_seconds: u64,

    /// Capacity of pooled sample batches.
    ///
    /// Defaults to 32.
    #[serde(default = "default_pool_batch_size")]
    pub(super) metric_sample_pool_batch_size: usize,

    /// Maximum number of idle batches kept by the sample batch pool.
    ///
    /// Defaults to 1024.
    #[serde(default = "default_pool_max_idle")]
    pub(super) metric_sample_pool_max_idle: usize,

    /// UDP port of the DogStatsD listener. Zero disables the listener.
    ///
    /// Defaults to 8125.
    #[serde(default = "default_dogstatsd_port")]
    pub(super) dogstatsd_port: u16,

    /// Whether the DogStatsD listener accepts traffic from other hosts.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub(super) dogstatsd_non_local_traffic: bool,

    /// Receive buffer size of the DogStatsD listener, in bytes.
    ///
    /// Defaults to 8192.
    #[serde(default = "default_dogstatsd_buffer_size")]
    pub(super) dogstatsd_buffer_size: usize,

    /// Number of packets queued between the DogStatsD listener and its workers.
    ///
    /// Defaults to 1024.
    #[serde(default = "default_dogstatsd_queue_size")]
    pub(super) dogstatsd_queue_size: usize,
}

impl DemultiplexerConfiguration {
    /// Creates a new `DemultiplexerConfiguration` from the given configuration.
    ///
    /// Out-of-range values are replaced by their defaults.
    ///
    /// # Errors
    ///
    /// If a value has the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let config: Self = config.as_typed()?;
        Ok(config.sanitized())
    }

    /// Creates a new `DemultiplexerConfiguration` with default values.
    pub fn with_defaults() -> Self {
        Self {
            pipeline_count: default_pipeline_count(),
            pipeline_autoadjust: false,
            flush_interval_secs: default_flush_interval_secs(),
            bucket_width_secs: default_bucket_width_secs(),
            shard_queue_size: default_shard_queue_size(),
            flush_buffer_size: default_flush_buffer_size(),
            flush_channel_size: default_flush_channel_size(),
            log_payloads: false,
            hostname: String::new(),
            sender_expiry_seconds: 0,
            metric_sample_pool_batch_size: default_pool_batch_size(),
            metric_sample_pool_max_idle: default_pool_max_idle(),
            dogstatsd_port: default_dogstatsd_port(),
            dogstatsd_non_local_traffic: false,
            dogstatsd_buffer_size: default_dogstatsd_buffer_size(),
            dogstatsd_queue_size: default_dogstatsd_queue_size(),
        }
    }

    /// Sets the pipeline count and whether it is auto-adjusted.
    pub fn with_pipelines(mut self, pipeline_count: i64, auto_adjust: bool) -> Self {
        self.pipeline_count = pipeline_count;
        self.pipeline_autoadjust = auto_adjust;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = interval.as_secs();
        self.sanitized()
    }

    /// Sets the default hostname.
    pub fn with_hostname<H: Into<String>>(mut self, hostname: H) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the DogStatsD listener port. Zero disables the listener.
    pub fn with_dogstatsd_port(mut self, port: u16) -> Self {
        self.dogstatsd_port = port;
        self
    }

    /// Sets the sender expiry.
    pub fn with_sender_expiry(mut self, expiry: Duration) -> Self {
        self.sender_expiry_seconds = expiry.as_secs();
        self
    }

    /// Pipeline count and auto-adjust flag, as configured.
    pub const fn pipelines(&self) -> (i64, bool) {
        (self.pipeline_count, self.pipeline_autoadjust)
    }

    /// Flush interval.
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Width of the aggregation windows, in seconds.
    pub const fn bucket_width_secs(&self) -> u64 {
        self.bucket_width_secs
    }

    pub(super) fn flush_settings(&self) -> FlushSettings {
        FlushSettings {
            buffer_size: self.flush_buffer_size,
            channel_size: self.flush_channel_size,
            log_payloads: self.log_payloads,
        }
    }

    pub(super) fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            port: self.dogstatsd_port,
            non_local_traffic: self.dogstatsd_non_local_traffic,
            buffer_size: self.dogstatsd_buffer_size,
            queue_size: self.dogstatsd_queue_size,
        }
    }

    fn sanitized(mut self) -> Self {
        if self.flush_interval_secs == 0 {
            warn!(
                default = default_flush_interval_secs(),
                "Flush interval must be at least one second. Using default."
            );
            self.flush_interval_secs = default_flush_interval_secs();
        }
        if self.bucket_width_secs == 0 {
            warn!(
                default = default_bucket_width_secs(),
                "Bucket width must be at least one second. Using default."
            );
            self.bucket_width_secs = default_bucket_width_secs();
        }
        for (name, value, default) in [
            ("aggregator_shard_queue_size", &mut self.shard_queue_size, default_shard_queue_size()),
            (
                "aggregator_flush_metrics_and_serialize_in_parallel_buffer_size",
                &mut self.flush_buffer_size,
                default_flush_buffer_size(),
            ),
            (
                "aggregator_flush_metrics_and_serialize_in_parallel_chan_size",
                &mut self.flush_channel_size,
                default_flush_channel_size(),
            ),
            (
                "metric_sample_pool_batch_size",
                &mut self.metric_sample_pool_batch_size,
                default_pool_batch_size(),
            ),
            ("dogstatsd_buffer_size", &mut self.dogstatsd_buffer_size, default_dogstatsd_buffer_size()),
            ("dogstatsd_queue_size", &mut self.dogstatsd_queue_size, default_dogstatsd_queue_size()),
        ] {
            if *value == 0 {
                warn!(setting = name, default, "Setting must be positive. Using default.");
                *value = default;
            }
        }
        self
    }
}
