//! Metric data model.
use std::fmt;

use crate::hash::hash_single_fast;

mod check_payload;
pub use self::check_payload::{CheckPayload, Event, ServiceCheck, ServiceCheckStatus};

pub mod iterable;

mod pool;
pub use self::pool::{MetricSampleBatch, MetricSamplePool};

mod series;
pub use self::series::{Serie, SerieKind, Sketch, SketchSeries};

/// Metric type, as submitted by a producer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricType {
    /// Last value wins.
    Gauge,

    /// Values are summed and reported per second.
    Counter,

    /// Values are summed and reported as an absolute count.
    MonotonicCount,

    /// Values are averaged and reported per second.
    Rate,

    /// Unique values are counted.
    Set,

    /// Values are summarized agent-side into several series.
    Histogram,

    /// Values are summarized into a sketch.
    Distribution,
}

impl MetricType {
    /// Returns the type's name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::MonotonicCount => "monotonic_count",
            Self::Rate => "rate",
            Self::Set => "set",
            Self::Histogram => "histogram",
            Self::Distribution => "distribution",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric value.
///
/// Sets carry their member as a string, everything else is numeric.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleValue {
    /// A numeric value.
    Number(f64),

    /// A set member.
    SetMember(String),
}

/// A single metric sample.
///
/// Samples without a timestamp are aggregated into time windows. Samples with a timestamp are "late" metrics: they
/// bypass windowing and are forwarded with the timestamp they were submitted with.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,

    /// Metric value.
    pub value: SampleValue,

    /// Metric type.
    pub metric_type: MetricType,

    /// Tags, in `key:value` form. Order and duplicates are not significant.
    pub tags: Vec<String>,

    /// Hostname the sample is attributed to, if any.
    pub host: Option<String>,

    /// Sample rate the value was submitted with, in `(0, 1]`.
    pub sample_rate: f64,

    /// Explicit Unix timestamp, in seconds.
    pub timestamp: Option<u64>,
}

impl MetricSample {
    /// Creates a numeric sample with no tags, no host, and no timestamp.
    pub fn new<N>(name: N, value: f64, metric_type: MetricType) -> Self
    where
        N: Into<String>,
    {
        Self {
            name: name.into(),
            value: SampleValue::Number(value),
            metric_type,
            tags: Vec::new(),
            host: None,
            sample_rate: 1.0,
            timestamp: None,
        }
    }

    /// Creates a set sample.
    pub fn set_member<N, M>(name: N, member: M) -> Self
    where
        N: Into<String>,
        M: Into<String>,
    {
        Self {
            value: SampleValue::SetMember(member.into()),
            ..Self::new(name, 0.0, MetricType::Set)
        }
    }

    /// Sets the tags.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the host.
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.host = Some(host.into());
        self
    }

    /// Sets an explicit timestamp, making this a late metric.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Returns `true` if the sample carries an explicit timestamp.
    pub fn is_late(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Returns the numeric value, or `None` for set members.
    pub fn numeric_value(&self) -> Option<f64> {
        match &self.value {
            SampleValue::Number(value) => Some(*value),
            SampleValue::SetMember(_) => None,
        }
    }

    /// Returns the sample's context.
    pub fn context(&self) -> Context {
        Context::new(&self.name, &self.tags, self.host.as_deref())
    }

    /// Returns a hash of the sample's context, suitable for picking a shard.
    ///
    /// Samples sharing a context always hash identically, regardless of tag order.
    pub fn context_hash(&self) -> u64 {
        hash_single_fast(self.context())
    }
}

/// Aggregation key: metric name, normalized tags, and host.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Context {
    name: String,
    tags: Vec<String>,
    host: Option<String>,
}

impl Context {
    /// Creates a context, sorting and de-duplicating the tags.
    pub fn new(name: &str, tags: &[String], host: Option<&str>) -> Self {
        let mut tags = tags.to_vec();
        tags.sort_unstable();
        tags.dedup();

        Self {
            name: name.to_string(),
            tags,
            host: host.map(str::to_string),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Host.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Consumes the context, returning its parts.
    pub fn into_parts(self) -> (String, Vec<String>, Option<String>) {
        (self.name, self.tags, self.host)
    }
}
