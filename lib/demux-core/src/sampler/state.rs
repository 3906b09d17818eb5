use hashbrown::hash_map::Entry;

use crate::{
    hash::{FastHashMap, FastHashSet},
    metrics::{Context, MetricSample, MetricType, SampleValue, Serie, SerieKind, Sketch, SketchSeries},
    time::align_to_bucket_start,
};

/// Output of flushing a single context.
#[derive(Debug, PartialEq)]
pub(crate) enum Flushed {
    Series(Serie),
    Sketch(SketchSeries),
}

/// Aggregated value of a single context within a bucket.
#[derive(Debug)]
pub(crate) enum ContextMetric {
    Gauge(f64),
    Counter(f64),
    MonotonicCount(f64),
    Rate { sum: f64, count: u64 },
    Set(FastHashSet<String>),
    Histogram(Sketch),
    Distribution(Sketch),
}

impl ContextMetric {
    fn empty(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Gauge => Self::Gauge(0.0),
            MetricType::Counter => Self::Counter(0.0),
            MetricType::MonotonicCount => Self::MonotonicCount(0.0),
            MetricType::Rate => Self::Rate { sum: 0.0, count: 0 },
            MetricType::Set => Self::Set(FastHashSet::default()),
            MetricType::Histogram => Self::Histogram(Sketch::default()),
            MetricType::Distribution => Self::Distribution(Sketch::default()),
        }
    }

    fn metric_type(&self) -> MetricType {
        match self {
            Self::Gauge(_) => MetricType::Gauge,
            Self::Counter(_) => MetricType::Counter,
            Self::MonotonicCount(_) => MetricType::MonotonicCount,
            Self::Rate { .. } => MetricType::Rate,
            Self::Set(_) => MetricType::Set,
            Self::Histogram(_) => MetricType::Histogram,
            Self::Distribution(_) => MetricType::Distribution,
        }
    }

    /// Merges a sample in. Returns `false` if the sample's value does not fit this metric.
    fn add(&mut self, sample: MetricSample) -> bool {
        if sample.metric_type != self.metric_type() {
            return false;
        }

        match (self, sample.value) {
            (Self::Set(members), SampleValue::SetMember(member)) => {
                members.insert(member);
            }
            (Self::Set(_), SampleValue::Number(_)) | (_, SampleValue::SetMember(_)) => return false,
            (Self::Gauge(last), SampleValue::Number(value)) => *last = value,
            (Self::Counter(sum), SampleValue::Number(value)) => *sum += scale_by_sample_rate(value, sample.sample_rate),
            (Self::MonotonicCount(sum), SampleValue::Number(value)) => *sum += value,
            (Self::Rate { sum, count }, SampleValue::Number(value)) => {
                *sum += value;
                *count += 1;
            }
            (Self::Histogram(sketch), SampleValue::Number(value))
            | (Self::Distribution(sketch), SampleValue::Number(value)) => sketch.insert(value, sample.sample_rate),
        }

        true
    }

    /// Converts the aggregated value into serializer-ready output.
    ///
    /// An `interval` of zero marks a late metric: counts are then reported as absolute counts rather than per-second
    /// rates.
    pub fn flush_into(self, context: Context, timestamp: u64, interval: u64, out: &mut Vec<Flushed>) {
        let (name, tags, host) = context.into_parts();
        let serie = |name: String, kind: SerieKind, value: f64| {
            Flushed::Series(Serie {
                name,
                tags: tags.clone(),
                host: host.clone(),
                kind,
                points: vec![(timestamp, value)],
                interval,
            })
        };

        match self {
            Self::Gauge(value) => out.push(serie(name, SerieKind::Gauge, value)),
            Self::Counter(sum) if interval > 0 => out.push(serie(name, SerieKind::Rate, sum / interval as f64)),
            Self::Counter(sum) | Self::MonotonicCount(sum) => out.push(serie(name, SerieKind::Count, sum)),
            Self::Rate { sum, count } => {
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                out.push(serie(name, SerieKind::Rate, avg));
            }
            Self::Set(members) => out.push(serie(name, SerieKind::Gauge, members.len() as f64)),
            Self::Histogram(sketch) => {
                if let (Some(max), Some(min), Some(avg)) = (sketch.max(), sketch.min(), sketch.avg()) {
                    let count = sketch.count() as f64;
                    let (count_kind, count_value) = if interval > 0 {
                        (SerieKind::Rate, count / interval as f64)
                    } else {
                        (SerieKind::Count, count)
                    };

                    out.push(serie(format!("{}.max", name), SerieKind::Gauge, max));
                    out.push(serie(format!("{}.min", name), SerieKind::Gauge, min));
                    out.push(serie(format!("{}.avg", name), SerieKind::Gauge, avg));
                    out.push(serie(format!("{}.count", name), count_kind, count_value));
                    out.push(serie(format!("{}.sum", name), SerieKind::Gauge, sketch.sum()));
                }
            }
            Self::Distribution(sketch) => {
                if sketch.count() > 0 {
                    out.push(Flushed::Sketch(SketchSeries {
                        name,
                        tags,
                        host,
                        points: vec![(timestamp, sketch)],
                        interval,
                    }));
                }
            }
        }
    }
}

fn scale_by_sample_rate(value: f64, sample_rate: f64) -> f64 {
    if sample_rate > 0.0 && sample_rate < 1.0 {
        value / sample_rate
    } else {
        value
    }
}

/// A closed time window, taken out of the aggregation state by a flush.
pub(crate) struct Bucket {
    start: u64,
    contexts: FastHashMap<Context, ContextMetric>,
}

impl Bucket {
    fn new(start: u64) -> Self {
        Self {
            start,
            contexts: FastHashMap::default(),
        }
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn into_contexts(self) -> impl Iterator<Item = (Context, ContextMetric)> {
        self.contexts.into_iter()
    }
}

/// Time-bucketed aggregation state of a single shard, plus its pass-through list of late metrics.
pub(crate) struct AggregationState {
    buckets: Vec<Bucket>,
    bucket_width: u64,
    late: Vec<MetricSample>,
}

impl AggregationState {
    pub fn new(bucket_width: u64) -> Self {
        Self {
            buckets: Vec::with_capacity(2),
            bucket_width: bucket_width.max(1),
            late: Vec::new(),
        }
    }

    pub const fn bucket_width(&self) -> u64 {
        self.bucket_width
    }

    pub fn active_contexts(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    #[cfg(test)]
    pub fn late_len(&self) -> usize {
        self.late.len()
    }

    fn get_or_create_bucket(&mut self, timestamp: u64) -> &mut Bucket {
        let bucket_start = align_to_bucket_start(timestamp, self.bucket_width);
        let idx = match self.buckets.iter().position(|bucket| bucket.start == bucket_start) {
            Some(idx) => idx,
            None => {
                self.buckets.push(Bucket::new(bucket_start));
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    /// Aggregates a windowed sample received at `timestamp`.
    ///
    /// Returns `false` if the sample was dropped because its context is already aggregated with a different type.
    pub fn insert(&mut self, timestamp: u64, sample: MetricSample) -> bool {
        let context = sample.context();
        let bucket = self.get_or_create_bucket(timestamp);
        match bucket.contexts.entry(context) {
            Entry::Occupied(mut entry) => entry.get_mut().add(sample),
            Entry::Vacant(entry) => {
                let mut metric = ContextMetric::empty(sample.metric_type);
                if metric.add(sample) {
                    entry.insert(metric);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Adds a late metric to the pass-through list.
    pub fn insert_late(&mut self, sample: MetricSample) {
        self.late.push(sample);
    }

    /// Takes every bucket that starts before the bucket containing `flush_timestamp`, oldest first, along with every
    /// late metric.
    pub fn take_closed(&mut self, flush_timestamp: u64) -> (Vec<Bucket>, Vec<MetricSample>) {
        let cutoff = align_to_bucket_start(flush_timestamp, self.bucket_width);

        let (mut closed, open) = std::mem::take(&mut self.buckets)
            .into_iter()
            .partition::<Vec<_>, _>(|bucket| bucket.start < cutoff);
        self.buckets = open;
        closed.sort_unstable_by_key(Bucket::start);

        (closed, std::mem::take(&mut self.late))
    }
}

/// Converts a late metric into serializer-ready output, keeping its original timestamp.
///
/// Returns `false` if the sample's value does not fit its type.
pub(crate) fn flush_late_metric(sample: MetricSample, out: &mut Vec<Flushed>) -> bool {
    let context = sample.context();
    let timestamp = sample.timestamp.unwrap_or_default();

    let mut metric = ContextMetric::empty(sample.metric_type);
    if !metric.add(sample) {
        return false;
    }
    metric.flush_into(context, timestamp, 0, out);
    true
}
