use std::fmt;

/// Largest number of values a single sample can stand for.
const MAX_SAMPLE_WEIGHT: u64 = 1_000_000_000;

/// Kind of an aggregated series, as understood by the intake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SerieKind {
    /// Point-in-time value.
    Gauge,

    /// Absolute count over the interval.
    Count,

    /// Per-second rate over the interval.
    Rate,
}

impl SerieKind {
    /// Returns the kind's name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Count => "count",
            Self::Rate => "rate",
        }
    }
}

/// An aggregated, serializer-ready series.
#[derive(Clone, Debug, PartialEq)]
pub struct Serie {
    /// Metric name.
    pub name: String,

    /// Normalized tags.
    pub tags: Vec<String>,

    /// Hostname, if any.
    pub host: Option<String>,

    /// Series kind.
    pub kind: SerieKind,

    /// Data points, as `(unix timestamp, value)`.
    pub points: Vec<(u64, f64)>,

    /// Interval the points cover, in seconds. Zero for late metrics.
    pub interval: u64,
}

impl fmt::Display for Serie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}} {}", self.name, self.tags.join(","), self.kind.as_str())?;
        if let Some(host) = &self.host {
            write!(f, " host={}", host)?;
        }
        for (timestamp, value) in &self.points {
            write!(f, " [{} {}]", timestamp, value)?;
        }
        Ok(())
    }
}

/// Summary of a distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sketch {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for Sketch {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Sketch {
    /// Inserts a value, weighted by `1 / sample_rate`.
    pub fn insert(&mut self, value: f64, sample_rate: f64) {
        let weight = sample_weight(sample_rate);
        self.count = self.count.saturating_add(weight);
        self.sum += value * weight as f64;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Number of values inserted.
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all values inserted.
    pub const fn sum(&self) -> f64 {
        self.sum
    }

    /// Smallest value inserted, if any.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest value inserted, if any.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Average of all values inserted, if any.
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Converts a sample rate into the number of values a single sample stands for, capped at `MAX_SAMPLE_WEIGHT`.
pub(crate) fn sample_weight(sample_rate: f64) -> u64 {
    if sample_rate > 0.0 && sample_rate < 1.0 {
        (1.0 / sample_rate).round().min(MAX_SAMPLE_WEIGHT as f64) as u64
    } else {
        1
    }
}

/// An aggregated, serializer-ready sketch series.
#[derive(Clone, Debug, PartialEq)]
pub struct SketchSeries {
    /// Metric name.
    pub name: String,

    /// Normalized tags.
    pub tags: Vec<String>,

    /// Hostname, if any.
    pub host: Option<String>,

    /// Sketches, as `(unix timestamp, sketch)`.
    pub points: Vec<(u64, Sketch)>,

    /// Interval the sketches cover, in seconds. Zero for late metrics.
    pub interval: u64,
}

impl fmt::Display for SketchSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.name, self.tags.join(","))?;
        if let Some(host) = &self.host {
            write!(f, " host={}", host)?;
        }
        for (timestamp, sketch) in &self.points {
            write!(f, " [{} count={} sum={}]", timestamp, sketch.count(), sketch.sum())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sketch_summary() {
        let mut sketch = Sketch::default();
        assert_eq!(sketch.min(), None);
        assert_eq!(sketch.avg(), None);

        sketch.insert(2.0, 1.0);
        sketch.insert(6.0, 1.0);
        assert_eq!(sketch.count(), 2);
        assert_eq!(sketch.min(), Some(2.0));
        assert_eq!(sketch.max(), Some(6.0));
        assert_eq!(sketch.avg(), Some(4.0));

        sketch.insert(10.0, 0.5);
        assert_eq!(sketch.count(), 4);
        assert_eq!(sketch.sum(), 28.0);
        assert_eq!(sketch.max(), Some(10.0));
    }

    #[test]
    fn tiny_sample_rates_do_not_overflow_count() {
        let mut sketch = Sketch::default();
        for _ in 0..5 {
            sketch.insert(1.0, 1e-20);
        }
        assert_eq!(sketch.count(), 5 * MAX_SAMPLE_WEIGHT);

        sketch.count = u64::MAX - 1;
        sketch.insert(1.0, 1e-20);
        assert_eq!(sketch.count(), u64::MAX);
    }

    #[test]
    fn sample_weights() {
        assert_eq!(sample_weight(1.0), 1);
        assert_eq!(sample_weight(0.5), 2);
        assert_eq!(sample_weight(0.1), 10);
        assert_eq!(sample_weight(0.0), 1);
        assert_eq!(sample_weight(-3.0), 1);
        assert_eq!(sample_weight(1e-20), MAX_SAMPLE_WEIGHT);
        assert_eq!(sample_weight(f64::MIN_POSITIVE), MAX_SAMPLE_WEIGHT);
    }
}
