//! DogStatsD metric line parsing.
//!
//! A metric line has the shape `<name>:<value>[:<value>...]|<type>[|@<sample rate>][|#<tag>,<tag>...][|T<timestamp>]`.
//! Extensions may come in any order, and unknown extensions are skipped.
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::map_res,
    sequence::{separated_pair, terminated},
    IResult, Parser as _,
};
use snafu::Snafu;

use crate::metrics::{MetricSample, MetricType};

/// A DogStatsD parsing error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseError {
    /// The line is not a well-formed metric line.
    #[snafu(display("Invalid metric line '{}': {}", line, reason))]
    InvalidLine {
        /// The offending line, lossily decoded.
        line: String,

        /// What was wrong with it.
        reason: &'static str,
    },

    /// The line is a valid DogStatsD message, but not a metric.
    #[snafu(display("Unsupported DogStatsD message kind '{}'.", kind))]
    Unsupported {
        /// Message kind.
        kind: &'static str,
    },
}

fn invalid(line: &[u8], reason: &'static str) -> ParseError {
    ParseError::InvalidLine {
        line: String::from_utf8_lossy(line).into_owned(),
        reason,
    }
}

/// Splits `input` at the first `delimiter`, returning the chunk before it and the remainder after it.
///
/// Returns `None` once `input` is empty.
pub fn split_at_delimiter(input: &[u8], delimiter: u8) -> Option<(&[u8], &[u8])> {
    match memchr::memchr(delimiter, input) {
        Some(index) => Some((&input[..index], &input[index + 1..])),
        None if input.is_empty() => None,
        None => Some((input, &[])),
    }
}

fn metric_name(input: &[u8]) -> IResult<&[u8], &str> {
    let valid_char = |c: u8| c > 31 && c < 128 && c != b':' && c != b'|';
    map_res(take_while1(valid_char), std::str::from_utf8).parse(input)
}

fn raw_metric_values(input: &[u8]) -> IResult<&[u8], (MetricType, &[u8])> {
    let (remaining, raw_values) = terminated(take_while1(|b: u8| b != b'|'), tag("|")).parse(input)?;
    let (remaining, raw_kind) = alt((tag("g"), tag("c"), tag("ms"), tag("h"), tag("s"), tag("d"))).parse(remaining)?;

    let metric_type = match raw_kind {
        b"g" => MetricType::Gauge,
        b"c" => MetricType::Counter,
        b"s" => MetricType::Set,
        b"d" => MetricType::Distribution,
        // Timers are histograms of durations.
        _ => MetricType::Histogram,
    };

    Ok((remaining, (metric_type, raw_values)))
}

/// Parses a single metric line, appending one sample per value to `out`.
///
/// Returns the number of samples appended.
///
/// # Errors
///
/// If the line is malformed, or is an event or service check, an error is returned and nothing is appended.
pub fn parse_metric_line(line: &[u8], out: &mut Vec<MetricSample>) -> Result<usize, ParseError> {
    if line.starts_with(b"_e{") {
        return Err(ParseError::Unsupported { kind: "event" });
    }
    if line.starts_with(b"_sc|") {
        return Err(ParseError::Unsupported { kind: "service check" });
    }

    let (remaining, (name, (metric_type, raw_values))) = separated_pair(metric_name, tag(":"), raw_metric_values)
        .parse(line)
        .map_err(|_| invalid(line, "expected '<name>:<value>|<type>'"))?;

    let mut sample_rate = 1.0;
    let mut tags = Vec::new();
    let mut timestamp = None;

    if !remaining.is_empty() {
        let Some(mut remaining) = remaining.strip_prefix(b"|") else {
            return Err(invalid(line, "unknown metric type"));
        };

        while let Some((chunk, tail)) = split_at_delimiter(remaining, b'|') {
            match chunk.first() {
                Some(b'@') => {
                    sample_rate = parse_str::<f64>(&chunk[1..])
                        .filter(|rate| *rate > 0.0 && *rate <= 1.0)
                        .ok_or_else(|| invalid(line, "sample rate must be in (0, 1]"))?;
                }
                Some(b'#') => {
                    let raw_tags = std::str::from_utf8(&chunk[1..]).map_err(|_| invalid(line, "tags must be UTF-8"))?;
                    tags.extend(raw_tags.split(',').filter(|tag| !tag.is_empty()).map(str::to_string));
                }
                Some(b'T') => {
                    timestamp = Some(parse_str::<u64>(&chunk[1..]).ok_or_else(|| invalid(line, "invalid timestamp"))?);
                }
                _ => {}
            }

            remaining = tail;
        }
    }

    let values = std::str::from_utf8(raw_values).map_err(|_| invalid(line, "values must be UTF-8"))?;
    let start = out.len();
    for raw_value in values.split(':') {
        let sample = match metric_type {
            MetricType::Set => MetricSample::set_member(name, raw_value),
            _ => match raw_value.parse::<f64>() {
                Ok(value) if value.is_finite() => MetricSample::new(name, value, metric_type),
                _ => {
                    out.truncate(start);
                    return Err(invalid(line, "invalid numeric value"));
                }
            },
        };

        let sample = sample.with_tags(tags.iter().cloned()).with_sample_rate(sample_rate);
        out.push(match timestamp {
            Some(timestamp) => sample.with_timestamp(timestamp),
            None => sample,
        });
    }

    Ok(out.len() - start)
}

fn parse_str<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
