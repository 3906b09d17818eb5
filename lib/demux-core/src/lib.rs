//! Metrics demultiplexer.
//!
//! Samples submitted by checks, by DogStatsD clients, or directly by the host process are routed by context to a fixed
//! set of aggregation shards. Each shard aggregates its samples into fixed-width time windows, and periodic flushes
//! stream the resulting series and sketches to a [`MetricSerializer`][serializer::MetricSerializer].
//!
//! [`AgentDemultiplexer`] is the entry point.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod checks;
pub mod config;
pub mod containers;
pub mod demux;
pub mod error;
pub mod flush;
pub mod hash;
pub mod listener;
pub mod metrics;
pub mod router;
pub mod sampler;
pub mod sender;
pub mod serializer;
pub mod task;
pub mod time;
pub mod topology;

#[cfg(test)]
mod test_util;

pub use self::demux::{AgentDemultiplexer, DemultiplexerConfiguration, DemultiplexerState};
pub use self::sender::{CheckId, Sender, SenderError};
pub use self::topology::Topology;
