//! Upload throughput probe
//!
//! Pushes synthetic media payloads through a [`TransportPublisher`](crate::transport::TransportPublisher)
//! on a dedicated worker thread, times each round and reports the median speed.

mod payload;
mod result;
mod runner;
mod sink;
mod watchdog;

pub use payload::{part_sizes, SyntheticPayload};
pub use result::{speed_mbps, BenchmarkResult, ThroughputRound};
pub use runner::{ProbeLifecycleFlags, ProbeOutcome, ProbeState, ThroughputProbe};
pub use sink::{ChannelSink, ProbeEvent, ResultSink};
pub use watchdog::Watchdog;
