//! upload-rate library - adaptive bitrate control and upload throughput probing for live streams

pub mod config;
pub mod error;
pub mod probe;
pub mod stats;
pub mod strategy;
pub mod transport;

// Re-export commonly used types
pub use config::{
    ConnectFailurePolicy, NetworkType, PayloadSchedule, ProbeConfig, ProbeOptions,
    RateControlConfig, RateControlOptions,
};
pub use error::{ProbeError, TransportError};
pub use probe::{BenchmarkResult, ChannelSink, ProbeEvent, ResultSink, ThroughputProbe};
pub use strategy::{AdaptiveRateController, BitrateAdjuster, RateAdjustment, RateSample};
pub use transport::{TcpPublisher, TransportPublisher};
