//! Adaptive bitrate strategy module
//!
//! Per-frame rate control driven by transmission telemetry, plus passive
//! interval estimation of the achieved upload bitrate and an adjuster that
//! applies estimates on network changes and congestion.

mod adaptive;
mod adjuster;
mod estimator;
mod telemetry;

pub use adaptive::{AdaptiveRateController, RateAdjustment};
pub use adjuster::{AdjusterConfig, BitrateAdjuster};
pub use estimator::{EstimatorConfig, IntervalBitrateEstimator};
pub use telemetry::{BitrateState, RateSample};
