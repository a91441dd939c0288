//! Configuration module - rate control and probe settings

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::transport::STREAM_KEY;

/// Size of a single write accepted by the ingest endpoint (200 KiB)
pub const DEFAULT_PART_SIZE_BYTES: usize = 200 * 1024;

/// Socket send buffer used while probing (40 KiB)
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 40 * 1024;

/// Number of bits in one megabit as used by the default bitrate table
const BITS_PER_MEGABIT: i64 = 1024 * 1024;

/// Network link type, used to seed an initial bitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    FourG,
    ThreeG,
    Other,
    /// No usable link; no estimation is started
    NoConnection,
}

impl NetworkType {
    /// Default bitrate (bits per second) for a freshly detected network
    pub fn default_bitrate(&self) -> i64 {
        let megabits = match self {
            Self::Wifi => 3,
            Self::FourG => 2,
            Self::ThreeG | Self::Other | Self::NoConnection => 1,
        };
        megabits * BITS_PER_MEGABIT
    }
}

/// Optional parameters for [`RateControlConfig::new`]
#[derive(Debug, Clone, Default)]
pub struct RateControlOptions {
    /// Minimum time between two applied bitrate changes. `None` applies on every frame.
    pub min_adjustment_interval_ms: Option<u64>,
}

/// Adaptive rate controller configuration
#[derive(Debug, Clone)]
pub struct RateControlConfig {
    pub min_bitrate: i64,
    pub max_bitrate: i64,
    pub initial_bitrate: i64,
    pub min_adjustment_interval_ms: Option<u64>,
}

impl RateControlConfig {
    /// Create a config; the initial bitrate is clamped into `[min_bitrate, max_bitrate]`
    pub fn new(
        min_bitrate: i64,
        max_bitrate: i64,
        initial_bitrate: i64,
        options: RateControlOptions,
    ) -> Result<Self> {
        if min_bitrate <= 0 {
            return Err(anyhow!("min_bitrate must be positive, got {}", min_bitrate));
        }

        if min_bitrate > max_bitrate {
            return Err(anyhow!(
                "min_bitrate ({}) cannot exceed max_bitrate ({})",
                min_bitrate,
                max_bitrate
            ));
        }

        Ok(Self {
            min_bitrate,
            max_bitrate,
            initial_bitrate: initial_bitrate.clamp(min_bitrate, max_bitrate),
            min_adjustment_interval_ms: options.min_adjustment_interval_ms,
        })
    }

    /// Create a config seeded with the default bitrate for `network`
    pub fn for_network(network: NetworkType, min_bitrate: i64, max_bitrate: i64) -> Result<Self> {
        Self::new(
            min_bitrate,
            max_bitrate,
            network.default_bitrate(),
            RateControlOptions::default(),
        )
    }
}

/// What the probe does when connect or publish fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectFailurePolicy {
    /// Deliver `on_error` to the result sink
    #[default]
    Report,
    /// End the run without any callback
    SilentAbort,
}

/// How the payload size evolves between rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadSchedule {
    /// Every round sends the whole buffer
    #[default]
    Full,
    /// Round `i` sends `size / 2^i`
    Halving,
    /// Round `i` sends `size / (i + 1)`
    Divided,
}

impl PayloadSchedule {
    /// Payload size for the zero-based `round`
    pub fn payload_size(&self, total: usize, round: usize) -> usize {
        match self {
            Self::Full => total,
            Self::Halving => total.checked_shr(round as u32).unwrap_or(0),
            Self::Divided => total / (round + 1),
        }
    }
}

impl std::str::FromStr for PayloadSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "halving" => Ok(Self::Halving),
            "divided" => Ok(Self::Divided),
            other => Err(anyhow!("unknown payload schedule: {}", other)),
        }
    }
}

/// Optional parameters for [`ProbeConfig::new`]
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub rounds: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub connect_failure_policy: ConnectFailurePolicy,
    pub payload_schedule: PayloadSchedule,
    pub part_size_bytes: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub stream_key: Option<String>,
}

/// Throughput probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub data_size_bytes: usize,
    pub rounds: usize,
    /// Watchdog timeout; 0 disables it
    pub timeout_secs: u64,
    pub connect_failure_policy: ConnectFailurePolicy,
    pub payload_schedule: PayloadSchedule,
    pub part_size_bytes: usize,
    pub send_buffer_size: usize,
    pub stream_key: String,
}

impl ProbeConfig {
    /// Create a new probe config with the total payload size plus optional settings
    pub fn new(data_size_bytes: usize, options: ProbeOptions) -> Result<Arc<Self>> {
        if data_size_bytes == 0 {
            return Err(anyhow!("data_size_bytes must be greater than zero"));
        }

        let rounds = options.rounds.unwrap_or(1);
        if rounds == 0 {
            return Err(anyhow!("rounds must be at least 1"));
        }

        let part_size_bytes = options.part_size_bytes.unwrap_or(DEFAULT_PART_SIZE_BYTES);
        if part_size_bytes == 0 {
            return Err(anyhow!("part_size_bytes must be greater than zero"));
        }

        let stream_key = options
            .stream_key
            .unwrap_or_else(|| STREAM_KEY.to_string());
        if stream_key.trim().is_empty() {
            return Err(anyhow!("stream_key cannot be empty"));
        }

        Ok(Arc::new(Self {
            data_size_bytes,
            rounds,
            timeout_secs: options.timeout_secs.unwrap_or(0),
            connect_failure_policy: options.connect_failure_policy,
            payload_schedule: options.payload_schedule,
            part_size_bytes,
            send_buffer_size: options.send_buffer_size.unwrap_or(DEFAULT_SEND_BUFFER_SIZE),
            stream_key,
        }))
    }
}
