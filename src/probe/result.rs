//! Round measurements and aggregated benchmark results

use std::time::Duration;

use serde::Serialize;

use crate::stats::median;

const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

/// Shortest duration a round is assumed to take (1 ns)
const MIN_ELAPSED_SECONDS: f64 = 1e-9;

/// Speed in megabits per second (1 megabit = 1024×1024 bits)
pub fn speed_mbps(bytes: u64, elapsed_seconds: f64) -> f64 {
    let bits = bytes as f64 * 8.0;
    bits / elapsed_seconds.max(MIN_ELAPSED_SECONDS) / BITS_PER_MEGABIT
}

/// One timed send-and-measure cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputRound {
    /// Zero-based round index
    pub round: usize,
    pub payload_size_bytes: u64,
    pub elapsed_seconds: f64,
    pub speed_mbps: f64,
    /// Bytes the OS reported as transmitted during the round
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_tx_bytes: Option<u64>,
    /// Speed derived from `system_tx_bytes`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_speed_mbps: Option<f64>,
}

impl ThroughputRound {
    pub fn new(
        round: usize,
        payload_size_bytes: u64,
        elapsed: Duration,
        system_tx_bytes: Option<u64>,
    ) -> Self {
        let elapsed_seconds = elapsed.as_secs_f64();
        Self {
            round,
            payload_size_bytes,
            elapsed_seconds,
            speed_mbps: speed_mbps(payload_size_bytes, elapsed_seconds),
            system_tx_bytes,
            system_speed_mbps: system_tx_bytes.map(|b| speed_mbps(b, elapsed_seconds)),
        }
    }
}

/// Outcome of a complete benchmark run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    pub rounds: Vec<ThroughputRound>,
    pub median_speed_mbps: f64,
}

impl BenchmarkResult {
    pub fn from_rounds(rounds: Vec<ThroughputRound>) -> Self {
        let speeds: Vec<f64> = rounds.iter().map(|r| r.speed_mbps).collect();
        Self {
            median_speed_mbps: median(&speeds),
            rounds,
        }
    }
}
