//! Passive upload bitrate estimation over fixed intervals

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::stats::median;
use crate::transport::TxByteCounter;

/// Skip the first second so TCP slow start does not skew the estimate
const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_TEST_DURATION_MS: u64 = 8_000;
const DEFAULT_INTERVAL_DURATION_MS: u64 = 1_000;
pub const DEFAULT_LOWERING_FACTOR: f64 = 0.9;

/// Estimator settings
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub test_duration_ms: u64,
    pub interval_duration_ms: u64,
    /// Start over after each result instead of finishing
    pub endless: bool,
    /// Scale the result by `lowering_factor`
    pub lower_estimation: bool,
    pub lowering_factor: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            test_duration_ms: DEFAULT_TEST_DURATION_MS,
            interval_duration_ms: DEFAULT_INTERVAL_DURATION_MS,
            endless: false,
            lower_estimation: false,
            lowering_factor: DEFAULT_LOWERING_FACTOR,
        }
    }
}

/// Measures the bitrate a live stream actually achieves.
///
/// Fed from the frame-send path: [`before_frame_sent`](Self::before_frame_sent)
/// opens an interval, [`after_frame_sent`](Self::after_frame_sent) accounts the
/// bytes. Once enough intervals are collected the median bitrate is returned.
pub struct IntervalBitrateEstimator {
    config: EstimatorConfig,
    max_intervals: u64,
    tx_counter: Option<Arc<dyn TxByteCounter>>,

    uploaded_bytes: u64,
    system_bytes_at_start: Option<u64>,
    interval_start: Option<Instant>,
    interval_no: u64,
    /// Bits per second of each completed interval
    bitrates: Vec<f64>,

    finished: bool,
    warmup_until: Option<Instant>,
}

impl IntervalBitrateEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let interval = config.interval_duration_ms.max(1);
        let max_intervals = (config.test_duration_ms / interval).max(1);
        Self {
            config,
            max_intervals,
            tx_counter: None,
            uploaded_bytes: 0,
            system_bytes_at_start: None,
            interval_start: None,
            interval_no: 1,
            bitrates: Vec::new(),
            finished: true,
            warmup_until: None,
        }
    }

    /// Estimate from the OS transmit counter instead of the bytes handed to the stream
    pub fn with_tx_counter(mut self, counter: Arc<dyn TxByteCounter>) -> Self {
        self.tx_counter = Some(counter);
        self
    }

    /// Arm the estimator; measurement begins after the warm-up delay
    pub fn start(&mut self, now: Instant) {
        self.finished = false;
        self.warmup_until = Some(now + INITIAL_DELAY);
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_endless(&self) -> bool {
        self.config.endless
    }

    pub fn before_frame_sent(&mut self, now: Instant) {
        if !self.can_execute(now) {
            return;
        }
        if self.interval_start.is_none() {
            self.open_interval(now);
        }
    }

    /// Account a sent frame. Returns the estimated bitrate (bits/s) when a
    /// measurement completes.
    pub fn after_frame_sent(&mut self, frame_bytes: usize, now: Instant) -> Option<f64> {
        if !self.can_execute(now) {
            return None;
        }

        let start = match self.interval_start {
            Some(start) => start,
            None => {
                self.open_interval(now);
                now
            }
        };

        self.uploaded_bytes += frame_bytes as u64;
        let elapsed = now.saturating_duration_since(start);
        if elapsed.as_millis() as u64 > self.config.interval_duration_ms {
            self.record_interval(elapsed);
            self.interval_no += 1;
            self.reset_interval();
            debug!("Starting estimator interval {}", self.interval_no);
        }

        if self.interval_no <= self.max_intervals {
            return None;
        }

        let median_bitrate = median(&self.bitrates);
        let estimate = if self.config.lower_estimation {
            median_bitrate * self.config.lowering_factor
        } else {
            median_bitrate
        };
        info!(
            "Estimated upload bitrate: {:.3} Mbps (median of {} intervals)",
            estimate / 1024.0 / 1024.0,
            self.bitrates.len()
        );

        if self.config.endless {
            self.reset();
        } else {
            self.finish();
        }
        Some(estimate)
    }

    fn can_execute(&mut self, now: Instant) -> bool {
        if self.finished {
            return false;
        }
        if let Some(until) = self.warmup_until {
            if now < until {
                return false;
            }
            self.warmup_until = None;
            self.reset();
        }
        true
    }

    fn open_interval(&mut self, now: Instant) {
        self.interval_start = Some(now);
        self.system_bytes_at_start = self.tx_counter.as_ref().and_then(|c| c.total_tx_bytes());
    }

    fn record_interval(&mut self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let stream_rate = self.uploaded_bytes as f64 / seconds;
        if stream_rate <= 0.0 {
            return;
        }

        let system_rate = match (&self.tx_counter, self.system_bytes_at_start) {
            (Some(counter), Some(before)) => counter
                .total_tx_bytes()
                .map(|after| after.saturating_sub(before) as f64 / seconds),
            _ => None,
        };

        let bits_per_sec = system_rate.unwrap_or(stream_rate) * 8.0;
        debug!(
            "Interval bitrate: stream={:.3} Mbps, system={:?}",
            stream_rate * 8.0 / 1024.0 / 1024.0,
            system_rate.map(|r| r * 8.0 / 1024.0 / 1024.0)
        );
        self.bitrates.push(bits_per_sec);
    }

    fn reset(&mut self) {
        self.interval_no = 1;
        self.bitrates.clear();
        self.reset_interval();
    }

    fn reset_interval(&mut self) {
        self.uploaded_bytes = 0;
        self.interval_start = None;
        self.system_bytes_at_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(test_ms: u64, interval_ms: u64) -> EstimatorConfig {
        EstimatorConfig {
            test_duration_ms: test_ms,
            interval_duration_ms: interval_ms,
            ..EstimatorConfig::default()
        }
    }

    /// Send `frame_bytes` every `step_ms` until a result or `max_frames`
    fn drive(
        estimator: &mut IntervalBitrateEstimator,
        t0: Instant,
        frame_bytes: usize,
        step_ms: u64,
        max_frames: u64,
    ) -> Option<f64> {
        for i in 0..max_frames {
            let now = t0 + Duration::from_millis(i * step_ms);
            estimator.before_frame_sent(now);
            if let Some(result) = estimator.after_frame_sent(frame_bytes, now + Duration::from_millis(step_ms)) {
                return Some(result);
            }
        }
        None
    }

    #[test]
    fn test_not_started_ignores_frames() {
        let mut estimator = IntervalBitrateEstimator::new(config(2_000, 1_000));
        let t0 = Instant::now();
        assert!(drive(&mut estimator, t0, 1000, 100, 100).is_none());
        assert!(estimator.is_finished());
    }

    #[test]
    fn test_frames_during_warmup_are_ignored() {
        let mut estimator = IntervalBitrateEstimator::new(config(2_000, 1_000));
        let t0 = Instant::now();
        estimator.start(t0);

        estimator.before_frame_sent(t0);
        assert!(estimator
            .after_frame_sent(1_000_000, t0 + Duration::from_millis(500))
            .is_none());
        assert_eq!(estimator.uploaded_bytes, 0);
        assert!(estimator.interval_start.is_none());
    }

    #[test]
    fn test_constant_rate_estimate() {
        let mut estimator = IntervalBitrateEstimator::new(config(2_000, 1_000));
        let t0 = Instant::now();
        estimator.start(t0);

        // 10 KB per 100 ms after warm-up
        let result = drive(&mut estimator, t0 + INITIAL_DELAY, 10_000, 100, 100).unwrap();

        // Each interval closes after 11 frames of 100 ms: 110 KB over 1.1 s
        let expected = 110_000.0 / 1.1 * 8.0;
        assert!((result - expected).abs() / expected < 1e-9);
        assert!(estimator.is_finished());
    }

    #[test]
    fn test_lowered_estimate() {
        let mut estimator = IntervalBitrateEstimator::new(EstimatorConfig {
            lower_estimation: true,
            ..config(2_000, 1_000)
        });
        let t0 = Instant::now();
        estimator.start(t0);

        let result = drive(&mut estimator, t0 + INITIAL_DELAY, 10_000, 100, 100).unwrap();
        let expected = 110_000.0 / 1.1 * 8.0 * DEFAULT_LOWERING_FACTOR;
        assert!((result - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn test_endless_restarts_after_result() {
        let mut estimator = IntervalBitrateEstimator::new(EstimatorConfig {
            endless: true,
            ..config(2_000, 1_000)
        });
        let t0 = Instant::now();
        estimator.start(t0);

        let start = t0 + INITIAL_DELAY;
        assert!(drive(&mut estimator, start, 10_000, 100, 100).is_some());
        assert!(!estimator.is_finished());
        assert!(estimator.bitrates.is_empty());
        assert!(drive(&mut estimator, start + Duration::from_secs(10), 10_000, 100, 100).is_some());
    }

    #[test]
    fn test_finish_stops_estimation() {
        let mut estimator = IntervalBitrateEstimator::new(config(2_000, 1_000));
        let t0 = Instant::now();
        estimator.start(t0);
        estimator.finish();
        assert!(drive(&mut estimator, t0 + INITIAL_DELAY, 10_000, 100, 100).is_none());
    }

    struct FixedStepCounter {
        value: std::sync::atomic::AtomicU64,
    }

    impl TxByteCounter for FixedStepCounter {
        fn total_tx_bytes(&self) -> Option<u64> {
            // Every read advances by 50 KB
            Some(
                self.value
                    .fetch_add(50_000, std::sync::atomic::Ordering::SeqCst),
            )
        }
    }

    #[test]
    fn test_system_counter_preferred_when_available() {
        let counter = Arc::new(FixedStepCounter {
            value: std::sync::atomic::AtomicU64::new(0),
        });
        let mut estimator =
            IntervalBitrateEstimator::new(config(1_000, 1_000)).with_tx_counter(counter);
        let t0 = Instant::now();
        estimator.start(t0);

        let result = drive(&mut estimator, t0 + INITIAL_DELAY, 10_000, 100, 100).unwrap();
        // One read at interval open, one at close: 50 KB over 1.1 s
        let expected = 50_000.0 / 1.1 * 8.0;
        assert!((result - expected).abs() / expected < 1e-9);
    }
}
