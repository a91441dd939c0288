//! Backlog-driven adaptive rate control with an increase hysteresis guard

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::RateControlConfig;
use crate::strategy::telemetry::{BitrateState, RateSample};
use crate::transport::TransportPublisher;

/// Backlog (bytes) at or below which the network is considered to keep up
const DIFF_THRESHOLD_BYTES: f64 = 2000.0;
/// Multiplicative growth applied on a good-network tick
const INCREASE_FACTOR: f64 = 1.05;
/// Weight of the OS-layer backlog in a decrease
const DECREASE_MULTIPLIER: f64 = 1.3;
const BITS_PER_BYTE: f64 = 8.0;
/// How long increases stay blocked after an increase was followed by a decrease
const INCREASE_BLOCK_MS: i64 = 15_000;

/// Direction of a controller tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustment {
    Increase,
    Decrease,
    NoChange,
}

/// Adjusts the encoder bitrate once per frame from backlog telemetry.
///
/// Runs synchronously on the frame-emission path; the only side effect is
/// [`TransportPublisher::set_bitrate`].
pub struct AdaptiveRateController {
    publisher: Arc<dyn TransportPublisher>,
    state: BitrateState,
    /// Optional rate limit on applied changes
    min_adjustment_interval_ms: Option<u64>,
    /// Time of the last applied change
    last_applied_at_ms: Option<i64>,
}

impl AdaptiveRateController {
    /// Create a controller seeded from `config.initial_bitrate`.
    /// The publisher's own bitrate is never read.
    pub fn new(config: &RateControlConfig, publisher: Arc<dyn TransportPublisher>) -> Self {
        let state = BitrateState::new(
            config.initial_bitrate,
            config.min_bitrate,
            config.max_bitrate,
        );

        info!(
            "Rate controller initialized: bitrate={}, range=[{}, {}], min_interval={:?}ms",
            state.current, state.min, state.max, config.min_adjustment_interval_ms
        );

        Self {
            publisher,
            state,
            min_adjustment_interval_ms: config.min_adjustment_interval_ms,
            last_applied_at_ms: None,
        }
    }

    /// Current state snapshot
    pub fn state(&self) -> &BitrateState {
        &self.state
    }

    /// Current target bitrate
    pub fn bitrate(&self) -> i64 {
        self.state.current
    }

    /// Feed one frame's telemetry and possibly apply a new bitrate
    pub fn on_sample(&mut self, sample: &RateSample) -> RateAdjustment {
        let now = sample.observed_at_ms;
        self.rearm_if_elapsed(now);

        if self.is_rate_limited(now) {
            return RateAdjustment::NoChange;
        }

        debug!(
            "Telemetry: diff={:.0}B, diff_system={:.0}B, frames_in_buffer={:.1}",
            sample.diff_bytes, sample.diff_bytes_system, sample.frames_in_buffer
        );

        if sample.diff_bytes <= DIFF_THRESHOLD_BYTES
            && sample.diff_bytes_system <= DIFF_THRESHOLD_BYTES
        {
            self.apply_increase(now)
        } else {
            self.apply_decrease(sample.diff_bytes_system, now)
        }
    }

    /// Lift the increase block once it has lasted long enough.
    /// There is no timer; this only runs on the next telemetry tick.
    fn rearm_if_elapsed(&mut self, now: i64) {
        if !self.state.can_increase
            && now.saturating_sub(self.state.increase_blocked_until_ms) > INCREASE_BLOCK_MS
        {
            debug!("Increase block lifted");
            self.state.can_increase = true;
        }
    }

    fn is_rate_limited(&self, now: i64) -> bool {
        match (self.min_adjustment_interval_ms, self.last_applied_at_ms) {
            (Some(interval), Some(last)) => now.saturating_sub(last) < interval as i64,
            _ => false,
        }
    }

    /// Apply multiplicative increase, unless blocked
    fn apply_increase(&mut self, now: i64) -> RateAdjustment {
        if !self.state.can_increase {
            return RateAdjustment::NoChange;
        }

        let old = self.state.current;
        self.apply(old as f64 * INCREASE_FACTOR, now);
        self.state.previously_increased = true;

        debug!("Bitrate INCREASE: {}→{}", old, self.state.current);
        RateAdjustment::Increase
    }

    /// Apply a decrease proportional to the OS-layer backlog
    fn apply_decrease(&mut self, diff_bytes_system: f64, now: i64) -> RateAdjustment {
        let old = self.state.current;
        let reduction = DECREASE_MULTIPLIER * diff_bytes_system.abs() * BITS_PER_BYTE;
        self.apply(old as f64 - reduction, now);

        if self.state.previously_increased {
            self.state.can_increase = false;
            self.state.increase_blocked_until_ms = now;
            info!(
                "Bitrate DECREASE after increase: {}→{}, increases blocked for {}ms",
                old, self.state.current, INCREASE_BLOCK_MS
            );
        } else {
            debug!("Bitrate DECREASE: {}→{}", old, self.state.current);
        }
        self.state.previously_increased = false;

        RateAdjustment::Decrease
    }

    fn apply(&mut self, target: f64, now: i64) {
        let target = if target.is_nan() {
            self.state.current
        } else {
            target as i64
        };
        let clamped = target.clamp(self.state.min, self.state.max);

        self.state.current = clamped;
        self.last_applied_at_ms = Some(now);
        self.publisher.set_bitrate(clamped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateControlOptions;
    use crate::error::TransportError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        applied: Mutex<Vec<i64>>,
    }

    impl RecordingPublisher {
        fn applied(&self) -> Vec<i64> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl TransportPublisher for RecordingPublisher {
        fn connect(&self, _url: &str) -> Result<bool, TransportError> {
            Ok(true)
        }
        fn publish(&self, _stream_key: &str) -> Result<bool, TransportError> {
            Ok(true)
        }
        fn send_media_payload(&self, _payload: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn bitrate(&self) -> i64 {
            // Never consulted by the controller
            -1
        }
        fn set_bitrate(&self, bitrate: i64) {
            self.applied.lock().unwrap().push(bitrate);
        }
        fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn controller(
        min: i64,
        max: i64,
        initial: i64,
    ) -> (AdaptiveRateController, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let config =
            RateControlConfig::new(min, max, initial, RateControlOptions::default()).unwrap();
        (
            AdaptiveRateController::new(&config, publisher.clone()),
            publisher,
        )
    }

    fn sample(diff: f64, diff_system: f64, at_ms: i64) -> RateSample {
        RateSample {
            diff_bytes: diff,
            diff_bytes_system: diff_system,
            frames_in_buffer: 0.0,
            observed_at_ms: at_ms,
        }
    }

    #[test]
    fn test_increase_on_good_network() {
        let (mut ctrl, publisher) = controller(500_000, 2_000_000, 1_000_000);

        let adjustment = ctrl.on_sample(&sample(500.0, 500.0, 0));

        assert_eq!(adjustment, RateAdjustment::Increase);
        assert_eq!(ctrl.bitrate(), 1_050_000);
        assert!(ctrl.state().previously_increased);
        assert_eq!(publisher.applied(), vec![1_050_000]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);
        assert_eq!(
            ctrl.on_sample(&sample(2000.0, 2000.0, 0)),
            RateAdjustment::Increase
        );
    }

    #[test]
    fn test_decrease_uses_system_backlog() {
        let (mut ctrl, publisher) = controller(500_000, 2_000_000, 1_000_000);

        let adjustment = ctrl.on_sample(&sample(5000.0, 3000.0, 0));

        assert_eq!(adjustment, RateAdjustment::Decrease);
        assert_eq!(ctrl.bitrate(), 968_800);
        assert_eq!(publisher.applied(), vec![968_800]);
    }

    #[test]
    fn test_decrease_uses_absolute_system_backlog() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);
        ctrl.on_sample(&sample(5000.0, -3000.0, 0));
        assert_eq!(ctrl.bitrate(), 968_800);
    }

    #[test]
    fn test_media_backlog_alone_triggers_decrease() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);
        let adjustment = ctrl.on_sample(&sample(2001.0, 0.0, 0));
        // Reduction is driven by the system signal, which is zero here
        assert_eq!(adjustment, RateAdjustment::Decrease);
        assert_eq!(ctrl.bitrate(), 1_000_000);
    }

    #[test]
    fn test_increase_clamped_to_max() {
        let (mut ctrl, publisher) = controller(500_000, 1_020_000, 1_000_000);
        ctrl.on_sample(&sample(0.0, 0.0, 0));
        assert_eq!(ctrl.bitrate(), 1_020_000);
        assert_eq!(publisher.applied(), vec![1_020_000]);
    }

    #[test]
    fn test_decrease_clamped_to_min() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 600_000);
        ctrl.on_sample(&sample(1_000_000.0, 1_000_000.0, 0));
        assert_eq!(ctrl.bitrate(), 500_000);
    }

    #[test]
    fn test_initial_bitrate_clamped() {
        let (ctrl, _) = controller(500_000, 2_000_000, 10_000_000);
        assert_eq!(ctrl.bitrate(), 2_000_000);
    }

    #[test]
    fn test_decrease_after_increase_blocks_increases() {
        let (mut ctrl, publisher) = controller(500_000, 2_000_000, 1_000_000);

        ctrl.on_sample(&sample(0.0, 0.0, 1_000));
        ctrl.on_sample(&sample(5000.0, 3000.0, 2_000));
        assert!(!ctrl.state().can_increase);
        assert_eq!(ctrl.state().increase_blocked_until_ms, 2_000);
        assert!(!ctrl.state().previously_increased);

        let before = ctrl.bitrate();
        let applied_before = publisher.applied().len();
        assert_eq!(
            ctrl.on_sample(&sample(0.0, 0.0, 2_000 + INCREASE_BLOCK_MS)),
            RateAdjustment::NoChange
        );
        assert_eq!(ctrl.bitrate(), before);
        assert_eq!(publisher.applied().len(), applied_before);

        assert_eq!(
            ctrl.on_sample(&sample(0.0, 0.0, 2_000 + INCREASE_BLOCK_MS + 1)),
            RateAdjustment::Increase
        );
        assert!(ctrl.state().can_increase);
    }

    #[test]
    fn test_decrease_without_prior_increase_does_not_block() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);

        ctrl.on_sample(&sample(5000.0, 3000.0, 0));
        ctrl.on_sample(&sample(5000.0, 3000.0, 10));
        assert!(ctrl.state().can_increase);

        assert_eq!(
            ctrl.on_sample(&sample(0.0, 0.0, 20)),
            RateAdjustment::Increase
        );
    }

    #[test]
    fn test_decreases_continue_while_blocked() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);

        ctrl.on_sample(&sample(0.0, 0.0, 0));
        ctrl.on_sample(&sample(5000.0, 3000.0, 100));
        let blocked_at = ctrl.state().increase_blocked_until_ms;

        let before = ctrl.bitrate();
        assert_eq!(
            ctrl.on_sample(&sample(5000.0, 3000.0, 200)),
            RateAdjustment::Decrease
        );
        assert!(ctrl.bitrate() < before);
        // A decrease that does not follow an increase keeps the original block start
        assert_eq!(ctrl.state().increase_blocked_until_ms, blocked_at);
    }

    #[test]
    fn test_nan_telemetry_keeps_bitrate() {
        let (mut ctrl, _) = controller(500_000, 2_000_000, 1_000_000);
        assert_eq!(
            ctrl.on_sample(&sample(f64::NAN, f64::NAN, 0)),
            RateAdjustment::Decrease
        );
        assert_eq!(ctrl.bitrate(), 1_000_000);
    }

    #[test]
    fn test_rate_limited_adjustments() {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = RateControlConfig::new(
            500_000,
            2_000_000,
            1_000_000,
            RateControlOptions {
                min_adjustment_interval_ms: Some(100),
            },
        )
        .unwrap();
        let mut ctrl = AdaptiveRateController::new(&config, publisher.clone());

        assert_eq!(
            ctrl.on_sample(&sample(5000.0, 3000.0, 0)),
            RateAdjustment::Decrease
        );
        assert_eq!(
            ctrl.on_sample(&sample(5000.0, 3000.0, 50)),
            RateAdjustment::NoChange
        );
        assert_eq!(
            ctrl.on_sample(&sample(5000.0, 3000.0, 100)),
            RateAdjustment::Decrease
        );
        assert_eq!(publisher.applied().len(), 2);
    }

    #[test]
    fn test_bitrate_always_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            let min = rng.gen_range(1..1_000_000i64);
            let max = min + rng.gen_range(0..5_000_000i64);
            let initial = rng.gen_range(0..10_000_000i64);
            let (mut ctrl, publisher) = controller(min, max, initial);

            let mut now = 0i64;
            for _ in 0..200 {
                now += rng.gen_range(0..2_000i64);
                let diff = rng.gen_range(0.0..6_000.0);
                let diff_system = rng.gen_range(-50_000.0..50_000.0);
                ctrl.on_sample(&sample(diff, diff_system, now));

                let state = ctrl.state();
                assert!(state.min <= state.current && state.current <= state.max);
            }

            assert!(publisher.applied().iter().all(|b| *b >= min && *b <= max));
        }
    }
}
