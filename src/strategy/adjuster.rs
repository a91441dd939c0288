//! Estimator-driven bitrate adjustment for a live stream
//!
//! Keeps an endless estimator tracking the achieved bitrate, starts a
//! blocking estimator whenever the network changes and a lowered estimator
//! when the encoder buffer congests. Each finished estimation is applied
//! through [`TransportPublisher::set_bitrate`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::NetworkType;
use crate::strategy::estimator::{
    EstimatorConfig, IntervalBitrateEstimator, DEFAULT_LOWERING_FACTOR,
};
use crate::transport::{TransportPublisher, TxByteCounter};

/// Buffer fill above which congestion starts an estimator
const CONGESTION_BUFFER_FILL: f64 = 0.2;
/// Extra wait after a congestion estimator's test duration before the next one
const CONGESTION_SPACING: Duration = Duration::from_millis(10_000);
/// Congestion repeating within this window after the spacing lowers the factor
const REPEATED_CONGESTION_WINDOW: Duration = Duration::from_millis(20_000);
const LOWERING_FACTOR_STEP: f64 = 0.1;
const MIN_LOWERING_FACTOR: f64 = 0.5;

/// Adjuster settings
#[derive(Debug, Clone)]
pub struct AdjusterConfig {
    pub test_duration_ms: u64,
    pub interval_duration_ms: u64,
    /// Initial factor applied to congestion estimates
    pub lowering_factor: f64,
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        let estimator = EstimatorConfig::default();
        Self {
            test_duration_ms: estimator.test_duration_ms,
            interval_duration_ms: estimator.interval_duration_ms,
            lowering_factor: DEFAULT_LOWERING_FACTOR,
        }
    }
}

struct ActiveEstimator {
    estimator: IntervalBitrateEstimator,
    /// Started for a network change; blocks other estimators until it finishes
    priority: bool,
}

/// Passive bitrate adaptation fed from the frame-send path.
///
/// Not thread-safe on its own; callers on several threads wrap it in a `Mutex`.
pub struct BitrateAdjuster {
    config: AdjusterConfig,
    publisher: Arc<dyn TransportPublisher>,
    tx_counter: Option<Arc<dyn TxByteCounter>>,

    endless: IntervalBitrateEstimator,
    current: Option<ActiveEstimator>,
    /// Latest result of the endless estimator (bits/s), 0 until one arrives
    current_estimate: f64,

    network: Option<NetworkType>,
    skip_new_estimators: bool,
    lowering_factor: f64,
    last_congestion_start: Option<Instant>,
}

impl BitrateAdjuster {
    pub fn new(
        config: AdjusterConfig,
        publisher: Arc<dyn TransportPublisher>,
        now: Instant,
    ) -> Self {
        Self::build(config, publisher, None, now)
    }

    /// Estimate from the OS transmit counter instead of stream bytes
    pub fn with_tx_counter(
        config: AdjusterConfig,
        publisher: Arc<dyn TransportPublisher>,
        tx_counter: Arc<dyn TxByteCounter>,
        now: Instant,
    ) -> Self {
        Self::build(config, publisher, Some(tx_counter), now)
    }

    fn build(
        config: AdjusterConfig,
        publisher: Arc<dyn TransportPublisher>,
        tx_counter: Option<Arc<dyn TxByteCounter>>,
        now: Instant,
    ) -> Self {
        let lowering_factor = config.lowering_factor;
        let mut adjuster = Self {
            endless: IntervalBitrateEstimator::new(EstimatorConfig::default()),
            config,
            publisher,
            tx_counter,
            current: None,
            current_estimate: 0.0,
            network: None,
            skip_new_estimators: false,
            lowering_factor,
            last_congestion_start: None,
        };
        adjuster.endless = adjuster.create_estimator(true, false);
        adjuster.endless.start(now);

        info!(
            "Bitrate adjuster initialized: test={}ms, interval={}ms, lowering_factor={}",
            adjuster.config.test_duration_ms,
            adjuster.config.interval_duration_ms,
            adjuster.lowering_factor
        );
        adjuster
    }

    /// Latest achieved bitrate (bits/s) from the endless estimator
    pub fn current_estimate(&self) -> f64 {
        self.current_estimate
    }

    pub fn lowering_factor(&self) -> f64 {
        self.lowering_factor
    }

    pub fn network(&self) -> Option<NetworkType> {
        self.network
    }

    /// Whether a non-endless estimator is still measuring
    pub fn is_estimating(&self) -> bool {
        self.current
            .as_ref()
            .map(|active| !active.estimator.is_endless() && !active.estimator.is_finished())
            .unwrap_or(false)
    }

    /// Seed the network's default bitrate and start a blocking estimator
    pub fn on_network_changed(&mut self, network: NetworkType, now: Instant) {
        info!("Network changed to {:?}", network);
        let previous = self.network.replace(network);

        if network != NetworkType::NoConnection {
            let estimator = self.create_estimator(false, false);
            self.start_estimator(estimator, true, Some(network.default_bitrate()), now);
        }

        if previous != Some(network) {
            self.lowering_factor = self.config.lowering_factor;
            debug!("Lowering factor reset to {}", self.lowering_factor);
        }
    }

    /// Report encoder buffer fill (0.0..=1.0). Returns `true` when a
    /// congestion estimator was started.
    pub fn on_congestion(&mut self, buffer_fill: f64, now: Instant) -> bool {
        if buffer_fill <= CONGESTION_BUFFER_FILL
            || self.network == Some(NetworkType::NoConnection)
            || !self.congestion_spacing_elapsed(now)
        {
            return false;
        }

        let initial = (self.current_estimate > 0.0)
            .then(|| (self.lowering_factor * self.current_estimate) as i64);
        let estimator = self.create_estimator(false, true);
        if !self.start_estimator(estimator, false, initial, now) {
            return false;
        }

        if self.is_repeated_congestion(now) {
            self.lowering_factor =
                (self.lowering_factor - LOWERING_FACTOR_STEP).max(MIN_LOWERING_FACTOR);
            info!("Repeated congestion, lowering factor now {:.1}", self.lowering_factor);
        }
        self.last_congestion_start = Some(now);
        true
    }

    pub fn before_frame_sent(&mut self, now: Instant) {
        if let Some(active) = self.current.as_mut() {
            active.estimator.before_frame_sent(now);
        }
        self.endless.before_frame_sent(now);
    }

    pub fn after_frame_sent(&mut self, frame_bytes: usize, now: Instant) {
        if let Some(active) = self.current.as_mut() {
            if let Some(bitrate) = active.estimator.after_frame_sent(frame_bytes, now) {
                info!("Estimator finished: {:.3} Mbps", bitrate / 1024.0 / 1024.0);
                self.publisher.set_bitrate(bitrate as i64);
                if active.priority {
                    self.skip_new_estimators = false;
                }
            }
        }

        if let Some(bitrate) = self.endless.after_frame_sent(frame_bytes, now) {
            debug!("Current estimated bitrate: {:.3} Mbps", bitrate / 1024.0 / 1024.0);
            self.current_estimate = bitrate;
        }
    }

    /// Replace the current estimator. A priority estimator always wins and
    /// blocks others until it produces a result; a regular one only starts
    /// when nothing else is measuring.
    fn start_estimator(
        &mut self,
        mut estimator: IntervalBitrateEstimator,
        priority: bool,
        initial_bitrate: Option<i64>,
        now: Instant,
    ) -> bool {
        if !priority && (self.skip_new_estimators || self.is_estimating()) {
            debug!("Estimator already running, not starting another");
            return false;
        }
        if priority {
            self.skip_new_estimators = true;
        }

        if let Some(previous) = self.current.as_mut() {
            previous.estimator.finish();
        }

        if let Some(bitrate) = initial_bitrate {
            info!("Starting estimator at {} bps (priority={})", bitrate, priority);
            self.publisher.set_bitrate(bitrate);
        } else {
            info!("Starting estimator (priority={})", priority);
        }

        estimator.start(now);
        self.current = Some(ActiveEstimator { estimator, priority });
        true
    }

    fn next_congestion_allowed_at(&self) -> Option<Instant> {
        let test_duration = Duration::from_millis(self.config.test_duration_ms);
        self.last_congestion_start
            .map(|start| start + test_duration + CONGESTION_SPACING)
    }

    fn congestion_spacing_elapsed(&self, now: Instant) -> bool {
        self.next_congestion_allowed_at()
            .map(|allowed| now > allowed)
            .unwrap_or(true)
    }

    fn is_repeated_congestion(&self, now: Instant) -> bool {
        self.next_congestion_allowed_at()
            .map(|allowed| now < allowed + REPEATED_CONGESTION_WINDOW)
            .unwrap_or(false)
    }

    fn create_estimator(&self, endless: bool, lower_estimation: bool) -> IntervalBitrateEstimator {
        let estimator = IntervalBitrateEstimator::new(EstimatorConfig {
            test_duration_ms: self.config.test_duration_ms,
            interval_duration_ms: self.config.interval_duration_ms,
            endless,
            lower_estimation,
            lowering_factor: self.lowering_factor,
        });
        match &self.tx_counter {
            Some(counter) => estimator.with_tx_counter(counter.clone()),
            None => estimator,
        }
    }
}
