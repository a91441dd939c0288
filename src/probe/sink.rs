//! Result delivery for the throughput probe

use tokio::sync::mpsc;
use tracing::debug;

use super::result::ThroughputRound;
use crate::error::ProbeError;

/// Receives probe results. Called from the probe's worker, watchdog or
/// disconnect threads, never from the caller of `start`.
///
/// At most one of `on_speed_estimated`, `on_timeout` and `on_error` is
/// delivered per run.
pub trait ResultSink: Send + Sync {
    fn on_speed_estimated(&self, speed_mbps: f64);

    fn on_timeout(&self);

    fn on_error(&self, cause: ProbeError);

    /// A round finished measuring. Not terminal.
    fn on_round_measured(&self, _round: &ThroughputRound) {}

    /// The transport was closed during teardown
    fn on_disconnected(&self) {}
}

/// Everything a [`ChannelSink`] forwards
#[derive(Debug)]
pub enum ProbeEvent {
    RoundMeasured(ThroughputRound),
    SpeedEstimated(f64),
    TimedOut,
    Failed(ProbeError),
    Disconnected,
}

impl ProbeEvent {
    /// Whether this event ends the measurement
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SpeedEstimated(_) | Self::TimedOut | Self::Failed(_)
        )
    }
}

/// Forwards probe callbacks into an unbounded tokio channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProbeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProbeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ProbeEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("Probe event dropped, receiver gone: {:?}", e.0);
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_speed_estimated(&self, speed_mbps: f64) {
        self.forward(ProbeEvent::SpeedEstimated(speed_mbps));
    }

    fn on_timeout(&self) {
        self.forward(ProbeEvent::TimedOut);
    }

    fn on_error(&self, cause: ProbeError) {
        self.forward(ProbeEvent::Failed(cause));
    }

    fn on_round_measured(&self, round: &ThroughputRound) {
        self.forward(ProbeEvent::RoundMeasured(round.clone()));
    }

    fn on_disconnected(&self) {
        self.forward(ProbeEvent::Disconnected);
    }
}
