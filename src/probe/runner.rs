//! Throughput probe lifecycle: worker, watchdog, cancellation and teardown

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::payload::{send_in_parts, SendOutcome, SyntheticPayload};
use super::result::{BenchmarkResult, ThroughputRound};
use super::sink::ResultSink;
use super::watchdog::Watchdog;
use crate::config::{ConnectFailurePolicy, ProbeConfig};
use crate::error::{ProbeError, TransportError};
use crate::transport::{SystemTxCounter, TransportPublisher, TxByteCounter};

/// How long `stop()` waits for the worker to acknowledge cancellation
const JOIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Lifecycle of a probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Running = 3,
    Completed = 4,
    TimedOut = 5,
    Stopped = 6,
    Failed = 7,
    Disconnecting = 8,
}

impl ProbeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Running,
            4 => Self::Completed,
            5 => Self::TimedOut,
            6 => Self::Stopped,
            7 => Self::Failed,
            8 => Self::Disconnecting,
            _ => Self::Idle,
        }
    }
}

/// Which path ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Completed,
    TimedOut,
    Stopped,
    Failed,
}

impl ProbeOutcome {
    fn state(self) -> ProbeState {
        match self {
            Self::Completed => ProbeState::Completed,
            Self::TimedOut => ProbeState::TimedOut,
            Self::Stopped => ProbeState::Stopped,
            Self::Failed => ProbeState::Failed,
        }
    }
}

/// Flags shared by the worker, the watchdog and callers of `stop()`
#[derive(Debug, Default)]
pub struct ProbeLifecycleFlags {
    connected: AtomicBool,
    stopped: AtomicBool,
}

impl ProbeLifecycleFlags {
    /// Set the stop flag. Returns `true` only for the first caller.
    pub fn try_stop(&self) -> bool {
        self.stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the worker exits
    done: mpsc::Receiver<()>,
}

struct ProbeInner {
    config: Arc<ProbeConfig>,
    publisher: Arc<dyn TransportPublisher>,
    sink: Arc<dyn ResultSink>,
    tx_counter: Arc<dyn TxByteCounter>,
    flags: ProbeLifecycleFlags,
    started: AtomicBool,
    state: AtomicU8,
    outcome: Mutex<Option<ProbeOutcome>>,
    worker: Mutex<Option<WorkerHandle>>,
    watchdog: Mutex<Option<Watchdog>>,
    /// Held across connect and close; `true` once teardown closed the transport
    torn_down: Mutex<bool>,
}

/// Measures sustained upload throughput against an ingest endpoint.
///
/// [`start`](Self::start) returns immediately; all work happens on one
/// dedicated worker thread. Results arrive through the [`ResultSink`].
/// A probe runs once: after it stops it cannot be restarted.
pub struct ThroughputProbe {
    inner: Arc<ProbeInner>,
}

impl ThroughputProbe {
    pub fn new(
        config: Arc<ProbeConfig>,
        publisher: Arc<dyn TransportPublisher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self::with_tx_counter(config, publisher, sink, Arc::new(SystemTxCounter))
    }

    /// Create a probe reading OS-level transmit counts from `tx_counter`
    pub fn with_tx_counter(
        config: Arc<ProbeConfig>,
        publisher: Arc<dyn TransportPublisher>,
        sink: Arc<dyn ResultSink>,
        tx_counter: Arc<dyn TxByteCounter>,
    ) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                config,
                publisher,
                sink,
                tx_counter,
                flags: ProbeLifecycleFlags::default(),
                started: AtomicBool::new(false),
                state: AtomicU8::new(ProbeState::Idle as u8),
                outcome: Mutex::new(None),
                worker: Mutex::new(None),
                watchdog: Mutex::new(None),
                torn_down: Mutex::new(false),
            }),
        }
    }

    /// Spawn the worker and begin measuring against `endpoint_url`
    pub fn start(&self, endpoint_url: &str) -> Result<(), ProbeError> {
        if self.inner.flags.is_stopped() {
            return Err(ProbeError::AlreadyStopped);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ProbeError::AlreadyStarted);
        }

        let inner = self.inner.clone();
        let url = endpoint_url.to_string();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("throughput-probe".to_string())
            .spawn(move || {
                let _done = done_tx;
                inner.run(&url);
            })
            .map_err(ProbeError::Spawn)?;

        if let Ok(mut slot) = self.inner.worker.lock() {
            *slot = Some(WorkerHandle {
                thread,
                done: done_rx,
            });
        }

        info!(
            "Throughput probe started: {} bytes x {} rounds, timeout={}s",
            self.inner.config.data_size_bytes,
            self.inner.config.rounds,
            self.inner.config.timeout_secs
        );
        Ok(())
    }

    /// Cancel the run. Idempotent and callable from any thread; only the
    /// first call tears down, and no result is delivered afterwards.
    pub fn stop(&self) {
        if !self.inner.flags.try_stop() {
            debug!("Probe already stopped");
            return;
        }
        info!("Stopping throughput probe");
        self.inner.finish(ProbeOutcome::Stopped);
    }

    pub fn state(&self) -> ProbeState {
        self.inner.state()
    }

    /// How the run ended, once it has
    pub fn outcome(&self) -> Option<ProbeOutcome> {
        self.inner.outcome.lock().ok().and_then(|o| *o)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.flags.is_stopped()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.flags.is_connected()
    }
}

impl Drop for ThroughputProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ProbeInner {
    fn state(&self) -> ProbeState {
        ProbeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProbeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from` -> `to` unless teardown already moved the state elsewhere
    fn advance(&self, from: ProbeState, to: ProbeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn run(self: &Arc<Self>, url: &str) {
        raise_worker_priority();
        self.arm_watchdog();

        if self.flags.is_stopped() || !self.advance(ProbeState::Idle, ProbeState::Connecting) {
            debug!("Probe stopped before connecting");
            return;
        }
        if let Err(cause) = self.connect(url) {
            self.handle_connect_failure(cause);
            return;
        }
        if !self.advance(ProbeState::Connecting, ProbeState::Connected)
            || !self.advance(ProbeState::Connected, ProbeState::Running)
        {
            debug!("Probe stopped while connecting");
            return;
        }

        let payload = SyntheticPayload::new(self.config.data_size_bytes);
        let mut rounds = Vec::with_capacity(self.config.rounds);

        for round in 0..self.config.rounds {
            if self.flags.is_stopped() {
                debug!("Probe stopped before round {}", round + 1);
                return;
            }

            let data = payload.for_round(self.config.payload_schedule, round);
            if data.is_empty() {
                debug!("Round {} has an empty payload, skipping", round + 1);
                continue;
            }

            match self.measure_round(round, data) {
                Ok(Some(measured)) => {
                    if !self.flags.is_stopped() {
                        self.sink.on_round_measured(&measured);
                    }
                    rounds.push(measured);
                }
                Ok(None) => {
                    debug!("Probe stopped during round {}", round + 1);
                    return;
                }
                Err(source) => {
                    if self.flags.try_stop() {
                        error!("Send failed in round {}: {}", round + 1, source);
                        self.sink.on_error(ProbeError::Send { round, source });
                        self.finish(ProbeOutcome::Failed);
                    } else {
                        debug!("Send aborted by teardown: {}", source);
                    }
                    return;
                }
            }
        }

        let result = BenchmarkResult::from_rounds(rounds);
        if self.flags.try_stop() {
            info!(
                "Estimated upload speed: {:.3} Mbps over {} rounds",
                result.median_speed_mbps,
                result.rounds.len()
            );
            self.sink.on_speed_estimated(result.median_speed_mbps);
            self.finish(ProbeOutcome::Completed);
        } else {
            debug!("Probe already stopped, dropping result");
        }
    }

    /// Connect and publish unless already connected
    fn connect(&self, url: &str) -> Result<(), ProbeError> {
        if self.flags.is_connected() {
            return Ok(());
        }

        // Held until connected so teardown cannot close in between
        let torn_down = self
            .torn_down
            .lock()
            .map_err(|_| ProbeError::AlreadyStopped)?;
        if *torn_down || self.flags.is_stopped() {
            return Err(ProbeError::AlreadyStopped);
        }

        self.publisher
            .set_send_buffer_size(self.config.send_buffer_size);

        if !self.publisher.connect(url).map_err(ProbeError::Connect)? {
            return Err(ProbeError::Connect(TransportError::ConnectFailed(
                url.to_string(),
            )));
        }

        let key = &self.config.stream_key;
        if !self.publisher.publish(key).map_err(ProbeError::Connect)? {
            return Err(ProbeError::Connect(TransportError::PublishRejected(
                key.clone(),
            )));
        }

        self.flags.set_connected(true);
        info!("Probe connected to {}", url);
        Ok(())
    }

    fn handle_connect_failure(self: &Arc<Self>, cause: ProbeError) {
        if !self.flags.try_stop() {
            debug!("Connect failed after stop: {}", cause);
            return;
        }

        match self.config.connect_failure_policy {
            ConnectFailurePolicy::Report => {
                error!("Probe {}", cause);
                self.sink.on_error(cause);
            }
            ConnectFailurePolicy::SilentAbort => {
                warn!("Probe {}, aborting without report", cause);
            }
        }
        self.finish(ProbeOutcome::Failed);
    }

    /// Send one round's payload and time it. `Ok(None)` means the probe was
    /// stopped between parts.
    fn measure_round(
        &self,
        round: usize,
        data: &[u8],
    ) -> Result<Option<ThroughputRound>, TransportError> {
        let tx_before = self.tx_counter.total_tx_bytes();
        let start = Instant::now();

        let outcome = send_in_parts(
            self.publisher.as_ref(),
            data,
            self.config.part_size_bytes,
            || self.flags.is_stopped(),
        )?;
        if outcome == SendOutcome::Cancelled {
            return Ok(None);
        }

        let elapsed = start.elapsed();
        let system_tx = match (tx_before, self.tx_counter.total_tx_bytes()) {
            (Some(before), Some(after)) => Some(after.saturating_sub(before)),
            _ => None,
        };

        let measured = ThroughputRound::new(round, data.len() as u64, elapsed, system_tx);
        info!(
            "Round {}/{}: {} bytes in {:.3}s = {:.3} Mbps (system: {:?})",
            round + 1,
            self.config.rounds,
            measured.payload_size_bytes,
            measured.elapsed_seconds,
            measured.speed_mbps,
            measured.system_speed_mbps
        );
        Ok(Some(measured))
    }

    fn arm_watchdog(self: &Arc<Self>) {
        if self.config.timeout_secs == 0 || self.flags.is_stopped() {
            return;
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let inner = self.clone();
        let armed = Watchdog::arm(timeout, move || {
            if inner.flags.try_stop() {
                warn!("Throughput probe timed out after {:?}", timeout);
                inner.sink.on_timeout();
                inner.finish(ProbeOutcome::TimedOut);
            }
        });

        match armed {
            Ok(watchdog) => {
                if let Ok(mut slot) = self.watchdog.lock() {
                    *slot = Some(watchdog);
                }
                // Teardown that ran before the slot was filled never saw this timer
                if self.flags.is_stopped() {
                    if let Some(watchdog) = self.watchdog.lock().ok().and_then(|mut w| w.take()) {
                        watchdog.disarm();
                    }
                }
            }
            Err(e) => warn!("Failed to arm probe watchdog: {}", e),
        }
    }

    /// Teardown; runs once, on whichever thread won the stop flag
    fn finish(self: &Arc<Self>, outcome: ProbeOutcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
        self.set_state(outcome.state());

        if let Some(watchdog) = self.watchdog.lock().ok().and_then(|mut w| w.take()) {
            watchdog.disarm();
        }
        self.join_worker();

        self.set_state(ProbeState::Disconnecting);
        let inner = self.clone();
        let spawned = thread::Builder::new()
            .name("probe-disconnect".to_string())
            .spawn(move || inner.disconnect());
        if let Err(e) = spawned {
            warn!("Failed to spawn disconnect thread: {}, closing inline", e);
            self.disconnect();
        }
    }

    /// Wait a bounded time for the worker, then detach it
    fn join_worker(&self) {
        let Some(handle) = self.worker.lock().ok().and_then(|mut w| w.take()) else {
            return;
        };

        if handle.thread.thread().id() == thread::current().id() {
            return;
        }

        match handle.done.recv_timeout(JOIN_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    "Probe worker still busy after {:?}, detaching",
                    JOIN_TIMEOUT
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!("Probe worker panicked");
                }
            }
        }
    }

    fn disconnect(&self) {
        // Waits for an in-flight connect; later connects see the flag
        if let Ok(mut torn_down) = self.torn_down.lock() {
            *torn_down = true;
        }

        match self.publisher.close() {
            Ok(()) => debug!("Probe transport closed"),
            Err(TransportError::AlreadyClosed) => debug!("Probe transport already closed"),
            Err(e) => warn!("Failed to close probe transport: {}", e),
        }
        self.flags.set_connected(false);
        self.set_state(ProbeState::Idle);
        self.sink.on_disconnected();
    }
}

/// Nudge the worker's scheduling priority up by one step
#[cfg(target_os = "linux")]
fn raise_worker_priority() {
    // SAFETY: get/setpriority with PRIO_PROCESS and who=0 only touch the
    // calling thread's nice value on Linux.
    let rc = unsafe {
        let current = libc::getpriority(libc::PRIO_PROCESS, 0);
        libc::setpriority(libc::PRIO_PROCESS, 0, current - 1)
    };
    if rc != 0 {
        debug!(
            "Could not raise probe worker priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_worker_priority() {}
