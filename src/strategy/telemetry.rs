//! Per-frame telemetry and controller state

/// Transmission telemetry sampled once per outgoing video frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    /// Media-layer backlog: bytes queued but not yet sent
    pub diff_bytes: f64,
    /// OS-layer backlog: bytes handed to the socket but not yet transmitted
    pub diff_bytes_system: f64,
    /// Current encoder buffer depth in frames
    pub frames_in_buffer: f64,
    /// Observation time in milliseconds on a monotonic clock
    pub observed_at_ms: i64,
}

/// Bitrate bookkeeping of one controller. `min <= current <= max` holds after every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateState {
    pub current: i64,
    pub min: i64,
    pub max: i64,
    /// The last applied change was an increase
    pub previously_increased: bool,
    /// Start of the current increase block
    pub increase_blocked_until_ms: i64,
    pub can_increase: bool,
}

impl BitrateState {
    pub fn new(initial: i64, min: i64, max: i64) -> Self {
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            previously_increased: false,
            increase_blocked_until_ms: 0,
            can_increase: true,
        }
    }
}
