//! Synthetic payloads and part splitting

use rand::RngCore;

use crate::config::PayloadSchedule;
use crate::error::TransportError;
use crate::transport::TransportPublisher;

/// Random bytes sent as fake video data
pub struct SyntheticPayload {
    bytes: Vec<u8>,
}

impl SyntheticPayload {
    /// Allocate `size` random (incompressible) bytes
    pub fn new(size: usize) -> Self {
        let mut bytes = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Prefix of the buffer sent in the zero-based `round`
    pub fn for_round(&self, schedule: PayloadSchedule, round: usize) -> &[u8] {
        let size = schedule.payload_size(self.bytes.len(), round);
        &self.bytes[..size.min(self.bytes.len())]
    }
}

/// Sizes of the writes a payload of `total` bytes is split into: full parts
/// of `part_size` followed by one remainder part when `total` is not a multiple.
pub fn part_sizes(total: usize, part_size: usize) -> Vec<usize> {
    let part_size = part_size.max(1);
    let full = total / part_size;
    let remainder = total % part_size;

    let mut sizes = vec![part_size; full];
    if remainder > 0 {
        sizes.push(remainder);
    }
    sizes
}

/// Result of sending one round's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Completed,
    /// Cancellation was observed between parts
    Cancelled,
}

/// Send `payload` back-to-back in parts, checking for cancellation before each part
pub(crate) fn send_in_parts(
    publisher: &dyn TransportPublisher,
    payload: &[u8],
    part_size: usize,
    is_cancelled: impl Fn() -> bool,
) -> Result<SendOutcome, TransportError> {
    let mut offset = 0;
    for size in part_sizes(payload.len(), part_size) {
        if is_cancelled() {
            return Ok(SendOutcome::Cancelled);
        }
        publisher.send_media_payload(&payload[offset..offset + size])?;
        offset += size;
    }
    Ok(SendOutcome::Completed)
}
