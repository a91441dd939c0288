//! Transport glue shared by the rate controller and the throughput probe
//!
//! The core never speaks a wire protocol itself. Everything it needs from the
//! live upload connection goes through [`TransportPublisher`], so production
//! publishers and benchmark publishers are plugged in by composition.

mod counter;
mod tcp;

pub use counter::{SystemTxCounter, TxByteCounter};
pub use tcp::TcpPublisher;

use crate::error::TransportError;

/// Stream key used when publishing to the ingest endpoint
pub const STREAM_KEY: &str = "live";

/// Minimal capability set of a live upload connection.
///
/// Methods take `&self` so one publisher can be shared through an
/// `Arc<dyn TransportPublisher>` between the frame pipeline and a probe.
pub trait TransportPublisher: Send + Sync {
    /// Open the connection. `Ok(false)` means the endpoint refused it.
    fn connect(&self, url: &str) -> Result<bool, TransportError>;

    /// Start publishing under `stream_key`
    fn publish(&self, stream_key: &str) -> Result<bool, TransportError>;

    /// Send one media payload. Fire-and-forget: returning `Ok` means the bytes
    /// were handed to the connection, not that the endpoint acknowledged them.
    fn send_media_payload(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Currently applied encoder bitrate (bits per second)
    fn bitrate(&self) -> i64;

    /// Apply a new encoder bitrate mid-stream. Must not block.
    fn set_bitrate(&self, bitrate: i64);

    /// Close the connection. Returns [`TransportError::AlreadyClosed`] when
    /// there is nothing left to close.
    fn close(&self) -> Result<(), TransportError>;

    /// Hint for the socket send buffer size
    fn set_send_buffer_size(&self, _bytes: usize) {}
}
