//! Raw TCP publisher
//!
//! Writes payload bytes straight onto a TCP connection. Useful for measuring
//! the link towards an ingest host; it does not speak RTMP.

use std::io::{ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use socket2::SockRef;
use tracing::{debug, info, warn};

use super::TransportPublisher;
use crate::error::TransportError;

/// Port used when the URL does not name one (RTMP default)
const DEFAULT_PORT: u16 = 1935;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw TCP implementation of [`TransportPublisher`]
pub struct TcpPublisher {
    /// Stream used for writes
    writer: Mutex<Option<TcpStream>>,
    /// Clone of the stream used to shut the socket down while a write is blocked
    shutdown_handle: Mutex<Option<TcpStream>>,
    bitrate: AtomicI64,
    send_buffer_size: AtomicUsize,
    /// Set by `close()` even while a blocked send still holds the writer
    closed: AtomicBool,
}

impl TcpPublisher {
    pub fn new(initial_bitrate: i64) -> Self {
        Self {
            writer: Mutex::new(None),
            shutdown_handle: Mutex::new(None),
            bitrate: AtomicI64::new(initial_bitrate),
            send_buffer_size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Extract `host:port` from `tcp://host[:port]` or `rtmp://host[:port]/app`
    pub fn parse_address(url: &str) -> Result<(String, u16), TransportError> {
        let rest = url
            .split_once("://")
            .map(|(scheme, rest)| (scheme.to_lowercase(), rest))
            .filter(|(scheme, _)| scheme == "tcp" || scheme == "rtmp")
            .map(|(_, rest)| rest)
            .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok((host.to_string(), port))
            }
            Some(_) => Err(TransportError::InvalidUrl(url.to_string())),
            None => Ok((authority.to_string(), DEFAULT_PORT)),
        }
    }

    fn apply_send_buffer_size(stream: &TcpStream, bytes: usize) {
        if let Err(e) = SockRef::from(stream).set_send_buffer_size(bytes) {
            debug!("Failed to set send buffer size {}: {}", bytes, e);
        }
    }
}

impl TransportPublisher for TcpPublisher {
    fn connect(&self, url: &str) -> Result<bool, TransportError> {
        let (host, port) = Self::parse_address(url)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::ConnectFailed(url.to_string()))?;

        let stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                warn!("Connect to {} failed: {}", addr, e);
                return Ok(false);
            }
        };
        stream.set_nodelay(true)?;

        let buffer_size = self.send_buffer_size.load(Ordering::Relaxed);
        if buffer_size > 0 {
            Self::apply_send_buffer_size(&stream, buffer_size);
        }

        let shutdown = stream.try_clone()?;
        *self.writer.lock().map_err(|_| TransportError::NotConnected)? = Some(stream);
        *self
            .shutdown_handle
            .lock()
            .map_err(|_| TransportError::NotConnected)? = Some(shutdown);
        self.closed.store(false, Ordering::Release);

        info!("Connected to {}", addr);
        Ok(true)
    }

    fn publish(&self, stream_key: &str) -> Result<bool, TransportError> {
        let connected = !self.closed.load(Ordering::Acquire)
            && self.writer.lock().map(|w| w.is_some()).unwrap_or(false);
        if !connected {
            return Err(TransportError::NotConnected);
        }
        debug!("Publishing raw stream '{}'", stream_key);
        Ok(true)
    }

    fn send_media_payload(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().map_err(|_| TransportError::NotConnected)?;
        if self.closed.load(Ordering::Acquire) {
            writer.take();
            return Err(TransportError::NotConnected);
        }
        let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
        let written = stream.write_all(payload);

        // close() ran while this write was blocked
        if self.closed.load(Ordering::Acquire) {
            writer.take();
        }
        written?;
        Ok(())
    }

    fn bitrate(&self) -> i64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    fn set_bitrate(&self, bitrate: i64) {
        self.bitrate.store(bitrate, Ordering::Relaxed);
    }

    fn close(&self) -> Result<(), TransportError> {
        let handle = self
            .shutdown_handle
            .lock()
            .map_err(|_| TransportError::AlreadyClosed)?
            .take()
            .ok_or(TransportError::AlreadyClosed)?;

        self.closed.store(true, Ordering::Release);

        // Unblocks a writer stuck in write_all
        if let Err(e) = handle.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                return Err(e.into());
            }
        }

        // A blocked writer clears the stream itself once write_all returns
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        info!("Connection closed");
        Ok(())
    }

    fn set_send_buffer_size(&self, bytes: usize) {
        self.send_buffer_size.store(bytes, Ordering::Relaxed);
    }
}
