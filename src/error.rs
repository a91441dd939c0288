//! Error types shared by the transport glue and the throughput probe

use thiserror::Error;

/// Failures surfaced by a [`TransportPublisher`](crate::transport::TransportPublisher)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {0}")]
    ConnectFailed(String),

    #[error("ingest endpoint rejected stream key '{0}'")]
    PublishRejected(String),

    /// Close on a connection that is already gone. Benign during teardown.
    #[error("connection already closed")]
    AlreadyClosed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cause delivered to [`ResultSink::on_error`](crate::probe::ResultSink::on_error)
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    #[error("send failed in round {round}: {source}")]
    Send {
        round: usize,
        #[source]
        source: TransportError,
    },

    #[error("probe already started")]
    AlreadyStarted,

    #[error("probe already stopped")]
    AlreadyStopped,

    #[error("failed to spawn probe worker: {0}")]
    Spawn(#[source] std::io::Error),
}
