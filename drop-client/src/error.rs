//! Error types for the sharedrop client.

use drop_types::{SessionError, WireError};
use thiserror::Error;

use crate::sink::SinkError;
use crate::transport::TransportError;

/// Connection-level errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The relay refused a session request.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The reader task stopped; the relay connection is gone.
    #[error("connection to relay lost")]
    ConnectionLost,

    /// No acknowledgment for a chunk within the wait timeout.
    #[error("no acknowledgment for chunk {seq}")]
    AckTimeout {
        /// Correlation id of the chunk.
        seq: u64,
    },

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Terminal outcome of a failed transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Timed out or retries exhausted.
    #[error("transfer failed: {0}")]
    Failed(String),

    /// Cancelled locally or aborted by the counterpart or relay.
    #[error("transfer aborted: {0}")]
    Aborted(String),

    /// Reading the source file failed.
    #[error("cannot read source: {0}")]
    Source(#[from] std::io::Error),

    /// Writing or finalizing the destination failed.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The relay connection failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result alias for connection operations.
pub type ClientResult<T> = Result<T, ClientError>;
