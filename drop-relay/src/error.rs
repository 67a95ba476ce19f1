//! Error types for sharedrop-relay.

use drop_types::WireError;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The dispatcher is no longer running.
    #[error("relay dispatcher stopped")]
    DispatcherStopped,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A message the relay refuses to act on.
///
/// Rejections change no state. The originator only learns
/// [`public_reason`](ProtocolError::public_reason); the full error is logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Only the relay sends this message type.
    #[error("{0} is sent by the relay only")]
    RelayOnly(&'static str),

    /// Caller belongs to no session.
    #[error("peer is not in a session")]
    NotInSession,

    /// The session has no receiver yet.
    #[error("session has no receiver")]
    NoReceiver,

    /// No live transfer under this id.
    #[error("unknown transfer")]
    UnknownTransfer,

    /// A transfer with this id is already registered.
    #[error("transfer id already registered")]
    DuplicateTransfer,

    /// Caller claims to be the sender but is not.
    #[error("caller is not the sender of this transfer")]
    NotSender,

    /// Caller claims to be the receiver but is not.
    #[error("caller is not the receiver of this transfer")]
    NotReceiver,

    /// Caller is neither party of the transfer.
    #[error("caller is not a party to this transfer")]
    NotParticipant,

    /// Claimed receiver id differs from the bound receiver.
    #[error("receiver id does not match the bound receiver")]
    ReceiverMismatch,

    /// Handshake metadata failed validation.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// File larger than the relay accepts.
    #[error("transfer of {size} bytes exceeds limit of {limit}")]
    TransferTooLarge {
        /// Announced size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// Chunk payload larger than the relay accepts.
    #[error("chunk of {len} bytes exceeds limit of {limit}")]
    ChunkTooLarge {
        /// Payload length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Chunk with no payload.
    #[error("empty chunk")]
    EmptyChunk,

    /// Chunk reaching past the announced file size.
    #[error("chunk {offset}+{len} exceeds transfer size {total}")]
    OutOfBounds {
        /// Chunk offset.
        offset: u64,
        /// Payload length.
        len: usize,
        /// Announced size.
        total: u64,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },
}

impl ProtocolError {
    /// Coarse reason sent back to the originator.
    pub fn public_reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed message",
            Self::RelayOnly(_) => "unexpected message",
            Self::NotInSession | Self::NoReceiver => "no active session",
            Self::UnknownTransfer => "unknown transfer",
            Self::DuplicateTransfer
            | Self::NotSender
            | Self::NotReceiver
            | Self::NotParticipant
            | Self::ReceiverMismatch => "not permitted",
            Self::InvalidMetadata(_) => "invalid metadata",
            Self::TransferTooLarge { .. } => "file too large",
            Self::ChunkTooLarge { .. } | Self::EmptyChunk | Self::OutOfBounds { .. } => {
                "invalid chunk"
            }
            Self::RateLimited { .. } => "rate limited",
        }
    }
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_violations_share_one_public_reason() {
        for e in [
            ProtocolError::NotSender,
            ProtocolError::NotReceiver,
            ProtocolError::ReceiverMismatch,
            ProtocolError::DuplicateTransfer,
        ] {
            assert_eq!(e.public_reason(), "not permitted");
        }
    }

    #[test]
    fn detail_stays_in_display() {
        let e = ProtocolError::OutOfBounds {
            offset: 10,
            len: 5,
            total: 12,
        };
        assert_eq!(e.to_string(), "chunk 10+5 exceeds transfer size 12");
        assert_eq!(e.public_reason(), "invalid chunk");
    }
}
