//! # drop-types
//!
//! Wire format types for the sharedrop relay protocol.
//!
//! This crate provides the foundational types shared by every sharedrop crate:
//! - [`PeerId`], [`TransferId`], [`SessionCode`] - Identity types
//! - [`Message`] - Protocol messages (session setup, chunks, pull signals, aborts)
//! - [`TransferMetadata`] - The immutable description of one file transfer
//! - [`SessionError`], [`WireError`] - Error types
//!
//! ## Protocol Flow
//!
//! ```text
//! Sender                      Relay                      Receiver
//!   |--- create-session -------->|                           |
//!   |<-- session-created --------|                           |
//!   |                            |<------- join-session -----|
//!   |<-- user-joined ------------|-------- join-success ---->|
//!   |--- metadata-handshake ---->|-------------------------->|
//!   |<-- pull-signal ------------|<-------- pull-signal -----|
//!   |--- chunk x BATCH_SIZE ---->|-------------------------->|
//!   |<-- chunk-ack --------------|                           |
//!   |<-- pull-signal ------------|<-------- pull-signal -----|
//!   |            ...             |            ...            |
//!   |--- end-of-transfer ------->|-------------------------->|
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;

pub use error::{SessionError, WireError};
pub use ids::{PeerId, SessionCode, TransferId, DEFAULT_CODE_LEN, MAX_CODE_LEN, MIN_CODE_LEN};
pub use messages::{
    Cancel, Chunk, ChunkAck, CreateSession, EndOfTransfer, JoinFailed, JoinSession, JoinSuccess,
    Message, MetadataHandshake, PeerLeft, PullSignal, SessionCreated, SessionCreationFailed,
    SessionExists, TransferAborted, TransferErrorNotice, TransferMetadata, UserJoined,
};
