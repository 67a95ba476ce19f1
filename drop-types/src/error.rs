//! Error types for sharedrop wire handling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Frame was not valid UTF-8 text
    #[error("frame is not valid utf-8")]
    NotText,

    /// Message decoded but carries invalid data
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Reasons a session could not be created or joined.
///
/// Sent to endpoints inside `session-creation-failed` and `join-failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionError {
    /// Code failed the length/format check
    #[error("invalid session code")]
    InvalidCode,

    /// A live session already holds this code
    #[error("session code already in use")]
    CodeInUse,

    /// No live session with this code
    #[error("room does not exist")]
    NotFound,

    /// The session already has a receiver
    #[error("room already has a receiver")]
    AlreadyBound,

    /// The caller is the session's sender
    #[error("sender cannot join their own room as receiver")]
    SelfJoin,

    /// The caller already belongs to another session
    #[error("endpoint already belongs to a session")]
    PeerBusy,
}
