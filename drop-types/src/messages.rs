//! Protocol messages for sharedrop.
//!
//! Every message travels as one JSON object per WebSocket text frame,
//! tagged by a kebab-case `type` field. Field names are camelCase so the
//! same frames are readable from browser endpoints.

use serde::{Deserialize, Serialize};

use crate::{PeerId, SessionCode, SessionError, TransferId, WireError};

/// All possible protocol messages.
///
/// One enum covers both directions; the relay rejects endpoint-originated
/// copies of messages only it may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Ask the relay to open a session under a code
    CreateSession(CreateSession),
    /// Session opened; caller is its sender
    SessionCreated(SessionCreated),
    /// A live session already holds the code
    SessionExists(SessionExists),
    /// Session could not be opened
    SessionCreationFailed(SessionCreationFailed),
    /// Ask to join a session as its receiver
    JoinSession(JoinSession),
    /// Joined; caller is the session's receiver
    JoinSuccess(JoinSuccess),
    /// Join refused
    JoinFailed(JoinFailed),
    /// A receiver bound to the sender's session
    UserJoined(UserJoined),
    /// The counterpart left the session
    PeerLeft(PeerLeft),
    /// Opens a transfer
    MetadataHandshake(MetadataHandshake),
    /// One piece of file data
    Chunk(Chunk),
    /// Relay verdict on one chunk
    ChunkAck(ChunkAck),
    /// Receiver demand for the next batch
    PullSignal(PullSignal),
    /// Sender finished sending
    EndOfTransfer(EndOfTransfer),
    /// Either side aborts a transfer
    Cancel(Cancel),
    /// Relay-originated terminal notification
    TransferAborted(TransferAborted),
    /// A request about a transfer was rejected or failed
    TransferError(TransferErrorNotice),
}

impl Message {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Serialization)
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::Deserialization)
    }

    /// Deserialize from raw frame bytes, which must be UTF-8 JSON.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(bytes).map_err(|_| WireError::NotText)?;
        Self::from_json(text)
    }

    /// The wire name of this message, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CreateSession(_) => "create-session",
            Message::SessionCreated(_) => "session-created",
            Message::SessionExists(_) => "session-exists",
            Message::SessionCreationFailed(_) => "session-creation-failed",
            Message::JoinSession(_) => "join-session",
            Message::JoinSuccess(_) => "join-success",
            Message::JoinFailed(_) => "join-failed",
            Message::UserJoined(_) => "user-joined",
            Message::PeerLeft(_) => "peer-left",
            Message::MetadataHandshake(_) => "metadata-handshake",
            Message::Chunk(_) => "chunk",
            Message::ChunkAck(_) => "chunk-ack",
            Message::PullSignal(_) => "pull-signal",
            Message::EndOfTransfer(_) => "end-of-transfer",
            Message::Cancel(_) => "cancel",
            Message::TransferAborted(_) => "transfer-aborted",
            Message::TransferError(_) => "transfer-error",
        }
    }

    /// The transfer this message is about, if any.
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Message::MetadataHandshake(m) => Some(m.metadata.transfer_id),
            Message::Chunk(m) => Some(m.transfer_id),
            Message::PullSignal(m) => Some(m.transfer_id),
            Message::EndOfTransfer(m) => Some(m.transfer_id),
            Message::Cancel(m) => Some(m.transfer_id),
            Message::TransferAborted(m) => Some(m.transfer_id),
            Message::TransferError(m) => m.transfer_id,
            _ => None,
        }
    }
}

/// Description of one file, fixed once the handshake is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Sender-generated transfer identity
    pub transfer_id: TransferId,
    /// Original file name
    pub filename: String,
    /// Total size in bytes
    pub total_size: u64,
    /// MIME type, may be empty
    #[serde(default)]
    pub mime_type: String,
    /// Modification time in milliseconds since the Unix epoch
    #[serde(default)]
    pub last_modified: u64,
}

impl TransferMetadata {
    /// Longest accepted file name, in bytes.
    pub const MAX_FILENAME_LEN: usize = 255;

    /// Check the fields the relay and receiver depend on.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.filename.trim().is_empty() {
            return Err(WireError::InvalidData("empty filename".into()));
        }
        if self.filename.len() > Self::MAX_FILENAME_LEN {
            return Err(WireError::InvalidData(format!(
                "filename longer than {} bytes",
                Self::MAX_FILENAME_LEN
            )));
        }
        if self.filename.contains('\0') {
            return Err(WireError::InvalidData("filename contains NUL".into()));
        }
        Ok(())
    }
}

/// Open a session under `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    /// Requested code, validated by the relay
    pub code: String,
}

/// Session opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    /// The bound code
    pub code: SessionCode,
}

/// Code already taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExists {
    /// The contested code
    pub code: String,
}

/// Session could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreationFailed {
    /// Why
    pub reason: SessionError,
}

/// Join a session as its receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSession {
    /// Code shared by the sender
    pub code: String,
}

/// Joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSuccess {
    /// The joined code
    pub code: SessionCode,
    /// The session's sender
    pub sender_id: PeerId,
}

/// Join refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinFailed {
    /// Why
    pub reason: SessionError,
}

/// Tells the sender who its receiver is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    /// The newly bound receiver
    pub receiver_id: PeerId,
}

/// Tells the survivor its counterpart is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLeft {
    /// The affected session
    pub code: SessionCode,
    /// Human readable reason
    pub reason: String,
}

/// Opens a transfer addressed to the session's receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataHandshake {
    /// Receiver the sender believes is bound
    pub receiver_id: PeerId,
    /// What is being sent
    pub metadata: TransferMetadata,
}

/// One piece of file data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Per-connection correlation id echoed in the [`ChunkAck`]
    pub seq: u64,
    /// Transfer this chunk belongs to
    pub transfer_id: TransferId,
    /// Receiver the sender believes is bound
    pub receiver_id: PeerId,
    /// Byte offset of `payload` in the file
    pub offset: u64,
    /// File bytes, base64 on the wire
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    /// Final chunk of the file
    pub is_last: bool,
    /// Final chunk of its batch; the receiver pulls once everything up to
    /// the end of this chunk has arrived
    #[serde(default)]
    pub batch_end: bool,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("seq", &self.seq)
            .field("transfer_id", &self.transfer_id)
            .field("offset", &self.offset)
            .field("payload_len", &self.payload.len())
            .field("is_last", &self.is_last)
            .field("batch_end", &self.batch_end)
            .finish_non_exhaustive()
    }
}

/// Relay verdict on one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    /// Correlation id of the chunk
    pub seq: u64,
    /// `true` once the chunk was handed to the receiver
    pub accepted: bool,
    /// Why the chunk was refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkAck {
    /// Positive acknowledgment.
    pub fn accepted(seq: u64) -> Self {
        Self {
            seq,
            accepted: true,
            error: None,
        }
    }

    /// Negative acknowledgment.
    pub fn rejected(seq: u64, error: impl Into<String>) -> Self {
        Self {
            seq,
            accepted: false,
            error: Some(error.into()),
        }
    }
}

/// Receiver demand for the next batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSignal {
    /// Transfer to continue
    pub transfer_id: TransferId,
}

/// Sender has sent every byte.
///
/// A hint only; the receiver's own byte count decides completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndOfTransfer {
    /// Finished transfer
    pub transfer_id: TransferId,
    /// Receiver the sender believes is bound
    pub receiver_id: PeerId,
}

/// Abort a transfer from either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancel {
    /// Transfer to abort
    pub transfer_id: TransferId,
    /// Human readable reason
    pub reason: String,
}

/// The relay ended a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAborted {
    /// Aborted transfer
    pub transfer_id: TransferId,
    /// Reason, e.g. `timeout`
    pub reason: String,
}

/// A request was refused or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferErrorNotice {
    /// Transfer the request named, when it named one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Human readable reason
    pub reason: String,
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
