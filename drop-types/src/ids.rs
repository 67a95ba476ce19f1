//! Identity types for sharedrop.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shortest accepted session code.
pub const MIN_CODE_LEN: usize = 4;

/// Longest accepted session code.
pub const MAX_CODE_LEN: usize = 64;

/// Length of generated session codes.
pub const DEFAULT_CODE_LEN: usize = 6;

const CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Identity the relay assigns to a connected endpoint.
///
/// UUID v4, one per WebSocket connection. Never chosen by the endpoint itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(uuid::Uuid);

impl PeerId {
    /// Create a new random PeerId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Get the raw bytes of this PeerId.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_string()[..8])
    }
}

/// Identity of one file transfer, generated by the sender.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(uuid::Uuid);

impl TransferId {
    /// Create a new random TransferId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self.0)
    }
}

/// A short, human-shareable room code.
///
/// Between [`MIN_CODE_LEN`] and [`MAX_CODE_LEN`] characters drawn from
/// `[A-Za-z0-9_-]`. Codes are case sensitive.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Validate a code supplied by an endpoint.
    pub fn parse(code: &str) -> Result<Self, SessionError> {
        let len = code.chars().count();
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&len) {
            return Err(SessionError::InvalidCode);
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SessionError::InvalidCode);
        }
        Ok(Self(code.to_string()))
    }

    /// Generate a random lowercase alphanumeric code.
    ///
    /// `len` is clamped into the accepted range.
    pub fn generate(len: usize) -> Self {
        let len = len.clamp(MIN_CODE_LEN, MAX_CODE_LEN);
        let mut code = String::with_capacity(len);
        let mut bytes = [0u8; 32];
        while code.len() < len {
            getrandom::getrandom(&mut bytes).expect("getrandom failed");
            code.extend(
                bytes
                    .iter()
                    .filter_map(|b| code_char(*b))
                    .take(len - code.len()),
            );
        }
        Self(code)
    }

    /// Get the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Map a random byte onto [`CODE_ALPHABET`], rejecting the bytes past the
/// last whole multiple of the alphabet size so every character is equally likely.
fn code_char(byte: u8) -> Option<char> {
    let n = CODE_ALPHABET.len();
    let accepted = 256 - 256 % n;
    let byte = usize::from(byte);
    (byte < accepted).then(|| CODE_ALPHABET[byte % n] as char)
}

impl TryFrom<String> for SessionCode {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl FromStr for SessionCode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionCode({})", self.0)
    }
}
