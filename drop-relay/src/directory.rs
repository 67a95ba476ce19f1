//! Session directory: room codes to their sender and optional receiver.
//!
//! Every endpoint belongs to at most one session, either as its sender or
//! as its receiver. A session lives as long as its sender; a receiver may
//! leave and another may join the same code.

use std::collections::HashMap;

use drop_types::{PeerId, SessionCode, SessionError};

/// An endpoint's place in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the session.
    Sender,
    /// Joined the session.
    Receiver,
}

/// One live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Room code.
    pub code: SessionCode,
    /// Creator.
    pub sender: PeerId,
    /// Bound receiver, if any.
    pub receiver: Option<PeerId>,
}

/// What changed when a peer left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Session the peer belonged to.
    pub code: SessionCode,
    /// Role the peer had.
    pub role: Role,
    /// The other endpoint of the session, if bound.
    pub counterpart: Option<PeerId>,
}

/// All live sessions.
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: HashMap<SessionCode, Session>,
    members: HashMap<PeerId, (SessionCode, Role)>,
}

impl SessionDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session under `code` with `sender` as its sender.
    pub fn create(&mut self, code: SessionCode, sender: PeerId) -> Result<(), SessionError> {
        if self.sessions.contains_key(&code) {
            return Err(SessionError::CodeInUse);
        }
        if self.members.contains_key(&sender) {
            return Err(SessionError::PeerBusy);
        }
        self.members.insert(sender, (code.clone(), Role::Sender));
        self.sessions.insert(
            code.clone(),
            Session {
                code,
                sender,
                receiver: None,
            },
        );
        Ok(())
    }

    /// Bind `receiver` to the session under `code`. Returns the sender.
    pub fn join(&mut self, code: &SessionCode, receiver: PeerId) -> Result<PeerId, SessionError> {
        let session = self.sessions.get_mut(code).ok_or(SessionError::NotFound)?;
        if session.receiver.is_some() {
            return Err(SessionError::AlreadyBound);
        }
        if session.sender == receiver {
            return Err(SessionError::SelfJoin);
        }
        if self.members.contains_key(&receiver) {
            return Err(SessionError::PeerBusy);
        }
        session.receiver = Some(receiver);
        self.members.insert(receiver, (code.clone(), Role::Receiver));
        Ok(session.sender)
    }

    /// Session and role of `peer`.
    pub fn membership(&self, peer: &PeerId) -> Option<(&Session, Role)> {
        let (code, role) = self.members.get(peer)?;
        self.sessions.get(code).map(|session| (session, *role))
    }

    /// Session under `code`.
    pub fn get(&self, code: &SessionCode) -> Option<&Session> {
        self.sessions.get(code)
    }

    /// Remove `peer` from its session.
    ///
    /// A sender takes its session with it; a receiver only frees the slot.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Option<Departure> {
        let (code, role) = self.members.remove(peer)?;
        let counterpart = match role {
            Role::Sender => {
                let session = self.sessions.remove(&code)?;
                if let Some(receiver) = session.receiver {
                    self.members.remove(&receiver);
                }
                session.receiver
            }
            Role::Receiver => {
                let session = self.sessions.get_mut(&code)?;
                session.receiver = None;
                Some(session.sender)
            }
        };
        Some(Departure {
            code,
            role,
            counterpart,
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
