//! Session setup over a [`RelayConnection`].
//!
//! A sender creates a session under a room code and waits for a receiver
//! to join; a receiver joins with the code and learns the sender's id.

use std::time::Duration;

use drop_types::{
    CreateSession, JoinSession, JoinSuccess, Message, PeerId, SessionCode, SessionError,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::RelayConnection;
use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

impl<T: Transport + 'static> RelayConnection<T> {
    /// Open a session under `code`. The caller becomes its sender.
    pub async fn create_session(
        &self,
        code: &SessionCode,
        timeout: Duration,
    ) -> ClientResult<SessionCode> {
        self.send(&Message::CreateSession(CreateSession {
            code: code.to_string(),
        }))
        .await?;

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_event_until(deadline, "session-created").await? {
                Message::SessionCreated(created) => {
                    info!(code = %created.code, "session created");
                    return Ok(created.code);
                }
                Message::SessionExists(_) => return Err(SessionError::CodeInUse.into()),
                Message::SessionCreationFailed(failed) => return Err(failed.reason.into()),
                other => debug!(kind = other.kind(), "ignoring message during session setup"),
            }
        }
    }

    /// Join the session under `code` as its receiver.
    pub async fn join_session(&self, code: &str, timeout: Duration) -> ClientResult<JoinSuccess> {
        self.send(&Message::JoinSession(JoinSession {
            code: code.to_string(),
        }))
        .await?;

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_event_until(deadline, "join-success").await? {
                Message::JoinSuccess(joined) => {
                    info!(code = %joined.code, sender = %joined.sender_id, "joined session");
                    return Ok(joined);
                }
                Message::JoinFailed(failed) => return Err(failed.reason.into()),
                other => debug!(kind = other.kind(), "ignoring message during join"),
            }
        }
    }

    /// Wait for a receiver to join the caller's session.
    ///
    /// `None` waits until the connection closes.
    pub async fn wait_for_receiver(&self, timeout: Option<Duration>) -> ClientResult<PeerId> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let message = match deadline {
                Some(deadline) => self.next_event_until(deadline, "user-joined").await?,
                None => self.next_event().await.ok_or(ClientError::ConnectionLost)?,
            };
            match message {
                Message::UserJoined(joined) => {
                    info!(receiver = %joined.receiver_id, "receiver joined");
                    return Ok(joined.receiver_id);
                }
                other => debug!(kind = other.kind(), "ignoring message while waiting for receiver"),
            }
        }
    }

    async fn next_event_until(
        &self,
        deadline: Instant,
        waiting_for: &'static str,
    ) -> ClientResult<Message> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.next_event_within(remaining, waiting_for).await
    }
}
