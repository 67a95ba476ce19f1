//! Sender transfer state machine.
//!
//! Pure and side-effect-free: the engine in `drop-client` feeds events
//! in and executes the returned actions. The machine enforces the pull
//! rhythm (one batch in flight, next batch only after a pull signal),
//! the bounded retry policy, and terminal-state stickiness.

use std::time::Duration;

use crate::plan::{plan_batch, BatchPlan};
use crate::Tunables;

/// Lifecycle of an outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    /// Metadata handshake not yet sent.
    Handshaking,
    /// Handshake sent, waiting for the receiver's first pull.
    AwaitingFirstPull,
    /// A batch is in flight.
    Sending,
    /// Batch settled, waiting for the next pull.
    AwaitingPull,
    /// Every byte settled, end-of-transfer being sent.
    Completing,
    /// Done.
    Complete,
    /// Timed out or retries exhausted.
    Failed,
    /// Cancelled locally or aborted by the counterpart or relay.
    Aborted,
}

impl SendStatus {
    /// Check if the transfer can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    /// Check if the engine is parked waiting for a pull signal.
    pub fn awaits_pull(&self) -> bool {
        matches!(self, Self::AwaitingFirstPull | Self::AwaitingPull)
    }
}

/// Inputs to the sender machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    /// The metadata handshake went out.
    HandshakeSent,
    /// A pull signal arrived.
    PullReceived,
    /// No pull signal within the wait timeout.
    PullTimedOut,
    /// Every chunk of the in-flight batch was accepted.
    BatchSettled,
    /// At least one chunk was rejected or its ack timed out.
    BatchRejected {
        /// First rejection reason seen.
        reason: String,
    },
    /// End-of-transfer went out.
    EndSent,
    /// The local user cancelled.
    Cancelled {
        /// Why.
        reason: String,
    },
    /// The relay or the receiver ended the transfer.
    PeerAborted {
        /// Why.
        reason: String,
    },
}

/// Instructions for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderAction {
    /// Wait for a pull signal, at most `timeout`.
    AwaitPull {
        /// Wait bound.
        timeout: Duration,
    },
    /// Dispatch every chunk of `batch` concurrently after `delay`.
    SendBatch {
        /// The batch.
        batch: BatchPlan,
        /// Backoff before sending; zero on the first attempt.
        delay: Duration,
        /// 0 for the first attempt, then the retry number.
        attempt: u32,
    },
    /// Publish progress.
    ReportProgress {
        /// Bytes settled.
        sent: u64,
        /// Total bytes.
        total: u64,
    },
    /// Send end-of-transfer.
    SendEnd,
    /// The transfer completed.
    Finish,
    /// The transfer failed; tell the counterpart.
    Fail {
        /// Why.
        reason: String,
    },
    /// The transfer was aborted.
    Abort {
        /// Why.
        reason: String,
        /// `true` if the counterpart still has to be told.
        notify_peer: bool,
    },
}

/// State of one outbound transfer.
#[derive(Debug, Clone)]
pub struct SenderTransfer {
    status: SendStatus,
    offset: u64,
    total: u64,
    retries: u32,
    in_flight: Option<BatchPlan>,
    tunables: Tunables,
}

impl SenderTransfer {
    /// Create a machine for a `total`-byte file.
    pub fn new(total: u64, tunables: Tunables) -> Self {
        Self {
            status: SendStatus::Handshaking,
            offset: 0,
            total,
            retries: 0,
            in_flight: None,
            tunables,
        }
    }

    /// Current status.
    pub fn status(&self) -> SendStatus {
        self.status
    }

    /// Bytes settled so far. Never decreases, never exceeds the total.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total bytes.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Consecutive rejections of the in-flight batch.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Process an event and return the actions to execute.
    ///
    /// Events that make no sense in the current status are ignored.
    /// A terminal status never changes.
    pub fn on_event(&mut self, event: SenderEvent) -> Vec<SenderAction> {
        if self.status.is_terminal() {
            return vec![];
        }

        match (self.status, event) {
            (SendStatus::Handshaking, SenderEvent::HandshakeSent) => {
                self.status = SendStatus::AwaitingFirstPull;
                vec![self.await_pull()]
            }

            (s, SenderEvent::PullReceived) if s.awaits_pull() => self.start_next_batch(),
            (s, SenderEvent::PullTimedOut) if s.awaits_pull() => {
                self.fail("timed out waiting for pull signal".into())
            }

            (SendStatus::Sending, SenderEvent::BatchSettled) => {
                if let Some(batch) = self.in_flight.take() {
                    self.offset = self.offset.max(batch.end).min(self.total);
                }
                self.retries = 0;
                let mut actions = vec![SenderAction::ReportProgress {
                    sent: self.offset,
                    total: self.total,
                }];
                if self.offset >= self.total {
                    self.status = SendStatus::Completing;
                    actions.push(SenderAction::SendEnd);
                } else {
                    self.status = SendStatus::AwaitingPull;
                    actions.push(self.await_pull());
                }
                actions
            }
            (SendStatus::Sending, SenderEvent::BatchRejected { reason }) => {
                self.retries += 1;
                match self.in_flight.clone() {
                    Some(batch) if self.retries <= self.tunables.max_retries => {
                        vec![SenderAction::SendBatch {
                            delay: self.tunables.retry_delay(self.retries),
                            attempt: self.retries,
                            batch,
                        }]
                    }
                    _ => self.fail(format!(
                        "batch at offset {} rejected after {} retries: {}",
                        self.offset, self.tunables.max_retries, reason
                    )),
                }
            }

            (SendStatus::Completing, SenderEvent::EndSent) => {
                self.status = SendStatus::Complete;
                vec![SenderAction::Finish]
            }

            (_, SenderEvent::Cancelled { reason }) => {
                self.status = SendStatus::Aborted;
                self.in_flight = None;
                vec![SenderAction::Abort {
                    reason,
                    notify_peer: true,
                }]
            }
            (_, SenderEvent::PeerAborted { reason }) => {
                self.status = SendStatus::Aborted;
                self.in_flight = None;
                vec![SenderAction::Abort {
                    reason,
                    notify_peer: false,
                }]
            }

            // Invalid transitions - stay in current state
            _ => vec![],
        }
    }

    fn await_pull(&self) -> SenderAction {
        SenderAction::AwaitPull {
            timeout: self.tunables.wait_timeout,
        }
    }

    fn start_next_batch(&mut self) -> Vec<SenderAction> {
        match plan_batch(self.offset, self.total, &self.tunables) {
            Some(batch) => {
                self.status = SendStatus::Sending;
                self.retries = 0;
                self.in_flight = Some(batch.clone());
                vec![SenderAction::SendBatch {
                    batch,
                    delay: Duration::ZERO,
                    attempt: 0,
                }]
            }
            None => {
                // Nothing left, e.g. an empty file
                self.status = SendStatus::Completing;
                vec![SenderAction::SendEnd]
            }
        }
    }

    fn fail(&mut self, reason: String) -> Vec<SenderAction> {
        self.status = SendStatus::Failed;
        self.in_flight = None;
        vec![SenderAction::Fail { reason }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1_048_576;

    fn batch_of(actions: &[SenderAction]) -> Option<&BatchPlan> {
        actions.iter().find_map(|a| match a {
            SenderAction::SendBatch { batch, .. } => Some(batch),
            _ => None,
        })
    }

    fn rejected() -> SenderEvent {
        SenderEvent::BatchRejected {
            reason: "busy".into(),
        }
    }

    #[test]
    fn starts_handshaking() {
        let s = SenderTransfer::new(10, Tunables::default());
        assert_eq!(s.status(), SendStatus::Handshaking);
        assert_eq!(s.offset(), 0);
    }

    #[test]
    fn handshake_then_waits_for_first_pull() {
        let mut s = SenderTransfer::new(10, Tunables::default());
        let actions = s.on_event(SenderEvent::HandshakeSent);
        assert_eq!(s.status(), SendStatus::AwaitingFirstPull);
        assert_eq!(
            actions,
            vec![SenderAction::AwaitPull {
                timeout: Duration::from_secs(30)
            }]
        );
    }

    #[test]
    fn no_batch_before_first_pull() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        assert!(s.on_event(SenderEvent::BatchSettled).is_empty());
        s.on_event(SenderEvent::HandshakeSent);
        assert!(s.on_event(SenderEvent::BatchSettled).is_empty());
        assert_eq!(s.status(), SendStatus::AwaitingFirstPull);
    }

    #[test]
    fn one_mib_transfer_walks_two_batches() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);

        let actions = s.on_event(SenderEvent::PullReceived);
        let first = batch_of(&actions).unwrap();
        assert_eq!((first.start, first.end), (0, 655_360));
        assert_eq!(s.status(), SendStatus::Sending);

        let actions = s.on_event(SenderEvent::BatchSettled);
        assert_eq!(s.offset(), 655_360);
        assert_eq!(s.status(), SendStatus::AwaitingPull);
        assert!(matches!(actions.last(), Some(SenderAction::AwaitPull { .. })));

        let actions = s.on_event(SenderEvent::PullReceived);
        let second = batch_of(&actions).unwrap();
        assert_eq!((second.start, second.end), (655_360, MIB));

        let actions = s.on_event(SenderEvent::BatchSettled);
        assert_eq!(s.offset(), MIB);
        assert_eq!(s.status(), SendStatus::Completing);
        assert_eq!(actions.last(), Some(&SenderAction::SendEnd));

        assert_eq!(s.on_event(SenderEvent::EndSent), vec![SenderAction::Finish]);
        assert_eq!(s.status(), SendStatus::Complete);
    }

    #[test]
    fn stale_pull_while_sending_is_ignored() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);
        assert!(s.on_event(SenderEvent::PullReceived).is_empty());
        assert_eq!(s.status(), SendStatus::Sending);
    }

    #[test]
    fn first_pull_timeout_fails() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        let actions = s.on_event(SenderEvent::PullTimedOut);
        assert_eq!(s.status(), SendStatus::Failed);
        assert!(matches!(actions.as_slice(), [SenderAction::Fail { .. }]));
    }

    #[test]
    fn retry_resends_same_batch_with_linear_backoff() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);
        s.on_event(SenderEvent::BatchSettled);
        s.on_event(SenderEvent::PullReceived);

        for attempt in 1..=3u32 {
            let actions = s.on_event(rejected());
            match actions.as_slice() {
                [SenderAction::SendBatch {
                    batch,
                    delay,
                    attempt: a,
                }] => {
                    assert_eq!((batch.start, batch.end), (655_360, MIB));
                    assert_eq!(*delay, Duration::from_millis(1000 * attempt as u64));
                    assert_eq!(*a, attempt);
                }
                other => panic!("unexpected actions {other:?}"),
            }
            assert_eq!(s.offset(), 655_360);
        }
    }

    #[test]
    fn exhausted_retries_fail_and_stop() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);

        // MAX_RETRIES + 1 consecutive rejections
        for _ in 0..3 {
            assert!(batch_of(&s.on_event(rejected())).is_some());
        }
        let actions = s.on_event(rejected());
        assert!(matches!(actions.as_slice(), [SenderAction::Fail { .. }]));
        assert_eq!(s.status(), SendStatus::Failed);
        assert_eq!(s.offset(), 0);

        // Nothing ever moves again
        assert!(s.on_event(SenderEvent::PullReceived).is_empty());
        assert!(s.on_event(SenderEvent::BatchSettled).is_empty());
        assert!(s.on_event(rejected()).is_empty());
        assert_eq!(s.status(), SendStatus::Failed);
    }

    #[test]
    fn retry_counter_resets_after_settled_batch() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);
        s.on_event(rejected());
        s.on_event(rejected());
        assert_eq!(s.retries(), 2);
        s.on_event(SenderEvent::BatchSettled);
        assert_eq!(s.retries(), 0);
    }

    #[test]
    fn empty_file_completes_after_first_pull() {
        let mut s = SenderTransfer::new(0, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        assert_eq!(
            s.on_event(SenderEvent::PullReceived),
            vec![SenderAction::SendEnd]
        );
        assert_eq!(s.status(), SendStatus::Completing);
    }

    #[test]
    fn cancel_notifies_peer_and_is_terminal() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        let actions = s.on_event(SenderEvent::Cancelled {
            reason: "user".into(),
        });
        assert_eq!(
            actions,
            vec![SenderAction::Abort {
                reason: "user".into(),
                notify_peer: true
            }]
        );
        assert_eq!(s.status(), SendStatus::Aborted);
        assert!(s.on_event(SenderEvent::PullReceived).is_empty());
    }

    #[test]
    fn peer_abort_does_not_echo() {
        let mut s = SenderTransfer::new(MIB, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);
        let actions = s.on_event(SenderEvent::PeerAborted {
            reason: "timeout".into(),
        });
        assert!(matches!(
            actions.as_slice(),
            [SenderAction::Abort {
                notify_peer: false,
                ..
            }]
        ));
    }

    #[test]
    fn complete_is_terminal() {
        let mut s = SenderTransfer::new(0, Tunables::default());
        s.on_event(SenderEvent::HandshakeSent);
        s.on_event(SenderEvent::PullReceived);
        s.on_event(SenderEvent::EndSent);
        assert!(s
            .on_event(SenderEvent::Cancelled {
                reason: "late".into()
            })
            .is_empty());
        assert_eq!(s.status(), SendStatus::Complete);
    }
}
