//! Receiver transfer state machine.
//!
//! Tracks one inbound transfer: which ranges have arrived, when to pull
//! the next batch, when the byte count says the file is complete, and
//! whether the transfer has gone idle. The engine performs the sink
//! writes; this module only decides.

use std::time::{Duration, Instant};

use drop_types::TransferMetadata;
use thiserror::Error;

use crate::ranges::{RangeCheck, ReceivedRanges};
use crate::Tunables;

/// Lifecycle of an inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveStatus {
    /// Handshake seen, sink being acquired.
    Starting,
    /// Accepting chunks.
    Receiving,
    /// Every byte arrived, sink being finalized.
    Completing,
    /// Done.
    Complete,
    /// Failed, cancelled or aborted.
    Error,
}

impl ReceiveStatus {
    /// Check if the transfer can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Check if the inactivity monitor should keep running.
    pub fn is_monitored(&self) -> bool {
        matches!(self, Self::Starting | Self::Receiving)
    }
}

/// What to do with an admitted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Write it to the sink.
    Write,
    /// Already written; skip the write.
    Duplicate,
}

/// Why a chunk was refused. Every fault is fatal for the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveFault {
    /// Chunk arrived outside the `receiving` status.
    #[error("chunk received while {0:?}")]
    NotReceiving(ReceiveStatus),

    /// Payload larger than the chunk size.
    #[error("chunk of {len} bytes exceeds limit of {max}")]
    Oversized {
        /// Payload length.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Payload reaches past the end of the file.
    #[error("chunk {offset}+{len} exceeds file size {total}")]
    OutOfBounds {
        /// Chunk offset.
        offset: u64,
        /// Payload length.
        len: usize,
        /// File size.
        total: u64,
    },

    /// Empty payload.
    #[error("empty chunk at offset {0}")]
    Empty(u64),

    /// Payload partially overlaps bytes already received.
    #[error("chunk at offset {0} overlaps received data")]
    Overlap(u64),
}

/// Instructions for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverAction {
    /// Send a pull signal for the next batch.
    SendPull,
    /// Publish progress.
    ReportProgress {
        /// Bytes received.
        received: u64,
        /// Total bytes.
        total: u64,
    },
    /// Finalize the sink.
    Finalize,
}

/// State of one inbound transfer.
#[derive(Debug, Clone)]
pub struct ReceiverTransfer {
    metadata: TransferMetadata,
    status: ReceiveStatus,
    ranges: ReceivedRanges,
    /// End of the latest batch whose closing chunk has arrived.
    pending_batch_end: Option<u64>,
    /// End of the batch most recently pulled past.
    last_pulled: u64,
    last_activity: Instant,
    max_chunk: usize,
    inactivity_timeout: Duration,
}

impl ReceiverTransfer {
    /// Start tracking a transfer whose handshake arrived at `now`.
    pub fn new(metadata: TransferMetadata, tunables: &Tunables, now: Instant) -> Self {
        Self {
            metadata,
            status: ReceiveStatus::Starting,
            ranges: ReceivedRanges::new(),
            pending_batch_end: None,
            last_pulled: 0,
            last_activity: now,
            max_chunk: tunables.chunk_size,
            inactivity_timeout: tunables.inactivity_timeout,
        }
    }

    /// The handshake metadata.
    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    /// Current status.
    pub fn status(&self) -> ReceiveStatus {
        self.status
    }

    /// Distinct bytes received.
    pub fn received(&self) -> u64 {
        self.ranges.received()
    }

    /// The sink is ready; start receiving and request the first batch.
    pub fn on_sink_ready(&mut self, now: Instant) -> Vec<ReceiverAction> {
        if self.status != ReceiveStatus::Starting {
            return vec![];
        }
        self.status = ReceiveStatus::Receiving;
        self.last_activity = now;
        let mut actions = vec![ReceiverAction::SendPull];
        if self.metadata.total_size == 0 {
            self.status = ReceiveStatus::Completing;
            actions.push(ReceiverAction::Finalize);
        }
        actions
    }

    /// Decide whether a chunk may be written. Does not change state.
    pub fn admit(&self, offset: u64, len: usize) -> Result<Admission, ReceiveFault> {
        if self.status != ReceiveStatus::Receiving {
            return Err(ReceiveFault::NotReceiving(self.status));
        }
        if len == 0 {
            return Err(ReceiveFault::Empty(offset));
        }
        if len > self.max_chunk {
            return Err(ReceiveFault::Oversized {
                len,
                max: self.max_chunk,
            });
        }
        let total = self.metadata.total_size;
        if offset.checked_add(len as u64).map_or(true, |end| end > total) {
            return Err(ReceiveFault::OutOfBounds { offset, len, total });
        }
        match self.ranges.check(offset, len as u64) {
            RangeCheck::New => Ok(Admission::Write),
            RangeCheck::Duplicate => Ok(Admission::Duplicate),
            RangeCheck::Overlap => Err(ReceiveFault::Overlap(offset)),
        }
    }

    /// Record an admitted chunk once it is in the sink (or skipped as a duplicate).
    pub fn on_chunk_written(
        &mut self,
        offset: u64,
        len: usize,
        batch_end: bool,
        now: Instant,
    ) -> Vec<ReceiverAction> {
        if self.status != ReceiveStatus::Receiving {
            return vec![];
        }
        self.last_activity = now;

        let mut actions = Vec::new();
        if self.ranges.insert(offset, len as u64) {
            actions.push(ReceiverAction::ReportProgress {
                received: self.ranges.received(),
                total: self.metadata.total_size,
            });
        }

        if self.ranges.received() >= self.metadata.total_size {
            self.status = ReceiveStatus::Completing;
            actions.push(ReceiverAction::Finalize);
            return actions;
        }

        let end = offset + len as u64;
        if batch_end && end > self.last_pulled {
            self.pending_batch_end = Some(self.pending_batch_end.map_or(end, |p| p.max(end)));
        }
        if let Some(batch_end) = self.pending_batch_end {
            if self.ranges.contiguous() >= batch_end {
                self.pending_batch_end = None;
                self.last_pulled = batch_end;
                actions.push(ReceiverAction::SendPull);
            }
        }
        actions
    }

    /// The sink was finalized. Returns `true` if this completed the transfer.
    pub fn mark_complete(&mut self) -> bool {
        if self.status != ReceiveStatus::Completing {
            return false;
        }
        self.status = ReceiveStatus::Complete;
        true
    }

    /// Move to `error`. Returns `false` if already terminal.
    pub fn fail(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ReceiveStatus::Error;
        true
    }

    /// Check whether the transfer has been idle past the inactivity timeout.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.status.is_monitored()
            && now.saturating_duration_since(self.last_activity) > self.inactivity_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_types::TransferId;

    const MIB: u64 = 1_048_576;
    const CHUNK: usize = 131_072;

    fn metadata(total: u64) -> TransferMetadata {
        TransferMetadata {
            transfer_id: TransferId::new(),
            filename: "f.bin".into(),
            total_size: total,
            mime_type: String::new(),
            last_modified: 0,
        }
    }

    fn receiving(total: u64) -> (ReceiverTransfer, Instant) {
        let now = Instant::now();
        let mut r = ReceiverTransfer::new(metadata(total), &Tunables::default(), now);
        assert_eq!(r.on_sink_ready(now), vec![ReceiverAction::SendPull]);
        (r, now)
    }

    fn pulls(actions: &[ReceiverAction]) -> usize {
        actions
            .iter()
            .filter(|a| **a == ReceiverAction::SendPull)
            .count()
    }

    #[test]
    fn starts_in_starting() {
        let r = ReceiverTransfer::new(metadata(10), &Tunables::default(), Instant::now());
        assert_eq!(r.status(), ReceiveStatus::Starting);
        assert!(matches!(r.admit(0, 10), Err(ReceiveFault::NotReceiving(_))));
    }

    #[test]
    fn one_mib_needs_exactly_two_pulls() {
        let (mut r, now) = receiving(MIB);
        let mut total_pulls = 1; // on_sink_ready
        let mut finalized = false;

        for i in 0..8u64 {
            let offset = i * CHUNK as u64;
            let batch_end = i == 4 || i == 7;
            assert_eq!(r.admit(offset, CHUNK), Ok(Admission::Write));
            let actions = r.on_chunk_written(offset, CHUNK, batch_end, now);
            total_pulls += pulls(&actions);
            finalized |= actions.contains(&ReceiverAction::Finalize);
        }

        assert_eq!(total_pulls, 2);
        assert!(finalized);
        assert_eq!(r.received(), MIB);
        assert_eq!(r.status(), ReceiveStatus::Completing);
        assert!(r.mark_complete());
        assert!(!r.mark_complete());
    }

    #[test]
    fn pull_waits_for_whole_batch() {
        let (mut r, now) = receiving(10 * CHUNK as u64);
        // Closing chunk of the first batch arrives before chunk 3
        for i in [0u64, 1, 2, 4] {
            let actions = r.on_chunk_written(i * CHUNK as u64, CHUNK, i == 4, now);
            assert_eq!(pulls(&actions), 0);
        }
        let actions = r.on_chunk_written(3 * CHUNK as u64, CHUNK, false, now);
        assert_eq!(pulls(&actions), 1);
    }

    #[test]
    fn resent_batch_does_not_pull_twice() {
        let (mut r, now) = receiving(10 * CHUNK as u64);
        for i in 0..5u64 {
            r.on_chunk_written(i * CHUNK as u64, CHUNK, i == 4, now);
        }
        // Same batch again after a lost ack
        for i in 0..5u64 {
            let offset = i * CHUNK as u64;
            assert_eq!(r.admit(offset, CHUNK), Ok(Admission::Duplicate));
            let actions = r.on_chunk_written(offset, CHUNK, i == 4, now);
            assert!(actions.is_empty());
        }
        assert_eq!(r.received(), 5 * CHUNK as u64);
    }

    #[test]
    fn oversized_and_out_of_bounds_chunks_are_faults() {
        let (r, _) = receiving(1000);
        assert!(matches!(
            r.admit(0, CHUNK + 1),
            Err(ReceiveFault::Oversized { .. })
        ));
        assert!(matches!(
            r.admit(900, 200),
            Err(ReceiveFault::OutOfBounds { .. })
        ));
        assert!(matches!(
            r.admit(u64::MAX, 1),
            Err(ReceiveFault::OutOfBounds { .. })
        ));
        assert_eq!(r.admit(10, 0), Err(ReceiveFault::Empty(10)));
    }

    #[test]
    fn overlapping_chunk_is_fault() {
        let (mut r, now) = receiving(1000);
        r.on_chunk_written(0, 100, false, now);
        assert_eq!(r.admit(50, 100), Err(ReceiveFault::Overlap(50)));
    }

    #[test]
    fn empty_file_finalizes_immediately() {
        let now = Instant::now();
        let mut r = ReceiverTransfer::new(metadata(0), &Tunables::default(), now);
        assert_eq!(
            r.on_sink_ready(now),
            vec![ReceiverAction::SendPull, ReceiverAction::Finalize]
        );
        assert!(r.mark_complete());
    }

    #[test]
    fn idle_detection() {
        let (mut r, now) = receiving(1000);
        assert!(!r.is_idle(now + Duration::from_secs(300)));
        assert!(r.is_idle(now + Duration::from_secs(301)));

        r.on_chunk_written(0, 10, false, now + Duration::from_secs(200));
        assert!(!r.is_idle(now + Duration::from_secs(301)));
    }

    #[test]
    fn fail_is_idempotent_and_terminal() {
        let (mut r, now) = receiving(1000);
        assert!(r.fail());
        assert!(!r.fail());
        assert_eq!(r.status(), ReceiveStatus::Error);
        assert!(r.on_chunk_written(0, 10, false, now).is_empty());
        assert!(!r.is_idle(now + Duration::from_secs(3600)));
        assert!(!r.mark_complete());
    }

    #[test]
    fn complete_cannot_fail() {
        let now = Instant::now();
        let mut r = ReceiverTransfer::new(metadata(0), &Tunables::default(), now);
        r.on_sink_ready(now);
        r.mark_complete();
        assert!(!r.fail());
        assert_eq!(r.status(), ReceiveStatus::Complete);
    }
}
