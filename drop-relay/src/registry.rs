//! Transfer registry: live transfers keyed by transfer id.

use std::collections::HashMap;
use std::time::Duration;

use drop_types::{PeerId, SessionCode, TransferId};
use tokio::time::Instant;

/// One live transfer as the relay sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Transfer id.
    pub transfer_id: TransferId,
    /// Session the transfer runs in.
    pub code: SessionCode,
    /// Sending endpoint.
    pub sender: PeerId,
    /// Receiving endpoint.
    pub receiver: PeerId,
    /// Announced file size.
    pub total_size: u64,
    /// Highest byte forwarded so far; never decreases.
    pub offset: u64,
    /// Payload bytes forwarded, resends included.
    pub bytes_relayed: u64,
    /// Last forwarded message for this transfer.
    pub last_activity: Instant,
}

impl TransferRecord {
    /// Record a forwarded chunk ending at `end`.
    pub fn advance(&mut self, end: u64, len: usize, now: Instant) {
        self.offset = self.offset.max(end.min(self.total_size));
        self.bytes_relayed += len as u64;
        self.last_activity = now;
    }

    /// Check whether the transfer has been idle longer than `timeout`.
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// All live transfers.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: HashMap<TransferId, TransferRecord>,
}

impl TransferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer. Returns `false` if the id is taken.
    pub fn insert(&mut self, record: TransferRecord) -> bool {
        if self.transfers.contains_key(&record.transfer_id) {
            return false;
        }
        self.transfers.insert(record.transfer_id, record);
        true
    }

    /// Check if `transfer_id` is registered.
    pub fn contains(&self, transfer_id: &TransferId) -> bool {
        self.transfers.contains_key(transfer_id)
    }

    /// Look up a transfer.
    pub fn get(&self, transfer_id: &TransferId) -> Option<&TransferRecord> {
        self.transfers.get(transfer_id)
    }

    /// Look up a transfer for update.
    pub fn get_mut(&mut self, transfer_id: &TransferId) -> Option<&mut TransferRecord> {
        self.transfers.get_mut(transfer_id)
    }

    /// Stamp activity on a transfer.
    pub fn touch(&mut self, transfer_id: &TransferId, now: Instant) {
        if let Some(record) = self.transfers.get_mut(transfer_id) {
            record.last_activity = now;
        }
    }

    /// Remove a transfer.
    pub fn remove(&mut self, transfer_id: &TransferId) -> Option<TransferRecord> {
        self.transfers.remove(transfer_id)
    }

    /// Remove every transfer `peer` takes part in.
    pub fn remove_for_peer(&mut self, peer: &PeerId) -> Vec<TransferRecord> {
        let ids: Vec<TransferId> = self
            .transfers
            .values()
            .filter(|r| r.sender == *peer || r.receiver == *peer)
            .map(|r| r.transfer_id)
            .collect();
        ids.iter().filter_map(|id| self.transfers.remove(id)).collect()
    }

    /// Transfers idle longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<TransferId> {
        self.transfers
            .values()
            .filter(|r| r.is_expired(now, timeout))
            .map(|r| r.transfer_id)
            .collect()
    }

    /// Number of live transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Check if there are no transfers.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
