//! Relay dispatcher.
//!
//! [`RelayState`] owns the peer table, the [`SessionDirectory`] and the
//! [`TransferRegistry`]. It runs inside a single task and is fed through one
//! command queue by every connection task and by the reaper, so sessions and
//! transfers are only ever mutated in one place, one command at a time.
//!
//! ```text
//! connection tasks ──Connect/Inbound/Disconnect──┐
//!                                                 ├─▶ mpsc ─▶ RelayState
//! reaper ───────────────────────────Sweep────────┘              │
//!                                                    per-peer outbound queues
//! ```
//!
//! Outbound delivery never blocks the dispatcher: every peer has a bounded
//! queue written with `try_send`. A chunk that does not fit is refused with a
//! negative ack; a peer whose queue overflows on a control message is dropped.

use crate::config::{Config, TransferConfig};
use crate::directory::{Role, SessionDirectory};
use crate::error::{ProtocolError, ProtocolResult};
use crate::limits::{ConnectionSlots, RateLimits};
use crate::registry::{TransferRecord, TransferRegistry};
use drop_types::{
    Chunk, ChunkAck, EndOfTransfer, JoinFailed, JoinSuccess, Message, MetadataHandshake,
    PeerId, PeerLeft, PullSignal, SessionCode, SessionCreated, SessionCreationFailed,
    SessionError, SessionExists, TransferAborted, TransferErrorNotice, TransferId, UserJoined,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart).
/// Gauges are published by the dispatcher after every command.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Total sessions created.
    pub sessions_created: AtomicU64,
    /// Total transfers opened.
    pub transfers_started: AtomicU64,
    /// Total transfers that reached end-of-transfer.
    pub transfers_completed: AtomicU64,
    /// Total transfers cancelled, disconnected or reaped.
    pub transfers_aborted: AtomicU64,
    /// Total transfers reaped for inactivity.
    pub transfers_reaped: AtomicU64,
    /// Total chunks forwarded.
    pub chunks_relayed: AtomicU64,
    /// Total payload bytes forwarded.
    pub bytes_relayed: AtomicU64,
    /// Total chunks refused because the receiver's queue was full.
    pub capacity_rejections: AtomicU64,
    /// Total rate limit rejections (connection + message + global).
    pub rate_limit_hits: AtomicU64,
    /// Total protocol errors.
    pub errors_total: AtomicU64,
    /// Live sessions.
    pub sessions_active: AtomicU64,
    /// Live transfers.
    pub transfers_active: AtomicU64,
    /// Connected peers.
    pub peers_connected: AtomicU64,
}

impl RelayMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Input to the dispatcher.
#[derive(Debug)]
pub enum RelayCommand {
    /// A connection was accepted; `outbound` delivers to it.
    Connect {
        /// Identity assigned to the connection.
        peer: PeerId,
        /// Queue drained by the connection task.
        outbound: mpsc::Sender<Message>,
    },
    /// A decoded message from a peer.
    Inbound {
        /// Originating peer.
        peer: PeerId,
        /// The message.
        message: Message,
    },
    /// A connection ended.
    Disconnect {
        /// The departed peer.
        peer: PeerId,
    },
    /// Reap idle transfers.
    Sweep,
}

/// Sessions, transfers and peers, mutated only by the dispatcher.
pub struct RelayState {
    limits: TransferConfig,
    peers: HashMap<PeerId, mpsc::Sender<Message>>,
    directory: SessionDirectory,
    registry: TransferRegistry,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayState")
            .field("peers", &self.peers.len())
            .field("sessions", &self.directory.len())
            .field("transfers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl RelayState {
    /// Create an empty state.
    pub fn new(limits: TransferConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            limits,
            peers: HashMap::new(),
            directory: SessionDirectory::new(),
            registry: TransferRegistry::new(),
            metrics,
        }
    }

    /// The session directory.
    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// The transfer registry.
    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Apply one command.
    pub fn apply(&mut self, command: RelayCommand, now: Instant) {
        match command {
            RelayCommand::Connect { peer, outbound } => self.connect(peer, outbound),
            RelayCommand::Inbound { peer, message } => self.dispatch(peer, message, now),
            RelayCommand::Disconnect { peer } => self.disconnect(peer),
            RelayCommand::Sweep => {
                self.sweep(now);
            }
        }
        self.publish_gauges();
    }

    /// Register a connected peer.
    pub fn connect(&mut self, peer: PeerId, outbound: mpsc::Sender<Message>) {
        tracing::debug!(%peer, "peer connected");
        self.peers.insert(peer, outbound);
    }

    /// Handle one message from `peer`.
    pub fn dispatch(&mut self, peer: PeerId, message: Message, now: Instant) {
        let kind = message.kind();
        let transfer_id = message.transfer_id();

        let outcome = match message {
            Message::CreateSession(request) => {
                self.create_session(peer, request.code);
                Ok(())
            }
            Message::JoinSession(request) => {
                self.join_session(peer, request.code);
                Ok(())
            }
            Message::MetadataHandshake(handshake) => self.open_transfer(peer, handshake, now),
            Message::Chunk(chunk) => {
                self.relay_chunk(peer, chunk, now);
                Ok(())
            }
            Message::PullSignal(pull) => self.relay_pull(peer, pull, now),
            Message::EndOfTransfer(end) => self.finish_transfer(peer, end),
            Message::Cancel(_)
            | Message::TransferAborted(_)
            | Message::TransferError(TransferErrorNotice {
                transfer_id: Some(_),
                ..
            }) => self.end_transfer(peer, message),
            _ => Err(ProtocolError::RelayOnly(kind)),
        };

        if let Err(e) = outcome {
            self.reject(peer, transfer_id, kind, e);
        }
    }

    fn create_session(&mut self, peer: PeerId, raw: String) {
        let code = match SessionCode::parse(&raw) {
            Ok(code) => code,
            Err(reason) => {
                tracing::debug!(%peer, code = %raw, "rejecting malformed session code");
                self.deliver(
                    peer,
                    Message::SessionCreationFailed(SessionCreationFailed { reason }),
                );
                return;
            }
        };

        match self.directory.create(code.clone(), peer) {
            Ok(()) => {
                RelayMetrics::bump(&self.metrics.sessions_created);
                tracing::info!(%peer, %code, "session created");
                self.deliver(peer, Message::SessionCreated(SessionCreated { code }));
            }
            Err(SessionError::CodeInUse) => {
                tracing::debug!(%peer, %code, "session code in use");
                self.deliver(peer, Message::SessionExists(SessionExists { code: raw }));
            }
            Err(reason) => {
                tracing::debug!(%peer, %code, %reason, "session not created");
                self.deliver(
                    peer,
                    Message::SessionCreationFailed(SessionCreationFailed { reason }),
                );
            }
        }
    }

    fn join_session(&mut self, peer: PeerId, raw: String) {
        let joined = SessionCode::parse(&raw).and_then(|code| {
            let sender = self.directory.join(&code, peer)?;
            Ok((code, sender))
        });

        match joined {
            Ok((code, sender)) => {
                tracing::info!(%peer, %code, %sender, "receiver joined session");
                self.deliver(
                    peer,
                    Message::JoinSuccess(JoinSuccess {
                        code,
                        sender_id: sender,
                    }),
                );
                self.deliver(sender, Message::UserJoined(UserJoined { receiver_id: peer }));
            }
            Err(reason) => {
                tracing::debug!(%peer, code = %raw, %reason, "join refused");
                self.deliver(peer, Message::JoinFailed(JoinFailed { reason }));
            }
        }
    }

    fn open_transfer(
        &mut self,
        peer: PeerId,
        handshake: MetadataHandshake,
        now: Instant,
    ) -> ProtocolResult<()> {
        let metadata = &handshake.metadata;
        if self.registry.contains(&metadata.transfer_id) {
            return Err(ProtocolError::DuplicateTransfer);
        }
        let (session, role) = self
            .directory
            .membership(&peer)
            .ok_or(ProtocolError::NotInSession)?;
        if role != Role::Sender {
            return Err(ProtocolError::NotSender);
        }
        let receiver = session.receiver.ok_or(ProtocolError::NoReceiver)?;
        if handshake.receiver_id != receiver {
            return Err(ProtocolError::ReceiverMismatch);
        }
        metadata
            .validate()
            .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))?;
        if metadata.total_size > self.limits.max_transfer_size {
            return Err(ProtocolError::TransferTooLarge {
                size: metadata.total_size,
                limit: self.limits.max_transfer_size,
            });
        }

        let transfer_id = metadata.transfer_id;
        let code = session.code.clone();
        tracing::info!(
            %transfer_id,
            %code,
            sender = %peer,
            %receiver,
            size = metadata.total_size,
            "transfer opened"
        );
        self.registry.insert(TransferRecord {
            transfer_id,
            code,
            sender: peer,
            receiver,
            total_size: metadata.total_size,
            offset: 0,
            bytes_relayed: 0,
            last_activity: now,
        });
        RelayMetrics::bump(&self.metrics.transfers_started);
        self.deliver(receiver, Message::MetadataHandshake(handshake));
        Ok(())
    }

    fn relay_chunk(&mut self, peer: PeerId, chunk: Chunk, now: Instant) {
        let seq = chunk.seq;
        let transfer_id = chunk.transfer_id;

        let receiver = match self.check_chunk(peer, &chunk) {
            Ok(receiver) => receiver,
            Err(e) => {
                self.count_violation(peer, Some(transfer_id), "chunk", &e);
                self.deliver(
                    peer,
                    Message::ChunkAck(ChunkAck::rejected(seq, e.public_reason())),
                );
                return;
            }
        };

        let len = chunk.payload.len();
        let end = chunk.offset + len as u64;
        match self.forward_chunk(receiver, chunk) {
            Ok(()) => {
                if let Some(record) = self.registry.get_mut(&transfer_id) {
                    record.advance(end, len, now);
                }
                RelayMetrics::bump(&self.metrics.chunks_relayed);
                self.metrics
                    .bytes_relayed
                    .fetch_add(len as u64, Ordering::Relaxed);
                self.deliver(peer, Message::ChunkAck(ChunkAck::accepted(seq)));
            }
            Err(reason) => {
                RelayMetrics::bump(&self.metrics.capacity_rejections);
                tracing::debug!(%transfer_id, seq, reason, "chunk refused");
                self.deliver(peer, Message::ChunkAck(ChunkAck::rejected(seq, reason)));
            }
        }
    }

    fn check_chunk(&self, peer: PeerId, chunk: &Chunk) -> ProtocolResult<PeerId> {
        let record = self
            .registry
            .get(&chunk.transfer_id)
            .ok_or(ProtocolError::UnknownTransfer)?;
        if record.sender != peer {
            return Err(ProtocolError::NotSender);
        }
        if chunk.receiver_id != record.receiver {
            return Err(ProtocolError::ReceiverMismatch);
        }
        let len = chunk.payload.len();
        if len == 0 {
            return Err(ProtocolError::EmptyChunk);
        }
        if len > self.limits.max_chunk_size {
            return Err(ProtocolError::ChunkTooLarge {
                len,
                limit: self.limits.max_chunk_size,
            });
        }
        if chunk
            .offset
            .checked_add(len as u64)
            .map_or(true, |end| end > record.total_size)
        {
            return Err(ProtocolError::OutOfBounds {
                offset: chunk.offset,
                len,
                total: record.total_size,
            });
        }
        Ok(record.receiver)
    }

    fn forward_chunk(&mut self, to: PeerId, chunk: Chunk) -> Result<(), &'static str> {
        let Some(outbound) = self.peers.get(&to) else {
            return Err("receiver unavailable");
        };
        match outbound.try_send(Message::Chunk(chunk)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err("receiver backlog full"),
            Err(TrySendError::Closed(_)) => Err("receiver unavailable"),
        }
    }

    fn relay_pull(&mut self, peer: PeerId, pull: PullSignal, now: Instant) -> ProtocolResult<()> {
        let record = self
            .registry
            .get(&pull.transfer_id)
            .ok_or(ProtocolError::UnknownTransfer)?;
        if record.receiver != peer {
            return Err(ProtocolError::NotReceiver);
        }
        let sender = record.sender;
        self.registry.touch(&pull.transfer_id, now);
        self.deliver(sender, Message::PullSignal(pull));
        Ok(())
    }

    fn finish_transfer(&mut self, peer: PeerId, end: EndOfTransfer) -> ProtocolResult<()> {
        let record = self
            .registry
            .get(&end.transfer_id)
            .ok_or(ProtocolError::UnknownTransfer)?;
        if record.sender != peer {
            return Err(ProtocolError::NotSender);
        }
        if end.receiver_id != record.receiver {
            return Err(ProtocolError::ReceiverMismatch);
        }

        let receiver = record.receiver;
        tracing::info!(
            transfer_id = %end.transfer_id,
            bytes = record.bytes_relayed,
            "transfer finished"
        );
        self.registry.remove(&end.transfer_id);
        RelayMetrics::bump(&self.metrics.transfers_completed);
        self.deliver(receiver, Message::EndOfTransfer(end));
        Ok(())
    }

    /// Cancel, abort or error notice from one party: forward it to the other
    /// and forget the transfer.
    fn end_transfer(&mut self, peer: PeerId, message: Message) -> ProtocolResult<()> {
        let transfer_id = message
            .transfer_id()
            .ok_or(ProtocolError::UnknownTransfer)?;
        let record = self
            .registry
            .get(&transfer_id)
            .ok_or(ProtocolError::UnknownTransfer)?;
        let counterpart = if peer == record.sender {
            record.receiver
        } else if peer == record.receiver {
            record.sender
        } else {
            return Err(ProtocolError::NotParticipant);
        };

        tracing::info!(%transfer_id, %peer, kind = message.kind(), "transfer ended by endpoint");
        self.registry.remove(&transfer_id);
        RelayMetrics::bump(&self.metrics.transfers_aborted);
        self.deliver(counterpart, message);
        Ok(())
    }

    /// Tear down whatever `peer` took part in and tell the survivors.
    pub fn disconnect(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let departure = self.directory.remove_peer(&peer);

        for record in self.registry.remove_for_peer(&peer) {
            let (survivor, reason) = if record.sender == peer {
                (record.receiver, "sender disconnected")
            } else {
                (record.sender, "receiver disconnected")
            };
            RelayMetrics::bump(&self.metrics.transfers_aborted);
            tracing::info!(transfer_id = %record.transfer_id, %peer, reason, "transfer aborted");
            self.deliver(
                survivor,
                Message::TransferAborted(TransferAborted {
                    transfer_id: record.transfer_id,
                    reason: reason.to_string(),
                }),
            );
        }

        match departure {
            Some(departure) => {
                tracing::info!(%peer, code = %departure.code, role = ?departure.role, "peer left session");
                if let Some(other) = departure.counterpart {
                    let reason = match departure.role {
                        Role::Sender => "sender left",
                        Role::Receiver => "receiver left",
                    };
                    self.deliver(
                        other,
                        Message::PeerLeft(PeerLeft {
                            code: departure.code,
                            reason: reason.to_string(),
                        }),
                    );
                }
            }
            None => tracing::debug!(%peer, "peer disconnected"),
        }
    }

    /// Abort every transfer idle past the inactivity timeout and notify both
    /// parties. Returns how many were reaped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.limits.inactivity_timeout();
        let expired = self.registry.expired(now, timeout);

        for transfer_id in &expired {
            let Some(record) = self.registry.remove(transfer_id) else {
                continue;
            };
            RelayMetrics::bump(&self.metrics.transfers_aborted);
            RelayMetrics::bump(&self.metrics.transfers_reaped);
            tracing::info!(
                %transfer_id,
                idle_secs = now.saturating_duration_since(record.last_activity).as_secs(),
                "reaping idle transfer"
            );
            for party in [record.sender, record.receiver] {
                self.deliver(
                    party,
                    Message::TransferAborted(TransferAborted {
                        transfer_id: *transfer_id,
                        reason: "timeout".to_string(),
                    }),
                );
            }
        }

        if expired.is_empty() {
            tracing::debug!("sweep: no idle transfers");
        }
        expired.len()
    }

    fn reject(
        &mut self,
        peer: PeerId,
        transfer_id: Option<TransferId>,
        kind: &'static str,
        error: ProtocolError,
    ) {
        self.count_violation(peer, transfer_id, kind, &error);
        self.deliver(
            peer,
            Message::TransferError(TransferErrorNotice {
                transfer_id,
                reason: error.public_reason().to_string(),
            }),
        );
    }

    fn count_violation(
        &self,
        peer: PeerId,
        transfer_id: Option<TransferId>,
        kind: &'static str,
        error: &ProtocolError,
    ) {
        RelayMetrics::bump(&self.metrics.errors_total);
        tracing::warn!(%peer, ?transfer_id, kind, %error, "protocol violation");
    }

    /// Queue `message` for `to` without waiting.
    ///
    /// A peer whose queue is full is dropped; its connection closes and the
    /// resulting disconnect tears down its session.
    fn deliver(&mut self, to: PeerId, message: Message) {
        let Some(outbound) = self.peers.get(&to) else {
            tracing::debug!(peer = %to, kind = message.kind(), "recipient not connected");
            return;
        };
        match outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!(peer = %to, kind = message.kind(), "outbound queue full, dropping peer");
                RelayMetrics::bump(&self.metrics.errors_total);
                self.peers.remove(&to);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer = %to, "recipient queue closed");
                self.peers.remove(&to);
            }
        }
    }

    fn publish_gauges(&self) {
        let m = &self.metrics;
        m.sessions_active
            .store(self.directory.len() as u64, Ordering::Relaxed);
        m.transfers_active
            .store(self.registry.len() as u64, Ordering::Relaxed);
        m.peers_connected
            .store(self.peers.len() as u64, Ordering::Relaxed);
    }
}

/// Main relay server: shared configuration, limits and metrics, plus the
/// command queue into the dispatcher.
pub struct DropRelay {
    config: Config,
    /// Rate limiters for connections and messages.
    rate_limits: RateLimits,
    /// Concurrent connection cap.
    slots: ConnectionSlots,
    /// Operational metrics (counters, gauges).
    metrics: Arc<RelayMetrics>,
    commands: mpsc::Sender<RelayCommand>,
    started: std::time::Instant,
}

impl std::fmt::Debug for DropRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("connections", &self.slots.active())
            .finish_non_exhaustive()
    }
}

impl DropRelay {
    /// Start the dispatcher task and return the relay plus the task handle.
    pub fn start(config: Config) -> (Arc<Self>, JoinHandle<()>) {
        let metrics = Arc::new(RelayMetrics::default());
        let (commands, queue) = mpsc::channel(config.server.command_queue.max(1));
        let state = RelayState::new(config.transfers.clone(), Arc::clone(&metrics));
        let dispatcher = tokio::spawn(run_dispatcher(state, queue));

        let relay = Arc::new(Self {
            rate_limits: RateLimits::new(&config.limits),
            slots: ConnectionSlots::new(config.limits.max_connections),
            config,
            metrics,
            commands,
            started: std::time::Instant::now(),
        });
        (relay, dispatcher)
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the connection cap.
    pub fn slots(&self) -> &ConnectionSlots {
        &self.slots
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Time since the relay started.
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Queue a command for the dispatcher.
    pub async fn submit(&self, command: RelayCommand) -> crate::error::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| crate::error::RelayError::DispatcherStopped)
    }

    /// Register a new peer and return its identity and outbound queue.
    pub async fn register_peer(&self) -> crate::error::Result<(PeerId, mpsc::Receiver<Message>)> {
        let peer = PeerId::new();
        let (outbound, queue) = mpsc::channel(self.config.server.outbound_queue.max(1));
        self.submit(RelayCommand::Connect { peer, outbound }).await?;
        RelayMetrics::bump(&self.metrics.connections_total);
        Ok((peer, queue))
    }
}

async fn run_dispatcher(mut state: RelayState, mut commands: mpsc::Receiver<RelayCommand>) {
    tracing::info!("relay dispatcher started");
    while let Some(command) = commands.recv().await {
        state.apply(command, Instant::now());
    }
    tracing::info!("relay dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use drop_types::{Cancel, CreateSession, JoinSession, TransferMetadata};
    use std::time::Duration;

    const CHUNK: usize = 131_072;
    const MIB: u64 = 1_048_576;

    struct Harness {
        state: RelayState,
        metrics: Arc<RelayMetrics>,
        outboxes: HashMap<PeerId, mpsc::Receiver<Message>>,
    }

    impl Harness {
        fn new() -> Self {
            let metrics = Arc::new(RelayMetrics::default());
            Self {
                state: RelayState::new(TransferConfig::default(), Arc::clone(&metrics)),
                metrics,
                outboxes: HashMap::new(),
            }
        }

        fn connect_with_capacity(&mut self, capacity: usize) -> PeerId {
            let peer = PeerId::new();
            let (tx, rx) = mpsc::channel(capacity);
            self.state.apply(RelayCommand::Connect { peer, outbound: tx }, Instant::now());
            self.outboxes.insert(peer, rx);
            peer
        }

        fn connect(&mut self) -> PeerId {
            self.connect_with_capacity(64)
        }

        fn send(&mut self, peer: PeerId, message: Message) {
            self.state
                .apply(RelayCommand::Inbound { peer, message }, Instant::now());
        }

        fn drain(&mut self, peer: PeerId) -> Vec<Message> {
            let rx = self.outboxes.get_mut(&peer).unwrap();
            let mut messages = Vec::new();
            while let Ok(m) = rx.try_recv() {
                messages.push(m);
            }
            messages
        }

        /// Sender and receiver bound to "room42", outboxes drained.
        fn paired(&mut self) -> (PeerId, PeerId) {
            let sender = self.connect();
            let receiver = self.connect();
            self.send(sender, create("room42"));
            self.send(receiver, join("room42"));
            self.drain(sender);
            self.drain(receiver);
            (sender, receiver)
        }

        /// A paired session with one open transfer of `size` bytes.
        fn open(&mut self, size: u64) -> (PeerId, PeerId, TransferId) {
            let (sender, receiver) = self.paired();
            let id = TransferId::new();
            self.send(sender, handshake(id, receiver, size));
            self.drain(receiver);
            (sender, receiver, id)
        }
    }

    fn create(code: &str) -> Message {
        Message::CreateSession(CreateSession { code: code.into() })
    }

    fn join(code: &str) -> Message {
        Message::JoinSession(JoinSession { code: code.into() })
    }

    fn handshake(transfer_id: TransferId, receiver: PeerId, size: u64) -> Message {
        Message::MetadataHandshake(MetadataHandshake {
            receiver_id: receiver,
            metadata: TransferMetadata {
                transfer_id,
                filename: "a.bin".into(),
                total_size: size,
                mime_type: "application/octet-stream".into(),
                last_modified: 0,
            },
        })
    }

    fn chunk(seq: u64, transfer_id: TransferId, receiver: PeerId, offset: u64, len: usize) -> Message {
        Message::Chunk(Chunk {
            seq,
            transfer_id,
            receiver_id: receiver,
            offset,
            payload: vec![1; len],
            is_last: false,
            batch_end: false,
        })
    }

    fn acks(messages: &[Message]) -> Vec<(u64, bool)> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::ChunkAck(a) => Some((a.seq, a.accepted)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_session_and_duplicate_code() {
        let mut h = Harness::new();
        let (a, b) = (h.connect(), h.connect());

        h.send(a, create("room42"));
        assert!(matches!(&h.drain(a)[..], [Message::SessionCreated(c)] if c.code.as_str() == "room42"));

        h.send(b, create("room42"));
        assert!(matches!(&h.drain(b)[..], [Message::SessionExists(e)] if e.code == "room42"));
        assert_eq!(h.state.directory().len(), 1);
    }

    #[tokio::test]
    async fn malformed_code_is_refused() {
        let mut h = Harness::new();
        let a = h.connect();
        h.send(a, create("no"));
        assert!(matches!(
            &h.drain(a)[..],
            [Message::SessionCreationFailed(SessionCreationFailed {
                reason: SessionError::InvalidCode
            })]
        ));
        assert!(h.state.directory().is_empty());
    }

    #[tokio::test]
    async fn join_confirms_and_notifies_sender() {
        let mut h = Harness::new();
        let (sender, receiver) = (h.connect(), h.connect());
        h.send(sender, create("room42"));
        h.drain(sender);

        h.send(receiver, join("room42"));
        assert!(matches!(
            &h.drain(receiver)[..],
            [Message::JoinSuccess(j)] if j.sender_id == sender
        ));
        assert!(matches!(
            &h.drain(sender)[..],
            [Message::UserJoined(u)] if u.receiver_id == receiver
        ));
    }

    #[tokio::test]
    async fn join_failures() {
        let mut h = Harness::new();
        let (sender, receiver) = h.paired();
        let late = h.connect();

        h.send(late, join("missing"));
        h.send(late, join("room42"));
        h.send(sender, join("room42"));
        let reasons: Vec<SessionError> = h
            .drain(late)
            .into_iter()
            .chain(h.drain(sender))
            .filter_map(|m| match m {
                Message::JoinFailed(f) => Some(f.reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                SessionError::NotFound,
                SessionError::AlreadyBound,
                SessionError::AlreadyBound
            ]
        );
        assert_eq!(
            h.state.directory().get(&SessionCode::parse("room42").unwrap()).unwrap().receiver,
            Some(receiver)
        );
    }

    #[tokio::test]
    async fn self_join_is_refused() {
        let mut h = Harness::new();
        let sender = h.connect();
        h.send(sender, create("room42"));
        h.drain(sender);

        h.send(sender, join("room42"));
        assert!(matches!(
            &h.drain(sender)[..],
            [Message::JoinFailed(JoinFailed {
                reason: SessionError::SelfJoin
            })]
        ));
    }

    #[tokio::test]
    async fn one_mib_transfer_is_relayed() {
        let mut h = Harness::new();
        let (sender, receiver) = h.paired();
        let id = TransferId::new();

        h.send(sender, handshake(id, receiver, MIB));
        assert!(matches!(&h.drain(receiver)[..], [Message::MetadataHandshake(_)]));
        assert_eq!(h.state.registry().len(), 1);

        for round in [0..5u64, 5..8u64] {
            h.send(receiver, Message::PullSignal(PullSignal { transfer_id: id }));
            assert!(matches!(&h.drain(sender)[..], [Message::PullSignal(_)]));
            for i in round {
                h.send(sender, chunk(i + 1, id, receiver, i * CHUNK as u64, CHUNK));
            }
        }

        let to_sender = h.drain(sender);
        assert_eq!(acks(&to_sender), (1..=8).map(|s| (s, true)).collect::<Vec<_>>());
        let forwarded = h.drain(receiver);
        assert_eq!(forwarded.len(), 8);
        assert_eq!(h.state.registry().get(&id).unwrap().offset, MIB);

        h.send(
            sender,
            Message::EndOfTransfer(EndOfTransfer {
                transfer_id: id,
                receiver_id: receiver,
            }),
        );
        assert!(matches!(&h.drain(receiver)[..], [Message::EndOfTransfer(_)]));
        assert!(h.state.registry().is_empty());
        assert_eq!(h.metrics.transfers_completed.load(Ordering::Relaxed), 1);
        assert_eq!(h.metrics.bytes_relayed.load(Ordering::Relaxed), MIB);
    }

    #[tokio::test]
    async fn forged_handshake_changes_nothing() {
        let mut h = Harness::new();
        let (sender, receiver) = h.paired();
        let stranger = h.connect();

        // Receiver posing as sender
        h.send(receiver, handshake(TransferId::new(), sender, 10));
        // Sender naming someone else as receiver
        h.send(sender, handshake(TransferId::new(), stranger, 10));
        // Peer outside any session
        h.send(stranger, handshake(TransferId::new(), receiver, 10));

        assert!(h.state.registry().is_empty());
        assert!(matches!(&h.drain(receiver)[..], [Message::TransferError(_)]));
        assert!(matches!(&h.drain(sender)[..], [Message::TransferError(_)]));
        assert!(matches!(&h.drain(stranger)[..], [Message::TransferError(_)]));
        assert_eq!(h.metrics.errors_total.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn duplicate_transfer_id_is_rejected() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(100);

        h.send(sender, handshake(id, receiver, 100));
        assert!(h.drain(receiver).is_empty());
        assert!(matches!(
            &h.drain(sender)[..],
            [Message::TransferError(TransferErrorNotice { reason, .. })] if reason == "not permitted"
        ));
    }

    #[tokio::test]
    async fn invalid_chunks_are_nacked_not_forwarded() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(1000);

        h.send(receiver, chunk(1, id, receiver, 0, 10)); // wrong party
        h.send(sender, chunk(2, id, sender, 0, 10)); // wrong receiver id
        h.send(sender, chunk(3, id, receiver, 0, CHUNK + 1)); // oversized
        h.send(sender, chunk(4, id, receiver, 990, 20)); // past the end
        h.send(sender, chunk(5, id, receiver, 0, 0)); // empty
        h.send(sender, chunk(6, TransferId::new(), receiver, 0, 10)); // unknown

        assert!(h.drain(receiver).iter().all(|m| !matches!(m, Message::Chunk(_))));
        assert_eq!(acks(&h.drain(sender)), vec![(2, false), (3, false), (4, false), (5, false), (6, false)]);
        assert_eq!(h.state.registry().get(&id).unwrap().offset, 0);
    }

    #[tokio::test]
    async fn full_receiver_queue_nacks_chunk() {
        let mut h = Harness::new();
        let sender = h.connect();
        let receiver = h.connect_with_capacity(3);
        h.send(sender, create("room42"));
        h.send(receiver, join("room42"));
        h.drain(sender);
        h.drain(receiver);

        let id = TransferId::new();
        h.send(sender, handshake(id, receiver, MIB));
        // Handshake occupies one slot; two chunks fit, the third does not
        for i in 0..3u64 {
            h.send(sender, chunk(i + 1, id, receiver, i * 100, 100));
        }

        let to_sender = h.drain(sender);
        assert_eq!(acks(&to_sender), vec![(1, true), (2, true), (3, false)]);
        match &to_sender[2] {
            Message::ChunkAck(ack) => assert_eq!(ack.error.as_deref(), Some("receiver backlog full")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.metrics.capacity_rejections.load(Ordering::Relaxed), 1);
        assert_eq!(h.state.peer_count(), 2);
    }

    #[tokio::test]
    async fn pull_only_from_receiver() {
        let mut h = Harness::new();
        let (sender, _receiver, id) = h.open(1000);

        h.send(sender, Message::PullSignal(PullSignal { transfer_id: id }));
        assert!(matches!(&h.drain(sender)[..], [Message::TransferError(_)]));
    }

    #[tokio::test]
    async fn cancel_is_forwarded_and_forgets_transfer() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(1000);

        h.send(
            receiver,
            Message::Cancel(Cancel {
                transfer_id: id,
                reason: "user cancelled".into(),
            }),
        );
        assert!(matches!(
            &h.drain(sender)[..],
            [Message::Cancel(c)] if c.reason == "user cancelled"
        ));
        assert!(h.state.registry().is_empty());
    }

    #[tokio::test]
    async fn relay_only_messages_are_violations() {
        let mut h = Harness::new();
        let peer = h.connect();
        h.send(peer, Message::ChunkAck(ChunkAck::accepted(1)));
        assert!(matches!(
            &h.drain(peer)[..],
            [Message::TransferError(TransferErrorNotice { transfer_id: None, reason })] if reason == "unexpected message"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transfer_is_reaped_once() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(MIB);

        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(h.state.sweep(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(h.state.sweep(Instant::now()), 1);
        assert_eq!(h.state.sweep(Instant::now()), 0);

        for peer in [sender, receiver] {
            let aborted: Vec<Message> = h.drain(peer);
            assert!(matches!(
                &aborted[..],
                [Message::TransferAborted(a)] if a.transfer_id == id && a.reason == "timeout"
            ));
        }
        assert!(h.state.registry().is_empty());
        assert_eq!(h.metrics.transfers_reaped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_postpones_reaping() {
        let mut h = Harness::new();
        let (_sender, receiver, id) = h.open(MIB);

        tokio::time::advance(Duration::from_secs(250)).await;
        h.send(receiver, Message::PullSignal(PullSignal { transfer_id: id }));
        tokio::time::advance(Duration::from_secs(250)).await;
        assert_eq!(h.state.sweep(Instant::now()), 0);
    }

    #[tokio::test]
    async fn sender_disconnect_tears_down_session() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(MIB);

        h.state
            .apply(RelayCommand::Disconnect { peer: sender }, Instant::now());

        assert!(h.state.directory().is_empty());
        assert!(h.state.registry().is_empty());
        let notices = h.drain(receiver);
        assert!(matches!(
            &notices[..],
            [Message::TransferAborted(a), Message::PeerLeft(p)]
                if a.transfer_id == id && a.reason == "sender disconnected" && p.reason == "sender left"
        ));
        assert_eq!(h.metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(h.metrics.peers_connected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn receiver_disconnect_keeps_session_open() {
        let mut h = Harness::new();
        let (sender, receiver, id) = h.open(MIB);

        h.state
            .apply(RelayCommand::Disconnect { peer: receiver }, Instant::now());

        assert!(h.state.registry().is_empty());
        assert!(matches!(
            &h.drain(sender)[..],
            [Message::TransferAborted(a), Message::PeerLeft(p)]
                if a.transfer_id == id && a.reason == "receiver disconnected" && p.reason == "receiver left"
        ));

        let next = h.connect();
        h.send(next, join("room42"));
        assert!(matches!(&h.drain(next)[..], [Message::JoinSuccess(_)]));
    }

    #[tokio::test]
    async fn overflowing_control_queue_drops_peer() {
        let mut h = Harness::new();
        let peer = h.connect_with_capacity(1);
        h.send(peer, create("room1"));
        h.send(peer, create("room2"));
        assert_eq!(h.state.peer_count(), 0);
    }

    #[tokio::test]
    async fn dispatcher_task_applies_commands() {
        let (relay, _task) = DropRelay::start(Config::default());
        let (a, mut a_rx) = relay.register_peer().await.unwrap();
        relay
            .submit(RelayCommand::Inbound {
                peer: a,
                message: create("room42"),
            })
            .await
            .unwrap();

        assert!(matches!(a_rx.recv().await, Some(Message::SessionCreated(_))));
        assert_eq!(relay.metrics().sessions_active.load(Ordering::Relaxed), 1);
        assert_eq!(relay.metrics().connections_total.load(Ordering::Relaxed), 1);
    }
}
