//! Receiver transfer engine.
//!
//! One task owns every inbound transfer and handles, in order, whatever the
//! relay sends and whatever its own command queue holds:
//!
//! ```text
//! RelayConnection events ─┐
//!                         ├─▶ run loop ─▶ ReceiverTransfer ─▶ Sink
//! commands ───────────────┘       │
//!   cancel (ReceiverHandle)       └─▶ pull-signal / cancel to the relay
//!   check-idle (monitor tasks)        ReceiverEvent to the application
//! ```
//!
//! Sinks are opened on their own task and handed back as a command, so a
//! slow destination never holds up the loop. From the handshake on, each
//! transfer owns a monitor task that asks the loop for an idle check every
//! few seconds. The monitor is aborted as soon as the transfer reaches a
//! terminal status, and the record itself is dropped; only its id is kept,
//! in a bounded list, to recognise a repeated handshake.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use drop_core::{Admission, ReceiverAction, ReceiverTransfer, Tunables};
use drop_types::{Cancel, Chunk, Message, PullSignal, TransferId, TransferMetadata};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::RelayConnection;
use crate::sink::{Sink, SinkOutput, SinkProvider};
use crate::transport::Transport;

/// What the receiver reports to the application.
#[derive(Debug)]
pub enum ReceiverEvent {
    /// A sender opened a transfer.
    Offered {
        /// Handshake metadata.
        metadata: TransferMetadata,
    },
    /// More bytes arrived.
    Progress {
        /// Transfer.
        transfer_id: TransferId,
        /// Distinct bytes received.
        received: u64,
        /// Total bytes.
        total: u64,
    },
    /// The file is complete.
    Completed {
        /// Transfer.
        transfer_id: TransferId,
        /// Where the bytes ended up.
        output: SinkOutput,
    },
    /// The transfer ended in error.
    Failed {
        /// Transfer.
        transfer_id: TransferId,
        /// Why.
        reason: String,
    },
}

#[derive(Debug)]
enum CancelTarget {
    Transfer(TransferId),
    First,
}

/// Finished transfer ids remembered for duplicate handshake detection.
const REMEMBERED_TRANSFERS: usize = 1024;

enum Command {
    Cancel {
        target: CancelTarget,
        reason: String,
        reply: oneshot::Sender<Option<TransferId>>,
    },
    CheckIdle(TransferId),
    SinkReady {
        transfer_id: TransferId,
        opened: Result<Box<dyn Sink>, String>,
    },
    Shutdown,
}

/// Control surface of a running [`ReceiverEngine`].
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ReceiverHandle {
    /// Cancel `transfer_id`. Returns `false` if it was not active.
    pub async fn cancel(&self, transfer_id: TransferId, reason: impl Into<String>) -> bool {
        self.request_cancel(CancelTarget::Transfer(transfer_id), reason.into())
            .await
            .is_some()
    }

    /// Cancel the earliest transfer that is still active.
    pub async fn cancel_first(&self, reason: impl Into<String>) -> Option<TransferId> {
        self.request_cancel(CancelTarget::First, reason.into()).await
    }

    /// Stop the engine, aborting whatever is still in progress.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request_cancel(&self, target: CancelTarget, reason: String) -> Option<TransferId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel {
                target,
                reason,
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

struct Inbound {
    machine: ReceiverTransfer,
    sink: Option<Box<dyn Sink>>,
    monitor: Option<JoinHandle<()>>,
}

impl Inbound {
    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Ids of retired transfers, oldest evicted first.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<TransferId>,
    seen: HashSet<TransferId>,
}

impl RecentIds {
    fn insert(&mut self, id: TransferId) {
        if !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > REMEMBERED_TRANSFERS {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &TransferId) -> bool {
        self.seen.contains(id)
    }
}

enum Step {
    Command(Option<Command>),
    Relay(Option<Message>),
}

/// Drives inbound transfers over one relay connection.
pub struct ReceiverEngine<T: Transport + 'static> {
    connection: Arc<RelayConnection<T>>,
    sinks: Arc<dyn SinkProvider>,
    tunables: Tunables,
    /// Transfers that have not reached a terminal status.
    transfers: HashMap<TransferId, Inbound>,
    /// Live transfer ids in handshake order.
    arrival: Vec<TransferId>,
    finished: RecentIds,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
}

impl<T: Transport + 'static> std::fmt::Debug for ReceiverEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverEngine")
            .field("transfers", &self.transfers.len())
            .field("tunables", &self.tunables)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> ReceiverEngine<T> {
    /// Create an engine plus its control handle and event stream.
    pub fn new(
        connection: Arc<RelayConnection<T>>,
        sinks: Arc<dyn SinkProvider>,
        tunables: Tunables,
    ) -> (Self, ReceiverHandle, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = ReceiverHandle {
            commands: commands_tx.clone(),
        };
        let engine = Self {
            connection,
            sinks,
            tunables,
            transfers: HashMap::new(),
            arrival: Vec::new(),
            finished: RecentIds::default(),
            commands_tx,
            commands,
            events,
        };
        (engine, handle, events_rx)
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until shutdown or until the relay connection ends.
    pub async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                message = self.connection.next_event() => Step::Relay(message),
            };

            match step {
                Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                    self.fail_all("receiver shut down", true).await;
                    break;
                }
                Step::Command(Some(command)) => self.on_command(command).await,
                Step::Relay(Some(message)) => self.on_message(message).await,
                Step::Relay(None) => {
                    self.fail_all("connection to relay lost", false).await;
                    break;
                }
            }
        }
        debug!("receiver engine stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Cancel {
                target,
                reason,
                reply,
            } => {
                let id = match target {
                    CancelTarget::Transfer(id) => Some(id).filter(|id| self.is_active(id)),
                    CancelTarget::First => self
                        .arrival
                        .iter()
                        .copied()
                        .find(|id| self.is_active(id)),
                };
                if let Some(id) = id {
                    self.fail_transfer(id, &reason, true).await;
                }
                let _ = reply.send(id);
            }
            Command::CheckIdle(id) => {
                let now = now();
                let idle = match self.transfers.get_mut(&id) {
                    Some(record) if record.machine.status().is_monitored() => {
                        record.machine.is_idle(now)
                    }
                    Some(record) => {
                        record.stop_monitor();
                        false
                    }
                    None => false,
                };
                if idle {
                    self.fail_transfer(id, "inactivity timeout", true).await;
                }
            }
            Command::SinkReady {
                transfer_id,
                opened,
            } => self.on_sink_ready(transfer_id, opened).await,
            Command::Shutdown => {}
        }
    }

    async fn on_message(&mut self, message: Message) {
        match message {
            Message::MetadataHandshake(handshake) => self.on_handshake(handshake.metadata).await,
            Message::Chunk(chunk) => self.on_chunk(chunk).await,
            Message::EndOfTransfer(end) => self.on_end(end.transfer_id),
            Message::Cancel(cancel) => {
                self.fail_transfer(cancel.transfer_id, &cancel.reason, false)
                    .await;
            }
            Message::TransferAborted(aborted) => {
                self.fail_transfer(aborted.transfer_id, &aborted.reason, false)
                    .await;
            }
            // The relay may still hold the transfer open, so the sender
            // has to hear about it from us.
            Message::TransferError(notice) => match notice.transfer_id {
                Some(id) => {
                    self.fail_transfer(id, &notice.reason, true).await;
                }
                None => warn!(reason = %notice.reason, "relay reported an error"),
            },
            Message::PeerLeft(left) => {
                info!(code = %left.code, reason = %left.reason, "sender left the session");
                self.fail_all(&format!("peer left: {}", left.reason), false)
                    .await;
            }
            other => debug!(kind = other.kind(), "receiver ignoring message"),
        }
    }

    async fn on_handshake(&mut self, metadata: TransferMetadata) {
        let transfer_id = metadata.transfer_id;
        if self.transfers.contains_key(&transfer_id) || self.finished.contains(&transfer_id) {
            debug!(%transfer_id, "duplicate handshake ignored");
            return;
        }

        info!(
            %transfer_id,
            filename = %metadata.filename,
            total = metadata.total_size,
            "incoming transfer"
        );
        self.arrival.push(transfer_id);
        self.transfers.insert(
            transfer_id,
            Inbound {
                machine: ReceiverTransfer::new(metadata.clone(), &self.tunables, now()),
                sink: None,
                monitor: Some(self.spawn_monitor(transfer_id)),
            },
        );
        self.emit(ReceiverEvent::Offered {
            metadata: metadata.clone(),
        });

        match metadata.validate() {
            Ok(()) => self.spawn_opener(metadata),
            Err(e) => {
                self.fail_transfer(transfer_id, &e.to_string(), true).await;
            }
        }
    }

    async fn on_sink_ready(
        &mut self,
        transfer_id: TransferId,
        opened: Result<Box<dyn Sink>, String>,
    ) {
        let Some(record) = self.transfers.get_mut(&transfer_id) else {
            if let Ok(sink) = opened {
                debug!(%transfer_id, "discarding sink for a transfer that already ended");
                sink.abort().await;
            }
            return;
        };
        match opened {
            Ok(sink) => {
                record.sink = Some(sink);
                let actions = record.machine.on_sink_ready(now());
                self.apply(transfer_id, actions).await;
            }
            Err(reason) => {
                self.fail_transfer(transfer_id, &reason, true).await;
            }
        }
    }

    async fn on_chunk(&mut self, chunk: Chunk) {
        let transfer_id = chunk.transfer_id;
        let len = chunk.payload.len();

        let written = {
            let Some(record) = self.transfers.get_mut(&transfer_id) else {
                if self.finished.contains(&transfer_id) {
                    debug!(%transfer_id, offset = chunk.offset, "chunk after transfer ended");
                } else {
                    debug!(%transfer_id, offset = chunk.offset, "chunk for unknown transfer");
                }
                return;
            };
            match record.machine.admit(chunk.offset, len) {
                Ok(admission) => {
                    if admission == Admission::Duplicate {
                        debug!(%transfer_id, offset = chunk.offset, "rewriting duplicate chunk");
                    }
                    match record.sink.as_mut() {
                        Some(sink) => sink
                            .write(chunk.offset, &chunk.payload)
                            .await
                            .map_err(|e| e.to_string()),
                        None => Err("no sink".to_string()),
                    }
                }
                Err(fault) => Err(fault.to_string()),
            }
        };

        if let Err(reason) = written {
            self.fail_transfer(transfer_id, &reason, true).await;
            return;
        }

        let actions = match self.transfers.get_mut(&transfer_id) {
            Some(record) => {
                record
                    .machine
                    .on_chunk_written(chunk.offset, len, chunk.batch_end, now())
            }
            None => return,
        };
        self.apply(transfer_id, actions).await;
    }

    fn on_end(&mut self, transfer_id: TransferId) {
        match self.transfers.get(&transfer_id) {
            Some(record) => warn!(
                %transfer_id,
                received = record.machine.received(),
                total = record.machine.metadata().total_size,
                "end-of-transfer before all bytes arrived; waiting for data"
            ),
            None if self.finished.contains(&transfer_id) => {
                debug!(%transfer_id, "end-of-transfer")
            }
            None => debug!(%transfer_id, "end-of-transfer for unknown transfer"),
        }
    }

    async fn apply(&mut self, transfer_id: TransferId, actions: Vec<ReceiverAction>) {
        for action in actions {
            match action {
                ReceiverAction::SendPull => {
                    let pull = Message::PullSignal(PullSignal { transfer_id });
                    if let Err(e) = self.connection.send(&pull).await {
                        warn!(%transfer_id, error = %e, "could not send pull signal");
                    }
                }
                ReceiverAction::ReportProgress { received, total } => {
                    self.emit(ReceiverEvent::Progress {
                        transfer_id,
                        received,
                        total,
                    });
                }
                ReceiverAction::Finalize => self.finalize(transfer_id).await,
            }
        }
    }

    async fn finalize(&mut self, transfer_id: TransferId) {
        let Some(sink) = self
            .transfers
            .get_mut(&transfer_id)
            .and_then(|record| record.sink.take())
        else {
            return;
        };
        match sink.finalize().await {
            Ok(output) => {
                let Some(record) = self.transfers.get_mut(&transfer_id) else {
                    return;
                };
                if record.machine.mark_complete() {
                    info!(%transfer_id, bytes = record.machine.received(), "transfer complete");
                    self.retire(transfer_id);
                    self.emit(ReceiverEvent::Completed {
                        transfer_id,
                        output,
                    });
                }
            }
            Err(e) => {
                self.fail_transfer(transfer_id, &e.to_string(), true).await;
            }
        }
    }

    /// Move a transfer to `error`, abort its sink and tell the application.
    /// Returns `false` if the transfer was unknown or already terminal.
    async fn fail_transfer(
        &mut self,
        transfer_id: TransferId,
        reason: &str,
        notify_peer: bool,
    ) -> bool {
        let Some(record) = self.transfers.get_mut(&transfer_id) else {
            debug!(%transfer_id, %reason, "ignoring failure for unknown transfer");
            return false;
        };
        if !record.machine.fail() {
            return false;
        }
        if let Some(sink) = self.retire(transfer_id) {
            sink.abort().await;
        }

        warn!(%transfer_id, %reason, "transfer failed");
        if notify_peer {
            let cancel = Message::Cancel(Cancel {
                transfer_id,
                reason: reason.to_string(),
            });
            if let Err(e) = self.connection.send(&cancel).await {
                debug!(%transfer_id, error = %e, "could not notify sender");
            }
        }
        self.emit(ReceiverEvent::Failed {
            transfer_id,
            reason: reason.to_string(),
        });
        true
    }

    async fn fail_all(&mut self, reason: &str, notify_peer: bool) {
        let active: Vec<TransferId> = self
            .arrival
            .iter()
            .copied()
            .filter(|id| self.is_active(id))
            .collect();
        for id in active {
            self.fail_transfer(id, reason, notify_peer).await;
        }
    }

    /// Forget a terminal transfer, keeping only its id. Hands back its sink.
    fn retire(&mut self, transfer_id: TransferId) -> Option<Box<dyn Sink>> {
        self.arrival.retain(|id| *id != transfer_id);
        self.finished.insert(transfer_id);
        let mut record = self.transfers.remove(&transfer_id)?;
        record.stop_monitor();
        record.sink.take()
    }

    fn is_active(&self, transfer_id: &TransferId) -> bool {
        self.transfers
            .get(transfer_id)
            .is_some_and(|record| !record.machine.status().is_terminal())
    }

    /// Open a sink for `metadata` off the loop, bounded by the inactivity timeout.
    fn spawn_opener(&self, metadata: TransferMetadata) {
        let sinks = Arc::clone(&self.sinks);
        let commands = self.commands_tx.clone();
        let limit = self.tunables.inactivity_timeout;
        tokio::spawn(async move {
            let transfer_id = metadata.transfer_id;
            let opened = match tokio::time::timeout(limit, sinks.open(&metadata)).await {
                Ok(Ok(sink)) => Ok(sink),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timed out waiting for destination".to_string()),
            };
            // Engine gone: nobody will finalize this sink
            if let Err(mpsc::error::SendError(Command::SinkReady {
                opened: Ok(sink), ..
            })) = commands.send(Command::SinkReady {
                transfer_id,
                opened,
            }) {
                sink.abort().await;
            }
        });
    }

    fn spawn_monitor(&self, transfer_id: TransferId) -> JoinHandle<()> {
        let commands = self.commands_tx.clone();
        let period = self.tunables.idle_check_interval;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if commands.send(Command::CheckIdle(transfer_id)).is_err() {
                    break;
                }
            }
        })
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
