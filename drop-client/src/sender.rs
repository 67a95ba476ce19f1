//! Sender transfer engine.
//!
//! Interprets [`SenderTransfer`] actions against a [`RelayConnection`]:
//! sends the handshake, waits for pull signals, fans a batch of chunks out
//! concurrently and joins their acknowledgments, backs off and resends a
//! rejected batch, and finally sends end-of-transfer.
//!
//! ```text
//! handshake ─▶ wait pull ─▶ batch (join_all acks) ─▶ wait pull ─▶ ... ─▶ end
//!                               │ any NACK/timeout
//!                               └─▶ sleep 1s*n ─▶ same batch again (n ≤ MAX_RETRIES)
//! ```

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use drop_core::{BatchPlan, SendStatus, SenderAction, SenderEvent, SenderTransfer, Tunables};
use drop_types::{
    Cancel, Chunk, EndOfTransfer, Message, MetadataHandshake, PeerId, TransferId,
    TransferMetadata,
};
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{RelayConnection, TransferSignal};
use crate::error::TransferError;
use crate::transport::Transport;

/// The file being sent.
#[derive(Debug, Clone)]
pub struct FileSource {
    filename: String,
    mime_type: String,
    last_modified: u64,
    size: u64,
    content: Content,
}

#[derive(Debug, Clone)]
enum Content {
    Memory(Arc<Vec<u8>>),
    Path(PathBuf),
}

impl FileSource {
    /// A file held in memory.
    pub fn from_bytes(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            last_modified: now_millis(),
            size: data.len() as u64,
            content: Content::Memory(Arc::new(data)),
        }
    }

    /// A file on disk, read one batch at a time.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as u64);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            mime_type: guess_mime(&filename).to_string(),
            filename,
            last_modified,
            size: meta.len(),
            content: Content::Path(path.to_path_buf()),
        })
    }

    /// File name sent in the handshake.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Handshake metadata for `transfer_id`.
    pub fn metadata(&self, transfer_id: TransferId) -> TransferMetadata {
        TransferMetadata {
            transfer_id,
            filename: self.filename.clone(),
            total_size: self.size,
            mime_type: self.mime_type.clone(),
            last_modified: self.last_modified,
        }
    }

    async fn read_batch(&self, batch: &BatchPlan) -> std::io::Result<Vec<Vec<u8>>> {
        match &self.content {
            Content::Memory(data) => Ok(batch
                .chunks
                .iter()
                .map(|c| data[c.offset as usize..c.end() as usize].to_vec())
                .collect()),
            Content::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut payloads = Vec::with_capacity(batch.chunks.len());
                for chunk in &batch.chunks {
                    let mut buf = vec![0u8; chunk.len];
                    file.seek(SeekFrom::Start(chunk.offset)).await?;
                    file.read_exact(&mut buf).await?;
                    payloads.push(buf);
                }
                Ok(payloads)
            }
        }
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderProgress {
    /// Transfer.
    pub transfer_id: TransferId,
    /// Current status.
    pub status: SendStatus,
    /// Bytes acknowledged.
    pub sent: u64,
    /// Total bytes.
    pub total: u64,
}

/// Successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Transfer.
    pub transfer_id: TransferId,
    /// Bytes delivered.
    pub bytes: u64,
}

/// A send running in the background.
#[derive(Debug)]
pub struct SendHandle {
    transfer_id: TransferId,
    cancel: CancellationToken,
    progress: watch::Receiver<SenderProgress>,
    task: JoinHandle<Result<SendReport, TransferError>>,
}

impl SendHandle {
    /// Transfer id of this send.
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Request cancellation; takes effect at the next wait point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this send, usable after [`wait`](Self::wait) took the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watch progress.
    pub fn progress(&self) -> watch::Receiver<SenderProgress> {
        self.progress.clone()
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<SendReport, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Aborted(format!("sender task ended: {e}")))?
    }
}

/// Drives outbound transfers over one relay connection.
pub struct SenderEngine<T: Transport + 'static> {
    connection: Arc<RelayConnection<T>>,
    tunables: Tunables,
}

impl<T: Transport + 'static> Clone for SenderEngine<T> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            tunables: self.tunables.clone(),
        }
    }
}

impl<T: Transport + 'static> SenderEngine<T> {
    /// Create an engine.
    pub fn new(connection: Arc<RelayConnection<T>>, tunables: Tunables) -> Self {
        Self {
            connection,
            tunables,
        }
    }

    /// Start sending `source` to `receiver` in the background.
    pub fn start(&self, receiver: PeerId, source: FileSource) -> SendHandle {
        let transfer_id = TransferId::new();
        let cancel = CancellationToken::new();
        let (progress_tx, progress) = watch::channel(SenderProgress {
            transfer_id,
            status: SendStatus::Handshaking,
            sent: 0,
            total: source.size(),
        });

        let engine = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            engine
                .send(transfer_id, receiver, &source, &token, &progress_tx)
                .await
        });

        SendHandle {
            transfer_id,
            cancel,
            progress,
            task,
        }
    }

    /// Send `source` to `receiver`, returning when the transfer is terminal.
    pub async fn send(
        &self,
        transfer_id: TransferId,
        receiver: PeerId,
        source: &FileSource,
        cancel: &CancellationToken,
        progress: &watch::Sender<SenderProgress>,
    ) -> Result<SendReport, TransferError> {
        let signals = self.connection.register_transfer(transfer_id).await;
        let mut inbox = Inbox {
            rx: signals,
            deferred_pulls: 0,
        };
        let mut machine = SenderTransfer::new(source.size(), self.tunables.clone());

        info!(
            %transfer_id,
            filename = source.filename(),
            total = source.size(),
            "starting transfer"
        );
        let result = self
            .drive(transfer_id, receiver, source, &mut machine, &mut inbox, cancel, progress)
            .await;

        // Late signals for this transfer are swallowed until the grace period ends
        let connection = Arc::clone(&self.connection);
        let grace = self.tunables.release_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            connection.release_transfer(transfer_id).await;
        });

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        transfer_id: TransferId,
        receiver: PeerId,
        source: &FileSource,
        machine: &mut SenderTransfer,
        inbox: &mut Inbox,
        cancel: &CancellationToken,
        progress: &watch::Sender<SenderProgress>,
    ) -> Result<SendReport, TransferError> {
        self.connection
            .send(&Message::MetadataHandshake(MetadataHandshake {
                receiver_id: receiver,
                metadata: source.metadata(transfer_id),
            }))
            .await?;

        let mut actions: VecDeque<SenderAction> = machine.on_event(SenderEvent::HandshakeSent).into();
        publish(progress, transfer_id, machine);

        while let Some(action) = actions.pop_front() {
            let event = match action {
                SenderAction::AwaitPull { timeout } => Some(inbox.wait_pull(timeout, cancel).await),
                SenderAction::SendBatch {
                    batch,
                    delay,
                    attempt,
                } => {
                    let interrupted = if attempt > 0 {
                        warn!(%transfer_id, offset = batch.start, attempt, "retrying batch");
                        inbox.pause(delay, cancel).await
                    } else {
                        None
                    };
                    match interrupted {
                        Some(event) => Some(event),
                        None => Some(
                            self.send_batch(transfer_id, receiver, source, &batch, cancel)
                                .await?,
                        ),
                    }
                }
                SenderAction::ReportProgress { sent, total } => {
                    debug!(%transfer_id, sent, total, "batch settled");
                    None
                }
                SenderAction::SendEnd => {
                    self.connection
                        .send(&Message::EndOfTransfer(EndOfTransfer {
                            transfer_id,
                            receiver_id: receiver,
                        }))
                        .await?;
                    Some(SenderEvent::EndSent)
                }
                SenderAction::Finish => {
                    info!(%transfer_id, bytes = machine.total(), "transfer complete");
                    return Ok(SendReport {
                        transfer_id,
                        bytes: machine.total(),
                    });
                }
                SenderAction::Fail { reason } => {
                    warn!(%transfer_id, %reason, "transfer failed");
                    self.notify_cancel(transfer_id, &reason).await;
                    return Err(TransferError::Failed(reason));
                }
                SenderAction::Abort {
                    reason,
                    notify_peer,
                } => {
                    info!(%transfer_id, %reason, "transfer aborted");
                    if notify_peer {
                        self.notify_cancel(transfer_id, &reason).await;
                    }
                    return Err(TransferError::Aborted(reason));
                }
            };

            if let Some(event) = event {
                actions.extend(machine.on_event(event));
                publish(progress, transfer_id, machine);
            }
        }

        Err(TransferError::Failed("sender stalled".into()))
    }

    /// Dispatch every chunk of `batch` at once and join the acknowledgments.
    async fn send_batch(
        &self,
        transfer_id: TransferId,
        receiver: PeerId,
        source: &FileSource,
        batch: &BatchPlan,
        cancel: &CancellationToken,
    ) -> Result<SenderEvent, TransferError> {
        if cancel.is_cancelled() {
            return Ok(cancelled());
        }
        let payloads = match source.read_batch(batch).await {
            Ok(payloads) => payloads,
            Err(e) => {
                self.notify_cancel(transfer_id, "sender could not read file").await;
                return Err(TransferError::Source(e));
            }
        };

        debug!(%transfer_id, start = batch.start, end = batch.end, "sending batch");
        let requests = batch.chunks.iter().zip(payloads).map(|(spec, payload)| {
            self.connection.request_chunk(Chunk {
                seq: 0,
                transfer_id,
                receiver_id: receiver,
                offset: spec.offset,
                payload,
                is_last: spec.is_last,
                batch_end: spec.batch_end,
            })
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(cancelled()),
            results = join_all(requests) => results,
        };

        let rejection = results.into_iter().find_map(|result| match result {
            Ok(ack) if ack.accepted => None,
            Ok(ack) => Some(ack.error.unwrap_or_else(|| "rejected".into())),
            Err(e) => Some(e.to_string()),
        });
        Ok(match rejection {
            None => SenderEvent::BatchSettled,
            Some(reason) => SenderEvent::BatchRejected { reason },
        })
    }

    async fn notify_cancel(&self, transfer_id: TransferId, reason: &str) {
        let message = Message::Cancel(Cancel {
            transfer_id,
            reason: reason.to_string(),
        });
        if let Err(e) = self.connection.send(&message).await {
            debug!(%transfer_id, error = %e, "could not notify counterpart");
        }
    }
}

/// Pull and abort signals for one transfer.
struct Inbox {
    rx: mpsc::UnboundedReceiver<TransferSignal>,
    /// Pulls that arrived while no pull was awaited.
    deferred_pulls: u32,
}

impl Inbox {
    async fn wait_pull(&mut self, timeout: Duration, cancel: &CancellationToken) -> SenderEvent {
        if self.deferred_pulls > 0 {
            self.deferred_pulls -= 1;
            return SenderEvent::PullReceived;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => cancelled(),
            signal = tokio::time::timeout(timeout, self.rx.recv()) => match signal {
                Ok(Some(TransferSignal::Pull)) => SenderEvent::PullReceived,
                Ok(Some(TransferSignal::Aborted { reason })) => SenderEvent::PeerAborted { reason },
                Ok(None) => connection_lost(),
                Err(_) => SenderEvent::PullTimedOut,
            },
        }
    }

    /// Sleep for `delay` unless the transfer is cancelled or aborted first.
    async fn pause(&mut self, delay: Duration, cancel: &CancellationToken) -> Option<SenderEvent> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(cancelled()),
                signal = self.rx.recv() => match signal {
                    Some(TransferSignal::Pull) => self.deferred_pulls += 1,
                    Some(TransferSignal::Aborted { reason }) => {
                        return Some(SenderEvent::PeerAborted { reason })
                    }
                    None => return Some(connection_lost()),
                },
                _ = &mut sleep => return None,
            }
        }
    }
}

fn cancelled() -> SenderEvent {
    SenderEvent::Cancelled {
        reason: "cancelled by user".into(),
    }
}

fn connection_lost() -> SenderEvent {
    SenderEvent::PeerAborted {
        reason: "connection to relay lost".into(),
    }
}

fn publish(progress: &watch::Sender<SenderProgress>, transfer_id: TransferId, machine: &SenderTransfer) {
    progress.send_replace(SenderProgress {
        transfer_id,
        status: machine.status(),
        sent: machine.offset(),
        total: machine.total(),
    });
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn guess_mime(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
