//! RelayConnection - one endpoint's link to the relay.
//!
//! A single reader task owns the receive half of the transport and acts
//! as the typed dispatcher for everything the relay sends:
//!
//! ```text
//!                     ┌── chunk-ack ──────────▶ oneshot keyed by seq
//! Transport ─▶ reader ┼── pull-signal ────────▶ per-transfer channel
//!                     │   cancel / aborted      (keyed by transferId)
//!                     │   transfer-error
//!                     └── everything else ────▶ ordered event queue
//! ```
//!
//! Signals for a transfer nobody registered (the receiving side never
//! registers) fall through to the event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drop_types::{Chunk, ChunkAck, Message, TransferErrorNotice, TransferId};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

/// A signal addressed to one outbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSignal {
    /// The receiver wants the next batch.
    Pull,
    /// The transfer ended on the other side or at the relay.
    Aborted {
        /// Why.
        reason: String,
    },
}

type AckMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ChunkAck>>>>;
type RouteMap = Arc<Mutex<HashMap<TransferId, mpsc::UnboundedSender<TransferSignal>>>>;

/// Connection to the relay with a background dispatcher.
pub struct RelayConnection<T: Transport + 'static> {
    transport: Arc<T>,
    next_seq: AtomicU64,
    acks: AckMap,
    routes: RouteMap,
    events: Mutex<mpsc::UnboundedReceiver<Message>>,
    reader: JoinHandle<()>,
    ack_timeout: Duration,
}

impl<T: Transport + 'static> RelayConnection<T> {
    /// Connect `transport` to `address` and start dispatching.
    pub async fn connect(transport: T, address: &str, ack_timeout: Duration) -> ClientResult<Self> {
        transport.connect(address).await?;
        Ok(Self::attach(transport, ack_timeout))
    }

    /// Start dispatching on an already connected transport.
    pub fn attach(transport: T, ack_timeout: Duration) -> Self {
        let transport = Arc::new(transport);
        let acks: AckMap = Arc::default();
        let routes: RouteMap = Arc::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            Arc::clone(&transport),
            Arc::clone(&acks),
            Arc::clone(&routes),
            events_tx,
        ));

        Self {
            transport,
            next_seq: AtomicU64::new(1),
            acks,
            routes,
            events: Mutex::new(events_rx),
            reader,
            ack_timeout,
        }
    }

    /// Send one message.
    pub async fn send(&self, message: &Message) -> ClientResult<()> {
        let json = message.to_json()?;
        self.transport.send(json.as_bytes()).await?;
        Ok(())
    }

    /// Send a chunk and wait for the relay's verdict.
    ///
    /// The chunk's `seq` is overwritten with a fresh correlation id.
    pub async fn request_chunk(&self, mut chunk: Chunk) -> ClientResult<ChunkAck> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        chunk.seq = seq;

        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(seq, tx);

        if let Err(e) = self.send(&Message::Chunk(chunk)).await {
            self.acks.lock().await.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.acks.lock().await.remove(&seq);
                Err(ClientError::AckTimeout { seq })
            }
        }
    }

    /// Route signals for `transfer_id` to the returned channel.
    pub async fn register_transfer(
        &self,
        transfer_id: TransferId,
    ) -> mpsc::UnboundedReceiver<TransferSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(transfer_id, tx);
        rx
    }

    /// Stop routing signals for `transfer_id`.
    pub async fn release_transfer(&self, transfer_id: TransferId) {
        self.routes.lock().await.remove(&transfer_id);
    }

    /// Next message that was not routed elsewhere.
    ///
    /// Returns `None` once the connection is gone and the queue is drained.
    pub async fn next_event(&self) -> Option<Message> {
        self.events.lock().await.recv().await
    }

    /// Like [`next_event`](Self::next_event) but bounded.
    pub async fn next_event_within(
        &self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> ClientResult<Message> {
        match tokio::time::timeout(timeout, self.next_event()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::Timeout(waiting_for)),
        }
    }

    /// Check if the transport is up and the dispatcher running.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected() && !self.reader.is_finished()
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the transport and stop dispatching.
    pub async fn close(&self) -> ClientResult<()> {
        self.transport.close().await?;
        self.reader.abort();
        Ok(())
    }
}

impl<T: Transport + 'static> Drop for RelayConnection<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl<T: Transport + 'static> std::fmt::Debug for RelayConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("connected", &self.is_connected())
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

async fn read_loop<T: Transport>(
    transport: Arc<T>,
    acks: AckMap,
    routes: RouteMap,
    events: mpsc::UnboundedSender<Message>,
) {
    loop {
        let frame = match transport.recv().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "relay connection closed");
                break;
            }
        };
        let message = match Message::from_slice(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };
        dispatch(message, &acks, &routes, &events).await;
    }

    // Dropping the ack senders wakes every waiter with ConnectionLost
    acks.lock().await.clear();
    for (_, route) in routes.lock().await.drain() {
        let _ = route.send(TransferSignal::Aborted {
            reason: "connection to relay lost".into(),
        });
    }
}

async fn dispatch(
    message: Message,
    acks: &AckMap,
    routes: &RouteMap,
    events: &mpsc::UnboundedSender<Message>,
) {
    if let Message::ChunkAck(ack) = message {
        match acks.lock().await.remove(&ack.seq) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => debug!(seq = ack.seq, "acknowledgment for unknown chunk"),
        }
        return;
    }

    let signal = match &message {
        Message::PullSignal(p) => Some((p.transfer_id, TransferSignal::Pull)),
        Message::Cancel(c) => Some((
            c.transfer_id,
            TransferSignal::Aborted {
                reason: c.reason.clone(),
            },
        )),
        Message::TransferAborted(a) => Some((
            a.transfer_id,
            TransferSignal::Aborted {
                reason: a.reason.clone(),
            },
        )),
        Message::TransferError(TransferErrorNotice {
            transfer_id: Some(id),
            reason,
        }) => Some((
            *id,
            TransferSignal::Aborted {
                reason: reason.clone(),
            },
        )),
        _ => None,
    };

    if let Some((transfer_id, signal)) = signal {
        if let Some(route) = routes.lock().await.get(&transfer_id) {
            if route.send(signal).is_ok() {
                return;
            }
        }
    }

    if events.send(message).is_err() {
        debug!("event queue closed, dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use drop_types::{Cancel, PeerId, PullSignal, UserJoined};

    fn frame(message: Message) -> Vec<u8> {
        message.to_json().unwrap().into_bytes()
    }

    fn decode(bytes: &[u8]) -> Message {
        Message::from_slice(bytes).unwrap()
    }

    fn chunk(transfer_id: TransferId) -> Chunk {
        Chunk {
            seq: 0,
            transfer_id,
            receiver_id: PeerId::new(),
            offset: 0,
            payload: vec![1, 2, 3],
            is_last: true,
            batch_end: true,
        }
    }

    async fn connected() -> (Arc<RelayConnection<MockTransport>>, MockTransport) {
        let mock = MockTransport::new();
        let conn = RelayConnection::connect(mock.clone(), "ws://relay/ws", Duration::from_secs(30))
            .await
            .unwrap();
        (Arc::new(conn), mock)
    }

    #[tokio::test]
    async fn chunk_ack_is_matched_by_seq() {
        let (conn, mock) = connected().await;
        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move { c.request_chunk(chunk(TransferId::new())).await });

        let sent = mock.wait_for_sent(1).await;
        let seq = match decode(&sent[0]) {
            Message::Chunk(c) => c.seq,
            other => panic!("expected chunk, got {other:?}"),
        };
        mock.queue_response(frame(Message::ChunkAck(ChunkAck::rejected(seq + 100, "x"))));
        mock.queue_response(frame(Message::ChunkAck(ChunkAck::accepted(seq))));

        let ack = pending.await.unwrap().unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.seq, seq);
    }

    #[tokio::test]
    async fn each_chunk_gets_a_fresh_seq() {
        let (conn, mock) = connected().await;
        for _ in 0..2 {
            let c = Arc::clone(&conn);
            tokio::spawn(async move { c.request_chunk(chunk(TransferId::new())).await });
        }
        let sent = mock.wait_for_sent(2).await;
        let seqs: Vec<u64> = sent
            .iter()
            .map(|f| match decode(f) {
                Message::Chunk(c) => c.seq,
                _ => unreachable!(),
            })
            .collect();
        assert_ne!(seqs[0], seqs[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let mock = MockTransport::new();
        let conn = RelayConnection::connect(mock.clone(), "relay", Duration::from_secs(30))
            .await
            .unwrap();
        let result = conn.request_chunk(chunk(TransferId::new())).await;
        assert!(matches!(result, Err(ClientError::AckTimeout { .. })));
    }

    #[tokio::test]
    async fn signals_route_by_transfer_id() {
        let (conn, mock) = connected().await;
        let mine = TransferId::new();
        let mut signals = conn.register_transfer(mine).await;

        mock.queue_response(frame(Message::PullSignal(PullSignal { transfer_id: mine })));
        mock.queue_response(frame(Message::Cancel(Cancel {
            transfer_id: mine,
            reason: "user".into(),
        })));

        assert_eq!(signals.recv().await, Some(TransferSignal::Pull));
        assert_eq!(
            signals.recv().await,
            Some(TransferSignal::Aborted {
                reason: "user".into()
            })
        );
    }

    #[tokio::test]
    async fn unrouted_messages_become_events() {
        let (conn, mock) = connected().await;
        let other = TransferId::new();
        let receiver = PeerId::new();
        mock.queue_response(b"not json".to_vec());
        mock.queue_response(frame(Message::PullSignal(PullSignal { transfer_id: other })));
        mock.queue_response(frame(Message::UserJoined(UserJoined {
            receiver_id: receiver,
        })));

        assert_eq!(
            conn.next_event().await,
            Some(Message::PullSignal(PullSignal { transfer_id: other }))
        );
        assert_eq!(
            conn.next_event().await,
            Some(Message::UserJoined(UserJoined {
                receiver_id: receiver
            }))
        );
    }

    #[tokio::test]
    async fn released_transfer_falls_through_to_events() {
        let (conn, mock) = connected().await;
        let id = TransferId::new();
        let _signals = conn.register_transfer(id).await;
        conn.release_transfer(id).await;

        mock.queue_response(frame(Message::PullSignal(PullSignal { transfer_id: id })));
        assert!(matches!(
            conn.next_event().await,
            Some(Message::PullSignal(_))
        ));
    }

    #[tokio::test]
    async fn hang_up_fails_waiters_and_aborts_routes() {
        let (conn, mock) = connected().await;
        let id = TransferId::new();
        let mut signals = conn.register_transfer(id).await;

        let c = Arc::clone(&conn);
        let pending = tokio::spawn(async move { c.request_chunk(chunk(id)).await });
        mock.wait_for_sent(1).await;
        mock.hang_up();

        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
        assert!(matches!(
            signals.recv().await,
            Some(TransferSignal::Aborted { .. })
        ));
        assert_eq!(conn.next_event().await, None);
        assert!(matches!(
            conn.next_event_within(Duration::from_secs(1), "anything").await,
            Err(ClientError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn send_failure_surfaces() {
        let (conn, mock) = connected().await;
        mock.fail_next_send("broken pipe");
        let result = conn.request_chunk(chunk(TransferId::new())).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
