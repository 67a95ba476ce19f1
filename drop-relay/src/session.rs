//! Per-connection WebSocket loop.
//!
//! Each upgraded socket gets a relay-assigned [`PeerId`] and runs until the
//! peer closes, the socket errors, or the dispatcher drops the peer's
//! outbound queue. Frames are decoded and rate limited here; everything that
//! passes is handed to the dispatcher as a [`RelayCommand::Inbound`].

use crate::error::ProtocolError;
use crate::limits::ConnectionSlot;
use crate::server::{DropRelay, RelayCommand};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use drop_types::{ChunkAck, Message, PeerId, TransferErrorNotice};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};

/// Outcome of screening one inbound frame.
#[derive(Debug)]
pub enum Screened {
    /// Hand the message to the dispatcher.
    Forward(Message),
    /// Answer the peer directly; the dispatcher never sees the frame.
    Reply(Message),
}

/// Decode and rate limit one frame from `peer`.
///
/// Pull signals and cancels count against the peer's own quota but not the
/// global one.
pub fn screen(relay: &DropRelay, peer: PeerId, frame: &[u8]) -> Screened {
    let message = match Message::from_slice(frame) {
        Ok(message) => message,
        Err(e) => {
            let error = ProtocolError::from(e);
            tracing::debug!(%peer, %error, "undecodable frame");
            relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
            return Screened::Reply(Message::TransferError(TransferErrorNotice {
                transfer_id: None,
                reason: error.public_reason().to_string(),
            }));
        }
    };

    let limits = relay.rate_limits();
    let checked = match &message {
        Message::PullSignal(_) | Message::Cancel(_) => limits.check_peer_message(&peer),
        _ => limits.check_message(&peer),
    };
    if let Err(e) = checked {
        tracing::warn!(%peer, kind = message.kind(), "message rate limited: {}", e);
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        let error = ProtocolError::RateLimited {
            reason: e.to_string(),
        };
        let reply = match &message {
            Message::Chunk(chunk) => {
                Message::ChunkAck(ChunkAck::rejected(chunk.seq, error.public_reason()))
            }
            other => Message::TransferError(TransferErrorNotice {
                transfer_id: other.transfer_id(),
                reason: error.public_reason().to_string(),
            }),
        };
        return Screened::Reply(reply);
    }

    Screened::Forward(message)
}

/// Serve one upgraded WebSocket until it closes.
///
/// `slot` is held for the lifetime of the connection.
pub async fn run_connection(
    relay: Arc<DropRelay>,
    socket: WebSocket,
    remote: SocketAddr,
    slot: ConnectionSlot,
) {
    let (peer, mut outbound) = match relay.register_peer().await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::error!(%remote, "cannot register peer: {}", e);
            return;
        }
    };
    tracing::info!(%peer, %remote, "connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let period = Duration::from_secs(relay.config().server.ping_interval_secs.max(1));
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let bytes = match frame {
                    Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                    Some(Ok(WsMessage::Binary(bytes))) => bytes,
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%peer, "socket error: {}", e);
                        break;
                    }
                };
                match screen(&relay, peer, &bytes) {
                    Screened::Forward(message) => {
                        if relay.submit(RelayCommand::Inbound { peer, message }).await.is_err() {
                            break;
                        }
                    }
                    Screened::Reply(reply) => {
                        if send_message(&mut ws_tx, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    tracing::info!(%peer, "dropped by relay");
                    break;
                };
                if send_message(&mut ws_tx, &message).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    if relay.submit(RelayCommand::Disconnect { peer }).await.is_err() {
        tracing::warn!(%peer, "dispatcher stopped before disconnect");
    }
    drop(slot);
    tracing::info!(%peer, %remote, "connection closed");
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    message: &Message,
) -> Result<(), axum::Error> {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(kind = message.kind(), "failed to encode message: {}", e);
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text)).await
}
