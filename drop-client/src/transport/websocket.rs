//! WebSocket transport over tokio-tungstenite.
//!
//! Frames are sent as text (the protocol is JSON). Binary frames from the
//! relay are accepted too. Ping/pong is handled by tungstenite.

use super::{Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport.
///
/// The socket is split so that one task can block in `recv()` while
/// others `send()`.
#[derive(Default)]
pub struct WsTransport {
    writer: Mutex<Option<SplitSink<WsStream, WsMessage>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
}

impl WsTransport {
    /// Create an unconnected transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let (stream, _response) = connect_async(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(address, "websocket connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?
            .to_string();
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotConnected)?;
        writer.send(WsMessage::text(text)).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_bytes().to_vec()),
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes.to_vec()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ConnectionClosed);
                }
                // Ping/Pong/raw frames
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer
                .close()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconnected_transport_refuses_io() {
        let transport = WsTransport::new();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(b"{}").await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let transport = WsTransport::new();
        let result = transport.connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn close_without_connect_is_ok() {
        let transport = WsTransport::new();
        transport.close().await.unwrap();
    }
}
