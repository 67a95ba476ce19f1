//! Transport abstraction for sharedrop.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (WebSocket, mock for testing).
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits one encoded protocol frame
//! - `recv()` receives one encoded protocol frame
//! - `close()` gracefully terminates
//!
//! `send()` and `recv()` take `&self` and must be callable concurrently:
//! one reader task receives while engines send.
//!
//! # Example
//!
//! ```ignore
//! let transport = WsTransport::new();
//! transport.connect("ws://127.0.0.1:5050/ws").await?;
//! transport.send(frame).await?;
//! let response = transport.recv().await?;
//! ```

mod mock;
mod websocket;

pub use mock::MockTransport;
pub use websocket::WsTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Transport trait for sending and receiving protocol frames.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, in-process channels, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the relay at the given address.
    ///
    /// For WebSocket, this is a `ws://` or `wss://` URL. For testing, it's arbitrary.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one frame over the connection.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame from the connection.
    ///
    /// Blocks until data is available or connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}
