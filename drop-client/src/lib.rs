//! # drop-client
//!
//! Endpoint library for the sharedrop relay protocol.
//!
//! ## Features
//!
//! - **Transport Abstraction**: Pluggable transport layer (WebSocket, mock)
//! - **Typed Dispatcher**: One reader task routes acks, pull signals and
//!   session events
//! - **Pull Backpressure**: The sender never has more than one batch in flight
//! - **Pluggable Sinks**: Memory, directory, or persistent-then-memory fallback
//! - **Pure State Machines**: Uses drop-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use drop_client::{FileSource, RelayConnection, SenderEngine, WsTransport};
//!
//! let conn = RelayConnection::connect(WsTransport::new(), "ws://relay:5050/ws", ack).await?;
//! conn.create_session(&code, timeout).await?;
//! let receiver = conn.wait_for_receiver(None).await?;
//!
//! let engine = SenderEngine::new(Arc::new(conn), Tunables::default());
//! let handle = engine.start(receiver, FileSource::open("photo.jpg").await?);
//! handle.wait().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod sink;
pub mod transport;

pub use connection::{RelayConnection, TransferSignal};
pub use error::{ClientError, ClientResult, TransferError};
pub use receiver::{ReceiverEngine, ReceiverEvent, ReceiverHandle};
pub use sender::{FileSource, SendHandle, SendReport, SenderEngine, SenderProgress};
pub use sink::{
    DirectorySinkProvider, FallbackSinkProvider, FileSink, MemorySink, MemorySinkProvider, Sink,
    SinkError, SinkOutput, SinkProvider,
};
pub use transport::{MockTransport, Transport, TransportError, WsTransport};
