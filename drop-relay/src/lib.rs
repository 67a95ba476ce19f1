//! # sharedrop-relay
//!
//! Relay server for sharedrop file transfers.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections and assigns each a peer identity
//! - Pairs a sender and a receiver under a room code
//! - Forwards transfer traffic between them, acking every chunk
//! - Refuses chunks a backlogged receiver cannot take
//! - Reaps transfers that go quiet
//! - Never stores file content
//!
//! ## Architecture
//!
//! ```text
//! Sender ──┐                        ┌── Receiver
//!          │   WebSocket (JSON)     │
//!      ┌───┴────────────────────────┴───┐
//!      │        sharedrop-relay         │
//!      │  connection tasks (session)    │
//!      │            │ mpsc              │
//!      │  ┌─────────▼──────────────┐    │
//!      │  │ dispatcher (server)    │◀── reaper (cleanup)
//!      │  │  SessionDirectory      │    │
//!      │  │  TransferRegistry      │    │
//!      │  └────────────────────────┘    │
//!      └────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - create-session → session-created | session-exists | session-creation-failed
//! - join-session → join-success (+ user-joined to the sender) | join-failed
//! - metadata-handshake, chunk (→ chunk-ack), pull-signal, end-of-transfer
//! - cancel, transfer-aborted, transfer-error, peer-left

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod directory;
pub mod error;
pub mod http;
pub mod limits;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
