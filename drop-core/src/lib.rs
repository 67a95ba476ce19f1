//! # drop-core
//!
//! Pure transfer logic for sharedrop (no I/O, instant tests).
//!
//! This crate implements the chunk planner and the sender/receiver state
//! machines without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (relay connection, sinks, timers) is performed by
//! `drop-client`, which interprets the actions produced by these machines.
//!
//! ```text
//!            HandshakeSent           PullReceived
//! Handshaking ────────────▶ AwaitingFirstPull ─────────▶ Sending ◀──┐
//!                                                         │   │     │ PullReceived
//!                                            BatchSettled │   └─▶ AwaitingPull
//!                                                         ▼
//!                                    Completing ──EndSent──▶ Complete
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod plan;
pub mod ranges;
pub mod receiver;
pub mod sender;
pub mod tunables;

pub use plan::{partition, plan_batch, BatchPlan, ChunkSpec};
pub use ranges::{RangeCheck, ReceivedRanges};
pub use receiver::{Admission, ReceiveFault, ReceiveStatus, ReceiverAction, ReceiverTransfer};
pub use sender::{SendStatus, SenderAction, SenderEvent, SenderTransfer};
pub use tunables::Tunables;
