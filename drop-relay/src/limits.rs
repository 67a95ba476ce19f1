//! Rate limiting for sharedrop-relay.
//!
//! Provides protection against connection flooding and message spam.
//!
//! ## Design Notes
//!
//! Connections are limited per remote IP address when the WebSocket is
//! upgraded. Messages are limited per peer (the relay-assigned [`PeerId`])
//! and globally across all peers. Both keyed limiters use governor's
//! DashMap-backed state store.
//!
//! [`ConnectionSlots`] caps the number of concurrent connections.

use crate::config::LimitsConfig;
use drop_types::PeerId;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per remote IP, per minute.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// Limits messages per peer, per second.
    message_limiter: Arc<KeyedLimiter<PeerId>>,

    /// Limits messages across all peers, per second.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("message_limiter", &"KeyedLimiter<PeerId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

fn per_unit(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero values are treated as one; [`Config::validate`](crate::config::Config::validate)
    /// rejects them when loading from a file.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(per_unit(config.connections_per_ip));
        let message_quota = Quota::per_second(per_unit(config.messages_per_second));
        let global_quota = Quota::per_second(per_unit(config.global_messages_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt from `ip` is allowed.
    pub fn check_connection(&self, ip: &IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a message from `peer` is allowed.
    ///
    /// The global limit is checked first.
    pub fn check_message(&self, peer: &PeerId) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.message_limiter
            .check_key(peer)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check a transfer control message from `peer` against its own quota only.
    ///
    /// Pull signals and cancels keep a transfer's two ends in agreement, so
    /// traffic from other peers must not starve them.
    pub fn check_peer_message(&self, peer: &PeerId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(peer)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked message keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict idle entries from the keyed limiters. Called by the reaper.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many messages from this peer.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,
    /// Too many messages across all peers.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
    /// Every connection slot is taken.
    #[error("too many connections")]
    TooManyConnections,
}

/// Caps concurrent connections.
#[derive(Debug)]
pub struct ConnectionSlots {
    active: Arc<AtomicUsize>,
    max: usize,
}

/// A held connection slot; released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlots {
    /// Allow at most `max` concurrent connections.
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Take a slot, or fail if all are in use.
    pub fn try_acquire(&self) -> Result<ConnectionSlot, RateLimitError> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .map_err(|_| RateLimitError::TooManyConnections)?;
        Ok(ConnectionSlot {
            active: Arc::clone(&self.active),
        })
    }

    /// Connections currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
