//! Health check endpoint.

use crate::server::DropRelay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of open WebSocket connections.
    pub connections: usize,
    /// Number of peers known to the dispatcher.
    pub peers: u64,
    /// Number of live sessions.
    pub sessions: u64,
    /// Number of transfers in flight.
    pub transfers: u64,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<DropRelay>>) -> Json<HealthStatus> {
    let m = relay.metrics();
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: relay.slots().active(),
        peers: m.peers_connected.load(Ordering::Relaxed),
        sessions: m.sessions_active.load(Ordering::Relaxed),
        transfers: m.transfers_active.load(Ordering::Relaxed),
        uptime_seconds: relay.uptime().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            connections: 42,
            peers: 40,
            sessions: 15,
            transfers: 3,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"sessions\":15"));
        assert!(json.contains("\"transfers\":3"));
    }
}
