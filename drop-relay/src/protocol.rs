//! WebSocket upgrade handler for `/ws`.
//!
//! Admission happens before the upgrade: the remote address must be within
//! its connection rate and a connection slot must be free.

use crate::server::DropRelay;
use crate::session::run_connection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Path the WebSocket endpoint is served under.
pub const WS_PATH: &str = "/ws";

/// Accept or refuse a WebSocket upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<DropRelay>>,
) -> Response {
    if let Err(e) = relay.rate_limits().check_connection(&remote.ip()) {
        tracing::warn!(%remote, "connection rate limited: {}", e);
        relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }

    let slot = match relay.slots().try_acquire() {
        Ok(slot) => slot,
        Err(e) => {
            tracing::warn!(
                %remote,
                active = relay.slots().active(),
                max = relay.config().limits.max_connections,
                "rejecting connection: {}",
                e
            );
            return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
        }
    };

    let max_frame = relay.config().server.max_frame_size;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| run_connection(relay, socket, remote, slot))
}
