//! Prometheus metrics endpoint.

use crate::server::{DropRelay, RelayMetrics};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<DropRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(
            relay.metrics(),
            Gauges {
                connections: relay.slots().active(),
                limited_ips: relay.rate_limits().connection_keys_count(),
                limited_peers: relay.rate_limits().message_keys_count(),
            },
        ),
    )
}

/// Point-in-time values that live outside [`RelayMetrics`].
struct Gauges {
    connections: usize,
    limited_ips: usize,
    limited_peers: usize,
}

fn render(m: &RelayMetrics, gauges: Gauges) -> String {
    let Gauges {
        connections,
        limited_ips,
        limited_peers,
    } = gauges;

    // Gauges: current state
    let sessions = m.sessions_active.load(Ordering::Relaxed);
    let transfers = m.transfers_active.load(Ordering::Relaxed);
    let peers = m.peers_connected.load(Ordering::Relaxed);

    // Counters: monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let sessions_total = m.sessions_created.load(Ordering::Relaxed);
    let started = m.transfers_started.load(Ordering::Relaxed);
    let completed = m.transfers_completed.load(Ordering::Relaxed);
    let aborted = m.transfers_aborted.load(Ordering::Relaxed);
    let reaped = m.transfers_reaped.load(Ordering::Relaxed);
    let chunks = m.chunks_relayed.load(Ordering::Relaxed);
    let bytes = m.bytes_relayed.load(Ordering::Relaxed);
    let capacity = m.capacity_rejections.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    format!(
        r#"# HELP sharedrop_relay_connections_active Number of open WebSocket connections
# TYPE sharedrop_relay_connections_active gauge
sharedrop_relay_connections_active {connections}

# HELP sharedrop_relay_peers_active Number of peers known to the dispatcher
# TYPE sharedrop_relay_peers_active gauge
sharedrop_relay_peers_active {peers}

# HELP sharedrop_relay_sessions_active Number of live sessions
# TYPE sharedrop_relay_sessions_active gauge
sharedrop_relay_sessions_active {sessions}

# HELP sharedrop_relay_transfers_active Number of transfers in flight
# TYPE sharedrop_relay_transfers_active gauge
sharedrop_relay_transfers_active {transfers}

# HELP sharedrop_relay_limiter_ips Remote addresses tracked by the connection limiter
# TYPE sharedrop_relay_limiter_ips gauge
sharedrop_relay_limiter_ips {limited_ips}

# HELP sharedrop_relay_limiter_peers Peers tracked by the message limiter
# TYPE sharedrop_relay_limiter_peers gauge
sharedrop_relay_limiter_peers {limited_peers}

# HELP sharedrop_relay_info Server information
# TYPE sharedrop_relay_info gauge
sharedrop_relay_info{{version="{version}"}} 1

# HELP sharedrop_relay_connections_total Total connections accepted
# TYPE sharedrop_relay_connections_total counter
sharedrop_relay_connections_total {conns_total}

# HELP sharedrop_relay_sessions_created_total Total sessions created
# TYPE sharedrop_relay_sessions_created_total counter
sharedrop_relay_sessions_created_total {sessions_total}

# HELP sharedrop_relay_transfers_started_total Total transfers opened
# TYPE sharedrop_relay_transfers_started_total counter
sharedrop_relay_transfers_started_total {started}

# HELP sharedrop_relay_transfers_completed_total Total transfers finished by the sender
# TYPE sharedrop_relay_transfers_completed_total counter
sharedrop_relay_transfers_completed_total {completed}

# HELP sharedrop_relay_transfers_aborted_total Total transfers cancelled, disconnected or reaped
# TYPE sharedrop_relay_transfers_aborted_total counter
sharedrop_relay_transfers_aborted_total {aborted}

# HELP sharedrop_relay_transfers_reaped_total Total transfers reaped for inactivity
# TYPE sharedrop_relay_transfers_reaped_total counter
sharedrop_relay_transfers_reaped_total {reaped}

# HELP sharedrop_relay_chunks_relayed_total Total chunks forwarded
# TYPE sharedrop_relay_chunks_relayed_total counter
sharedrop_relay_chunks_relayed_total {chunks}

# HELP sharedrop_relay_bytes_relayed_total Total payload bytes forwarded
# TYPE sharedrop_relay_bytes_relayed_total counter
sharedrop_relay_bytes_relayed_total {bytes}

# HELP sharedrop_relay_capacity_rejections_total Total chunks refused because the receiver was backlogged
# TYPE sharedrop_relay_capacity_rejections_total counter
sharedrop_relay_capacity_rejections_total {capacity}

# HELP sharedrop_relay_rate_limit_hits_total Total rate limit rejections
# TYPE sharedrop_relay_rate_limit_hits_total counter
sharedrop_relay_rate_limit_hits_total {rate_limits}

# HELP sharedrop_relay_errors_total Total protocol errors
# TYPE sharedrop_relay_errors_total counter
sharedrop_relay_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_and_gauges() {
        let m = RelayMetrics::default();
        m.bytes_relayed.store(1_048_576, Ordering::Relaxed);
        m.sessions_active.store(2, Ordering::Relaxed);

        let body = render(
            &m,
            Gauges {
                connections: 4,
                limited_ips: 3,
                limited_peers: 7,
            },
        );
        assert!(body.contains("# TYPE sharedrop_relay_sessions_active gauge"));
        assert!(body.contains("sharedrop_relay_sessions_active 2\n"));
        assert!(body.contains("sharedrop_relay_bytes_relayed_total 1048576\n"));
        assert!(body.contains("sharedrop_relay_connections_active 4\n"));
        assert!(body.contains("sharedrop_relay_limiter_ips 3\n"));
        assert!(body.contains("sharedrop_relay_limiter_peers 7\n"));
    }
}
