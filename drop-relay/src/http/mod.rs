//! HTTP endpoints for sharedrop-relay.
//!
//! Serves the WebSocket upgrade alongside health and metrics endpoints.

pub mod health;
mod metrics;

use crate::protocol::{ws_handler, WS_PATH};
use crate::server::DropRelay;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<DropRelay>) -> Router {
    let mut router = Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(health::health_handler));
    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}
