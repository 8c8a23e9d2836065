//! Relay WebSocket route configuration.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::handlers::relay::relay_handler;
use crate::state::AppState;

/// Path of the relay WebSocket upgrade endpoint.
pub const REALTIME_WS_PATH: &str = "/openai/agents/realtime/ws";

/// Create the relay WebSocket router.
///
/// # Protocol
///
/// After the upgrade the server either sends one error frame and closes
/// (configuration failure), or one `server.status` frame once the upstream
/// handshake succeeds. From then on frames pass through verbatim in both
/// directions until either side closes.
pub fn create_relay_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(REALTIME_WS_PATH, get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
