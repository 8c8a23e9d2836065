//! HTTP route configuration.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::sessions::{create_ephemeral_session, health_check};
use crate::state::AppState;

/// Path of the ephemeral credential issuance endpoint.
pub const REALTIME_EPHEMERAL_PATH: &str = "/openai/agents/realtime/ephemeral-token";

/// Create the HTTP API router.
///
/// # Endpoints
///
/// - `GET /` - health check
/// - `POST /openai/agents/realtime/ephemeral-token` - exchange the server's
///   long-lived key for a short-lived, session-scoped client credential
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health_check))
        .route(REALTIME_EPHEMERAL_PATH, post(create_ephemeral_session))
        .layer(TraceLayer::new_for_http())
}
