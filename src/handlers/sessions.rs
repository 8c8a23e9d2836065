//! HTTP handlers: ephemeral credential issuance and health check.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::core::session::EphemeralSession;
use crate::errors::RelayError;
use crate::state::AppState;

/// Issue a short-lived session credential for direct WebRTC negotiation.
///
/// Error mapping lives on [`RelayError`]'s `IntoResponse`: missing key and
/// unreachable provider are 500s with fixed bodies, a provider rejection
/// mirrors the upstream status and carries its body text as `details`.
pub async fn create_ephemeral_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EphemeralSession>, RelayError> {
    match state.issuer.create_ephemeral_session().await {
        Ok(session) => {
            info!(session_id = ?session.id, "Issued ephemeral realtime session");
            Ok(Json(session))
        }
        Err(e) => {
            error!("Ephemeral session creation failed: {e}");
            Err(e)
        }
    }
}

/// Health check.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "voicebridge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
