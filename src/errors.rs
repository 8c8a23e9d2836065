//! Error types for the VoiceBridge Gateway.
//!
//! The taxonomy mirrors the failure boundaries of the relay: configuration
//! problems detected before any I/O, upstream rejections that carry an HTTP
//! status worth mirroring to the caller, network-level failures that must not
//! leak internal detail, and protocol frames that fail to decode (dropped and
//! logged, never surfaced).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// User-visible message for a missing server API key.
///
/// This string is part of the wire contract consumed by the browser client;
/// it must match on both the HTTP and WebSocket surfaces.
pub const MISSING_API_KEY_MESSAGE: &str = "伺服器缺少 OPENAI_API_KEY";

/// User-visible message when the provider rejects session creation.
pub const SESSION_REJECTED_MESSAGE: &str = "建立短效會話失敗";

/// User-visible message for an unexpected session-creation failure.
pub const SESSION_FAILED_MESSAGE: &str = "建立短效會話時發生錯誤";

/// Errors that can occur while relaying realtime sessions.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The long-lived provider API key is not configured.
    /// Detected synchronously, before any network call.
    #[error("{}", MISSING_API_KEY_MESSAGE)]
    MissingApiKey,

    /// The provider answered with a non-success status.
    /// Carries the upstream status code and the upstream body text.
    #[error("{}", SESSION_REJECTED_MESSAGE)]
    UpstreamRejected {
        /// HTTP status returned by the provider
        status: u16,
        /// Human-readable detail extracted from the upstream body
        details: String,
    },

    /// The provider could not be reached, or its response was malformed.
    #[error("{}", SESSION_FAILED_MESSAGE)]
    UpstreamUnreachable(#[from] reqwest::Error),

    /// The upstream WebSocket handshake failed or timed out.
    #[error("Upstream WebSocket connection failed: {0}")]
    UpstreamWebSocket(String),

    /// A received frame could not be parsed as a structured event.
    /// Such frames are dropped and logged, not propagated to users.
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(#[from] serde_json::Error),

    /// A step of the WebRTC offer/answer exchange failed.
    #[error("{0}")]
    Negotiation(String),

    /// Configuration value rejected during validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::MissingApiKey => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": MISSING_API_KEY_MESSAGE })),
            )
                .into_response(),
            RelayError::UpstreamRejected { status, details } => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (
                    status,
                    Json(json!({ "error": SESSION_REJECTED_MESSAGE, "details": details })),
                )
                    .into_response()
            }
            // Network-level causes are logged by the caller; the body stays
            // generic so internal error shapes never reach the client.
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": SESSION_FAILED_MESSAGE })),
            )
                .into_response(),
        }
    }
}
