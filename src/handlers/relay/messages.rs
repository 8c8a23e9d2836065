//! Relay WebSocket frame types.
//!
//! The relay itself speaks a deliberately tiny protocol: everything between
//! client and provider passes through verbatim, and the relay only injects
//! frames of its own for lifecycle transitions — one status frame when the
//! upstream opens or closes, one error frame when something fails.

use serde::Serialize;

/// Status text sent once the upstream connection is established.
pub const UPSTREAM_CONNECTED_STATUS: &str = "已連線至 OpenAI";

/// Status text for an upstream closure that carried no reason.
pub const UPSTREAM_CLOSED_STATUS: &str = "OpenAI 連線已關閉";

/// Error text for an upstream connection failure.
pub const UPSTREAM_FAILED_MESSAGE: &str = "OpenAI 即時連線失敗。";

/// Frames the relay injects into the client stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    /// Terminal error, followed by a close
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: RelayErrorBody,
    },

    /// Lifecycle status
    #[serde(rename = "server.status")]
    Status {
        /// Human-readable status label
        status: String,
        /// Upstream close code, when reporting a closure
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
    },
}

/// Body of an error frame.
#[derive(Debug, Serialize)]
pub struct RelayErrorBody {
    /// Human-readable message
    pub message: String,
}

impl RelayFrame {
    /// An error frame.
    pub fn error(message: impl Into<String>) -> Self {
        RelayFrame::Error {
            error: RelayErrorBody {
                message: message.into(),
            },
        }
    }

    /// A status frame.
    pub fn status(status: impl Into<String>, code: Option<u16>) -> Self {
        RelayFrame::Status {
            status: status.into(),
            code,
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> String {
        // These frames contain only strings and integers; serialization
        // cannot fail, but a panic here would take the session down with it.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}
