//! Application state shared across handlers.

use crate::config::ServerConfig;
use crate::core::session::SessionIssuer;

/// Read-only state handed to every handler.
///
/// Sessions share nothing mutable: each relay connection and each issued
/// credential is independent, so the state is just the configuration snapshot
/// and the issuer built from it.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration, immutable after startup
    pub config: ServerConfig,
    /// Ephemeral session credential issuer
    pub issuer: SessionIssuer,
}

impl AppState {
    /// Build the application state from configuration.
    pub fn new(config: ServerConfig) -> Self {
        let issuer = SessionIssuer::from_config(&config);
        Self { config, issuer }
    }
}
