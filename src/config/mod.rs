//! Configuration module for the VoiceBridge Gateway.
//!
//! Configuration is read once at startup from environment variables (after an
//! optional `.env` file is loaded), with a hardcoded fallback for every value.
//! Nothing here is consulted again after the server starts; handlers see an
//! immutable snapshot through `AppState`.
//!
//! # Example
//! ```rust,no_run
//! use voicebridge_gateway::config::ServerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use url::Url;

use crate::errors::{RelayError, RelayResult};

/// Default listen host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default realtime model requested from the provider.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default voice for audio output.
pub const DEFAULT_REALTIME_VOICE: &str = "verse";

/// Base URL of the provider's realtime API.
pub const DEFAULT_REALTIME_BASE_URL: &str = "https://api.openai.com/v1/realtime";

/// Server configuration.
///
/// Read-only after startup. The API key is optional on purpose: the server
/// boots without one and reports the missing key per request, so a
/// misconfigured deployment is observable rather than crash-looping.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Long-lived provider API key; absence is a per-request error
    pub openai_api_key: Option<String>,
    /// Realtime model identifier
    pub realtime_model: String,
    /// Voice identifier for audio output
    pub realtime_voice: String,
    /// Base URL for the provider's realtime API
    pub realtime_base_url: String,
    /// Allowed CORS origins: `None` = same-origin only, `*` = any,
    /// otherwise a comma-separated list
    pub cors_allowed_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            openai_api_key: None,
            realtime_model: DEFAULT_REALTIME_MODEL.to_string(),
            realtime_voice: DEFAULT_REALTIME_VOICE.to_string(),
            realtime_base_url: DEFAULT_REALTIME_BASE_URL.to_string(),
            cors_allowed_origins: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// hardcoded defaults for anything unset or empty.
    pub fn from_env() -> RelayResult<Self> {
        let config = Self {
            host: env_or("HOST", DEFAULT_HOST),
            port: match std::env::var("PORT") {
                Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
                    RelayError::InvalidConfiguration(format!("PORT is not a valid port: {raw}"))
                })?,
                _ => DEFAULT_PORT,
            },
            openai_api_key: env_opt("OPENAI_API_KEY"),
            realtime_model: env_or("OPENAI_REALTIME_MODEL", DEFAULT_REALTIME_MODEL),
            realtime_voice: env_or("OPENAI_REALTIME_VOICE", DEFAULT_REALTIME_VOICE),
            realtime_base_url: env_or("OPENAI_REALTIME_BASE_URL", DEFAULT_REALTIME_BASE_URL),
            cors_allowed_origins: env_opt("CORS_ALLOWED_ORIGINS"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> RelayResult<()> {
        if self.port == 0 {
            return Err(RelayError::InvalidConfiguration(
                "port must be non-zero".to_string(),
            ));
        }
        let url = Url::parse(&self.realtime_base_url).map_err(|e| {
            RelayError::InvalidConfiguration(format!(
                "realtime base URL '{}' is invalid: {e}",
                self.realtime_base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::InvalidConfiguration(format!(
                "realtime base URL '{}' must use http or https",
                self.realtime_base_url
            )));
        }
        Ok(())
    }

    /// Socket address string for the listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket URL for the upstream realtime connection, with the model
    /// (and voice, when configured) attached as query parameters.
    pub fn upstream_ws_url(&self) -> RelayResult<Url> {
        let mut url = Url::parse(&self.realtime_base_url).map_err(|e| {
            RelayError::InvalidConfiguration(format!(
                "realtime base URL '{}' is invalid: {e}",
                self.realtime_base_url
            ))
        })?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(RelayError::InvalidConfiguration(format!(
                    "unsupported realtime base URL scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| RelayError::InvalidConfiguration("cannot set ws scheme".to_string()))?;
        url.query_pairs_mut().append_pair("model", &self.realtime_model);
        if !self.realtime_voice.is_empty() {
            url.query_pairs_mut().append_pair("voice", &self.realtime_voice);
        }
        Ok(url)
    }

    /// Provider endpoint for ephemeral session creation.
    pub fn sessions_url(&self) -> String {
        format!("{}/sessions", self.realtime_base_url.trim_end_matches('/'))
    }

    /// Provider endpoint for WebRTC SDP offer/answer exchange.
    pub fn calls_url(&self) -> String {
        format!("{}/calls", self.realtime_base_url.trim_end_matches('/'))
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => fallback.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
