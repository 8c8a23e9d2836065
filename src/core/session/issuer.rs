//! Ephemeral session credential issuer.
//!
//! Exchanges the server-held long-lived API key for a short-lived credential
//! the browser can present directly to the provider during WebRTC
//! negotiation. Each call is independent: nothing is cached or persisted, and
//! the credential is returned whole or not at all.

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::errors::{RelayError, RelayResult};

/// Short-lived credential scoped to one realtime session.
///
/// The top-level `expires_at` mirrors `client_secret.expires_at` so clients
/// can read the expiry without digging into the secret object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralSession {
    /// Provider-assigned session identifier
    pub id: Option<String>,
    /// The short-lived secret and its expiry
    pub client_secret: Option<ClientSecret>,
    /// Expiry of the secret, mirrored from `client_secret`
    pub expires_at: Option<i64>,
}

/// The client-usable secret within an ephemeral session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecret {
    /// Bearer token value
    pub value: String,
    /// Unix timestamp after which the token is invalid
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Raw session payload as returned by the provider.
#[derive(Debug, Deserialize)]
struct UpstreamSessionPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Serialize)]
struct SessionCreateRequest<'a> {
    model: &'a str,
    voice: &'a str,
}

/// Issues ephemeral session credentials against the provider's
/// session-creation endpoint.
#[derive(Debug, Clone)]
pub struct SessionIssuer {
    http: reqwest::Client,
    api_key: Option<String>,
    sessions_url: String,
    model: String,
    voice: String,
}

impl SessionIssuer {
    /// Build an issuer from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.openai_api_key.clone(),
            sessions_url: config.sessions_url(),
            model: config.realtime_model.clone(),
            voice: config.realtime_voice.clone(),
        }
    }

    /// Create one ephemeral session credential.
    ///
    /// Fails with [`RelayError::MissingApiKey`] before any network call when
    /// the server key is not configured; with [`RelayError::UpstreamRejected`]
    /// (carrying the upstream status and body text) when the provider says
    /// no; and with [`RelayError::UpstreamUnreachable`] on transport-level
    /// failures or a malformed response body.
    pub async fn create_ephemeral_session(&self) -> RelayResult<EphemeralSession> {
        let api_key = self.api_key.as_ref().ok_or(RelayError::MissingApiKey)?;

        let response = self
            .http
            .post(&self.sessions_url)
            .bearer_auth(api_key)
            .json(&SessionCreateRequest {
                model: &self.model,
                voice: &self.voice,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), details = %details, "Session creation rejected");
            return Err(RelayError::UpstreamRejected {
                status: status.as_u16(),
                details,
            });
        }

        let payload: UpstreamSessionPayload = response.json().await?;
        let expires_at = payload.client_secret.as_ref().and_then(|s| s.expires_at);
        Ok(EphemeralSession {
            id: payload.id,
            client_secret: payload.client_secret,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_fails_without_network() {
        let config = ServerConfig {
            // An unroutable URL: if the issuer dialed it the test would hang
            // instead of returning immediately.
            realtime_base_url: "http://192.0.2.1:1".to_string(),
            ..Default::default()
        };
        let issuer = SessionIssuer::from_config(&config);
        let result = issuer.create_ephemeral_session().await;
        assert!(matches!(result, Err(RelayError::MissingApiKey)));
    }

    #[test]
    fn test_payload_tolerates_nulls() {
        let payload: UpstreamSessionPayload =
            serde_json::from_str(r#"{"id":null,"client_secret":null}"#).unwrap();
        assert!(payload.id.is_none());
        assert!(payload.client_secret.is_none());
    }

    #[test]
    fn test_expires_at_mirrors_client_secret() {
        let session = EphemeralSession {
            id: Some("sess_1".to_string()),
            client_secret: Some(ClientSecret {
                value: "ek_abc".to_string(),
                expires_at: Some(1734000000),
            }),
            expires_at: Some(1734000000),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["expires_at"], json["client_secret"]["expires_at"]);
    }
}
