//! WebRTC negotiation handler.
//!
//! Establishes a direct data channel (plus optional outbound audio) with the
//! provider: fetch an ephemeral credential from the relay's issuance
//! endpoint, create a peer connection and the `oai-events` data channel,
//! perform the SDP offer/answer exchange against the provider's negotiation
//! endpoint, and route every data-channel message through the event
//! classifier. The relay server is not on the media path — it only issues the
//! credential.
//!
//! Every step fails fast: an error before the peer exists creates nothing,
//! an error after it closes the peer and clears the transport state, so no
//! half-negotiated connection ever lingers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;

use crate::core::events::{
    ClientEvent, MessageRole, ProviderEvent, SessionUpdateConfig, TransportSession,
    VOICE_TURN_PLACEHOLDER, labels,
};
use crate::errors::{RelayError, RelayResult};

/// Label of the provider's event data channel.
const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Bound on ICE candidate gathering. Past this, gathering is treated as
/// complete regardless of actual state, so a network with slow or failing
/// STUN never hangs the negotiation.
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(2);

/// Session state shared with the data-channel callbacks.
pub type SharedSession = Arc<Mutex<TransportSession>>;

/// Negotiates direct WebRTC transports with the provider.
#[derive(Debug, Clone)]
pub struct WebRtcNegotiator {
    http: reqwest::Client,
    credentials_url: String,
    calls_url: String,
    ice_gathering_timeout: Duration,
}

impl WebRtcNegotiator {
    /// Create a negotiator.
    ///
    /// `credentials_url` is the relay's ephemeral-token endpoint;
    /// `calls_url` is the provider's SDP negotiation endpoint.
    pub fn new(credentials_url: impl Into<String>, calls_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials_url: credentials_url.into(),
            calls_url: calls_url.into(),
            ice_gathering_timeout: ICE_GATHERING_TIMEOUT,
        }
    }

    /// Override the ICE gathering bound.
    pub fn with_ice_gathering_timeout(mut self, timeout: Duration) -> Self {
        self.ice_gathering_timeout = timeout;
        self
    }

    /// Establish a data channel with the provider.
    ///
    /// `local_audio` is an optional outbound audio track; when absent the
    /// audio transceiver is receive-only. A missing or denied microphone
    /// downgrades the session instead of failing it.
    pub async fn connect(
        &self,
        session: SharedSession,
        local_audio: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> RelayResult<WebRtcTransport> {
        let token = self.fetch_ephemeral_token(&session).await?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RelayError::Negotiation(format!("Failed to register codecs: {e}")))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RelayError::Negotiation(format!("Failed to register interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| {
                    RelayError::Negotiation(format!("Failed to create peer connection: {e}"))
                })?,
        );

        let channel = match peer.create_data_channel(DATA_CHANNEL_LABEL, None).await {
            Ok(channel) => channel,
            Err(e) => {
                return Err(self
                    .fail(&session, &peer, format!("Failed to create data channel: {e}"))
                    .await);
            }
        };

        // Outbound audio when a local track exists, receive-only otherwise.
        let audio_setup = match local_audio {
            Some(track) => peer.add_track(track).await.map(|_| ()),
            None => peer
                .add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map(|_| ()),
        };
        if let Err(e) = audio_setup {
            return Err(self
                .fail(&session, &peer, format!("Failed to set up audio transceiver: {e}"))
                .await);
        }

        register_channel_callbacks(&channel, &session, &peer);

        let offer = match peer.create_offer(None).await {
            Ok(offer) => offer,
            Err(e) => {
                return Err(self
                    .fail(&session, &peer, format!("Failed to create offer: {e}"))
                    .await);
            }
        };
        if let Err(e) = peer.set_local_description(offer).await {
            return Err(self
                .fail(&session, &peer, format!("Failed to set local description: {e}"))
                .await);
        }

        // Gathering that outruns the bound is treated as complete.
        let mut gathering_done = peer.gathering_complete_promise().await;
        let _ = tokio::time::timeout(self.ice_gathering_timeout, gathering_done.recv()).await;

        let Some(local) = peer.local_description().await else {
            return Err(self
                .fail(&session, &peer, "缺少本地 SDP offer".to_string())
                .await);
        };

        session.lock().status = labels::NEGOTIATING.to_string();

        let response = match self
            .http
            .post(&self.calls_url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "application/sdp")
            .body(local.sdp)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Err(self
                    .fail(&session, &peer, format!("OpenAI WebRTC 協商失敗：{e}"))
                    .await);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(self
                .fail(
                    &session,
                    &peer,
                    format!("OpenAI WebRTC 協商失敗（{}）：{details}", status.as_u16()),
                )
                .await);
        }

        let answer_sdp = match response.text().await {
            Ok(sdp) => sdp,
            Err(e) => {
                return Err(self
                    .fail(&session, &peer, format!("OpenAI WebRTC 協商失敗：{e}"))
                    .await);
            }
        };
        let answer = match RTCSessionDescription::answer(answer_sdp) {
            Ok(answer) => answer,
            Err(e) => {
                return Err(self
                    .fail(&session, &peer, format!("Invalid answer SDP: {e}"))
                    .await);
            }
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            return Err(self
                .fail(&session, &peer, format!("Failed to set remote description: {e}"))
                .await);
        }

        session.lock().status = labels::WAITING_CHANNEL.to_string();
        tracing::info!("WebRTC negotiation complete, waiting for data channel");

        Ok(WebRtcTransport {
            peer,
            channel,
            session,
        })
    }

    /// Fetch an ephemeral credential from the issuance endpoint.
    async fn fetch_ephemeral_token(&self, session: &SharedSession) -> RelayResult<String> {
        session.lock().status = labels::FETCHING_KEY.to_string();

        let result: RelayResult<String> = async {
            let response = self
                .http
                .post(&self.credentials_url)
                .send()
                .await
                .map_err(|e| RelayError::Negotiation(format!("取得短效金鑰失敗：{e}")))?;
            let status = response.status();
            if !status.is_success() {
                let details = response.text().await.unwrap_or_default();
                return Err(RelayError::Negotiation(format!(
                    "取得短效金鑰失敗（{}）：{details}",
                    status.as_u16()
                )));
            }
            let payload: Value = response
                .json()
                .await
                .map_err(|e| RelayError::Negotiation(format!("取得短效金鑰失敗：{e}")))?;
            extract_client_secret(&payload).ok_or_else(|| {
                RelayError::Negotiation("短效金鑰回應缺少 client secret".to_string())
            })
        }
        .await;

        if let Err(error) = &result {
            tracing::error!("Failed to obtain ephemeral credential: {error}");
            let mut state = session.lock();
            let message = error.to_string();
            state.push_message(MessageRole::Error, message);
            state.status = labels::KEY_ERROR.to_string();
        }
        result
    }

    /// Record a fatal negotiation failure: surface it in the conversation
    /// log, clear transport state, and release the peer. Single exit path for
    /// every post-peer-creation error.
    async fn fail(
        &self,
        session: &SharedSession,
        peer: &Arc<RTCPeerConnection>,
        message: String,
    ) -> RelayError {
        tracing::error!("WebRTC negotiation failed: {message}");
        {
            let mut state = session.lock();
            state.push_message(MessageRole::Error, message.clone());
            state.manual_stop = false;
            state.reset();
            state.status = labels::ERROR.to_string();
        }
        let _ = peer.close().await;
        RelayError::Negotiation(message)
    }
}

/// Pull the bearer token out of a credential response, tolerating both the
/// object and plain-string `client_secret` shapes.
fn extract_client_secret(payload: &Value) -> Option<String> {
    match payload.get("client_secret") {
        Some(Value::String(token)) => Some(token.clone()),
        Some(Value::Object(secret)) => secret
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Wire the data-channel lifecycle into the session state.
fn register_channel_callbacks(
    channel: &Arc<RTCDataChannel>,
    session: &SharedSession,
    peer: &Arc<RTCPeerConnection>,
) {
    let on_open_session = session.clone();
    channel.on_open(Box::new(move || {
        let session = on_open_session.clone();
        Box::pin(async move {
            tracing::info!("WebRTC data channel open");
            let mut state = session.lock();
            state.is_ready = true;
            state.status = labels::CONNECTED.to_string();
        })
    }));

    let on_message_session = session.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let session = on_message_session.clone();
        Box::pin(async move {
            let Ok(text) = std::str::from_utf8(&message.data) else {
                tracing::warn!("Ignoring non-UTF-8 data channel payload");
                return;
            };
            match ProviderEvent::parse(text) {
                Ok(event) => session.lock().apply_event(event, Instant::now()),
                Err(e) => tracing::warn!("Failed to parse data channel event: {e}"),
            }
        })
    }));

    let on_close_session = session.clone();
    // Weak reference: the peer owns the channel, and the channel's callback
    // must not keep the peer alive.
    let weak_peer = Arc::downgrade(peer);
    channel.on_close(Box::new(move || {
        let session = on_close_session.clone();
        let weak_peer = weak_peer.clone();
        Box::pin(async move {
            tracing::info!("WebRTC data channel closed");
            {
                let mut state = session.lock();
                if state.is_ready {
                    state.reset();
                }
            }
            if let Some(peer) = weak_peer.upgrade() {
                let _ = peer.close().await;
            }
        })
    }));

    let on_error_session = session.clone();
    channel.on_error(Box::new(move |error| {
        let session = on_error_session.clone();
        Box::pin(async move {
            tracing::error!("WebRTC data channel error: {error}");
            session.lock().status = labels::ERROR.to_string();
        })
    }));
}

/// An established WebRTC transport: the peer connection, its event data
/// channel, and the session state the channel callbacks mutate.
pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    session: SharedSession,
}

impl WebRtcTransport {
    /// Session state shared with the channel callbacks.
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Whether the data channel is open and the session marked ready.
    pub fn is_ready(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    /// Send a user text turn over the data channel.
    ///
    /// Registers the turn for latency correlation and appends the user
    /// message only after the send succeeds. Empty input is a no-op.
    pub async fn send_text(&self, text: &str) -> RelayResult<()> {
        let message = text.trim();
        if message.is_empty() {
            return Ok(());
        }

        let client_message_id = Uuid::new_v4().to_string();
        self.send_event(&ClientEvent::text_turn(message, &client_message_id))
            .await?;

        let mut state = self.session.lock();
        state.note_turn_sent(&client_message_id, Instant::now());
        state.push_message(MessageRole::User, message);
        Ok(())
    }

    /// Push session instructions and voice to the provider.
    pub async fn configure_session(
        &self,
        instructions: &str,
        voice: Option<&str>,
    ) -> RelayResult<()> {
        self.send_event(&ClientEvent::SessionUpdate {
            session: SessionUpdateConfig::realtime(instructions, voice),
        })
        .await
    }

    /// Stream one captured audio chunk into the provider's input buffer.
    pub async fn send_audio_chunk(&self, pcm: &[u8]) -> RelayResult<()> {
        self.send_event(&ClientEvent::audio_append(pcm)).await
    }

    /// Commit the buffered audio as a voice turn and request the reply.
    ///
    /// Registers the turn for latency correlation and appends the
    /// placeholder user message, like a text turn does.
    pub async fn commit_audio_turn(&self) -> RelayResult<()> {
        self.send_event(&ClientEvent::InputAudioBufferCommit).await?;

        let client_message_id = Uuid::new_v4().to_string();
        self.send_event(&ClientEvent::audio_turn(&client_message_id))
            .await?;

        let mut state = self.session.lock();
        state.note_turn_sent(&client_message_id, Instant::now());
        state.push_message(MessageRole::User, VOICE_TURN_PLACEHOLDER);
        Ok(())
    }

    /// Discard any audio buffered but not yet committed.
    pub async fn clear_audio_buffer(&self) -> RelayResult<()> {
        self.send_event(&ClientEvent::InputAudioBufferClear).await
    }

    async fn send_event(&self, event: &ClientEvent) -> RelayResult<()> {
        if !self.is_ready() {
            return Err(RelayError::Negotiation("資料通道尚未開啟".to_string()));
        }
        let payload = serde_json::to_string(event)?;
        self.channel
            .send_text(payload)
            .await
            .map_err(|e| RelayError::Negotiation(format!("Failed to send on data channel: {e}")))?;
        Ok(())
    }

    /// Tear the transport down.
    ///
    /// Idempotent: closing an already-closed channel or peer is ignored.
    pub async fn close(&self) {
        self.session.lock().manual_stop = true;
        let _ = self.channel.close().await;
        let _ = self.peer.close().await;
        let mut state = self.session.lock();
        if state.is_ready || state.manual_stop {
            state.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_client_secret_object_shape() {
        let payload = json!({"client_secret": {"value": "ek_123", "expires_at": 1}});
        assert_eq!(extract_client_secret(&payload).as_deref(), Some("ek_123"));
    }

    #[test]
    fn test_extract_client_secret_string_shape() {
        let payload = json!({"client_secret": "ek_plain"});
        assert_eq!(extract_client_secret(&payload).as_deref(), Some("ek_plain"));
    }

    #[test]
    fn test_extract_client_secret_missing() {
        assert!(extract_client_secret(&json!({})).is_none());
        assert!(extract_client_secret(&json!({"client_secret": null})).is_none());
        assert!(extract_client_secret(&json!({"client_secret": {"expires_at": 1}})).is_none());
    }
}
