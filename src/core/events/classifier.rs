//! Transport session state and the event classifier/accumulator.
//!
//! [`TransportSession`] owns everything a single client transport accumulates:
//! the visible message log, the pending-turn map used for latency
//! correlation, the in-progress response records, and the latency samples.
//! [`TransportSession::apply_event`] is the single entry point that maps one
//! decoded provider event to a deterministic state mutation — no I/O happens
//! here, which is what makes the whole turn lifecycle unit-testable.
//!
//! Every map lives on the session itself. Concurrent sessions cannot observe
//! each other's state because there is nothing module-level to share.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use super::messages::{ClientEvent, EventBody, ProviderEvent};

/// User-visible status labels.
///
/// Advisory only — nothing branches on them — but they are what the client
/// renders, so the exact strings matter.
pub mod labels {
    /// Idle, no transport active
    pub const IDLE: &str = "待命";
    /// Transport connecting
    pub const CONNECTING: &str = "連線中…";
    /// Session established, voice-ready
    pub const READY: &str = "已連線（語音就緒）";
    /// Data channel open
    pub const CONNECTED: &str = "已連線";
    /// Fetching an ephemeral credential
    pub const FETCHING_KEY: &str = "取得金鑰中…";
    /// SDP offer/answer exchange in flight
    pub const NEGOTIATING: &str = "協商中…";
    /// Answer applied, waiting for the data channel to open
    pub const WAITING_CHANNEL: &str = "等待資料通道…";
    /// Turn sent, waiting for the model's reply
    pub const WAITING_REPLY: &str = "等待語音回覆…";
    /// Transport closed by the remote side
    pub const CLOSED: &str = "已關閉";
    /// Generic error state
    pub const ERROR: &str = "錯誤";
    /// Credential fetch failed
    pub const KEY_ERROR: &str = "錯誤（金鑰）";
}

/// Fallback text for error events that carry no message.
const UNKNOWN_ERROR_MESSAGE: &str = "發生未知的即時錯誤";

/// Placeholder text shown for a submitted voice turn.
pub const VOICE_TURN_PLACEHOLDER: &str = "（語音訊息）";

/// Which transport a session runs over.
///
/// Determines the role label assigned to model output so the client can tell
/// the two assistant streams apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Server-proxied WebSocket
    Ws,
    /// Direct WebRTC data channel
    Webrtc,
}

impl TransportKind {
    fn assistant_role(self) -> MessageRole {
        match self {
            TransportKind::Ws => MessageRole::AssistantWs,
            TransportKind::Webrtc => MessageRole::AssistantWebrtc,
        }
    }
}

/// Role of a message in the display log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageRole {
    /// User-authored turn
    #[serde(rename = "user")]
    User,
    /// Model output received over the WebSocket relay
    #[serde(rename = "gpt-ws")]
    AssistantWs,
    /// Model output received over the WebRTC data channel
    #[serde(rename = "gpt-webrtc")]
    AssistantWebrtc,
    /// Error surfaced into the conversation log
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::AssistantWs => write!(f, "gpt-ws"),
            MessageRole::AssistantWebrtc => write!(f, "gpt-webrtc"),
            MessageRole::Error => write!(f, "error"),
        }
    }
}

/// One message in the display log. Text grows by delta concatenation while
/// the response streams.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Stable message identifier
    pub id: Uuid,
    /// Speaker role
    pub role: MessageRole,
    /// Accumulated text
    pub text: String,
}

/// In-progress accumulation record for one provider response.
#[derive(Debug, Clone)]
struct ActiveResponse {
    /// Client-generated turn id, filled once from response metadata and
    /// stable for the response lifetime
    client_message_id: Option<String>,
    /// Index of the target message in the display log
    message_index: usize,
}

/// Sink for decoded PCM audio chunks.
///
/// Playback devices are external collaborators; the classifier only decodes
/// and hands off.
pub trait AudioSink: Send {
    /// Consume one decoded PCM chunk.
    fn play(&mut self, pcm: Bytes);
}

/// Sink that discards audio. The default until a real sink is attached.
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn play(&mut self, _pcm: Bytes) {}
}

/// State of one client transport connection.
pub struct TransportSession {
    /// Transport kind, fixed at creation
    kind: TransportKind,
    /// Advisory status label
    pub status: String,
    /// True only after the transport handshake completed
    pub is_ready: bool,
    /// True while a user-initiated stop is in progress; selects the label
    /// shown after the close event lands
    pub manual_stop: bool,
    messages: Vec<ChatMessage>,
    pending_turns: HashMap<String, Instant>,
    active_responses: HashMap<String, ActiveResponse>,
    latencies: Vec<Duration>,
    audio_sink: Box<dyn AudioSink>,
}

impl TransportSession {
    /// Create an idle session for the given transport.
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            status: labels::IDLE.to_string(),
            is_ready: false,
            manual_stop: false,
            messages: Vec::new(),
            pending_turns: HashMap::new(),
            active_responses: HashMap::new(),
            latencies: Vec::new(),
            audio_sink: Box::new(NullAudioSink),
        }
    }

    /// Transport kind this session runs over.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Attach a playback sink for decoded audio deltas.
    pub fn set_audio_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.audio_sink = sink;
    }

    /// The display log.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of turns awaiting completion.
    pub fn pending_turn_count(&self) -> usize {
        self.pending_turns.len()
    }

    /// Whether a specific turn is still awaiting completion.
    pub fn has_pending_turn(&self, client_message_id: &str) -> bool {
        self.pending_turns.contains_key(client_message_id)
    }

    /// Number of responses currently streaming.
    pub fn active_response_count(&self) -> usize {
        self.active_responses.len()
    }

    /// Recorded round-trip samples.
    pub fn latencies(&self) -> &[Duration] {
        &self.latencies
    }

    /// Most recent round-trip duration.
    pub fn latest_latency(&self) -> Option<Duration> {
        self.latencies.last().copied()
    }

    /// Running mean of all recorded round-trips.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    /// Append a message to the display log and return its index.
    pub fn push_message(&mut self, role: MessageRole, text: impl Into<String>) -> usize {
        self.messages.push(ChatMessage {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
        });
        self.messages.len() - 1
    }

    /// Register a sent turn for latency correlation.
    ///
    /// At most one pending entry exists per turn id; re-registering replaces
    /// the start timestamp.
    pub fn note_turn_sent(&mut self, client_message_id: &str, now: Instant) {
        self.pending_turns.insert(client_message_id.to_string(), now);
    }

    /// Start a text turn: registers the pending entry, appends the user
    /// message, and returns the event to send upstream.
    pub fn begin_text_turn(&mut self, text: &str, now: Instant) -> ClientEvent {
        let client_message_id = Uuid::new_v4().to_string();
        self.note_turn_sent(&client_message_id, now);
        self.push_message(MessageRole::User, text);
        self.status = labels::WAITING_REPLY.to_string();
        ClientEvent::text_turn(text, &client_message_id)
    }

    /// Start a voice turn from the committed audio buffer.
    pub fn begin_audio_turn(&mut self, now: Instant) -> ClientEvent {
        let client_message_id = Uuid::new_v4().to_string();
        self.note_turn_sent(&client_message_id, now);
        self.push_message(MessageRole::User, VOICE_TURN_PLACEHOLDER);
        self.status = labels::WAITING_REPLY.to_string();
        ClientEvent::audio_turn(&client_message_id)
    }

    /// Clear all per-connection state and return to the idle or closed label.
    ///
    /// Latency samples are cleared too: a new connection is a new experiment.
    pub fn reset(&mut self) {
        self.is_ready = false;
        self.pending_turns.clear();
        self.active_responses.clear();
        self.latencies.clear();
        self.status = if self.manual_stop {
            labels::IDLE.to_string()
        } else {
            labels::CLOSED.to_string()
        };
        self.manual_stop = false;
    }

    /// Apply one decoded provider event.
    ///
    /// `now` is the observation timestamp used for latency samples; passing
    /// it in keeps the classifier deterministic under test.
    pub fn apply_event(&mut self, event: ProviderEvent, now: Instant) {
        match event {
            ProviderEvent::Error { error, message } => {
                let text = error
                    .and_then(|e| e.message)
                    .or(message)
                    .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string());
                self.push_message(MessageRole::Error, text);
                self.status = labels::ERROR.to_string();
            }

            ProviderEvent::ServerStatus { status, .. } => {
                self.status = status;
            }

            ProviderEvent::SessionCreated => {
                self.status = labels::READY.to_string();
            }

            ProviderEvent::TextDelta(body) | ProviderEvent::TranscriptionDelta(body) => {
                self.append_delta(&body);
            }

            ProviderEvent::AudioDelta(body) => match body.decode_audio_delta() {
                Some(Ok(pcm)) => self.audio_sink.play(Bytes::from(pcm)),
                Some(Err(e)) => {
                    tracing::warn!("Failed to decode audio delta: {e}");
                }
                None => {}
            },

            ProviderEvent::ResponseDone(body) => {
                self.finalize(&body, now);
            }

            ProviderEvent::PartDone(body) | ProviderEvent::TranscriptionCompleted(body) => {
                self.finalize(&body, now);
            }

            ProviderEvent::ResponseError(body) => {
                let text = body
                    .error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string());
                self.push_message(MessageRole::Error, text);
                if let Some(key) = body.response_key() {
                    if let Some(record) = self.active_responses.remove(key) {
                        if let Some(client_id) = record.client_message_id {
                            self.pending_turns.remove(&client_id);
                        }
                    }
                }
                if let Some(client_id) = body.client_message_id() {
                    self.pending_turns.remove(client_id);
                }
            }

            // Forward compatibility: unhandled event types change nothing.
            ProviderEvent::Unknown(_) => {
                tracing::trace!("Unhandled provider event");
            }
        }
    }

    /// Resolve or create the accumulation record for a fragment and append
    /// its text to the target message.
    fn append_delta(&mut self, body: &EventBody) {
        let Some(key) = body.response_key() else {
            return;
        };
        let key = key.to_string();
        let metadata_id = body.client_message_id().map(str::to_string);

        let messages = &mut self.messages;
        let role = self.kind.assistant_role();
        let metadata_for_backfill = metadata_id.clone();
        let record = self
            .active_responses
            .entry(key)
            .and_modify(|record| {
                // Backfill the linkage if the first fragment arrived without
                // metadata; once set it never changes.
                if record.client_message_id.is_none() {
                    record.client_message_id = metadata_for_backfill;
                }
            })
            .or_insert_with(|| {
                let message_index = messages.len();
                messages.push(ChatMessage {
                    id: Uuid::new_v4(),
                    role,
                    text: String::new(),
                });
                ActiveResponse {
                    client_message_id: metadata_id,
                    message_index,
                }
            });

        let index = record.message_index;
        let text = body.delta_text();
        if !text.is_empty() {
            if let Some(message) = self.messages.get_mut(index) {
                message.text.push_str(&text);
            }
        }
    }

    /// Terminal transition for a response.
    ///
    /// Removes the accumulation record, records one latency sample when the
    /// linked turn is still pending, and returns the status to ready. A
    /// terminal event for an unknown response only correlates latency through
    /// its own metadata — it never fabricates a message, so duplicate or
    /// out-of-order terminal spellings stay harmless.
    fn finalize(&mut self, body: &EventBody, now: Instant) {
        let record = body
            .response_key()
            .and_then(|key| self.active_responses.remove(key));

        let client_id = record
            .as_ref()
            .and_then(|r| r.client_message_id.clone())
            .or_else(|| body.client_message_id().map(str::to_string));

        if let Some(record) = &record {
            // A response that finished without streaming any fragment still
            // carries its full text on the terminal event.
            if let Some(message) = self.messages.get_mut(record.message_index) {
                if message.text.is_empty() {
                    message.text = body.completed_text();
                }
            }
        }

        if let Some(client_id) = client_id {
            if let Some(started) = self.pending_turns.remove(&client_id) {
                self.latencies.push(now.duration_since(started));
            }
        }

        if self.is_ready {
            self.status = labels::READY.to_string();
        }
    }
}

/// Format a latency sample the way the client's metrics panel shows it.
pub fn format_latency(duration: Duration) -> String {
    format!("{:.2} 毫秒", duration.as_secs_f64() * 1000.0)
}
