//! Realtime provider event types.
//!
//! This module defines the client and server event types exchanged with the
//! provider's realtime API. All events are JSON objects with a `type`
//! discriminator.
//!
//! Server events are decoded exactly once, at the transport boundary, into a
//! closed tagged union. Anything with an unrecognized `type` becomes
//! [`ProviderEvent::Unknown`] carrying the raw payload, so new provider event
//! types never break the relay. Event-name spellings that drifted across
//! provider revisions (`response.done` vs `response.completed`,
//! `...transcription.completed` vs `.done`) are accepted as synonyms via
//! serde aliases.
//!
//! # Protocol Overview
//!
//! Client events (sent to provider):
//! - session.update - Update session configuration
//! - input_audio_buffer.append - Append audio to buffer
//! - input_audio_buffer.commit - Commit audio buffer
//! - input_audio_buffer.clear - Clear audio buffer
//! - response.create - Generate a response (tagged with a client message id)
//!
//! Server events (received from provider):
//! - error - Error occurred
//! - server.status - Relay-injected lifecycle status
//! - session.created - Session established
//! - response.text.delta / response.output_text.delta /
//!   response.audio_transcript.delta - Text fragments
//! - conversation.item.input_audio_transcription.delta - Transcription fragment
//! - response.audio.delta - Base64 PCM audio chunk
//! - response.done / response.completed - Response complete
//! - response.*.done - Per-part completion
//! - response.error - Response-scoped failure

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Server Events (received from provider)
// =============================================================================

/// Server events received from the realtime provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderEvent {
    /// Error occurred
    #[serde(rename = "error")]
    Error {
        /// Error details
        #[serde(default)]
        error: Option<ApiError>,
        /// Flat error message used by some provider revisions
        #[serde(default)]
        message: Option<String>,
    },

    /// Lifecycle status injected by the relay server
    #[serde(rename = "server.status")]
    ServerStatus {
        /// Human-readable status label, shown verbatim
        status: String,
        /// Upstream close code, when the status reports a closure
        #[serde(default)]
        code: Option<u16>,
    },

    /// Session established with the provider
    #[serde(rename = "session.created")]
    SessionCreated,

    /// Text fragment of a streamed response
    #[serde(
        rename = "response.text.delta",
        alias = "response.output_text.delta",
        alias = "response.audio_transcript.delta"
    )]
    TextDelta(EventBody),

    /// Transcription fragment for a conversation item
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta(EventBody),

    /// Base64-encoded PCM audio chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta(EventBody),

    /// Response complete
    #[serde(rename = "response.done", alias = "response.completed")]
    ResponseDone(EventBody),

    /// A single output part finished streaming
    #[serde(
        rename = "response.text.done",
        alias = "response.output_text.done",
        alias = "response.audio_transcript.done",
        alias = "response.audio.done"
    )]
    PartDone(EventBody),

    /// Transcription finished for a conversation item
    #[serde(
        rename = "conversation.item.input_audio_transcription.completed",
        alias = "conversation.item.input_audio_transcription.done"
    )]
    TranscriptionCompleted(EventBody),

    /// Response-scoped failure
    #[serde(rename = "response.error")]
    ResponseError(EventBody),

    /// Any event type this relay does not interpret.
    /// Constructed by [`ProviderEvent::from_value`], never by serde dispatch.
    #[serde(skip)]
    Unknown(Value),
}

impl ProviderEvent {
    /// Decode a raw JSON frame into an event.
    ///
    /// Malformed JSON is an error (the caller drops and logs the frame);
    /// well-formed JSON with an unhandled `type` becomes `Unknown`.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(value))
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<ProviderEvent>(value.clone()) {
            Ok(event) => event,
            Err(_) => ProviderEvent::Unknown(value),
        }
    }
}

/// Shared payload for response-scoped events.
///
/// Providers are inconsistent about where the response identity lives: some
/// events carry a full `response` object, some a flat `response_id` (or its
/// camelCase spelling), and transcription events only an `item_id`. Every
/// field is optional so one shape-tolerant body covers all of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventBody {
    /// Full response object, when present
    #[serde(default)]
    pub response: Option<ResponseInfo>,
    /// Flat response identifier
    #[serde(default, alias = "responseId")]
    pub response_id: Option<String>,
    /// Conversation item identifier (transcription events)
    #[serde(default)]
    pub item_id: Option<String>,
    /// Delta content: a plain string, or a structured fragment
    #[serde(default)]
    pub delta: Option<Value>,
    /// Full item content, used by item-scoped events
    #[serde(default)]
    pub item: Option<Value>,
    /// Completed transcript text
    #[serde(default)]
    pub transcript: Option<String>,
    /// Error details for `response.error`
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl EventBody {
    /// Resolve the identity of the response this event belongs to.
    ///
    /// Order matches the tolerance the provider requires: explicit
    /// `response.id`, then a flat `response_id`, then `item_id`.
    pub fn response_key(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.id.as_deref())
            .or(self.response_id.as_deref())
            .or(self.item_id.as_deref())
    }

    /// Client message id attached as response metadata at send time.
    pub fn client_message_id(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|r| r.metadata.as_ref())
            .and_then(|m| m.client_message_id.as_deref())
    }

    /// Extract the text carried by this fragment, whatever its shape.
    pub fn delta_text(&self) -> String {
        if let Some(delta) = &self.delta {
            let text = text_from_content(delta);
            if !text.is_empty() {
                return text;
            }
        }
        if let Some(item) = &self.item {
            if let Some(content) = item.get("content") {
                let text = text_from_content(content);
                if !text.is_empty() {
                    return text;
                }
            }
        }
        self.transcript.clone().unwrap_or_default()
    }

    /// Decode the delta as a base64 PCM audio chunk.
    pub fn decode_audio_delta(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match &self.delta {
            Some(Value::String(b64)) => Some(BASE64_STANDARD.decode(b64)),
            _ => None,
        }
    }

    /// Full text of a completed response, used when a response finishes
    /// without streaming any delta first.
    pub fn completed_text(&self) -> String {
        let Some(response) = &self.response else {
            return String::new();
        };
        if let Some(parts) = &response.output_text {
            return parts.join("");
        }
        if let Some(output) = &response.output {
            return text_from_content(output);
        }
        String::new()
    }
}

/// Response object embedded in response-scoped events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseInfo {
    /// Provider-assigned response identifier
    #[serde(default)]
    pub id: Option<String>,
    /// Metadata echoed back from `response.create`
    #[serde(default)]
    pub metadata: Option<ResponseMetadata>,
    /// Completed output items
    #[serde(default)]
    pub output: Option<Value>,
    /// Completed output text fragments
    #[serde(default)]
    pub output_text: Option<Vec<String>>,
}

/// Metadata attached to a response at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Client-generated turn identifier, used for latency correlation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// API error information.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Error type
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    /// Error code
    #[serde(default)]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: Option<String>,
}

/// Recursively extract text from arbitrarily nested content.
///
/// Handles a plain string, an array of fragments, and objects with `text`,
/// `output_text`, `content`, or `delta` fields. Unknown shapes contribute an
/// empty string rather than failing.
pub fn text_from_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(text_from_content).collect(),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                return text.clone();
            }
            if let Some(Value::Array(parts)) = map.get("output_text") {
                return parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join("");
            }
            if let Some(content) = map.get("content") {
                return text_from_content(content);
            }
            if let Some(delta) = map.get("delta") {
                return text_from_content(delta);
            }
            String::new()
        }
        _ => String::new(),
    }
}

// =============================================================================
// Client Events (sent to provider)
// =============================================================================

/// Client events sent to the realtime provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionUpdateConfig,
    },

    /// Append audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a response
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Response request tagged with the client message id
        response: ResponseRequest,
    },
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    /// Response-create event for a user text turn.
    pub fn text_turn(text: &str, client_message_id: &str) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseRequest {
                metadata: ResponseMetadata {
                    client_message_id: Some(client_message_id.to_string()),
                },
                input: vec![InputItem::user_text(text)],
            },
        }
    }

    /// Response-create event for a committed voice turn.
    ///
    /// The input list is empty: the turn content is whatever sits in the
    /// provider's committed audio buffer.
    pub fn audio_turn(client_message_id: &str) -> Self {
        ClientEvent::ResponseCreate {
            response: ResponseRequest {
                metadata: ResponseMetadata {
                    client_message_id: Some(client_message_id.to_string()),
                },
                input: Vec::new(),
            },
        }
    }
}

/// Request body of a `response.create` event.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseRequest {
    /// Metadata echoed back on every event of the resulting response
    pub metadata: ResponseMetadata,
    /// Input items for this turn
    pub input: Vec<InputItem>,
}

/// Input item within a response request.
#[derive(Debug, Clone, Serialize)]
pub struct InputItem {
    /// Item type (always "message")
    #[serde(rename = "type")]
    pub item_type: String,
    /// Speaker role
    pub role: String,
    /// Content parts
    pub content: Vec<InputContent>,
}

impl InputItem {
    /// A user message carrying one text part.
    pub fn user_text(text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: "user".to_string(),
            content: vec![InputContent {
                content_type: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

/// Content part within an input item.
#[derive(Debug, Clone, Serialize)]
pub struct InputContent {
    /// Content type (input_text)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    pub text: String,
}

/// Session configuration for `session.update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionUpdateConfig {
    /// Session type discriminator expected by the provider
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl SessionUpdateConfig {
    /// The realtime session configuration sent right after connecting.
    pub fn realtime(instructions: &str, voice: Option<&str>) -> Self {
        Self {
            session_type: Some("realtime".to_string()),
            instructions: Some(instructions.to_string()),
            voice: voice.map(str::to_string),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_event_parses() {
        let event = ProviderEvent::parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#,
        )
        .unwrap();
        match event {
            ProviderEvent::Error { error, .. } => {
                assert_eq!(error.unwrap().message.as_deref(), Some("bad"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_preserves_payload() {
        let event =
            ProviderEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        match event {
            ProviderEvent::Unknown(value) => {
                assert_eq!(value["type"], "rate_limits.updated");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(ProviderEvent::parse("not json").is_err());
    }

    #[test]
    fn test_done_spellings_are_synonyms() {
        for raw in [
            r#"{"type":"response.done","response":{"id":"r1"}}"#,
            r#"{"type":"response.completed","response":{"id":"r1"}}"#,
        ] {
            match ProviderEvent::parse(raw).unwrap() {
                ProviderEvent::ResponseDone(body) => {
                    assert_eq!(body.response_key(), Some("r1"));
                }
                other => panic!("wrong event for {raw}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_transcription_completed_spellings() {
        for raw in [
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i1","transcript":"hi"}"#,
            r#"{"type":"conversation.item.input_audio_transcription.done","item_id":"i1","transcript":"hi"}"#,
        ] {
            match ProviderEvent::parse(raw).unwrap() {
                ProviderEvent::TranscriptionCompleted(body) => {
                    assert_eq!(body.response_key(), Some("i1"));
                }
                other => panic!("wrong event for {raw}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_response_key_resolution_order() {
        let body = EventBody {
            response: Some(ResponseInfo {
                id: Some("from-response".to_string()),
                ..Default::default()
            }),
            response_id: Some("flat".to_string()),
            item_id: Some("item".to_string()),
            ..Default::default()
        };
        assert_eq!(body.response_key(), Some("from-response"));

        let body = EventBody {
            response_id: Some("flat".to_string()),
            item_id: Some("item".to_string()),
            ..Default::default()
        };
        assert_eq!(body.response_key(), Some("flat"));

        let body = EventBody {
            item_id: Some("item".to_string()),
            ..Default::default()
        };
        assert_eq!(body.response_key(), Some("item"));
    }

    #[test]
    fn test_camel_case_response_id_alias() {
        let event = ProviderEvent::parse(
            r#"{"type":"response.text.delta","responseId":"r9","delta":"hi"}"#,
        )
        .unwrap();
        match event {
            ProviderEvent::TextDelta(body) => assert_eq!(body.response_key(), Some("r9")),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_delta_text_shapes() {
        let plain = EventBody {
            delta: Some(json!("hello")),
            ..Default::default()
        };
        assert_eq!(plain.delta_text(), "hello");

        let text_field = EventBody {
            delta: Some(json!({"text": "hello"})),
            ..Default::default()
        };
        assert_eq!(text_field.delta_text(), "hello");

        let output_text = EventBody {
            delta: Some(json!({"output_text": ["hel", "lo"]})),
            ..Default::default()
        };
        assert_eq!(output_text.delta_text(), "hello");

        let nested = EventBody {
            delta: Some(json!({"content": [{"text": "hel"}, {"text": "lo"}]})),
            ..Default::default()
        };
        assert_eq!(nested.delta_text(), "hello");

        let transcript = EventBody {
            transcript: Some("hello".to_string()),
            ..Default::default()
        };
        assert_eq!(transcript.delta_text(), "hello");

        let unknown_shape = EventBody {
            delta: Some(json!({"unexpected": 42})),
            ..Default::default()
        };
        assert_eq!(unknown_shape.delta_text(), "");
    }

    #[test]
    fn test_text_from_content_ignores_unknown_shapes() {
        assert_eq!(text_from_content(&json!(null)), "");
        assert_eq!(text_from_content(&json!(17)), "");
        assert_eq!(text_from_content(&json!({"weird": true})), "");
        assert_eq!(
            text_from_content(&json!([{"content": [{"text": "a"}]}, "b"])),
            "ab"
        );
    }

    #[test]
    fn test_completed_text_fallbacks() {
        let body = EventBody {
            response: Some(ResponseInfo {
                output_text: Some(vec!["he".to_string(), "llo".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(body.completed_text(), "hello");

        let body = EventBody {
            response: Some(ResponseInfo {
                output: Some(json!([{"content": [{"text": "hi"}]}])),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(body.completed_text(), "hi");
    }

    #[test]
    fn test_audio_delta_decode() {
        let original = vec![0u8, 1, 2, 3, 4, 5];
        let body = EventBody {
            delta: Some(json!(BASE64_STANDARD.encode(&original))),
            ..Default::default()
        };
        assert_eq!(body.decode_audio_delta().unwrap().unwrap(), original);

        let bad = EventBody {
            delta: Some(json!("not base64!!")),
            ..Default::default()
        };
        assert!(bad.decode_audio_delta().unwrap().is_err());
    }

    #[test]
    fn test_text_turn_serialization() {
        let event = ClientEvent::text_turn("hi there", "msg-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "response.create");
        assert_eq!(json["response"]["metadata"]["client_message_id"], "msg-1");
        assert_eq!(json["response"]["input"][0]["role"], "user");
        assert_eq!(json["response"]["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(json["response"]["input"][0]["content"][0]["text"], "hi there");
    }

    #[test]
    fn test_audio_turn_has_empty_input() {
        let event = ClientEvent::audio_turn("msg-2");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["response"]["input"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_session_update_serialization() {
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdateConfig::realtime("be helpful", Some("verse")),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("session.update"));
        assert!(json.contains("\"type\":\"realtime\""));
        assert!(json.contains("verse"));
    }

    #[test]
    fn test_audio_append_round_trip() {
        let data = vec![0u8, 1, 2, 3];
        match ClientEvent::audio_append(&data) {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap(), data);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }
}
