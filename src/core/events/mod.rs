//! Provider event schema and the classifier/accumulator.

mod classifier;
mod messages;

pub use classifier::{
    AudioSink, ChatMessage, MessageRole, NullAudioSink, TransportKind, TransportSession,
    VOICE_TURN_PLACEHOLDER, format_latency, labels,
};
pub use messages::{
    ApiError, ClientEvent, EventBody, InputContent, InputItem, ProviderEvent, ResponseInfo,
    ResponseMetadata, ResponseRequest, SessionUpdateConfig, text_from_content,
};
