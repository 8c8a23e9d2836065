//! Core functionality: the provider event schema and classifier, ephemeral
//! session issuance, and the WebRTC negotiation handler.

pub mod events;
pub mod session;
pub mod webrtc;

pub use self::events::*;
pub use self::session::*;
pub use self::webrtc::*;
