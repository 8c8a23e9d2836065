//! Direct WebRTC transport to the provider.

mod negotiator;

pub use negotiator::{SharedSession, WebRtcNegotiator, WebRtcTransport};
