//! WebSocket relay between browser clients and the provider.

mod handler;
mod messages;

pub use handler::relay_handler;
pub use messages::{
    RelayErrorBody, RelayFrame, UPSTREAM_CLOSED_STATUS, UPSTREAM_CONNECTED_STATUS,
    UPSTREAM_FAILED_MESSAGE,
};
