//! Request handlers.

pub mod relay;
pub mod sessions;
