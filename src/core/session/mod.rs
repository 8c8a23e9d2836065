//! Ephemeral session credential issuance.

mod issuer;

pub use issuer::{ClientSecret, EphemeralSession, SessionIssuer};
