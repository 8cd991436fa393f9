//! Credential and request-key models shared across components.

pub mod credential;
pub mod key;

pub use credential::*;
pub use key::*;
