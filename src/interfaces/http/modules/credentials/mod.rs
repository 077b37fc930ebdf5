//! Credential store management. Secrets are write-only.

pub mod dto;
pub mod handlers;

pub use dto::*;
pub use handlers::*;
