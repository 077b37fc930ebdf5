//! Live connections and outbound requests

pub mod dto;
pub mod handlers;

pub use dto::*;
pub use handlers::*;
