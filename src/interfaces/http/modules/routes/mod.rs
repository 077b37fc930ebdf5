//! Static relay route management

pub mod dto;
pub mod handlers;

pub use dto::*;
pub use handlers::*;
