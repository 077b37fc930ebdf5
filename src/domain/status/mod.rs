pub mod history;
pub mod types;

pub use history::{StatusHistory, Timestamped, DEFAULT_HISTORY_CAPACITY};
pub use types::{AvailabilityStatus, SocketStatus};
