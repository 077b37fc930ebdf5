//! Transport surfaces: the node WebSocket server and peer links (`ws`) and
//! the admin API (`http`).

pub mod http;
pub mod ws;
