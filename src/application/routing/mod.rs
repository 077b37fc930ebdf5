//! Routing table, credential store and the connection handle they share.

pub mod connection;
pub mod credentials;
pub mod table;

pub use connection::{Connection, ConnectionId, TransportError};
pub use credentials::{
    basic_auth_header, hash_secret, parse_basic_auth, AuthError, CredentialInfo, CredentialStore,
    Secret,
};
pub use table::{Resolution, RouteInfo, RoutingError, RoutingTable};
