pub mod assets;
pub mod handlers;
pub mod router;
pub mod routing;

// Re-export key types for convenience
pub use assets::{AssetRegistry, SharedAssetRegistry, StatusPublisher};
pub use handlers::register_builtin_handlers;
pub use router::{
    DeliveryError, MessageHandler, ProtocolRouter, RequestContext, RequestOptions, RouterConfig,
    RpcError, SharedRouter,
};
pub use routing::{Connection, ConnectionId, CredentialStore, Resolution, RoutingTable};
