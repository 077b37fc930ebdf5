pub mod assets;
pub mod connections;
pub mod credentials;
pub mod health;
pub mod metrics;
pub mod routes;
