//! Credential store
//!
//! Shared secret per remote node. Outbound requests to a node are stamped
//! with its secret; inbound traffic claiming to come from a node is checked
//! against it. A node without a configured secret needs no authentication.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use super::connection::ConnectionId;
use crate::domain::ids::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("node {0} requires a credential")]
    Missing(NodeId),
    #[error("invalid credential for node {0}")]
    Invalid(NodeId),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection already bound to {bound}, cannot claim {claimed}")]
    IdentityMismatch { bound: NodeId, claimed: NodeId },
    #[error("unidentified connection cannot answer for {0}")]
    Unidentified(NodeId),
}

/// A stored secret. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// SHA-256 hex digest, safe to show to operators.
    pub fn fingerprint(&self) -> String {
        hash_secret(&self.0)
    }

    fn matches(&self, presented: &str) -> bool {
        Sha256::digest(self.0.as_bytes()) == Sha256::digest(presented.as_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub node_id: NodeId,
    pub fingerprint: String,
}

#[derive(Default)]
pub struct CredentialStore {
    secrets: DashMap<NodeId, Secret>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if an existing secret was replaced.
    pub fn set(&self, node: NodeId, secret: impl Into<String>) -> bool {
        info!(node_id = %node, "Credential set");
        self.secrets.insert(node, Secret::new(secret)).is_some()
    }

    pub fn clear(&self, node: &NodeId) -> bool {
        let removed = self.secrets.remove(node).is_some();
        if removed {
            info!(node_id = %node, "Credential cleared");
        }
        removed
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.secrets.contains_key(node)
    }

    /// Secret used to stamp traffic addressed to `node`.
    pub fn secret_for(&self, node: &NodeId) -> Option<String> {
        self.secrets.get(node).map(|s| s.expose().to_string())
    }

    /// Check a credential presented on behalf of `node`. Permissive when no
    /// secret is configured for it.
    pub fn verify(&self, node: &NodeId, presented: Option<&str>) -> Result<(), AuthError> {
        let Some(secret) = self.secrets.get(node).map(|s| s.clone()) else {
            return Ok(());
        };
        match presented {
            None => {
                warn!(node_id = %node, "Credential missing");
                Err(AuthError::Missing(node.clone()))
            }
            Some(presented) if secret.matches(presented) => Ok(()),
            Some(_) => {
                warn!(node_id = %node, "Credential rejected");
                Err(AuthError::Invalid(node.clone()))
            }
        }
    }

    /// Sorted by node id; secrets are shown as fingerprints only.
    pub fn list(&self) -> Vec<CredentialInfo> {
        let mut list: Vec<CredentialInfo> = self
            .secrets
            .iter()
            .map(|entry| CredentialInfo {
                node_id: entry.key().clone(),
                fingerprint: entry.value().fingerprint(),
            })
            .collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }
}

// ── HTTP Basic helpers ─────────────────────────────────────────

/// `Authorization` header value for `user:password`.
pub fn basic_auth_header(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}

/// Split a `Basic` authorization header into user and password.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
