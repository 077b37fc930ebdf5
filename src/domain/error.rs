//! Domain errors

use std::fmt;

use crate::domain::asset::AssetLevel;
use crate::domain::ids::{AssetId, IdError};

/// Structural errors raised by the asset hierarchy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The parent already has a child with this id
    DuplicateChild { parent: AssetId, child: AssetId },
    /// No child with this id under the parent
    ChildNotFound { parent: AssetId, child: AssetId },
    /// No asset with this id anywhere in the registry
    AssetNotFound(AssetId),
    /// A root asset with this id is already registered
    DuplicateAsset(AssetId),
    /// Leaf level asked to hold children
    LeafAsset { asset: AssetId, level: AssetLevel },
    /// The configuration callback failed; the child was never published
    ConfigureFailed { child: AssetId, reason: String },
    /// Malformed identifier
    InvalidId(IdError),
}

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateChild { parent, child } => {
                write!(f, "Asset {} already has a child {}", parent, child)
            }
            Self::ChildNotFound { parent, child } => {
                write!(f, "Asset {} has no child {}", parent, child)
            }
            Self::AssetNotFound(id) => write!(f, "Asset not found: {}", id),
            Self::DuplicateAsset(id) => write!(f, "Asset already registered: {}", id),
            Self::LeafAsset { asset, level } => {
                write!(f, "Asset {} is a {} and cannot have children", asset, level)
            }
            Self::ConfigureFailed { child, reason } => {
                write!(f, "Configuring asset {} failed: {}", child, reason)
            }
            Self::InvalidId(err) => write!(f, "Invalid asset id: {}", err),
        }
    }
}

impl std::error::Error for AssetError {}

impl From<IdError> for AssetError {
    fn from(err: IdError) -> Self {
        Self::InvalidId(err)
    }
}

/// Result type for asset operations
pub type AssetResult<T> = Result<T, AssetError>;
