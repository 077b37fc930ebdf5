//! Hierarchy levels
//!
//! Each level is a marker type implementing [`AssetKind`], which fixes the
//! level's status type and the node type of its children. Sockets name
//! [`NoChildren`], an uninhabited child type, so the nesting of node types
//! ends at the socket level.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::node::{AssetNode, ChildNode, NoChildren};
use crate::domain::status::{AvailabilityStatus, SocketStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetLevel {
    Pool,
    Station,
    Socket,
}

impl fmt::Display for AssetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool => write!(f, "pool"),
            Self::Station => write!(f, "station"),
            Self::Socket => write!(f, "socket"),
        }
    }
}

/// Values that can be kept in a status history.
pub trait StatusValue:
    Clone + PartialEq + fmt::Debug + fmt::Display + Default + Send + Sync + 'static
{
}

impl<T> StatusValue for T where
    T: Clone + PartialEq + fmt::Debug + fmt::Display + Default + Send + Sync + 'static
{
}

pub trait AssetKind: Send + Sync + Sized + 'static {
    type Status: StatusValue;
    type Child: ChildNode;

    const LEVEL: AssetLevel;
}

/// Charging pool (site); contains stations.
pub struct Pool;

/// Charging station; contains sockets.
pub struct Station;

/// Socket equipment (EVSE). Leaf level.
pub struct Socket;

impl AssetKind for Pool {
    type Status = AvailabilityStatus;
    type Child = AssetNode<Station>;

    const LEVEL: AssetLevel = AssetLevel::Pool;
}

impl AssetKind for Station {
    type Status = AvailabilityStatus;
    type Child = AssetNode<Socket>;

    const LEVEL: AssetLevel = AssetLevel::Station;
}

impl AssetKind for Socket {
    type Status = SocketStatus;
    type Child = NoChildren;

    const LEVEL: AssetLevel = AssetLevel::Socket;
}
