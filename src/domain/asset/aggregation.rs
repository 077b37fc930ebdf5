//! Status aggregation
//!
//! A parent's status is derived from its children's current statuses by a
//! pluggable function. The stock rollups below cover the common cases.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::ids::AssetId;
use crate::domain::status::{AvailabilityStatus, SocketStatus, Timestamped};

/// Current status of every direct child at the moment of aggregation.
#[derive(Debug, Clone)]
pub struct StatusSnapshot<S> {
    pub timestamp: DateTime<Utc>,
    /// Sorted by child id.
    pub children: Vec<(AssetId, Timestamped<S>)>,
}

impl<S> StatusSnapshot<S> {
    pub fn statuses(&self) -> impl Iterator<Item = &S> {
        self.children.iter().map(|(_, status)| &status.value)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }
}

pub type Aggregator<C, S> = Arc<dyn Fn(&StatusSnapshot<C>) -> S + Send + Sync>;

/// Statuses that can be read as station/pool availability.
pub trait AsAvailability {
    fn availability(&self) -> AvailabilityStatus;
}

impl AsAvailability for AvailabilityStatus {
    fn availability(&self) -> AvailabilityStatus {
        *self
    }
}

impl AsAvailability for SocketStatus {
    fn availability(&self) -> AvailabilityStatus {
        match self {
            SocketStatus::Unknown => AvailabilityStatus::Unknown,
            SocketStatus::Available => AvailabilityStatus::Available,
            SocketStatus::Occupied | SocketStatus::Reserved => AvailabilityStatus::Occupied,
            SocketStatus::OutOfService | SocketStatus::Faulted => AvailabilityStatus::OutOfService,
            SocketStatus::Offline => AvailabilityStatus::Offline,
        }
    }
}

/// `Occupied` as soon as one child is occupied, otherwise `Available`.
/// A parent without children is `Unknown`.
pub fn occupancy_rollup<S: AsAvailability>(snapshot: &StatusSnapshot<S>) -> AvailabilityStatus {
    if snapshot.is_empty() {
        return AvailabilityStatus::Unknown;
    }
    if snapshot
        .statuses()
        .any(|s| s.availability() == AvailabilityStatus::Occupied)
    {
        AvailabilityStatus::Occupied
    } else {
        AvailabilityStatus::Available
    }
}

/// Best availability any child offers: available beats occupied beats
/// out-of-service beats offline.
pub fn availability_rollup<S: AsAvailability>(snapshot: &StatusSnapshot<S>) -> AvailabilityStatus {
    const PRECEDENCE: [AvailabilityStatus; 4] = [
        AvailabilityStatus::Available,
        AvailabilityStatus::Occupied,
        AvailabilityStatus::OutOfService,
        AvailabilityStatus::Offline,
    ];

    let present: Vec<AvailabilityStatus> = snapshot.statuses().map(|s| s.availability()).collect();
    PRECEDENCE
        .into_iter()
        .find(|candidate| present.contains(candidate))
        .unwrap_or(AvailabilityStatus::Unknown)
}
