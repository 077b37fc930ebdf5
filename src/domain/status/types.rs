//! Status values for each level of the asset hierarchy

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a single socket (EVSE / connector equipment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SocketStatus {
    #[default]
    Unknown,
    Available,
    Occupied,
    Reserved,
    OutOfService,
    Faulted,
    Offline,
}

/// Aggregated availability of a station or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AvailabilityStatus {
    #[default]
    Unknown,
    Available,
    Occupied,
    OutOfService,
    Offline,
}

impl SocketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Available => "Available",
            Self::Occupied => "Occupied",
            Self::Reserved => "Reserved",
            Self::OutOfService => "OutOfService",
            Self::Faulted => "Faulted",
            Self::Offline => "Offline",
        }
    }
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Available => "Available",
            Self::Occupied => "Occupied",
            Self::OutOfService => "OutOfService",
            Self::Offline => "Offline",
        }
    }
}

impl fmt::Display for SocketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketStatus {
    type Err = String;

    /// Accepts the OCPP connector status names as aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(Self::Unknown),
            "Available" => Ok(Self::Available),
            "Occupied" | "Charging" | "Preparing" | "SuspendedEV" | "SuspendedEVSE"
            | "Finishing" => Ok(Self::Occupied),
            "Reserved" => Ok(Self::Reserved),
            "OutOfService" | "Unavailable" => Ok(Self::OutOfService),
            "Faulted" => Ok(Self::Faulted),
            "Offline" => Ok(Self::Offline),
            other => Err(format!("unknown socket status '{}'", other)),
        }
    }
}
