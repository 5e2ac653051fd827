use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Output phase an inverter's production is attributed to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Phase {
    L1,
    L2,
    L3,
    #[default]
    #[serde(alias = "none", alias = "NONE")]
    None,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::L1 => "L1",
            Phase::L2 => "L2",
            Phase::L3 => "L3",
            Phase::None => "NONE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "L1" => Ok(Phase::L1),
            "L2" => Ok(Phase::L2),
            "L3" => Ok(Phase::L3),
            "" | "NONE" => Ok(Phase::None),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// State of the most recent limit-set command, either reported by the DTU or
/// inferred from the outcome of our own write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitStatus {
    #[default]
    Unknown,
    Ok,
    Pending,
    Failure,
}

impl LimitStatus {
    /// Maps the `limit_set_status` strings OpenDTU reports. Anything
    /// unrecognised is `Unknown`.
    pub fn from_device(value: &str) -> Self {
        match value.trim() {
            "Ok" | "OK" | "ok" => LimitStatus::Ok,
            "Pending" | "pending" => LimitStatus::Pending,
            "Failure" | "failure" => LimitStatus::Failure,
            _ => LimitStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitStatus::Unknown => "Unknown",
            LimitStatus::Ok => "Ok",
            LimitStatus::Pending => "Pending",
            LimitStatus::Failure => "Failure",
        }
    }
}

impl fmt::Display for LimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one inverter behind the DTU.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub phase: Phase,
}

impl DeviceIdentity {
    pub fn new(serial: impl Into<String>, phase: Phase) -> Self {
        Self {
            serial: serial.into(),
            phase,
        }
    }
}
