use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DetectError;

/// Domain models served by the detector.
///
/// Adding a model means adding a variant here and registering a backend
/// for it; request handlers never match on raw strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    TrafficViolation,
    Pothole,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::TrafficViolation, ModelType::Pothole];

    /// Wire name used in requests and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::TrafficViolation => "traffic_violation",
            ModelType::Pothole => "pothole",
        }
    }

    /// Key under which the model's counter is reported.
    pub fn stats_key(self) -> &'static str {
        match self {
            ModelType::TrafficViolation => "Traffic Violation",
            ModelType::Pothole => "Potholes",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traffic_violation" => Ok(ModelType::TrafficViolation),
            "pothole" => Ok(ModelType::Pothole),
            other => Err(DetectError::UnknownModel(other.to_string())),
        }
    }
}
