//! Stream-to-scene scenarios for deterministic simulation.

use serde::{Deserialize, Serialize};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// XRS-001: Robot frames tracked and smoothed, subscriptions released on detach
    SmoothFollow,

    /// XRS-002: Point clouds far faster than the bridge delivers them
    CloudFlood,

    /// XRS-003: Marker ADD/MODIFY/DELETE churn with racing mesh loads
    MarkerChurn,

    /// XRS-004: Guided teleport from a pointing controller
    GuidedTeleport,

    /// XRS-005: Two-handed grab navigation (scale, yaw, translation)
    GrabNavigate,

    /// XRS-006: Occupancy grid stream with random message loss
    GridStream,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SmoothFollow,
            ScenarioId::CloudFlood,
            ScenarioId::MarkerChurn,
            ScenarioId::GuidedTeleport,
            ScenarioId::GrabNavigate,
            ScenarioId::GridStream,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SmoothFollow => "smooth_follow",
            ScenarioId::CloudFlood => "cloud_flood",
            ScenarioId::MarkerChurn => "marker_churn",
            ScenarioId::GuidedTeleport => "guided_teleport",
            ScenarioId::GrabNavigate => "grab_navigate",
            ScenarioId::GridStream => "grid_stream",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SmoothFollow => {
                "Robot drives a circle, then stops; rendered base pose must converge and frames release on detach"
            }
            ScenarioId::CloudFlood => {
                "Lidar scans every tick into a 3-slot ring behind a 100ms throttle with queue depth 1"
            }
            ScenarioId::MarkerChurn => {
                "Markers spawn, change and die while mesh loads complete late; registry must match the oracle"
            }
            ScenarioId::GuidedTeleport => {
                "Controller points down-range, guide arc previewed, release teleports the feet onto the landing"
            }
            ScenarioId::GrabNavigate => "Both grips held while hands spread apart and twist; viewer scale and yaw follow",
            ScenarioId::GridStream => "Map published every tick with 30% loss; texture tracks the latest delivered map",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smooth_follow" | "smoothfollow" | "xrs-001" => Ok(ScenarioId::SmoothFollow),
            "cloud_flood" | "cloudflood" | "xrs-002" => Ok(ScenarioId::CloudFlood),
            "marker_churn" | "markerchurn" | "xrs-003" => Ok(ScenarioId::MarkerChurn),
            "guided_teleport" | "guidedteleport" | "xrs-004" => Ok(ScenarioId::GuidedTeleport),
            "grab_navigate" | "grabnavigate" | "xrs-005" => Ok(ScenarioId::GrabNavigate),
            "grid_stream" | "gridstream" | "xrs-006" => Ok(ScenarioId::GridStream),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
