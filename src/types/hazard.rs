use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Hazard categories reported by the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObstacleType {
    Pothole,
    SpeedBump,
    Bump,
    Construction,
    Accident,
    Flooding,
    Debris,
    #[serde(other)]
    Other,
}

impl ObstacleType {
    pub const ALL: [ObstacleType; 8] = [
        ObstacleType::Pothole,
        ObstacleType::SpeedBump,
        ObstacleType::Bump,
        ObstacleType::Construction,
        ObstacleType::Accident,
        ObstacleType::Flooding,
        ObstacleType::Debris,
        ObstacleType::Other,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ObstacleType::Pothole => "Pothole",
            ObstacleType::SpeedBump => "Speed bump",
            ObstacleType::Bump => "Bump",
            ObstacleType::Construction => "Road works",
            ObstacleType::Accident => "Accident",
            ObstacleType::Flooding => "Flooding",
            ObstacleType::Debris => "Debris",
            ObstacleType::Other => "Hazard",
        }
    }
}

impl Display for ObstacleType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeverityStats {
    pub avg: f64,
    /// Most severe report; 1 is critical
    pub max: u8,
}

impl Default for SeverityStats {
    fn default() -> Self {
        Self { avg: 3.0, max: 3 }
    }
}

/// Confirmed hazard near the vehicle.
///
/// `distance` and `bearing` are recomputed from the live position on every
/// tracking tick; `relevant_distance` is the distance along the direction of
/// travel and goes negative once the hazard is behind the vehicle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obstacle {
    pub id: String,
    #[serde(rename = "type")]
    pub obstacle_type: ObstacleType,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub bearing: f64,
    #[serde(default, skip_serializing)]
    pub relevant_distance: f64,
    #[serde(default)]
    pub severity: SeverityStats,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub last_reported: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Confirmed,
    Dismissed,
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverReaction {
    pub obstacle_id: String,
    pub obstacle_type: ObstacleType,
    pub action: ReactionAction,
    pub timestamp: DateTime<Utc>,
    pub distance_at_reaction: f64,
}

impl DriverReaction {
    pub fn new(obstacle: &Obstacle, action: ReactionAction) -> Self {
        Self {
            obstacle_id: obstacle.id.clone(),
            obstacle_type: obstacle.obstacle_type,
            action,
            timestamp: Utc::now(),
            distance_at_reaction: obstacle.relevant_distance,
        }
    }
}

/// Server-generated warning returned alongside raw data uploads or listed
/// per device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    #[serde(rename = "type", default)]
    pub warning_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: Option<u8>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
}
