//! Per-type alert distances learned from how the driver reacts to warnings.

use crate::types::{DriverReaction, ObstacleType, ReactionAction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_ALERT_DISTANCE_M: f64 = 500.0;
pub const MIN_ALERT_DISTANCE_M: f64 = 200.0;
pub const MAX_ALERT_DISTANCE_M: f64 = 1500.0;
/// Shift per net confirmed-over-dismissed reaction
pub const ADAPTATION_STEP_M: f64 = 50.0;
/// Reactions considered when recomputing distances
pub const ADAPTATION_WINDOW: usize = 100;
pub const REACTION_LOG_CAP: usize = 200;

/// Bounded, oldest-first log of driver reactions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionLog {
    entries: VecDeque<DriverReaction>,
}

impl ReactionLog {
    pub fn from_entries(entries: Vec<DriverReaction>) -> Self {
        let mut log = ReactionLog::default();
        for reaction in entries {
            log.push(reaction);
        }
        log
    }

    pub fn push(&mut self, reaction: DriverReaction) {
        self.entries.push_back(reaction);
        while self.entries.len() > REACTION_LOG_CAP {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest `n` reactions, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &DriverReaction> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDistances {
    distances: HashMap<ObstacleType, f64>,
}

impl AlertDistances {
    pub fn get(&self, obstacle_type: ObstacleType) -> f64 {
        self.distances
            .get(&obstacle_type)
            .copied()
            .unwrap_or(DEFAULT_ALERT_DISTANCE_M)
    }

    /// Recompute every type that appears in the adaptation window.
    ///
    /// Types without any reaction in the window fall back to the default.
    pub fn recompute(&mut self, log: &ReactionLog) {
        let mut net: HashMap<ObstacleType, i64> = HashMap::new();
        for reaction in log.recent(ADAPTATION_WINDOW) {
            let entry = net.entry(reaction.obstacle_type).or_insert(0);
            match reaction.action {
                ReactionAction::Confirmed => *entry += 1,
                ReactionAction::Dismissed => *entry -= 1,
                ReactionAction::Ignored => {}
            }
        }

        self.distances = net
            .into_iter()
            .map(|(obstacle_type, score)| {
                let distance = (DEFAULT_ALERT_DISTANCE_M + ADAPTATION_STEP_M * score as f64)
                    .clamp(MIN_ALERT_DISTANCE_M, MAX_ALERT_DISTANCE_M);
                (obstacle_type, distance)
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reaction(obstacle_type: ObstacleType, action: ReactionAction) -> DriverReaction {
        DriverReaction {
            obstacle_id: "o".to_string(),
            obstacle_type,
            action,
            timestamp: Utc::now(),
            distance_at_reaction: 100.0,
        }
    }

    fn distances_after(log: &ReactionLog) -> AlertDistances {
        let mut d = AlertDistances::default();
        d.recompute(log);
        d
    }

    #[test]
    fn test_default_distance() {
        let d = AlertDistances::default();
        assert_eq!(d.get(ObstacleType::Pothole), DEFAULT_ALERT_DISTANCE_M);
    }

    #[test]
    fn test_confirmed_raises_dismissed_lowers() {
        let mut log = ReactionLog::default();
        log.push(reaction(ObstacleType::Pothole, ReactionAction::Confirmed));
        log.push(reaction(ObstacleType::Pothole, ReactionAction::Confirmed));
        log.push(reaction(ObstacleType::Debris, ReactionAction::Dismissed));

        let d = distances_after(&log);
        assert_eq!(d.get(ObstacleType::Pothole), 600.0);
        assert_eq!(d.get(ObstacleType::Debris), 450.0);
        assert_eq!(d.get(ObstacleType::Bump), DEFAULT_ALERT_DISTANCE_M);
    }

    #[test]
    fn test_bounds() {
        let mut log = ReactionLog::default();
        for _ in 0..60 {
            log.push(reaction(ObstacleType::Pothole, ReactionAction::Confirmed));
        }
        assert_eq!(distances_after(&log).get(ObstacleType::Pothole), MAX_ALERT_DISTANCE_M);

        for _ in 0..100 {
            log.push(reaction(ObstacleType::Pothole, ReactionAction::Dismissed));
        }
        assert_eq!(distances_after(&log).get(ObstacleType::Pothole), MIN_ALERT_DISTANCE_M);
    }

    #[test]
    fn test_adaptation_is_monotonic_per_type() {
        let actions = [
            ReactionAction::Confirmed,
            ReactionAction::Dismissed,
            ReactionAction::Ignored,
            ReactionAction::Confirmed,
        ];
        let mut log = ReactionLog::default();
        for i in 0..250 {
            let action = actions[i % actions.len()];
            let obstacle_type = if i % 5 == 0 { ObstacleType::Bump } else { ObstacleType::Pothole };
            let before = distances_after(&log).get(obstacle_type);
            log.push(reaction(obstacle_type, action));
            let after = distances_after(&log).get(obstacle_type);
            match action {
                ReactionAction::Confirmed => assert!(after >= before),
                ReactionAction::Dismissed => assert!(after <= before),
                ReactionAction::Ignored => {}
            }
        }
    }

    #[test]
    fn test_log_capped() {
        let mut log = ReactionLog::default();
        for _ in 0..(REACTION_LOG_CAP + 25) {
            log.push(reaction(ObstacleType::Pothole, ReactionAction::Ignored));
        }
        assert_eq!(log.len(), REACTION_LOG_CAP);
        assert_eq!(log.recent(ADAPTATION_WINDOW).count(), ADAPTATION_WINDOW);
    }

    #[test]
    fn test_distances_roundtrip_json() {
        let mut log = ReactionLog::default();
        log.push(reaction(ObstacleType::SpeedBump, ReactionAction::Confirmed));
        let d = distances_after(&log);
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("speed_bump"));
        let back: AlertDistances = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(ObstacleType::SpeedBump), 550.0);
    }
}
