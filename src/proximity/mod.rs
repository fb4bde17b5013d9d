//! Tracks confirmed hazards around the vehicle.
//!
//! Two loops feed this module: a slow poll that refreshes the hazard set from
//! the backend (cached for `cache_ttl_secs`), and a fast tick whose period
//! shrinks with speed and which recomputes the along-track distance to every
//! hazard. Hazards that fall below `passed_threshold_m` are retired until
//! tracking stops.

pub mod adaptation;

pub use adaptation::{AlertDistances, ReactionLog};

use crate::backend::{Backend, NearbyObstaclesResponse, ObstacleQuery};
use crate::config::ProximityConfig;
use crate::error::Result;
use crate::storage::{KvStore, ALERT_DISTANCES_KEY, DRIVER_REACTIONS_KEY};
use crate::types::geodesy::{along_track_distance, bearing_deg, distance_m};
use crate::types::{DriverReaction, LocationFix, Obstacle, ObstacleType};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

/// Movement below this between fixes is too noisy to infer a bearing from
const MIN_BEARING_BASELINE_M: f64 = 2.0;

/// Tracking tick period for a given speed
pub fn tick_interval(speed_kmh: f64) -> Duration {
    let ms = if speed_kmh < 20.0 {
        1500
    } else if speed_kmh < 40.0 {
        600
    } else if speed_kmh < 60.0 {
        400
    } else if speed_kmh < 80.0 {
        250
    } else {
        200
    };
    Duration::from_millis(ms)
}

struct ObstacleCache {
    fetched_at: Instant,
    obstacles: Vec<Obstacle>,
}

/// Outcome of one tracking tick
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    /// Hazards still ahead, nearest first
    pub active: Vec<Obstacle>,
    /// Hazards retired on this tick
    pub passed: Vec<Obstacle>,
}

pub struct ProximityTracker<B: Backend> {
    backend: Rc<B>,
    store: KvStore,
    config: ProximityConfig,
    cache: Option<ObstacleCache>,
    active: Vec<Obstacle>,
    passed: HashSet<String>,
    last_fix: Option<LocationFix>,
    inferred_heading: Option<f64>,
    reactions: ReactionLog,
    distances: AlertDistances,
}

impl<B: Backend> ProximityTracker<B> {
    /// Restores the reaction log and learned distances from `store`
    pub fn new(backend: Rc<B>, store: KvStore, config: ProximityConfig) -> Self {
        let reactions = store
            .load_or_warn::<Vec<DriverReaction>>(DRIVER_REACTIONS_KEY)
            .map(ReactionLog::from_entries)
            .unwrap_or_default();
        let mut distances = store
            .load_or_warn::<AlertDistances>(ALERT_DISTANCES_KEY)
            .unwrap_or_default();
        if !reactions.is_empty() {
            distances.recompute(&reactions);
        }

        Self {
            backend,
            store,
            config,
            cache: None,
            active: Vec::new(),
            passed: HashSet::new(),
            last_fix: None,
            inferred_heading: None,
            reactions,
            distances,
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    /// Whether the cached hazard set is missing or older than the TTL
    pub fn needs_refresh(&self) -> bool {
        match &self.cache {
            Some(cache) => cache.fetched_at.elapsed() >= self.config.cache_ttl(),
            None => true,
        }
    }

    pub fn query_for(&self, latitude: f64, longitude: f64) -> ObstacleQuery {
        ObstacleQuery {
            latitude,
            longitude,
            radius: self.config.search_radius_m,
            min_confirmations: self.config.min_confirmations,
        }
    }

    /// Install the result of a backend poll. On failure the previous hazard
    /// set keeps serving until the next successful poll.
    pub fn apply_fetch(&mut self, result: Result<NearbyObstaclesResponse>) {
        match result {
            Ok(response) => {
                log::debug!(
                    "Fetched {} obstacles within {:.0} m",
                    response.obstacles.len(),
                    response.search_radius
                );
                self.cache = Some(ObstacleCache {
                    fetched_at: Instant::now(),
                    obstacles: response.obstacles,
                });
            }
            Err(e) => {
                let cached = self.cache.as_ref().map_or(0, |c| c.obstacles.len());
                log::warn!("Obstacle poll failed ({}), serving {} cached obstacles", e, cached);
            }
        }
    }

    /// Nearby hazards sorted by straight-line distance, filtered by
    /// confirmations and excluding passed ones. Hits the backend only when
    /// the cache is stale.
    pub async fn fetch_nearby_obstacles(
        &mut self,
        latitude: f64,
        longitude: f64,
        radius: f64,
        min_confirmations: u32,
    ) -> Vec<Obstacle> {
        if self.needs_refresh() {
            let query = ObstacleQuery {
                latitude,
                longitude,
                radius,
                min_confirmations,
            };
            let result = self.backend.nearby_obstacles(&query).await;
            self.apply_fetch(result);
        }

        let mut nearby: Vec<Obstacle> = self
            .cached_obstacles()
            .filter(|o| o.confirmations >= min_confirmations)
            .cloned()
            .map(|mut o| {
                o.distance = distance_m(latitude, longitude, o.latitude, o.longitude);
                o.bearing = bearing_deg(latitude, longitude, o.latitude, o.longitude);
                o
            })
            .filter(|o| o.distance <= radius)
            .collect();
        nearby.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        nearby
    }

    fn cached_obstacles(&self) -> impl Iterator<Item = &Obstacle> {
        let passed = &self.passed;
        self.cache
            .iter()
            .flat_map(|c| c.obstacles.iter())
            .filter(move |o| !passed.contains(&o.id))
    }

    /// Direction of travel: device heading, else bearing between the last two
    /// fixes that were far enough apart
    fn update_heading(&mut self, fix: &LocationFix) -> Option<f64> {
        // The anchor fix only advances once we have moved far enough
        let advance = match &self.last_fix {
            None => true,
            Some(prev) => {
                let moved = distance_m(prev.latitude, prev.longitude, fix.latitude, fix.longitude);
                if moved >= MIN_BEARING_BASELINE_M {
                    self.inferred_heading =
                        Some(bearing_deg(prev.latitude, prev.longitude, fix.latitude, fix.longitude));
                    true
                } else {
                    false
                }
            }
        };
        if advance {
            self.last_fix = Some(fix.clone());
        }
        fix.heading.or(self.inferred_heading)
    }

    /// Recompute distance, bearing and relevant distance for every tracked
    /// hazard. Anything whose relevant distance drops below the passed
    /// threshold is retired.
    pub fn tick(&mut self, fix: &LocationFix) -> TickReport {
        let heading = self.update_heading(fix);
        let min_confirmations = self.config.min_confirmations;
        let threshold = self.config.passed_threshold_m;

        let mut report = TickReport::default();
        let candidates: Vec<Obstacle> = self
            .cached_obstacles()
            .filter(|o| o.confirmations >= min_confirmations)
            .cloned()
            .collect();

        for mut obstacle in candidates {
            obstacle.distance = distance_m(fix.latitude, fix.longitude, obstacle.latitude, obstacle.longitude);
            obstacle.bearing = bearing_deg(fix.latitude, fix.longitude, obstacle.latitude, obstacle.longitude);
            obstacle.relevant_distance = match heading {
                Some(h) => along_track_distance(obstacle.distance, obstacle.bearing, h),
                None => obstacle.distance,
            };

            if obstacle.relevant_distance < threshold {
                log::debug!(
                    "Passed {} {} ({:.0} m along track)",
                    obstacle.obstacle_type,
                    obstacle.id,
                    obstacle.relevant_distance
                );
                self.passed.insert(obstacle.id.clone());
                report.passed.push(obstacle);
            } else {
                report.active.push(obstacle);
            }
        }

        report
            .active
            .sort_by(|a, b| a.relevant_distance.total_cmp(&b.relevant_distance));
        self.active = report.active.clone();
        report
    }

    pub fn active(&self) -> &[Obstacle] {
        &self.active
    }

    pub fn is_passed(&self, obstacle_id: &str) -> bool {
        self.passed.contains(obstacle_id)
    }

    /// Log a reaction and re-learn alert distances; both are persisted
    pub fn record_driver_reaction(&mut self, reaction: DriverReaction) {
        log::info!(
            "Driver reaction {:?} to {} {} at {:.0} m",
            reaction.action,
            reaction.obstacle_type,
            reaction.obstacle_id,
            reaction.distance_at_reaction
        );
        self.reactions.push(reaction);
        self.distances.recompute(&self.reactions);
        self.store.save_or_warn(DRIVER_REACTIONS_KEY, &self.reactions);
        self.store.save_or_warn(ALERT_DISTANCES_KEY, &self.distances);
    }

    pub fn alert_distance(&self, obstacle_type: ObstacleType) -> f64 {
        self.distances.get(obstacle_type)
    }

    pub fn reactions(&self) -> &ReactionLog {
        &self.reactions
    }

    /// Forget all tracking state. Learned distances survive.
    pub fn stop(&mut self) {
        self.cache = None;
        self.active.clear();
        self.passed.clear();
        self.last_fix = None;
        self.inferred_heading = None;
    }
}
