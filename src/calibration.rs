//! Per-device motion baseline and deviation thresholds.
//!
//! A profile comes from the server when possible, from the local cache
//! otherwise, and from a hard-coded default as a last resort, so the
//! classifier always has usable thresholds.

use crate::backend::{Backend, CalibrationRequest};
use crate::config::CalibrationConfig;
use crate::error::{Result, SentinelError};
use crate::storage::{KvStore, CALIBRATION_PROFILE_KEY};
use crate::types::{AccelerationSample, RoadType, VehicleClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

const DEFAULT_DEVIATION_THRESHOLD: f64 = 2.0;
/// Typical steady-driving noise on a car mount, m/s²
const NOMINAL_NOISE: f64 = 0.3;
const MIN_LOCAL_THRESHOLD: f64 = 0.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileSource {
    #[default]
    Server,
    Local,
    Default,
}

fn unit_multiplier() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProfile {
    #[serde(default)]
    pub vehicle_class: VehicleClass,
    #[serde(alias = "baselineSample")]
    pub baseline: Vec3,
    #[serde(default, alias = "standardDeviation")]
    pub std_dev: Vec3,
    #[serde(alias = "threshold")]
    pub deviation_threshold: f64,
    #[serde(default = "unit_multiplier")]
    pub threshold_multiplier: f64,
    #[serde(default)]
    pub sample_count: usize,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub source: ProfileSource,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            vehicle_class: VehicleClass::Car,
            baseline: Vec3::new(0.0, 0.0, 9.81),
            std_dev: Vec3::default(),
            deviation_threshold: DEFAULT_DEVIATION_THRESHOLD,
            threshold_multiplier: 1.0,
            sample_count: 0,
            last_updated: Utc::now(),
            source: ProfileSource::Default,
        }
    }
}

impl CalibrationProfile {
    /// Multiplier the classifier applies; malformed values degrade to 1.0
    pub fn effective_multiplier(&self) -> f64 {
        if self.threshold_multiplier.is_finite() && self.threshold_multiplier > 0.0 {
            self.threshold_multiplier
        } else {
            1.0
        }
    }

    fn is_usable(&self) -> bool {
        self.deviation_threshold.is_finite()
            && self.deviation_threshold > 0.0
            && self.baseline.x.is_finite()
            && self.baseline.y.is_finite()
            && self.baseline.z.is_finite()
    }

    /// Compute a profile on device from the collected samples
    pub fn from_samples(samples: &[AccelerationSample], vehicle_class: VehicleClass) -> Self {
        if samples.is_empty() {
            return CalibrationProfile::default();
        }
        let n = samples.len() as f64;
        let mean = Vec3::new(
            samples.iter().map(|s| s.x).sum::<f64>() / n,
            samples.iter().map(|s| s.y).sum::<f64>() / n,
            samples.iter().map(|s| s.z).sum::<f64>() / n,
        );
        let std_dev = Vec3::new(
            (samples.iter().map(|s| (s.x - mean.x).powi(2)).sum::<f64>() / n).sqrt(),
            (samples.iter().map(|s| (s.y - mean.y).powi(2)).sum::<f64>() / n).sqrt(),
            (samples.iter().map(|s| (s.z - mean.z).powi(2)).sum::<f64>() / n).sqrt(),
        );
        let total_std = std_dev.norm();

        CalibrationProfile {
            vehicle_class,
            baseline: mean,
            std_dev,
            deviation_threshold: (3.0 * total_std).max(MIN_LOCAL_THRESHOLD),
            threshold_multiplier: (total_std / NOMINAL_NOISE).clamp(0.5, 2.0),
            sample_count: samples.len(),
            last_updated: Utc::now(),
            source: ProfileSource::Local,
        }
    }
}

pub struct CalibrationManager<B: Backend> {
    backend: Rc<B>,
    store: KvStore,
    device_id: String,
    vehicle_class: VehicleClass,
    config: CalibrationConfig,
    samples: Vec<AccelerationSample>,
    collecting: bool,
    profile: CalibrationProfile,
}

impl<B: Backend> CalibrationManager<B> {
    pub fn new(
        backend: Rc<B>,
        store: KvStore,
        device_id: &str,
        vehicle_class: VehicleClass,
        config: CalibrationConfig,
    ) -> Self {
        let profile = CalibrationProfile {
            vehicle_class,
            ..CalibrationProfile::default()
        };
        CalibrationManager {
            backend,
            store,
            device_id: device_id.to_string(),
            vehicle_class,
            samples: Vec::with_capacity(config.max_samples),
            config,
            collecting: false,
            profile,
        }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    /// Begin a fresh collection, discarding any partial one
    pub fn start_calibration(&mut self) {
        log::info!("Calibration started (need {} samples)", self.config.min_samples);
        self.samples.clear();
        self.collecting = true;
    }

    /// Feed a sample to the running collection. Returns whether it was kept.
    pub fn add_sample(&mut self, sample: AccelerationSample) -> bool {
        if !self.collecting || !sample.is_finite() || self.samples.len() >= self.config.max_samples {
            return false;
        }
        self.samples.push(sample);
        true
    }

    /// Submit the collected samples. The server-computed profile replaces the
    /// local one; if the server cannot be reached the profile is computed on
    /// device instead.
    pub async fn submit_calibration(&mut self, speed_kmh: f64, road_type: RoadType) -> Result<&CalibrationProfile> {
        let have = self.samples.len();
        if have < self.config.min_samples {
            return Err(SentinelError::InsufficientData {
                have,
                need: self.config.min_samples,
            });
        }

        let request = CalibrationRequest {
            device_id: self.device_id.clone(),
            accelerometer_data: self.samples.clone(),
            speed: speed_kmh,
            road_type,
        };

        let profile = match self.backend.submit_calibration(&request).await {
            Ok(mut profile) if profile.is_usable() => {
                profile.source = ProfileSource::Server;
                profile.sample_count = have;
                profile
            }
            Ok(_) => {
                log::warn!("Server returned an unusable calibration profile, computing locally");
                CalibrationProfile::from_samples(&self.samples, self.vehicle_class)
            }
            Err(e) => {
                log::warn!("Calibration submit failed ({}), computing locally", e);
                CalibrationProfile::from_samples(&self.samples, self.vehicle_class)
            }
        };

        log::info!(
            "Calibration complete: baseline=({:.2}, {:.2}, {:.2}) threshold={:.2} source={:?}",
            profile.baseline.x,
            profile.baseline.y,
            profile.baseline.z,
            profile.deviation_threshold,
            profile.source
        );

        self.store.save_or_warn(CALIBRATION_PROFILE_KEY, &profile);
        self.profile = profile;
        self.samples.clear();
        self.collecting = false;
        Ok(&self.profile)
    }

    /// Resolve the active profile: backend, then local cache, then default.
    pub async fn load_profile(&mut self) -> &CalibrationProfile {
        match self.backend.fetch_calibration(&self.device_id).await {
            Ok(Some(mut profile)) if profile.is_usable() => {
                profile.source = ProfileSource::Server;
                self.store.save_or_warn(CALIBRATION_PROFILE_KEY, &profile);
                self.profile = profile;
                return &self.profile;
            }
            Ok(_) => log::info!("No server calibration profile for {}", self.device_id),
            Err(e) => log::warn!("Calibration profile fetch failed: {}", e),
        }

        match self.store.load_or_warn::<CalibrationProfile>(CALIBRATION_PROFILE_KEY) {
            Some(profile) if profile.is_usable() => {
                log::info!("Using cached calibration profile");
                self.profile = profile;
            }
            _ => {
                log::warn!("{}, using default thresholds", SentinelError::ProfileUnavailable);
                self.profile = CalibrationProfile {
                    vehicle_class: self.vehicle_class,
                    ..CalibrationProfile::default()
                };
            }
        }
        &self.profile
    }

    /// Forget the profile everywhere and revert to defaults
    pub async fn reset_profile(&mut self) {
        if let Err(e) = self.backend.delete_calibration(&self.device_id).await {
            log::warn!("Server profile delete failed: {}", e);
        }
        if let Err(e) = self.store.remove(CALIBRATION_PROFILE_KEY) {
            log::warn!("Cached profile delete failed: {}", e);
        }
        self.profile = CalibrationProfile {
            vehicle_class: self.vehicle_class,
            ..CalibrationProfile::default()
        };
    }

    /// Euclidean deviation from the baseline exceeds the profile threshold
    pub fn detect_anomaly(&self, sample: &AccelerationSample) -> bool {
        let b = &self.profile.baseline;
        let deviation = Vec3::new(sample.x - b.x, sample.y - b.y, sample.z - b.z).norm();
        deviation > self.profile.deviation_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::MockBackend;

    fn manager(backend: Rc<MockBackend>, store: KvStore) -> CalibrationManager<MockBackend> {
        CalibrationManager::new(
            backend,
            store,
            "dev-1",
            VehicleClass::Car,
            Config::default().calibration,
        )
    }

    fn server_profile() -> CalibrationProfile {
        CalibrationProfile {
            vehicle_class: VehicleClass::Car,
            baseline: Vec3::new(0.1, 0.2, 9.7),
            std_dev: Vec3::new(0.1, 0.1, 0.2),
            deviation_threshold: 1.5,
            threshold_multiplier: 1.2,
            sample_count: 0,
            last_updated: Utc::now(),
            source: ProfileSource::Server,
        }
    }

    fn feed(m: &mut CalibrationManager<MockBackend>, n: usize) {
        for i in 0..n {
            m.add_sample(AccelerationSample::new(0.0, 0.1, 9.8, i as f64 * 0.02));
        }
    }

    #[tokio::test]
    async fn test_nineteen_samples_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(Rc::new(MockBackend::online()), KvStore::open(dir.path()).unwrap());
        m.start_calibration();
        feed(&mut m, 19);

        let err = m.submit_calibration(40.0, RoadType::Asphalt).await.unwrap_err();
        assert_eq!(err, SentinelError::InsufficientData { have: 19, need: 20 });
        assert!(m.is_collecting());
    }

    #[tokio::test]
    async fn test_twenty_samples_submits_and_replaces_profile() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Rc::new(MockBackend::online());
        *backend.calibration_response.borrow_mut() = Some(server_profile());
        let store = KvStore::open(dir.path()).unwrap();
        let mut m = manager(backend.clone(), store.clone());
        m.start_calibration();
        feed(&mut m, 20);

        let profile = m.submit_calibration(40.0, RoadType::Gravel).await.unwrap().clone();
        assert_eq!(profile.deviation_threshold, 1.5);
        assert_eq!(profile.sample_count, 20);
        assert_eq!(profile.source, ProfileSource::Server);
        assert!(!m.is_collecting());

        let request = &backend.calibration_requests.borrow()[0];
        assert_eq!(request.accelerometer_data.len(), 20);
        assert_eq!(request.road_type, RoadType::Gravel);

        let cached: CalibrationProfile = store.load(CALIBRATION_PROFILE_KEY).unwrap().unwrap();
        assert_eq!(cached.deviation_threshold, 1.5);
    }

    #[tokio::test]
    async fn test_collection_caps_at_max_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(Rc::new(MockBackend::online()), KvStore::open(dir.path()).unwrap());
        assert!(!m.add_sample(AccelerationSample::new(0.0, 0.0, 9.8, 0.0)));
        m.start_calibration();
        feed(&mut m, 150);
        assert_eq!(m.collected(), 100);
    }

    #[tokio::test]
    async fn test_offline_submit_computes_locally() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(Rc::new(MockBackend::offline()), KvStore::open(dir.path()).unwrap());
        m.start_calibration();
        feed(&mut m, 30);

        let profile = m.submit_calibration(30.0, RoadType::Asphalt).await.unwrap();
        assert_eq!(profile.source, ProfileSource::Local);
        assert!((profile.baseline.z - 9.8).abs() < 1e-9);
        assert_eq!(profile.deviation_threshold, MIN_LOCAL_THRESHOLD);
    }

    #[tokio::test]
    async fn test_load_profile_falls_back_to_cache_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let backend = Rc::new(MockBackend::offline());

        let mut m = manager(backend.clone(), store.clone());
        let profile = m.load_profile().await;
        assert_eq!(profile.source, ProfileSource::Default);
        assert_eq!(profile.baseline, Vec3::new(0.0, 0.0, 9.81));
        assert_eq!(profile.deviation_threshold, 2.0);

        store.save(CALIBRATION_PROFILE_KEY, &server_profile()).unwrap();
        let profile = m.load_profile().await;
        assert_eq!(profile.deviation_threshold, 1.5);

        backend.set_online(true);
        let mut remote = server_profile();
        remote.deviation_threshold = 3.3;
        *backend.stored_profile.borrow_mut() = Some(remote);
        let profile = m.load_profile().await;
        assert_eq!(profile.deviation_threshold, 3.3);
    }

    #[tokio::test]
    async fn test_reset_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let backend = Rc::new(MockBackend::online());
        *backend.stored_profile.borrow_mut() = Some(server_profile());
        let mut m = manager(backend.clone(), store.clone());
        m.load_profile().await;

        m.reset_profile().await;
        assert_eq!(m.profile().source, ProfileSource::Default);
        assert_eq!(backend.deleted_profiles.borrow().as_slice(), ["dev-1"]);
        assert!(store.load::<CalibrationProfile>(CALIBRATION_PROFILE_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detect_anomaly_against_default_profile() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(Rc::new(MockBackend::offline()), KvStore::open(dir.path()).unwrap());
        assert!(!m.detect_anomaly(&AccelerationSample::new(0.5, 0.5, 9.9, 0.0)));
        assert!(m.detect_anomaly(&AccelerationSample::new(0.0, 2.5, 9.81, 0.0)));
    }

    #[test]
    fn test_malformed_multiplier_degrades_to_one() {
        let mut profile = CalibrationProfile::default();
        profile.threshold_multiplier = f64::NAN;
        assert_eq!(profile.effective_multiplier(), 1.0);
        profile.threshold_multiplier = -2.0;
        assert_eq!(profile.effective_multiplier(), 1.0);
        profile.threshold_multiplier = 1.4;
        assert_eq!(profile.effective_multiplier(), 1.4);
    }

    #[test]
    fn test_server_json_aliases() {
        let json = r#"{"baselineSample": {"x": 0.0, "y": 0.0, "z": 9.8},
                       "standardDeviation": {"x": 0.1, "y": 0.1, "z": 0.1},
                       "threshold": 1.8}"#;
        let profile: CalibrationProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.deviation_threshold, 1.8);
        assert_eq!(profile.threshold_multiplier, 1.0);
    }
}
