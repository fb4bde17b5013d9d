//! Session configuration.
//!
//! `Config` carries a default for every field. User overrides are parsed into
//! `ConfigOverrides`, where every field is optional and unknown keys are a
//! parse error, then applied with [`merge`], which validates the result.

use crate::error::{Result, SentinelError};
use crate::types::VehicleClass;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub vehicle_class: VehicleClass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub reachability_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub min_samples: usize,
    pub max_samples: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Rolling magnitude window used for road type inference
    pub history_size: usize,
    /// Samples required before the road type is inferred
    pub road_inference_min_samples: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransmissionConfig {
    pub buffer_capacity: usize,
    /// Buffer length that triggers batch formation
    pub batch_size: usize,
    pub idle_flush_secs: u64,
    pub max_retries: u32,
    pub queue_capacity: usize,
    /// Pause between sends while draining the offline queue
    pub drain_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProximityConfig {
    pub search_radius_m: f64,
    pub min_confirmations: u32,
    pub cache_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub passed_threshold_m: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub backend: BackendConfig,
    pub calibration: CalibrationConfig,
    pub classifier: ClassifierConfig,
    pub transmission: TransmissionConfig,
    pub proximity: ProximityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                device_id: "unknown-device".to_string(),
                vehicle_class: VehicleClass::Car,
            },
            backend: BackendConfig {
                base_url: "http://localhost:3000".to_string(),
                request_timeout_secs: 10,
                reachability_timeout_secs: 3,
            },
            calibration: CalibrationConfig {
                min_samples: 20,
                max_samples: 100,
            },
            classifier: ClassifierConfig {
                history_size: 100,
                road_inference_min_samples: 50,
            },
            transmission: TransmissionConfig {
                buffer_capacity: 50,
                batch_size: 50,
                idle_flush_secs: 60,
                max_retries: 3,
                queue_capacity: 100,
                drain_delay_ms: 500,
            },
            proximity: ProximityConfig {
                search_radius_m: 2000.0,
                min_confirmations: 1,
                cache_ttl_secs: 30,
                poll_interval_secs: 30,
                passed_threshold_m: 50.0,
            },
        }
    }
}

impl TransmissionConfig {
    pub fn idle_flush(&self) -> Duration {
        Duration::from_secs(self.idle_flush_secs)
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }
}

impl ProximityConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceOverrides {
    pub device_id: Option<String>,
    pub vehicle_class: Option<VehicleClass>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendOverrides {
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub reachability_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationOverrides {
    pub min_samples: Option<usize>,
    pub max_samples: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierOverrides {
    pub history_size: Option<usize>,
    pub road_inference_min_samples: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransmissionOverrides {
    pub buffer_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub idle_flush_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub queue_capacity: Option<usize>,
    pub drain_delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProximityOverrides {
    pub search_radius_m: Option<f64>,
    pub min_confirmations: Option<u32>,
    pub cache_ttl_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub passed_threshold_m: Option<f64>,
}

/// Partial configuration as read from a user file
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub device: DeviceOverrides,
    #[serde(default)]
    pub backend: BackendOverrides,
    #[serde(default)]
    pub calibration: CalibrationOverrides,
    #[serde(default)]
    pub classifier: ClassifierOverrides,
    #[serde(default)]
    pub transmission: TransmissionOverrides,
    #[serde(default)]
    pub proximity: ProximityOverrides,
}

fn apply<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

/// Apply `overrides` on top of `defaults` and validate the result.
pub fn merge(defaults: &Config, overrides: &ConfigOverrides) -> Result<Config> {
    let mut cfg = defaults.clone();

    let d = &overrides.device;
    apply(&mut cfg.device.device_id, &d.device_id);
    apply(&mut cfg.device.vehicle_class, &d.vehicle_class);

    let b = &overrides.backend;
    apply(&mut cfg.backend.base_url, &b.base_url);
    apply(&mut cfg.backend.request_timeout_secs, &b.request_timeout_secs);
    apply(&mut cfg.backend.reachability_timeout_secs, &b.reachability_timeout_secs);

    let c = &overrides.calibration;
    apply(&mut cfg.calibration.min_samples, &c.min_samples);
    apply(&mut cfg.calibration.max_samples, &c.max_samples);

    let k = &overrides.classifier;
    apply(&mut cfg.classifier.history_size, &k.history_size);
    apply(&mut cfg.classifier.road_inference_min_samples, &k.road_inference_min_samples);

    let t = &overrides.transmission;
    apply(&mut cfg.transmission.buffer_capacity, &t.buffer_capacity);
    apply(&mut cfg.transmission.batch_size, &t.batch_size);
    apply(&mut cfg.transmission.idle_flush_secs, &t.idle_flush_secs);
    apply(&mut cfg.transmission.max_retries, &t.max_retries);
    apply(&mut cfg.transmission.queue_capacity, &t.queue_capacity);
    apply(&mut cfg.transmission.drain_delay_ms, &t.drain_delay_ms);

    let p = &overrides.proximity;
    apply(&mut cfg.proximity.search_radius_m, &p.search_radius_m);
    apply(&mut cfg.proximity.min_confirmations, &p.min_confirmations);
    apply(&mut cfg.proximity.cache_ttl_secs, &p.cache_ttl_secs);
    apply(&mut cfg.proximity.poll_interval_secs, &p.poll_interval_secs);
    apply(&mut cfg.proximity.passed_threshold_m, &p.passed_threshold_m);

    cfg.validate()?;
    Ok(cfg)
}

fn invalid(msg: &str) -> SentinelError {
    SentinelError::InvalidConfig(msg.to_string())
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.device.device_id.trim().is_empty() {
            return Err(invalid("device.device_id must not be empty"));
        }
        if !self.backend.base_url.starts_with("http://") && !self.backend.base_url.starts_with("https://") {
            return Err(invalid("backend.base_url must be an http(s) URL"));
        }
        if self.backend.request_timeout_secs == 0 || self.backend.reachability_timeout_secs == 0 {
            return Err(invalid("backend timeouts must be positive"));
        }
        if self.calibration.min_samples == 0 || self.calibration.min_samples > self.calibration.max_samples {
            return Err(invalid("calibration.min_samples must be in 1..=max_samples"));
        }
        if self.classifier.history_size == 0
            || self.classifier.road_inference_min_samples > self.classifier.history_size
        {
            return Err(invalid("classifier.road_inference_min_samples must not exceed history_size"));
        }
        let t = &self.transmission;
        if t.buffer_capacity == 0 || t.batch_size == 0 || t.batch_size > t.buffer_capacity {
            return Err(invalid("transmission.batch_size must be in 1..=buffer_capacity"));
        }
        if t.max_retries == 0 {
            return Err(invalid("transmission.max_retries must be at least 1"));
        }
        if t.queue_capacity == 0 {
            return Err(invalid("transmission.queue_capacity must be positive"));
        }
        if t.idle_flush_secs == 0 {
            return Err(invalid("transmission.idle_flush_secs must be positive"));
        }
        let p = &self.proximity;
        if !(p.search_radius_m.is_finite() && p.search_radius_m > 0.0) {
            return Err(invalid("proximity.search_radius_m must be positive"));
        }
        if !(p.passed_threshold_m.is_finite() && p.passed_threshold_m >= 0.0) {
            return Err(invalid("proximity.passed_threshold_m must be non-negative"));
        }
        if p.poll_interval_secs == 0 {
            return Err(invalid("proximity.poll_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Load a JSON overrides file and merge it over the defaults.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let overrides: ConfigOverrides = serde_json::from_str(contents)
            .map_err(|e| SentinelError::InvalidConfig(e.to_string()))?;
        merge(&Config::default(), &overrides)
    }
}
