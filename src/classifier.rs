//! Road anomaly and driving event classification from raw accelerometer
//! samples.
//!
//! Each sample is compared with its predecessor. The per-axis absolute
//! change is matched against threshold bands, scaled by road surface, vehicle
//! class and calibration, in a fixed priority order:
//!
//! 1. accident (combined magnitude)
//! 2. critical pothole (combined magnitude)
//! 3. vertical bands: pothole / bump / vibration
//! 4. longitudinal bands: braking
//! 5. lateral bands: vibration
//!
//! The first match wins. Anything below the lowest band with a combined
//! change of at least 1.0 m/s² is reported as `normal`; smaller changes emit
//! nothing.

use crate::calibration::CalibrationProfile;
use crate::config::ClassifierConfig;
use crate::types::{AccelerationSample, AxisDelta, DetectedEvent, EventType, RoadType, VehicleClass};
use std::collections::VecDeque;

const NORMAL_EVENT_MIN_MAGNITUDE: f64 = 1.0;

/// Unscaled thresholds in m/s²
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaseThresholds {
    pub accident: f64,
    pub critical_magnitude: f64,
    pub pothole_critical: f64,
    pub pothole_high: f64,
    pub bump: f64,
    pub vibration_vertical: f64,
    pub braking_emergency: f64,
    pub braking_sharp: f64,
    pub braking_moderate: f64,
    pub lateral_sharp: f64,
    pub lateral_moderate: f64,
}

impl Default for BaseThresholds {
    fn default() -> Self {
        Self {
            accident: 15.0,
            critical_magnitude: 5.0,
            pothole_critical: 3.5,
            pothole_high: 2.5,
            bump: 1.5,
            vibration_vertical: 0.8,
            braking_emergency: 3.0,
            braking_sharp: 2.0,
            braking_moderate: 1.2,
            lateral_sharp: 2.0,
            lateral_moderate: 1.0,
        }
    }
}

impl BaseThresholds {
    fn scaled(&self, k: f64) -> Self {
        Self {
            accident: self.accident * k,
            critical_magnitude: self.critical_magnitude * k,
            pothole_critical: self.pothole_critical * k,
            pothole_high: self.pothole_high * k,
            bump: self.bump * k,
            vibration_vertical: self.vibration_vertical * k,
            braking_emergency: self.braking_emergency * k,
            braking_sharp: self.braking_sharp * k,
            braking_moderate: self.braking_moderate * k,
            lateral_sharp: self.lateral_sharp * k,
            lateral_moderate: self.lateral_moderate * k,
        }
    }
}

pub struct SignalClassifier {
    config: ClassifierConfig,
    base: BaseThresholds,
    vehicle_class: VehicleClass,
    calibration_multiplier: f64,
    previous: Option<AccelerationSample>,
    history: VecDeque<f64>,
    road_type: RoadType,
}

impl SignalClassifier {
    pub fn new(config: ClassifierConfig, vehicle_class: VehicleClass) -> Self {
        SignalClassifier {
            history: VecDeque::with_capacity(config.history_size),
            config,
            base: BaseThresholds::default(),
            vehicle_class,
            calibration_multiplier: 1.0,
            previous: None,
            road_type: RoadType::Asphalt,
        }
    }

    /// Adopt a calibration profile's multiplier. `None` or a malformed value
    /// falls back to 1.0.
    pub fn set_calibration(&mut self, profile: Option<&CalibrationProfile>) {
        self.calibration_multiplier = profile.map(|p| p.effective_multiplier()).unwrap_or(1.0);
    }

    pub fn road_type(&self) -> RoadType {
        self.road_type
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.history.clear();
        self.road_type = RoadType::Asphalt;
    }

    /// Combined multiplier applied to every base threshold
    pub fn threshold_multiplier(&self) -> f64 {
        self.road_type.threshold_multiplier()
            * self.vehicle_class.threshold_multiplier()
            * self.calibration_multiplier
    }

    pub fn thresholds(&self) -> BaseThresholds {
        self.base.scaled(self.threshold_multiplier())
    }

    /// Classify one sample. The first sample (and any non-finite one) only
    /// primes the state.
    pub fn process(&mut self, sample: AccelerationSample) -> Option<DetectedEvent> {
        if !sample.is_finite() {
            log::debug!("Skipping non-finite sample at {}", sample.timestamp);
            return None;
        }

        let previous = match self.previous.replace(sample) {
            Some(prev) => prev,
            None => return None,
        };

        let delta = sample.delta_from(&previous);
        let magnitude = delta.magnitude();

        self.history.push_back(magnitude);
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
        if self.history.len() >= self.config.road_inference_min_samples {
            let inferred = RoadType::from_mean_magnitude(self.mean());
            if inferred != self.road_type {
                log::info!("Road type changed: {:?} -> {:?}", self.road_type, inferred);
                self.road_type = inferred;
            }
        }

        let (event_type, severity) = self.classify(&delta, magnitude)?;
        let critical = severity == 1;

        Some(DetectedEvent {
            event_type,
            severity,
            timestamp: sample.timestamp,
            magnitude,
            delta,
            variance: self.variance(),
            road_type: self.road_type,
            notify_user: critical,
            send_immediately: critical,
        })
    }

    fn classify(&self, delta: &AxisDelta, magnitude: f64) -> Option<(EventType, u8)> {
        let t = self.thresholds();

        if magnitude >= t.accident {
            return Some((EventType::Accident, 1));
        }
        if magnitude >= t.critical_magnitude {
            return Some((EventType::Pothole, 1));
        }

        let vertical = delta.vertical();
        if vertical >= t.pothole_critical {
            return Some((EventType::Pothole, 1));
        }
        if vertical >= t.pothole_high {
            return Some((EventType::Pothole, 2));
        }
        if vertical >= t.bump {
            return Some((EventType::Bump, 3));
        }
        if vertical >= t.vibration_vertical {
            return Some((EventType::Vibration, 4));
        }

        let longitudinal = delta.longitudinal();
        if longitudinal >= t.braking_emergency {
            return Some((EventType::Braking, 1));
        }
        if longitudinal >= t.braking_sharp {
            return Some((EventType::Braking, 2));
        }
        if longitudinal >= t.braking_moderate {
            return Some((EventType::Braking, 3));
        }

        let lateral = delta.lateral();
        if lateral >= t.lateral_sharp {
            return Some((EventType::Vibration, 3));
        }
        if lateral >= t.lateral_moderate {
            return Some((EventType::Vibration, 4));
        }

        if magnitude >= NORMAL_EVENT_MIN_MAGNITUDE {
            return Some((EventType::Normal, 5));
        }
        None
    }

    fn mean(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().sum::<f64>() / self.history.len() as f64
    }

    fn variance(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        self.history.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / self.history.len() as f64
    }
}
