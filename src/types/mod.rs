pub mod geodesy;
pub mod hazard;

pub use geodesy::*;
pub use hazard::*;

use serde::{Deserialize, Serialize};

/// Accelerometer sample, m/s² per axis, timestamp in seconds since epoch
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelerationSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: f64,
}

impl AccelerationSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self { x, y, z, timestamp }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Absolute per-axis change from `previous` to `self`
    pub fn delta_from(&self, previous: &AccelerationSample) -> AxisDelta {
        AxisDelta {
            x: (self.x - previous.x).abs(),
            y: (self.y - previous.y).abs(),
            z: (self.z - previous.z).abs(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Per-axis absolute acceleration change between consecutive samples.
///
/// Axis convention for a phone in a dash mount: X lateral, Y vertical,
/// Z longitudinal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisDelta {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AxisDelta {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn lateral(&self) -> f64 {
        self.x
    }

    pub fn vertical(&self) -> f64 {
        self.y
    }

    pub fn longitudinal(&self) -> f64 {
        self.z
    }
}

/// GPS fix from the platform location provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// m/s
    pub speed: f64,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Device compass heading in degrees, when the platform reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub timestamp: f64,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, speed: f64, timestamp: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed,
            accuracy: 0.0,
            altitude: None,
            heading: None,
            timestamp,
        }
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed.max(0.0) * 3.6
    }
}

/// Road surface inferred from rolling vibration magnitude
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoadType {
    #[default]
    Asphalt,
    Gravel,
    Dirt,
}

impl RoadType {
    pub fn threshold_multiplier(&self) -> f64 {
        match self {
            RoadType::Asphalt => 1.0,
            RoadType::Gravel => 1.3,
            RoadType::Dirt => 1.6,
        }
    }

    pub fn from_mean_magnitude(mean: f64) -> Self {
        if mean < 0.5 {
            RoadType::Asphalt
        } else if mean < 1.0 {
            RoadType::Gravel
        } else {
            RoadType::Dirt
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    #[default]
    Car,
    Suv,
    Van,
    Truck,
    Motorcycle,
}

impl VehicleClass {
    /// Stiffer, heavier vehicles transmit less of the road into the cabin.
    pub fn threshold_multiplier(&self) -> f64 {
        match self {
            VehicleClass::Car => 1.0,
            VehicleClass::Suv => 1.1,
            VehicleClass::Van => 1.15,
            VehicleClass::Truck => 1.3,
            VehicleClass::Motorcycle => 0.8,
        }
    }
}

impl std::str::FromStr for VehicleClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "car" => Ok(VehicleClass::Car),
            "suv" => Ok(VehicleClass::Suv),
            "van" => Ok(VehicleClass::Van),
            "truck" => Ok(VehicleClass::Truck),
            "motorcycle" => Ok(VehicleClass::Motorcycle),
            other => Err(format!("unknown vehicle class '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Pothole,
    Bump,
    Vibration,
    Braking,
    Accident,
    Normal,
}

/// Classified road or driving event. Severity 1 is critical, 5 is benign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedEvent {
    pub event_type: EventType,
    pub severity: u8,
    pub timestamp: f64,
    pub magnitude: f64,
    pub delta: AxisDelta,
    pub variance: f64,
    pub road_type: RoadType,
    pub notify_user: bool,
    pub send_immediately: bool,
}

impl DetectedEvent {
    pub fn is_critical(&self) -> bool {
        self.severity == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accel_magnitude() {
        let sample = AccelerationSample::new(3.0, 4.0, 0.0, 0.0);
        assert_eq!(sample.magnitude(), 5.0);
    }

    #[test]
    fn test_delta_is_absolute() {
        let a = AccelerationSample::new(1.0, 5.0, 9.8, 0.0);
        let b = AccelerationSample::new(2.0, 2.0, 9.8, 0.1);
        let delta = b.delta_from(&a);
        assert_eq!(delta.lateral(), 1.0);
        assert_eq!(delta.vertical(), 3.0);
        assert_eq!(delta.longitudinal(), 0.0);
    }

    #[test]
    fn test_road_type_bands() {
        assert_eq!(RoadType::from_mean_magnitude(0.2), RoadType::Asphalt);
        assert_eq!(RoadType::from_mean_magnitude(0.5), RoadType::Gravel);
        assert_eq!(RoadType::from_mean_magnitude(0.99), RoadType::Gravel);
        assert_eq!(RoadType::from_mean_magnitude(1.0), RoadType::Dirt);
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = DetectedEvent {
            event_type: EventType::Pothole,
            severity: 1,
            timestamp: 1.0,
            magnitude: 5.0,
            delta: AxisDelta::default(),
            variance: 0.0,
            road_type: RoadType::Gravel,
            notify_user: true,
            send_immediately: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"pothole\""));
        assert!(json.contains("\"roadType\":\"gravel\""));
        assert!(json.contains("\"sendImmediately\":true"));
    }

    #[test]
    fn test_speed_kmh() {
        let fix = LocationFix::new(0.0, 0.0, 10.0, 0.0);
        assert!((fix.speed_kmh() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_vehicle_class_from_str() {
        assert_eq!("Truck".parse::<VehicleClass>(), Ok(VehicleClass::Truck));
        assert!("tank".parse::<VehicleClass>().is_err());
    }
}
