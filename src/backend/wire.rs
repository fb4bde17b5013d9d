use crate::types::{AccelerationSample, DetectedEvent, LocationFix, Obstacle, RoadType, Warning};
use serde::{Deserialize, Serialize};

/// Location snapshot as carried on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl From<&LocationFix> for GpsPayload {
    fn from(fix: &LocationFix) -> Self {
        GpsPayload {
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed: fix.speed,
            accuracy: fix.accuracy,
            altitude: fix.altitude,
        }
    }
}

/// One location snapshot plus the acceleration window recorded around it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataPoint {
    pub device_id: String,
    pub timestamp: f64,
    pub gps: GpsPayload,
    pub accelerometer: Vec<AccelerationSample>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataRequest {
    pub device_id: String,
    pub data: Vec<RawDataPoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDataResponse {
    pub raw_data_saved: usize,
    pub events_detected: usize,
    pub warnings_generated: usize,
    pub warnings: Vec<Warning>,
}

/// Classified event record for `/api/sensor-data`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_type: Option<RoadType>,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GpsPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SensorDataRecord {
    pub fn from_event(event: &DetectedEvent, location: Option<&LocationFix>) -> Self {
        let event_type = serde_json::to_value(event.event_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        SensorDataRecord {
            kind: "road_event".to_string(),
            event_type,
            severity: Some(event.severity),
            road_type: Some(event.road_type),
            timestamp: event.timestamp,
            location: location.map(GpsPayload::from),
            data: Some(serde_json::json!({
                "magnitude": event.magnitude,
                "deltaX": event.delta.x,
                "deltaY": event.delta.y,
                "deltaZ": event.delta.z,
                "variance": event.variance,
            })),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataRequest {
    pub device_id: String,
    pub sensor_data: Vec<SensorDataRecord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObstacleQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub min_confirmations: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NearbyObstaclesResponse {
    pub user_location: Option<serde_json::Value>,
    pub search_radius: f64,
    pub min_confirmations: u32,
    pub total: usize,
    pub obstacles: Vec<Obstacle>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningsResponse {
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRequest {
    pub device_id: String,
    pub accelerometer_data: Vec<AccelerationSample>,
    /// km/h while the samples were collected
    pub speed: f64,
    pub road_type: RoadType,
}
