use crate::backend::{GpsPayload, RawDataPoint, SensorDataRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum Payload {
    /// Location snapshots with their acceleration windows, for `/api/raw-data`
    Points(Vec<RawDataPoint>),
    /// Classified events, for `/api/sensor-data`
    Events(Vec<SensorDataRecord>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Points(points) => points.len(),
            Payload::Events(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unit of delivery. Only `retry_count` changes after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPackage {
    pub id: String,
    pub device_id: String,
    pub payload: Payload,
    pub location: Option<GpsPayload>,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub retry_count: u32,
}

impl DataPackage {
    pub fn new(
        id: String,
        device_id: &str,
        payload: Payload,
        location: Option<GpsPayload>,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            device_id: device_id.to_string(),
            payload,
            location,
            timestamp: Utc::now(),
            priority,
            retry_count: 0,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.priority == Priority::Critical
    }

    /// Count one failed delivery attempt. Returns whether the batch is still
    /// within `max_retries` and may be resent.
    pub fn record_failure(&mut self, max_retries: u32) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count <= max_retries
    }
}

/// Event batches are high priority if they hold anything severity 2 or worse
pub fn events_priority(severities: impl IntoIterator<Item = u8>) -> Priority {
    if severities.into_iter().any(|s| s <= 2) {
        Priority::High
    } else {
        Priority::Normal
    }
}
