use crate::alerts::ActiveWarning;
use crate::calibration::ProfileSource;
use crate::transmission::PipelineStatus;
use crate::types::RoadType;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot written periodically while a session runs
#[derive(Serialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub accel_samples: u64,
    pub gps_fixes: u64,
    pub events_detected: u64,
    pub critical_events: u64,
    pub road_type: RoadType,
    // Calibration
    pub calibrating: bool,
    pub calibration_samples: usize,
    pub profile_source: ProfileSource,
    pub threshold_multiplier: f64,
    // Position
    pub gps_lat: f64,
    pub gps_lon: f64,
    pub gps_speed_kmh: f64,
    // Hazards
    pub tracked_hazards: usize,
    pub warnings: Vec<ActiveWarning>,
    pub transmission: PipelineStatus,
}

impl LiveStatus {
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
