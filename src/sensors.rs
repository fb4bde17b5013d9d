//! Input sources for a session: a synthetic drive and JSON-lines replay.

use crate::error::{Result, SentinelError};
use crate::lifecycle::StopToken;
use crate::live_status::current_timestamp;
use crate::types::{AccelerationSample, LocationFix};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, sleep, Duration};

const METRES_PER_DEG_LAT: f64 = 111_195.0;

/// Parameters of the synthetic drive
#[derive(Clone, Debug)]
pub struct MockDrive {
    pub start_lat: f64,
    pub start_lon: f64,
    pub heading_deg: f64,
    pub speed_kmh: f64,
    pub accel_hz: u32,
    /// Inject a pothole-sized vertical jolt this often
    pub pothole_every: Duration,
}

impl Default for MockDrive {
    fn default() -> Self {
        Self {
            start_lat: 45.0703,
            start_lon: 7.6869,
            heading_deg: 0.0,
            speed_kmh: 50.0,
            accel_hz: 50,
            pothole_every: Duration::from_secs(20),
        }
    }
}

/// Outcome of a non-blocking hand-off to the session. Returns false once the
/// receiver is gone.
fn offer<T>(tx: &Sender<T>, item: T, label: &str, count: &mut u64) -> bool {
    match tx.try_send(item) {
        Ok(()) => {
            *count += 1;
            true
        }
        Err(TrySendError::Closed(_)) => {
            log::info!("[{}] channel closed after {} items", label, count);
            false
        }
        // Session is behind; drop this one
        Err(TrySendError::Full(_)) => true,
    }
}

pub async fn mock_accel_loop(tx: Sender<AccelerationSample>, drive: MockDrive, stop: StopToken) {
    use std::f64::consts::PI;

    let period = Duration::from_secs_f64(1.0 / f64::from(drive.accel_hz.max(1)));
    let pothole_every = (drive.pothole_every.as_secs_f64() / period.as_secs_f64()).round() as u64;
    let mut ticker = interval(period);
    let mut count = 0u64;
    let mut seq = 0u64;

    while !stop.is_stopped() {
        ticker.tick().await;
        let t = seq as f64 * period.as_secs_f64();
        let jolt = if pothole_every > 0 && seq > 0 && seq % pothole_every == 0 {
            5.5
        } else {
            0.0
        };
        seq += 1;

        let sample = AccelerationSample::new(
            (t * 2.0 * PI).sin() * 0.15,
            (t * 3.0 * PI).cos() * 0.1 + jolt,
            9.81 + (t * PI).sin() * 0.05,
            current_timestamp(),
        );
        if !offer(&tx, sample, "accel", &mut count) {
            break;
        }
        if count % 500 == 0 && count > 0 {
            log::debug!("[accel] {} samples", count);
        }
    }
}

pub async fn mock_gps_loop(tx: Sender<LocationFix>, drive: MockDrive, stop: StopToken) {
    let mut ticker = interval(Duration::from_secs(1));
    let speed_ms = drive.speed_kmh / 3.6;
    let heading = drive.heading_deg.to_radians();
    let mut count = 0u64;
    let mut travelled = 0.0;

    while !stop.is_stopped() {
        ticker.tick().await;
        let north = travelled * heading.cos();
        let east = travelled * heading.sin();
        let lat = drive.start_lat + north / METRES_PER_DEG_LAT;
        let lon = drive.start_lon + east / (METRES_PER_DEG_LAT * drive.start_lat.to_radians().cos());
        travelled += speed_ms;

        let mut fix = LocationFix::new(lat, lon, speed_ms, current_timestamp()).with_heading(drive.heading_deg);
        fix.accuracy = 5.0;
        if !offer(&tx, fix, "gps", &mut count) {
            break;
        }
    }
}

/// One line of a replay file: `{"accel":{...}}` or `{"gps":{...}}`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel: Option<AccelerationSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<LocationFix>,
}

impl ReplayLine {
    fn timestamp(&self) -> Option<f64> {
        self.accel
            .as_ref()
            .map(|a| a.timestamp)
            .or_else(|| self.gps.as_ref().map(|g| g.timestamp))
    }
}

/// Parse a JSON-lines recording, gzipped when the name ends in `.gz`.
/// Blank and malformed lines are skipped.
pub fn read_replay(path: &Path) -> Result<Vec<ReplayLine>> {
    let file = File::open(path)
        .map_err(|e| SentinelError::Playback(format!("Cannot open {}: {}", path.display(), e)))?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut lines = Vec::new();
    let mut skipped = 0usize;
    for (n, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.map_err(|e| SentinelError::Playback(format!("Read failed at line {}: {}", n + 1, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayLine>(&line) {
            Ok(parsed) if parsed.accel.is_some() || parsed.gps.is_some() => lines.push(parsed),
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        log::warn!("Skipped {} unreadable replay lines in {}", skipped, path.display());
    }
    Ok(lines)
}

/// Feed recorded lines to the session, paced by their timestamps divided by
/// `speedup`. A `speedup` of zero replays as fast as the session accepts.
pub async fn replay_loop(
    lines: Vec<ReplayLine>,
    samples: Sender<AccelerationSample>,
    fixes: Sender<LocationFix>,
    speedup: f64,
    stop: StopToken,
) {
    let mut previous: Option<f64> = None;
    let (mut accel_count, mut gps_count) = (0u64, 0u64);

    for line in lines {
        if stop.is_stopped() {
            break;
        }
        if speedup > 0.0 {
            if let (Some(prev), Some(ts)) = (previous, line.timestamp()) {
                let gap = (ts - prev) / speedup;
                if gap > 0.0 && gap.is_finite() {
                    sleep(Duration::from_secs_f64(gap.min(10.0))).await;
                }
            }
        }
        previous = line.timestamp().or(previous);

        // Replay is lossless: wait for room instead of dropping
        if let Some(sample) = line.accel {
            if samples.send(sample).await.is_err() {
                break;
            }
            accel_count += 1;
        }
        if let Some(fix) = line.gps {
            if fixes.send(fix).await.is_err() {
                break;
            }
            gps_count += 1;
        }
    }
    log::info!("Replay finished: {} samples, {} fixes", accel_count, gps_count);
}
