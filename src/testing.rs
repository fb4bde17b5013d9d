//! In-process doubles for the backend and the alert outputs.
//!
//! Used by the unit tests, the integration tests and the replay tool's
//! offline mode.

use crate::alerts::{AudioOutput, SpeechOutput, Tone, Utterance};
use crate::backend::{
    Backend, CalibrationRequest, NearbyObstaclesResponse, ObstacleQuery, RawDataRequest,
    RawDataResponse, SensorDataRequest,
};
use crate::calibration::CalibrationProfile;
use crate::error::{Result, SentinelError};
use crate::types::{Obstacle, Warning};
use std::cell::{Cell, RefCell};
use std::time::Duration;

/// Scriptable backend that records every call
#[derive(Default)]
pub struct MockBackend {
    pub reachable: Cell<bool>,
    /// Number of upcoming sends that fail with HTTP 503
    pub fail_sends: Cell<u32>,
    pub always_fail_sends: Cell<bool>,
    /// Simulated network latency for sends
    pub send_delay: Cell<Duration>,
    /// Probe results consumed front-first before falling back to `reachable`
    pub reachability_script: RefCell<Vec<bool>>,
    pub raw_requests: RefCell<Vec<RawDataRequest>>,
    pub sensor_requests: RefCell<Vec<SensorDataRequest>>,
    pub obstacle_queries: RefCell<Vec<ObstacleQuery>>,
    pub obstacles: RefCell<Vec<Obstacle>>,
    pub fail_obstacle_fetch: Cell<bool>,
    pub warnings: RefCell<Vec<Warning>>,
    pub deleted_warnings: RefCell<Vec<String>>,
    pub calibration_requests: RefCell<Vec<CalibrationRequest>>,
    pub calibration_response: RefCell<Option<CalibrationProfile>>,
    pub stored_profile: RefCell<Option<CalibrationProfile>>,
    pub deleted_profiles: RefCell<Vec<String>>,
}

impl MockBackend {
    pub fn online() -> Self {
        let backend = MockBackend::default();
        backend.reachable.set(true);
        backend
    }

    pub fn offline() -> Self {
        MockBackend::default()
    }

    pub fn set_online(&self, online: bool) {
        self.reachable.set(online);
    }

    /// Total batches delivered to either data endpoint
    pub fn delivered_batches(&self) -> usize {
        self.raw_requests.borrow().len() + self.sensor_requests.borrow().len()
    }

    async fn simulate_send(&self) -> Result<()> {
        let delay = self.send_delay.get();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        if self.always_fail_sends.get() {
            return Err(SentinelError::HttpStatus(503));
        }
        let remaining = self.fail_sends.get();
        if remaining > 0 {
            self.fail_sends.set(remaining - 1);
            return Err(SentinelError::HttpStatus(503));
        }
        Ok(())
    }
}

impl Backend for MockBackend {
    async fn is_reachable(&self) -> bool {
        let mut script = self.reachability_script.borrow_mut();
        if !script.is_empty() {
            return script.remove(0);
        }
        self.reachable.get()
    }

    async fn post_raw_data(&self, request: &RawDataRequest) -> Result<RawDataResponse> {
        self.simulate_send().await?;
        self.raw_requests.borrow_mut().push(request.clone());
        let warnings = self.warnings.borrow().clone();
        Ok(RawDataResponse {
            raw_data_saved: request.data.len(),
            events_detected: 0,
            warnings_generated: warnings.len(),
            warnings,
        })
    }

    async fn post_sensor_data(&self, request: &SensorDataRequest) -> Result<()> {
        self.simulate_send().await?;
        self.sensor_requests.borrow_mut().push(request.clone());
        Ok(())
    }

    async fn nearby_obstacles(&self, query: &ObstacleQuery) -> Result<NearbyObstaclesResponse> {
        self.obstacle_queries.borrow_mut().push(query.clone());
        if self.fail_obstacle_fetch.get() || !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        let obstacles = self.obstacles.borrow().clone();
        Ok(NearbyObstaclesResponse {
            user_location: None,
            search_radius: query.radius,
            min_confirmations: query.min_confirmations,
            total: obstacles.len(),
            obstacles,
        })
    }

    async fn fetch_warnings(&self, _device_id: &str) -> Result<Vec<Warning>> {
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        Ok(self.warnings.borrow().clone())
    }

    async fn delete_warning(&self, warning_id: &str) -> Result<()> {
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        self.deleted_warnings.borrow_mut().push(warning_id.to_string());
        self.warnings.borrow_mut().retain(|w| w.id != warning_id);
        Ok(())
    }

    async fn submit_calibration(&self, request: &CalibrationRequest) -> Result<CalibrationProfile> {
        self.calibration_requests.borrow_mut().push(request.clone());
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        self.calibration_response
            .borrow()
            .clone()
            .ok_or(SentinelError::HttpStatus(500))
    }

    async fn fetch_calibration(&self, _device_id: &str) -> Result<Option<CalibrationProfile>> {
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        Ok(self.stored_profile.borrow().clone())
    }

    async fn delete_calibration(&self, device_id: &str) -> Result<()> {
        if !self.reachable.get() {
            return Err(SentinelError::NetworkUnavailable);
        }
        self.deleted_profiles.borrow_mut().push(device_id.to_string());
        self.stored_profile.borrow_mut().take();
        Ok(())
    }
}

/// Speech output that records utterances and can be told to fail
#[derive(Default)]
pub struct RecordingSpeech {
    pub spoken: RefCell<Vec<Utterance>>,
    pub fail: Cell<bool>,
}

impl SpeechOutput for RecordingSpeech {
    async fn speak(&self, utterance: &Utterance) -> Result<()> {
        if self.fail.get() {
            return Err(SentinelError::Playback("speech engine unavailable".to_string()));
        }
        self.spoken.borrow_mut().push(utterance.clone());
        Ok(())
    }
}

/// Audio output that records tones and can be told to fail
#[derive(Default)]
pub struct RecordingAudio {
    pub played: RefCell<Vec<Tone>>,
    pub fail: Cell<bool>,
}

impl AudioOutput for RecordingAudio {
    async fn play(&self, tone: &Tone) -> Result<()> {
        if self.fail.get() {
            return Err(SentinelError::Playback("audio device busy".to_string()));
        }
        self.played.borrow_mut().push(tone.clone());
        Ok(())
    }
}
