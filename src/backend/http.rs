use super::{
    Backend, CalibrationRequest, NearbyObstaclesResponse, ObstacleQuery, RawDataRequest,
    RawDataResponse, SensorDataRequest, WarningsResponse,
};
use crate::calibration::CalibrationProfile;
use crate::config::BackendConfig;
use crate::error::{Result, SentinelError};
use crate::types::Warning;
use reqwest::StatusCode;
use std::time::Duration;

/// reqwest-backed client for the road sentinel API
///
/// # Timeouts
/// - Every request: `request_timeout_secs` (default 10 s)
/// - Reachability probe: `reachability_timeout_secs` (default 3 s); any HTTP
///   answer, even an error status, counts as reachable
///
/// # Error Mapping
/// - connect failure → `NetworkUnavailable`
/// - timeout → `Timeout`
/// - non-2xx → `HttpStatus(code)`
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("road_sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        HttpBackend {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_secs(config.reachability_timeout_secs),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            return Err(SentinelError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }
}

impl Backend for HttpBackend {
    async fn is_reachable(&self) -> bool {
        let probe = self
            .client
            .get(self.url("/api/health"))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match probe {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Backend unreachable: {}", e);
                false
            }
        }
    }

    async fn post_raw_data(&self, request: &RawDataRequest) -> Result<RawDataResponse> {
        let response = self
            .client
            .post(self.url("/api/raw-data"))
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.json::<RawDataResponse>().await?)
    }

    async fn post_sensor_data(&self, request: &SensorDataRequest) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/sensor-data"))
            .json(request)
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn nearby_obstacles(&self, query: &ObstacleQuery) -> Result<NearbyObstaclesResponse> {
        let response = self
            .client
            .get(self.url("/api/obstacles/nearby"))
            .query(&[
                ("latitude", query.latitude.to_string()),
                ("longitude", query.longitude.to_string()),
                ("radius", query.radius.to_string()),
                ("min_confirmations", query.min_confirmations.to_string()),
            ])
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.json::<NearbyObstaclesResponse>().await?)
    }

    async fn fetch_warnings(&self, device_id: &str) -> Result<Vec<Warning>> {
        let response = self
            .client
            .get(self.url(&format!("/api/warnings/{}", device_id)))
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.json::<WarningsResponse>().await?.warnings)
    }

    async fn delete_warning(&self, warning_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/warnings/{}", warning_id)))
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }

    async fn submit_calibration(&self, request: &CalibrationRequest) -> Result<CalibrationProfile> {
        let response = self
            .client
            .post(self.url("/api/calibration/submit"))
            .json(request)
            .send()
            .await?;
        let response = Self::check_status(response)?;
        Ok(response.json::<CalibrationProfile>().await?)
    }

    async fn fetch_calibration(&self, device_id: &str) -> Result<Option<CalibrationProfile>> {
        let response = self
            .client
            .get(self.url(&format!("/api/calibration/profile/{}", device_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response)?;
        Ok(Some(response.json::<CalibrationProfile>().await?))
    }

    async fn delete_calibration(&self, device_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/calibration/profile/{}", device_id)))
            .send()
            .await?;
        Self::check_status(response)?;
        Ok(())
    }
}
