//! Backend protocol: the request/response calls the pipeline makes, their
//! wire shapes, and the HTTP client that implements them.

pub mod http;
pub mod wire;

pub use http::HttpBackend;
pub use wire::*;

use crate::calibration::CalibrationProfile;
use crate::error::Result;
use crate::types::Warning;

/// Remote service the pipeline talks to.
///
/// Implementations are driven from a single cooperative task, so futures are
/// not required to be `Send`.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Cheap probe run before every send
    async fn is_reachable(&self) -> bool;

    /// `POST /api/raw-data`
    async fn post_raw_data(&self, request: &RawDataRequest) -> Result<RawDataResponse>;

    /// `POST /api/sensor-data`
    async fn post_sensor_data(&self, request: &SensorDataRequest) -> Result<()>;

    /// `GET /api/obstacles/nearby`
    async fn nearby_obstacles(&self, query: &ObstacleQuery) -> Result<NearbyObstaclesResponse>;

    /// `GET /api/warnings/{deviceId}`
    async fn fetch_warnings(&self, device_id: &str) -> Result<Vec<Warning>>;

    /// `DELETE /api/warnings/{warningId}`
    async fn delete_warning(&self, warning_id: &str) -> Result<()>;

    /// `POST /api/calibration/submit`
    async fn submit_calibration(&self, request: &CalibrationRequest) -> Result<CalibrationProfile>;

    /// `GET /api/calibration/profile/{deviceId}`; `Ok(None)` when the server
    /// has no profile for the device
    async fn fetch_calibration(&self, device_id: &str) -> Result<Option<CalibrationProfile>>;

    /// `DELETE /api/calibration/profile/{deviceId}`
    async fn delete_calibration(&self, device_id: &str) -> Result<()>;
}
