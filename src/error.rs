use thiserror::Error;

/// Road sentinel error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SentinelError {
    #[error("Insufficient calibration data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Batch {batch_id} dropped after {retries} retries")]
    RetryExhausted { batch_id: String, retries: u32 },

    #[error("Calibration profile unavailable")]
    ProfileUnavailable,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SentinelError {
    /// Whether the failure means the backend could not be reached at all
    /// (as opposed to answering with an error).
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SentinelError::NetworkUnavailable | SentinelError::Timeout)
    }
}

impl From<reqwest::Error> for SentinelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SentinelError::Timeout
        } else if e.is_connect() {
            SentinelError::NetworkUnavailable
        } else if let Some(status) = e.status() {
            SentinelError::HttpStatus(status.as_u16())
        } else {
            SentinelError::DeliveryFailure(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SentinelError {
    fn from(e: serde_json::Error) -> Self {
        SentinelError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for SentinelError {
    fn from(e: std::io::Error) -> Self {
        SentinelError::Storage(e.to_string())
    }
}

/// Result type for library operations
pub type Result<T> = std::result::Result<T, SentinelError>;
