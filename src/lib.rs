//! Vehicle telemetry pipeline: road event classification, batched delivery
//! with an offline queue, hazard proximity tracking and driver alerts.

pub mod alerts;
pub mod backend;
pub mod calibration;
pub mod classifier;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod live_status;
pub mod proximity;
pub mod sensors;
pub mod session;
pub mod storage;
pub mod testing;
pub mod transmission;
pub mod types;

pub use error::{Result, SentinelError};
