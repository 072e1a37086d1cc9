//! Audio module
//!
//! Handles the loopback monitoring path: backend capabilities, the drift
//! correcting synchronizer, and the cpal and scripted backends.

mod backend;
mod cpal_backend;
mod device;
mod error;
pub mod scripted;
mod synchronizer;

pub use backend::{AudioFormat, DeviceIndex, LoopbackBackend};
pub use cpal_backend::{CpalBackend, CpalChannel, LoopRing};
pub use device::{input_device_format, list_input_devices, list_output_devices, AudioDevice};
pub use error::{AudioFormatError, BackendError, LoopbackError};
pub use synchronizer::{
    rate_step_hz, select_rate_adjustment, smooth_latency, unwrap_delta, LoopbackSynchronizer,
    RateAdjustment, SyncConfig, SyncState, SyncStats, TickOutcome, DEFAULT_DRIFT_MS,
    DEFAULT_LATENCY_MS, DEFAULT_RATE_STEP, DEFAULT_SMOOTHING,
};
