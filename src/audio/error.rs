//! Audio error types

use thiserror::Error;

/// Errors reported by a capture/playback backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The input device is transiently unplugged or unavailable.
    /// Callers treat this as "no update this tick", never as a failure.
    #[error("Input device disconnected")]
    Disconnected,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No recording devices found")]
    NoInputDevices,

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Rejected audio format
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormatError {
    #[error("Sample rate must be positive")]
    ZeroSampleRate,

    #[error("Channel count must be positive")]
    ZeroChannels,
}

/// Errors that can occur in the loopback synchronizer
#[derive(Error, Debug)]
pub enum LoopbackError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid audio format: {0}")]
    InvalidFormat(#[from] AudioFormatError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
