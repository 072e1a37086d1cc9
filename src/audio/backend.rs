//! Capture/playback backend capabilities
//!
//! The synchronizer only talks to audio hardware through [`LoopbackBackend`],
//! so it can be driven by a real device backend or by a scripted one.

use serde::{Deserialize, Serialize};

use super::error::{AudioFormatError, BackendError};

/// Index of a recording device as enumerated by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceIndex(pub usize);

/// Sample format of the loopback buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Check that rate and channel count are usable
    pub fn validate(&self) -> Result<(), AudioFormatError> {
        if self.sample_rate == 0 {
            return Err(AudioFormatError::ZeroSampleRate);
        }
        if self.channels == 0 {
            return Err(AudioFormatError::ZeroChannels);
        }
        Ok(())
    }

    /// Number of sample frames in one second of audio
    pub fn frames_per_second(&self) -> u32 {
        self.sample_rate
    }
}

/// Minimal set of operations the loopback synchronizer needs from an audio SDK.
///
/// Positions and lengths are in sample frames. Position queries may report
/// [`BackendError::Disconnected`] while the input device is unavailable.
pub trait LoopbackBackend {
    /// Looping capture buffer shared by the capture and playback devices
    type Buffer;
    /// Handle to an active playback channel
    type Channel;

    /// Allocate a looping one-second buffer for the given format
    fn create_buffer(&mut self, format: &AudioFormat) -> Result<Self::Buffer, BackendError>;

    /// Begin writing live input into the buffer, wrapping at its end
    fn start_capture(
        &mut self,
        buffer: &Self::Buffer,
        device: DeviceIndex,
    ) -> Result<(), BackendError>;

    /// Current write offset of the capture device into the buffer
    fn capture_write_position(&mut self, device: DeviceIndex) -> Result<u32, BackendError>;

    /// Whether the capture device is still recording
    fn is_capturing(&mut self, device: DeviceIndex) -> Result<bool, BackendError>;

    /// Length of the buffer in sample frames
    fn buffer_length_samples(&self, buffer: &Self::Buffer) -> Result<u32, BackendError>;

    /// Begin looped playback of the buffer from its start
    fn start_playback(&mut self, buffer: &Self::Buffer) -> Result<Self::Channel, BackendError>;

    /// Current read offset of the playback channel into the buffer
    fn playback_position(&mut self, channel: &Self::Channel) -> Result<u32, BackendError>;

    fn set_paused(&mut self, channel: &Self::Channel, paused: bool) -> Result<(), BackendError>;

    /// Set the playback clock frequency in Hz
    fn set_playback_rate(&mut self, channel: &Self::Channel, rate: f32)
        -> Result<(), BackendError>;

    fn release_buffer(&mut self, buffer: Self::Buffer);

    fn stop_capture(&mut self, device: DeviceIndex);
}
