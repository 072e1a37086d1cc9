//! Audio device enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use super::backend::{AudioFormat, DeviceIndex};
use super::error::BackendError;

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Position in the host's device list
    pub index: DeviceIndex,
    /// Display name
    pub name: String,
    /// Default format reported by the driver, if it could be queried
    pub native_format: Option<AudioFormat>,
    /// Whether this is the default device
    pub is_default: bool,
}

/// List available input (recording) devices
pub fn list_input_devices() -> Result<Vec<AudioDevice>, BackendError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| BackendError::Stream(e.to_string()))?
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let native_format = device
                .default_input_config()
                .ok()
                .map(|config| AudioFormat {
                    sample_rate: config.sample_rate().0,
                    channels: config.channels(),
                });
            Some(AudioDevice {
                index: DeviceIndex(index),
                is_default: default_name.as_ref() == Some(&name),
                name,
                native_format,
            })
        })
        .collect();

    Ok(devices)
}

/// List available output (playback) devices
pub fn list_output_devices() -> Result<Vec<AudioDevice>, BackendError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| BackendError::Stream(e.to_string()))?
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let native_format = device
                .default_output_config()
                .ok()
                .map(|config| AudioFormat {
                    sample_rate: config.sample_rate().0,
                    channels: config.channels(),
                });
            Some(AudioDevice {
                index: DeviceIndex(index),
                is_default: default_name.as_ref() == Some(&name),
                name,
                native_format,
            })
        })
        .collect();

    Ok(devices)
}

/// Look up a recording device by index
pub(crate) fn input_device(
    host: &cpal::Host,
    index: DeviceIndex,
) -> Result<cpal::Device, BackendError> {
    let mut devices = host
        .input_devices()
        .map_err(|e| BackendError::Stream(e.to_string()))?
        .peekable();

    if devices.peek().is_none() {
        return Err(BackendError::NoInputDevices);
    }

    devices
        .nth(index.0)
        .ok_or_else(|| BackendError::DeviceNotFound(format!("input device #{}", index.0)))
}

/// Native sample rate and channel count of a recording device
pub fn input_device_format(index: DeviceIndex) -> Result<AudioFormat, BackendError> {
    let host = cpal::default_host();
    let device = input_device(&host, index)?;
    let config = device
        .default_input_config()
        .map_err(|e| BackendError::UnsupportedFormat(e.to_string()))?;

    Ok(AudioFormat {
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    })
}
