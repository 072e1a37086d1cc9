//! Loopback backend on top of cpal
//!
//! Capture writes into a one-second looping buffer. Playback reads the same
//! buffer through a fractional cursor whose step is `rate / native_rate`, so
//! changing the playback rate moves the playback clock without resampling.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::backend::{AudioFormat, DeviceIndex, LoopbackBackend};
use super::device::input_device;
use super::error::BackendError;

/// Looping capture buffer shared between the capture and playback callbacks
pub struct LoopRing {
    // Interleaved samples, len_frames * channels
    samples: Mutex<Vec<f32>>,
    format: AudioFormat,
    len_frames: u32,
    write_frame: AtomicU32,
    capturing: AtomicBool,
}

impl LoopRing {
    fn new(format: AudioFormat) -> Self {
        let len_frames = format.frames_per_second();
        Self {
            samples: Mutex::new(vec![0.0; len_frames as usize * format.channels as usize]),
            format,
            len_frames,
            write_frame: AtomicU32::new(0),
            capturing: AtomicBool::new(false),
        }
    }

    /// Copy interleaved input frames in at the write position, wrapping at the end
    fn write(&self, data: &[f32]) {
        let channels = self.format.channels as usize;
        let len = self.len_frames as usize;
        let frames = data.len() / channels;
        let mut frame = self.write_frame.load(Ordering::Acquire) as usize;

        // Use try_lock to avoid blocking in real-time audio callback
        if let Some(mut samples) = self.samples.try_lock() {
            for chunk in data.chunks_exact(channels) {
                let start = frame * channels;
                samples[start..start + channels].copy_from_slice(chunk);
                frame = (frame + 1) % len;
            }
        } else {
            frame = (frame + frames) % len;
        }

        self.write_frame.store(frame as u32, Ordering::Release);
    }

    fn write_position(&self) -> u32 {
        self.write_frame.load(Ordering::Acquire)
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }
}

/// Error callback of the input stream.
///
/// cpal input streams do not come back after `DeviceNotAvailable`, so the
/// ring stops reporting capture and the write position freezes where it is.
fn on_capture_error(ring: &LoopRing, err: cpal::StreamError) {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            warn!("Input device disconnected, capture stopped");
            ring.capturing.store(false, Ordering::SeqCst);
        }
        _ => error!("Capture stream error: {:?}", err),
    }
}

/// Playback-side state shared with the output callback
struct PlaybackCursor {
    // f64 frame position stored as bits; only the output callback writes it
    position: AtomicU64,
    rate: AtomicU32,
    paused: AtomicBool,
}

impl PlaybackCursor {
    fn new(native_rate: u32) -> Self {
        Self {
            position: AtomicU64::new(0f64.to_bits()),
            rate: AtomicU32::new((native_rate as f32).to_bits()),
            paused: AtomicBool::new(false),
        }
    }

    fn position(&self) -> f64 {
        f64::from_bits(self.position.load(Ordering::Acquire))
    }
}

/// Playback channel; dropping it stops the output stream
pub struct CpalChannel {
    _stream: Stream,
    cursor: Arc<PlaybackCursor>,
    ring: Arc<LoopRing>,
}

struct CaptureSession {
    device: DeviceIndex,
    _stream: Stream,
    ring: Arc<LoopRing>,
}

/// Backend driving the host's recording device and default output device
pub struct CpalBackend {
    host: cpal::Host,
    capture: Option<CaptureSession>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            capture: None,
        }
    }

    fn capture_ring(&self, device: DeviceIndex) -> Result<&Arc<LoopRing>, BackendError> {
        match &self.capture {
            Some(session) if session.device == device => Ok(&session.ring),
            _ => Err(BackendError::InvalidHandle(format!(
                "no capture running on device #{}",
                device.0
            ))),
        }
    }
}

fn stream_config(format: &AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

impl LoopbackBackend for CpalBackend {
    type Buffer = Arc<LoopRing>;
    type Channel = CpalChannel;

    fn create_buffer(&mut self, format: &AudioFormat) -> Result<Arc<LoopRing>, BackendError> {
        format
            .validate()
            .map_err(|e| BackendError::UnsupportedFormat(e.to_string()))?;
        Ok(Arc::new(LoopRing::new(*format)))
    }

    fn start_capture(
        &mut self,
        buffer: &Arc<LoopRing>,
        device_index: DeviceIndex,
    ) -> Result<(), BackendError> {
        let device = input_device(&self.host, device_index)?;
        let device_name = device.name().unwrap_or_default();
        info!("Starting capture on device: {}", device_name);

        let ring = buffer.clone();
        let err_ring = buffer.clone();

        let err_fn = move |err: cpal::StreamError| on_capture_error(&err_ring, err);

        let stream = device
            .build_input_stream(
                &stream_config(&buffer.format),
                move |data: &[f32], _: &cpal::InputCallbackInfo| ring.write(data),
                err_fn,
                None,
            )
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        buffer.write_frame.store(0, Ordering::SeqCst);
        buffer.capturing.store(true, Ordering::SeqCst);
        self.capture = Some(CaptureSession {
            device: device_index,
            _stream: stream,
            ring: buffer.clone(),
        });

        debug!("Capture started with format: {:?}", buffer.format);
        Ok(())
    }

    fn capture_write_position(&mut self, device: DeviceIndex) -> Result<u32, BackendError> {
        Ok(self.capture_ring(device)?.write_position())
    }

    fn is_capturing(&mut self, device: DeviceIndex) -> Result<bool, BackendError> {
        Ok(self.capture_ring(device)?.is_capturing())
    }

    fn buffer_length_samples(&self, buffer: &Arc<LoopRing>) -> Result<u32, BackendError> {
        Ok(buffer.len_frames)
    }

    fn start_playback(&mut self, buffer: &Arc<LoopRing>) -> Result<CpalChannel, BackendError> {
        let device = self
            .host
            .default_output_device()
            .ok_or_else(|| BackendError::DeviceNotFound("No default output device".into()))?;
        let device_name = device.name().unwrap_or_default();
        info!("Starting playback on device: {}", device_name);

        let cursor = Arc::new(PlaybackCursor::new(buffer.format.sample_rate));
        let cursor_clone = cursor.clone();
        let ring = buffer.clone();

        let err_fn = move |err: cpal::StreamError| match err {
            cpal::StreamError::DeviceNotAvailable => warn!("Output device disconnected"),
            _ => error!("Playback stream error: {:?}", err),
        };

        let stream = device
            .build_output_stream(
                &stream_config(&buffer.format),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render_playback(&ring, &cursor_clone, data)
                },
                err_fn,
                None,
            )
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| BackendError::Stream(e.to_string()))?;

        debug!("Playback started with format: {:?}", buffer.format);
        Ok(CpalChannel {
            _stream: stream,
            cursor,
            ring: buffer.clone(),
        })
    }

    fn playback_position(&mut self, channel: &CpalChannel) -> Result<u32, BackendError> {
        let frame = channel.cursor.position() as u64;
        Ok((frame % u64::from(channel.ring.len_frames)) as u32)
    }

    fn set_paused(&mut self, channel: &CpalChannel, paused: bool) -> Result<(), BackendError> {
        channel.cursor.paused.store(paused, Ordering::SeqCst);
        Ok(())
    }

    fn set_playback_rate(&mut self, channel: &CpalChannel, rate: f32) -> Result<(), BackendError> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(BackendError::UnsupportedFormat(format!(
                "playback rate {} Hz",
                rate
            )));
        }
        channel.cursor.rate.store(rate.to_bits(), Ordering::Release);
        Ok(())
    }

    fn release_buffer(&mut self, buffer: Arc<LoopRing>) {
        debug!(
            "Releasing capture buffer ({} frames, {} other references)",
            buffer.len_frames,
            Arc::strong_count(&buffer) - 1
        );
    }

    fn stop_capture(&mut self, device: DeviceIndex) {
        match self.capture.take() {
            Some(session) if session.device == device => {
                session.ring.capturing.store(false, Ordering::SeqCst);
                info!("Capture stopped");
            }
            other => self.capture = other,
        }
    }
}

/// Fill an output block from the ring, advancing the cursor by the playback rate
fn render_playback(ring: &LoopRing, cursor: &PlaybackCursor, data: &mut [f32]) {
    if cursor.paused.load(Ordering::Relaxed) {
        data.fill(0.0);
        return;
    }

    let channels = ring.format.channels as usize;
    let len = f64::from(ring.len_frames);
    let step = f64::from(f32::from_bits(cursor.rate.load(Ordering::Acquire)))
        / f64::from(ring.format.sample_rate);
    let mut position = cursor.position();

    // Use try_lock to avoid blocking in real-time audio callback
    match ring.samples.try_lock() {
        Some(samples) => {
            for out in data.chunks_exact_mut(channels) {
                let start = position as usize * channels;
                out.copy_from_slice(&samples[start..start + channels]);
                position = advance(position, step, len);
            }
        }
        None => {
            // Lock not available, output silence but keep the clock running
            data.fill(0.0);
            for _ in 0..data.len() / channels {
                position = advance(position, step, len);
            }
        }
    }

    cursor.position.store(position.to_bits(), Ordering::Release);
}

fn advance(position: f64, step: f64, len: f64) -> f64 {
    (position + step) % len
}
