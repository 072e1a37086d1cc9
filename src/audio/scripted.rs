//! Scripted backend for driving the synchronizer without audio hardware
//!
//! Positions, capture state and failures are queued through a [`ScriptHandle`];
//! every call the synchronizer makes is recorded on the same handle so it can
//! be inspected after the backend has been moved or dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::backend::{AudioFormat, DeviceIndex, LoopbackBackend};
use super::error::BackendError;

/// Buffer allocated by [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedBuffer {
    id: u32,
    len: u32,
}

/// Playback channel handed out by [`ScriptedBackend`]
#[derive(Debug)]
pub struct ScriptedChannel {
    id: u32,
}

#[derive(Debug, Default)]
struct ScriptState {
    // Scripted responses
    record_queue: VecDeque<Result<u32, BackendError>>,
    record_position: u32,
    capture_queue: VecDeque<Result<bool, BackendError>>,
    capturing: bool,
    play_queue: VecDeque<Result<u32, BackendError>>,
    play_position: u32,
    buffer_len_override: Option<u32>,
    start_capture_error: Option<BackendError>,
    buffer_length_error: Option<BackendError>,
    start_playback_error: Option<BackendError>,
    set_rate_error: Option<BackendError>,

    // Observations
    next_id: u32,
    buffers_created: u32,
    buffers_released: u32,
    capture_device: Option<DeviceIndex>,
    capture_stops: u32,
    active_channel: Option<u32>,
    playback_starts: u32,
    paused: bool,
    pause_calls: Vec<bool>,
    rate_calls: Vec<f32>,
}

/// Shared control surface for a [`ScriptedBackend`]
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    inner: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHandle {
    /// Create a handle with capture reported active and all positions at zero
    pub fn new() -> Self {
        let state = ScriptState {
            capturing: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Queue the next capture write position
    pub fn push_record_position(&self, position: u32) {
        self.inner.lock().record_queue.push_back(Ok(position));
    }

    /// Replace the repeated capture position, dropping anything queued
    pub fn set_record_position(&self, position: u32) {
        let mut state = self.inner.lock();
        state.record_queue.clear();
        state.record_position = position;
    }

    /// Queue a failure for the next capture position query
    pub fn push_record_error(&self, error: BackendError) {
        self.inner.lock().record_queue.push_back(Err(error));
    }

    /// Queue a disconnect for the next capture position query
    pub fn push_record_disconnect(&self) {
        self.push_record_error(BackendError::Disconnected);
    }

    /// Set the persistent "is capturing" report
    pub fn set_capturing(&self, capturing: bool) {
        self.inner.lock().capturing = capturing;
    }

    /// Queue a one-off response for the next "is capturing" query
    pub fn push_capture_report(&self, report: Result<bool, BackendError>) {
        self.inner.lock().capture_queue.push_back(report);
    }

    /// Queue the next playback position
    pub fn push_play_position(&self, position: u32) {
        self.inner.lock().play_queue.push_back(Ok(position));
    }

    /// Replace the repeated playback position, dropping anything queued
    pub fn set_play_position(&self, position: u32) {
        let mut state = self.inner.lock();
        state.play_queue.clear();
        state.play_position = position;
    }

    /// Queue a failure for the next playback position query
    pub fn push_play_error(&self, error: BackendError) {
        self.inner.lock().play_queue.push_back(Err(error));
    }

    /// Report a buffer length other than one second
    pub fn set_buffer_len(&self, len: u32) {
        self.inner.lock().buffer_len_override = Some(len);
    }

    pub fn fail_start_capture(&self, error: BackendError) {
        self.inner.lock().start_capture_error = Some(error);
    }

    pub fn fail_buffer_length(&self, error: BackendError) {
        self.inner.lock().buffer_length_error = Some(error);
    }

    pub fn fail_start_playback(&self, error: BackendError) {
        self.inner.lock().start_playback_error = Some(error);
    }

    pub fn fail_set_rate(&self, error: BackendError) {
        self.inner.lock().set_rate_error = Some(error);
    }

    pub fn capture_started(&self) -> bool {
        self.inner.lock().capture_device.is_some()
    }

    pub fn capture_stops(&self) -> u32 {
        self.inner.lock().capture_stops
    }

    pub fn buffers_created(&self) -> u32 {
        self.inner.lock().buffers_created
    }

    pub fn buffers_released(&self) -> u32 {
        self.inner.lock().buffers_released
    }

    pub fn playback_starts(&self) -> u32 {
        self.inner.lock().playback_starts
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().active_channel.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Every `set_paused` argument in call order
    pub fn pause_calls(&self) -> Vec<bool> {
        self.inner.lock().pause_calls.clone()
    }

    /// Every `set_playback_rate` argument in call order
    pub fn rate_calls(&self) -> Vec<f32> {
        self.inner.lock().rate_calls.clone()
    }

    /// Most recently applied playback rate
    pub fn last_rate(&self) -> Option<f32> {
        self.inner.lock().rate_calls.last().copied()
    }
}

/// Backend that replays positions queued on a [`ScriptHandle`].
///
/// When a queue is empty the last reported position is repeated.
#[derive(Debug)]
pub struct ScriptedBackend {
    handle: ScriptHandle,
}

impl ScriptedBackend {
    pub fn new(handle: ScriptHandle) -> Self {
        Self { handle }
    }

    fn check_channel(state: &ScriptState, channel: &ScriptedChannel) -> Result<(), BackendError> {
        if state.active_channel == Some(channel.id) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle(format!("channel {}", channel.id)))
        }
    }
}

impl LoopbackBackend for ScriptedBackend {
    type Buffer = ScriptedBuffer;
    type Channel = ScriptedChannel;

    fn create_buffer(&mut self, format: &AudioFormat) -> Result<ScriptedBuffer, BackendError> {
        let mut state = self.handle.inner.lock();
        state.next_id += 1;
        state.buffers_created += 1;
        let len = state
            .buffer_len_override
            .unwrap_or_else(|| format.frames_per_second());
        Ok(ScriptedBuffer {
            id: state.next_id,
            len,
        })
    }

    fn start_capture(
        &mut self,
        buffer: &ScriptedBuffer,
        device: DeviceIndex,
    ) -> Result<(), BackendError> {
        let mut state = self.handle.inner.lock();
        if let Some(error) = state.start_capture_error.clone() {
            return Err(error);
        }
        debug!("Scripted capture into buffer {} on device {}", buffer.id, device.0);
        state.capture_device = Some(device);
        Ok(())
    }

    fn capture_write_position(&mut self, _device: DeviceIndex) -> Result<u32, BackendError> {
        let mut state = self.handle.inner.lock();
        match state.record_queue.pop_front() {
            Some(Ok(position)) => {
                state.record_position = position;
                Ok(position)
            }
            Some(Err(error)) => Err(error),
            None => Ok(state.record_position),
        }
    }

    fn is_capturing(&mut self, _device: DeviceIndex) -> Result<bool, BackendError> {
        let mut state = self.handle.inner.lock();
        match state.capture_queue.pop_front() {
            Some(report) => report,
            None => Ok(state.capturing),
        }
    }

    fn buffer_length_samples(&self, buffer: &ScriptedBuffer) -> Result<u32, BackendError> {
        let state = self.handle.inner.lock();
        match state.buffer_length_error.clone() {
            Some(error) => Err(error),
            None => Ok(buffer.len),
        }
    }

    fn start_playback(&mut self, _buffer: &ScriptedBuffer) -> Result<ScriptedChannel, BackendError> {
        let mut state = self.handle.inner.lock();
        if let Some(error) = state.start_playback_error.clone() {
            return Err(error);
        }
        state.next_id += 1;
        state.playback_starts += 1;
        state.active_channel = Some(state.next_id);
        Ok(ScriptedChannel { id: state.next_id })
    }

    fn playback_position(&mut self, channel: &ScriptedChannel) -> Result<u32, BackendError> {
        let mut state = self.handle.inner.lock();
        Self::check_channel(&state, channel)?;
        match state.play_queue.pop_front() {
            Some(Ok(position)) => {
                state.play_position = position;
                Ok(position)
            }
            Some(Err(error)) => Err(error),
            None => Ok(state.play_position),
        }
    }

    fn set_paused(&mut self, channel: &ScriptedChannel, paused: bool) -> Result<(), BackendError> {
        let mut state = self.handle.inner.lock();
        Self::check_channel(&state, channel)?;
        state.paused = paused;
        state.pause_calls.push(paused);
        Ok(())
    }

    fn set_playback_rate(&mut self, channel: &ScriptedChannel, rate: f32) -> Result<(), BackendError> {
        let mut state = self.handle.inner.lock();
        Self::check_channel(&state, channel)?;
        if let Some(error) = state.set_rate_error.clone() {
            return Err(error);
        }
        state.rate_calls.push(rate);
        Ok(())
    }

    fn release_buffer(&mut self, buffer: ScriptedBuffer) {
        let mut state = self.handle.inner.lock();
        debug!("Scripted buffer {} released", buffer.id);
        state.buffers_released += 1;
        state.active_channel = None;
    }

    fn stop_capture(&mut self, _device: DeviceIndex) {
        let mut state = self.handle.inner.lock();
        state.capture_device = None;
        state.capture_stops += 1;
    }
}

/// Free-running capture and playback clocks feeding a [`ScriptHandle`].
///
/// Each step advances capture by one tick of audio, reported in multiples of
/// `granularity`, and advances playback by one tick scaled by the last applied
/// playback rate and by a fixed clock error in parts per million.
#[derive(Debug, Clone)]
pub struct ClockSimulation {
    sample_rate: u32,
    buffer_len: u32,
    frames_per_tick: f64,
    granularity: u32,
    drift_ppm: f64,
    record_clock: f64,
    play_clock: f64,
}

impl ClockSimulation {
    pub fn new(format: AudioFormat, tick_ms: u64, granularity: u32, drift_ppm: f64) -> Self {
        Self {
            sample_rate: format.sample_rate,
            buffer_len: format.frames_per_second(),
            frames_per_tick: f64::from(format.sample_rate) * tick_ms as f64 / 1000.0,
            granularity: granularity.max(1),
            drift_ppm,
            record_clock: 0.0,
            play_clock: 0.0,
        }
    }

    /// Set the positions the synchronizer will see on its next tick
    pub fn advance(&mut self, handle: &ScriptHandle) {
        self.record_clock += self.frames_per_tick;
        let granularity = f64::from(self.granularity);
        let reported = (self.record_clock / granularity).floor() * granularity;
        handle.set_record_position((reported as u64 % u64::from(self.buffer_len)) as u32);

        if handle.is_playing() && !handle.is_paused() {
            let rate = handle.last_rate().map_or(f64::from(self.sample_rate), f64::from);
            let speed = rate / f64::from(self.sample_rate) * (1.0 + self.drift_ppm / 1_000_000.0);
            self.play_clock += self.frames_per_tick * speed;
        }
        handle.set_play_position((self.play_clock as u64 % u64::from(self.buffer_len)) as u32);
    }
}
