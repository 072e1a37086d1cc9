//! Adaptive loopback synchronizer
//!
//! Plays captured input back out through a looping one-second buffer with a
//! small, stable delay. The capture and playback clocks drift apart over time;
//! instead of resampling, the synchronizer nudges the playback clock a few
//! percent up or down to keep the recorded/played gap inside a tolerance band.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{AudioFormat, DeviceIndex, LoopbackBackend};
use super::error::{BackendError, LoopbackError};

/// Default target delay between capture and playback
pub const DEFAULT_LATENCY_MS: u32 = 50;

/// Default tolerance around the target delay before the rate is nudged
pub const DEFAULT_DRIFT_MS: u32 = 1;

/// Default playback rate adjustment (2% of the native rate)
pub const DEFAULT_RATE_STEP: f64 = 0.02;

/// Default weight of the previous latency estimate in the low-pass filter
pub const DEFAULT_SMOOTHING: f64 = 0.97;

/// Synchronizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Recording device index
    pub device_index: usize,
    /// Target delay in milliseconds (must stay below the one-second buffer)
    pub latency_ms: u32,
    /// Drift tolerance in milliseconds
    pub drift_ms: u32,
    /// Fraction of the native rate added or removed when correcting drift
    pub rate_step: f64,
    /// Weight of the previous estimate in the latency filter, in [0, 1)
    pub smoothing: f64,
    /// Unpause playback when capture reports active again after a pause
    pub resume_on_capture: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            latency_ms: DEFAULT_LATENCY_MS,
            drift_ms: DEFAULT_DRIFT_MS,
            rate_step: DEFAULT_RATE_STEP,
            smoothing: DEFAULT_SMOOTHING,
            resume_on_capture: false,
        }
    }
}

impl SyncConfig {
    /// Recording device as a backend index
    pub fn device(&self) -> DeviceIndex {
        DeviceIndex(self.device_index)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), LoopbackError> {
        if self.latency_ms >= 1000 {
            return Err(LoopbackError::InvalidConfig(format!(
                "latency {} ms does not fit in the one-second capture buffer",
                self.latency_ms
            )));
        }
        if !(self.rate_step > 0.0 && self.rate_step < 1.0) {
            return Err(LoopbackError::InvalidConfig(format!(
                "rate step {} must be in (0, 1)",
                self.rate_step
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(LoopbackError::InvalidConfig(format!(
                "smoothing {} must be in [0, 1)",
                self.smoothing
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Buffering input, no playback channel yet
    Capturing,
    /// Channel active, drift correction running
    Playing,
    /// Channel paused because capture went inactive
    Paused,
}

/// Outcome of the drift comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustment {
    /// Latency inside the tolerance band
    Native,
    /// Playback is catching up to the record position
    Slower,
    /// Playback is falling behind the record position
    Faster,
}

impl RateAdjustment {
    /// Playback frequency for this adjustment
    pub fn playback_rate(self, native_rate: u32, step_hz: u32) -> u32 {
        match self {
            RateAdjustment::Native => native_rate,
            RateAdjustment::Slower => native_rate.saturating_sub(step_hz),
            RateAdjustment::Faster => native_rate.saturating_add(step_hz),
        }
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Capture device unavailable; nothing was updated
    Disconnected,
    /// Still filling the buffer up to the target latency
    Buffering { samples_recorded: u64, target: u64 },
    /// Playback running (or paused) with drift correction applied
    Monitoring {
        started_playback: bool,
        adjustment: RateAdjustment,
        playback_rate: u32,
    },
}

/// Snapshot of the synchronizer's counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStats {
    pub state: SyncState,
    pub has_channel: bool,
    pub samples_recorded: u64,
    pub samples_played: u64,
    pub desired_latency: u64,
    pub adjusted_latency: u64,
    pub actual_latency: f64,
    pub drift_threshold: u64,
    pub min_record_delta: Option<u64>,
    pub last_record_pos: u32,
    pub last_play_pos: u32,
    pub playback_rate: u32,
    pub adjustment: RateAdjustment,
    pub ticks: u64,
}

/// Forward distance from `last` to `current` in a ring of `buffer_len` frames.
///
/// A decrease is taken as exactly one wrap of the buffer.
pub fn unwrap_delta(last: u32, current: u32, buffer_len: u32) -> u64 {
    if current >= last {
        u64::from(current - last)
    } else {
        u64::from(buffer_len).saturating_sub(u64::from(last)) + u64::from(current)
    }
}

/// One step of the single-pole low-pass latency filter.
///
/// Written as a blend toward `latency` so the estimate never passes it.
pub fn smooth_latency(actual: f64, latency: i64, smoothing: f64) -> f64 {
    actual + (1.0 - smoothing) * (latency as f64 - actual)
}

/// Decide how to nudge the playback clock given the smoothed latency
pub fn select_rate_adjustment(
    actual_latency: f64,
    adjusted_latency: u64,
    drift_threshold: u64,
) -> RateAdjustment {
    let target = adjusted_latency as f64;
    let band = drift_threshold as f64;
    if actual_latency < target - band {
        RateAdjustment::Slower
    } else if actual_latency > target + band {
        RateAdjustment::Faster
    } else {
        RateAdjustment::Native
    }
}

/// Convert a millisecond duration to sample frames at `sample_rate`
fn ms_to_samples(sample_rate: u32, ms: u32) -> u64 {
    u64::from(sample_rate) * u64::from(ms) / 1000
}

/// Playback rate offset in Hz for a fractional step, truncated toward zero.
///
/// The default 2% step is exactly `sample_rate / 50` in integer arithmetic.
pub fn rate_step_hz(sample_rate: u32, rate_step: f64) -> u32 {
    if rate_step == DEFAULT_RATE_STEP {
        sample_rate / 50
    } else {
        (f64::from(sample_rate) * rate_step) as u32
    }
}

/// Loopback synchronizer
///
/// Owns the capture buffer and the playback channel for one monitoring path.
/// Driven by [`tick`](Self::tick) from a single thread; dropping it stops
/// capture and releases the buffer.
pub struct LoopbackSynchronizer<B: LoopbackBackend> {
    backend: B,
    config: SyncConfig,
    format: AudioFormat,
    // Always Some until drop hands it back to the backend
    buffer: Option<B::Buffer>,
    buffer_len: u32,
    channel: Option<B::Channel>,
    state: SyncState,
    desired_latency: u64,
    adjusted_latency: u64,
    actual_latency: f64,
    drift_threshold: u64,
    rate_step_hz: u32,
    samples_recorded: u64,
    samples_played: u64,
    last_record_pos: u32,
    last_play_pos: u32,
    min_record_delta: Option<u64>,
    playback_rate: u32,
    adjustment: RateAdjustment,
    ticks: u64,
}

impl<B: LoopbackBackend> LoopbackSynchronizer<B> {
    /// Allocate the capture buffer and start recording into it
    pub fn new(mut backend: B, format: AudioFormat, config: SyncConfig) -> Result<Self, LoopbackError> {
        format.validate()?;
        config.validate()?;

        let device = config.device();
        let buffer = backend.create_buffer(&format)?;

        if let Err(e) = backend.start_capture(&buffer, device) {
            backend.release_buffer(buffer);
            return Err(e.into());
        }

        let buffer_len = match backend.buffer_length_samples(&buffer) {
            Ok(0) => Err(BackendError::InvalidHandle(
                "capture buffer has zero length".to_string(),
            )),
            other => other,
        };
        let buffer_len = match buffer_len {
            Ok(len) => len,
            Err(e) => {
                backend.stop_capture(device);
                backend.release_buffer(buffer);
                return Err(e.into());
            }
        };

        let desired_latency = ms_to_samples(format.sample_rate, config.latency_ms);
        let drift_threshold = ms_to_samples(format.sample_rate, config.drift_ms);
        let rate_step_hz = rate_step_hz(format.sample_rate, config.rate_step);

        info!(
            "Loopback capture started on device {}: {} Hz, {} ch, buffer {} frames",
            config.device_index, format.sample_rate, format.channels, buffer_len
        );
        debug!(
            "Target latency {} samples, drift threshold {} samples, rate step {} Hz",
            desired_latency, drift_threshold, rate_step_hz
        );

        Ok(Self {
            backend,
            format,
            buffer: Some(buffer),
            buffer_len,
            channel: None,
            state: SyncState::Capturing,
            desired_latency,
            adjusted_latency: desired_latency,
            actual_latency: desired_latency as f64,
            drift_threshold,
            rate_step_hz,
            samples_recorded: 0,
            samples_played: 0,
            last_record_pos: 0,
            last_play_pos: 0,
            min_record_delta: None,
            playback_rate: format.sample_rate,
            adjustment: RateAdjustment::Native,
            ticks: 0,
            config,
        })
    }

    /// Poll the backend once and update counters, playback and drift correction.
    ///
    /// A disconnected capture device leaves every counter untouched. Any other
    /// backend failure fails the tick; capture counters updated earlier in the
    /// same tick are kept.
    pub fn tick(&mut self) -> Result<TickOutcome, LoopbackError> {
        let device = self.config.device();
        let record_pos = match self.backend.capture_write_position(device) {
            Ok(pos) => pos,
            Err(BackendError::Disconnected) => {
                debug!("Capture device disconnected, skipping tick");
                return Ok(TickOutcome::Disconnected);
            }
            Err(e) => return Err(e.into()),
        };

        self.ticks += 1;

        let record_delta = unwrap_delta(self.last_record_pos, record_pos, self.buffer_len);
        self.last_record_pos = record_pos;
        self.samples_recorded += record_delta;
        self.adapt_to_granularity(record_delta);

        let mut started_playback = false;
        if self.channel.is_none() && self.samples_recorded >= self.adjusted_latency {
            self.start_playback()?;
            started_playback = true;
        }

        if self.channel.is_none() {
            return Ok(TickOutcome::Buffering {
                samples_recorded: self.samples_recorded,
                target: self.adjusted_latency,
            });
        }

        self.follow_capture_state()?;
        self.track_playback()?;
        self.correct_drift()?;

        Ok(TickOutcome::Monitoring {
            started_playback,
            adjustment: self.adjustment,
            playback_rate: self.playback_rate,
        })
    }

    /// Widen the latency target when the driver reports capture in coarse jumps
    fn adapt_to_granularity(&mut self, record_delta: u64) {
        if record_delta == 0 {
            return;
        }
        if self.min_record_delta.is_some_and(|min| record_delta >= min) {
            return;
        }

        self.min_record_delta = Some(record_delta);
        let adjusted = record_delta.max(self.desired_latency);
        if adjusted != self.adjusted_latency {
            info!(
                "Capture granularity {} samples, adjusting latency {} -> {} samples",
                record_delta, self.adjusted_latency, adjusted
            );
        }
        self.adjusted_latency = adjusted;
    }

    fn start_playback(&mut self) -> Result<(), BackendError> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| BackendError::InvalidHandle("capture buffer released".to_string()))?;
        let channel = self.backend.start_playback(buffer)?;
        self.channel = Some(channel);
        self.state = SyncState::Playing;
        info!(
            "Playback started after {} samples (target {})",
            self.samples_recorded, self.adjusted_latency
        );
        Ok(())
    }

    /// Pause playback while capture is inactive
    fn follow_capture_state(&mut self) -> Result<(), BackendError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };

        match self.backend.is_capturing(self.config.device()) {
            Ok(false) => {
                self.backend.set_paused(channel, true)?;
                if self.state != SyncState::Paused {
                    warn!("Capture stopped, pausing playback");
                    self.state = SyncState::Paused;
                }
            }
            Ok(true) => {
                if self.state == SyncState::Paused && self.config.resume_on_capture {
                    self.backend.set_paused(channel, false)?;
                    self.state = SyncState::Playing;
                    info!("Capture active again, resuming playback");
                }
            }
            Err(BackendError::Disconnected) => {
                debug!("Capture device disconnected, capture state unchanged");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn track_playback(&mut self) -> Result<(), BackendError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };

        let play_pos = self.backend.playback_position(channel)?;
        let play_delta = unwrap_delta(self.last_play_pos, play_pos, self.buffer_len);
        self.last_play_pos = play_pos;
        self.samples_played += play_delta;
        Ok(())
    }

    /// Smooth the recorded/played gap and nudge the playback clock toward the target
    fn correct_drift(&mut self) -> Result<(), BackendError> {
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };

        let latency = self.samples_recorded as i64 - self.samples_played as i64;
        self.actual_latency = smooth_latency(self.actual_latency, latency, self.config.smoothing);

        let adjustment =
            select_rate_adjustment(self.actual_latency, self.adjusted_latency, self.drift_threshold);
        let rate = adjustment.playback_rate(self.format.sample_rate, self.rate_step_hz);
        self.backend.set_playback_rate(channel, rate as f32)?;

        if adjustment != self.adjustment {
            debug!(
                "Latency {:.1} samples (target {} +/- {}), playback rate {:?} at {} Hz",
                self.actual_latency, self.adjusted_latency, self.drift_threshold, adjustment, rate
            );
        }
        self.adjustment = adjustment;
        self.playback_rate = rate;
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether a playback channel has been created
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Format the buffer was created with
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            state: self.state,
            has_channel: self.channel.is_some(),
            samples_recorded: self.samples_recorded,
            samples_played: self.samples_played,
            desired_latency: self.desired_latency,
            adjusted_latency: self.adjusted_latency,
            actual_latency: self.actual_latency,
            drift_threshold: self.drift_threshold,
            min_record_delta: self.min_record_delta,
            last_record_pos: self.last_record_pos,
            last_play_pos: self.last_play_pos,
            playback_rate: self.playback_rate,
            adjustment: self.adjustment,
            ticks: self.ticks,
        }
    }
}

impl<B: LoopbackBackend> Drop for LoopbackSynchronizer<B> {
    fn drop(&mut self) {
        // Playback reads from the buffer, so it goes first
        drop(self.channel.take());
        self.backend.stop_capture(self.config.device());
        if let Some(buffer) = self.buffer.take() {
            self.backend.release_buffer(buffer);
        }
        info!("Loopback capture stopped");
    }
}
