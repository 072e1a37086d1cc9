//! Loopback monitoring tests
//!
//! Drives the synchronizer through the scripted backend: playback start,
//! granularity adaptation, drift correction, pausing, disconnects, errors and
//! teardown.

use micloop::audio::scripted::{ClockSimulation, ScriptHandle, ScriptedBackend};
use micloop::audio::{
    AudioFormat, AudioFormatError, BackendError, LoopbackError, LoopbackSynchronizer,
    RateAdjustment, SyncConfig, SyncState, TickOutcome,
};

fn format(sample_rate: u32) -> AudioFormat {
    AudioFormat {
        sample_rate,
        channels: 1,
    }
}

fn start(
    handle: &ScriptHandle,
    sample_rate: u32,
    config: SyncConfig,
) -> LoopbackSynchronizer<ScriptedBackend> {
    LoopbackSynchronizer::new(ScriptedBackend::new(handle.clone()), format(sample_rate), config)
        .expect("Failed to create synchronizer")
}

/// Tick once with the capture position at `position`
fn tick_at(
    sync: &mut LoopbackSynchronizer<ScriptedBackend>,
    handle: &ScriptHandle,
    position: u32,
) -> TickOutcome {
    handle.push_record_position(position);
    sync.tick().expect("Tick failed")
}

/// Test: Playback waits for the target latency
/// Given a 48 kHz device and a 50 ms target latency
/// When capture advances 800 samples per tick
/// Then playback starts on the third tick and not before
#[test]
fn test_playback_starts_at_target_latency() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    assert_eq!(sync.stats().desired_latency, 2400);

    assert_eq!(
        tick_at(&mut sync, &handle, 800),
        TickOutcome::Buffering {
            samples_recorded: 800,
            target: 2400
        }
    );
    assert!(matches!(
        tick_at(&mut sync, &handle, 1600),
        TickOutcome::Buffering { .. }
    ));
    assert_eq!(handle.playback_starts(), 0);
    assert_eq!(sync.state(), SyncState::Capturing);

    let outcome = tick_at(&mut sync, &handle, 2400);
    assert!(matches!(
        outcome,
        TickOutcome::Monitoring {
            started_playback: true,
            ..
        }
    ));
    assert_eq!(handle.playback_starts(), 1);
    assert_eq!(sync.state(), SyncState::Playing);

    // Never restarted
    let outcome = tick_at(&mut sync, &handle, 3200);
    assert!(matches!(
        outcome,
        TickOutcome::Monitoring {
            started_playback: false,
            ..
        }
    ));
    assert_eq!(handle.playback_starts(), 1);
}

/// Test: End-to-end startup at 44.1 kHz
/// Given 44100 Hz, 1 channel, 50 ms latency and 1 ms drift tolerance
/// When the first tick reports exactly the desired latency recorded
/// Then playback starts on that tick
#[test]
fn test_end_to_end_44100() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 44100, SyncConfig::default());

    let stats = sync.stats();
    assert_eq!(stats.desired_latency, 2205);
    assert_eq!(stats.drift_threshold, 44);
    assert!(!sync.has_channel());

    let outcome = tick_at(&mut sync, &handle, 2205);
    assert!(matches!(
        outcome,
        TickOutcome::Monitoring {
            started_playback: true,
            adjustment: RateAdjustment::Native,
            playback_rate: 44100,
        }
    ));
    assert_eq!(sync.stats().samples_recorded, 2205);
    assert_eq!(sync.stats().samples_played, 0);
}

/// Test: One sample short of the target does not start playback
#[test]
fn test_one_sample_short_keeps_buffering() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 44100, SyncConfig::default());

    tick_at(&mut sync, &handle, 2204);
    assert!(!sync.has_channel());
    tick_at(&mut sync, &handle, 2205);
    assert!(sync.has_channel());
}

/// Test: Record position wraps around the buffer
/// Given a 48000-sample buffer with the last position at 47990
/// When capture reports position 5
/// Then 15 samples are counted
#[test]
fn test_record_wraparound_counted() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 47990);
    let before = sync.stats().samples_recorded;
    tick_at(&mut sync, &handle, 5);
    assert_eq!(sync.stats().samples_recorded - before, 15);
}

/// Test: Coarse driver granularity widens the latency target
/// Given a driver that reports capture in 5000 sample jumps
/// Then the adjusted latency becomes 5000
#[test]
fn test_coarse_granularity_widens_target() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 0);
    assert_eq!(sync.stats().adjusted_latency, 2400);
    assert_eq!(sync.stats().min_record_delta, None);

    tick_at(&mut sync, &handle, 5000);
    let stats = sync.stats();
    assert_eq!(stats.min_record_delta, Some(5000));
    assert_eq!(stats.adjusted_latency, 5000);
    assert!(sync.has_channel());

    tick_at(&mut sync, &handle, 10000);
    assert_eq!(sync.stats().adjusted_latency, 5000);
}

/// Test: Fine granularity after a coarse first jump restores the target
#[test]
fn test_granularity_refines_down_to_desired() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 3000);
    assert_eq!(sync.stats().adjusted_latency, 3000);

    tick_at(&mut sync, &handle, 3500);
    let stats = sync.stats();
    assert_eq!(stats.min_record_delta, Some(500));
    assert_eq!(stats.adjusted_latency, 2400);
}

/// Test: Playback falling behind speeds up
/// Given playback has started
/// When the playback position stops advancing while capture continues
/// Then the playback rate is raised by 2%
#[test]
fn test_drift_correction_speeds_up() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 2400);
    assert_eq!(handle.last_rate(), Some(48000.0));

    let mut position = 2400;
    for _ in 0..20 {
        position += 480;
        tick_at(&mut sync, &handle, position);
    }

    let stats = sync.stats();
    assert!(stats.actual_latency > 2448.0);
    assert_eq!(stats.adjustment, RateAdjustment::Faster);
    assert_eq!(stats.playback_rate, 48960);
    assert_eq!(handle.last_rate(), Some(48960.0));
}

/// Test: Playback catching up slows down
/// Given playback has started
/// When playback runs ahead of capture
/// Then the playback rate is lowered by 2%
#[test]
fn test_drift_correction_slows_down() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 2400);

    // Playback catches up to the capture position
    handle.set_play_position(2400);
    for _ in 0..20 {
        tick_at(&mut sync, &handle, 2400);
    }

    let stats = sync.stats();
    assert!(stats.actual_latency < 2352.0);
    assert_eq!(stats.adjustment, RateAdjustment::Slower);
    assert_eq!(handle.last_rate(), Some(47040.0));
}

/// Test: Rate step is a fiftieth of the native rate in integer steps
/// Given an 11025 Hz device, where 2% is 220.5 Hz
/// When drift correction pushes the rate either way
/// Then the only rates used are 10805, 11025 and 11245 Hz
#[test]
fn test_rate_step_at_11025() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 11025, SyncConfig::default());
    assert_eq!(sync.stats().desired_latency, 551);

    tick_at(&mut sync, &handle, 551);
    let mut position = 551;
    for _ in 0..20 {
        position += 110;
        tick_at(&mut sync, &handle, position);
    }
    assert_eq!(sync.stats().adjustment, RateAdjustment::Faster);
    assert_eq!(handle.last_rate(), Some(11245.0));

    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 11025, SyncConfig::default());
    tick_at(&mut sync, &handle, 551);
    handle.set_play_position(551);
    for _ in 0..20 {
        tick_at(&mut sync, &handle, 551);
    }
    assert_eq!(sync.stats().adjustment, RateAdjustment::Slower);
    assert_eq!(handle.last_rate(), Some(10805.0));
    assert!(handle
        .rate_calls()
        .iter()
        .all(|&rate| [10805.0, 11025.0, 11245.0].contains(&rate)));
}

/// Test: Latency inside the band keeps the native rate
#[test]
fn test_steady_latency_keeps_native_rate() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    tick_at(&mut sync, &handle, 2400);
    let mut position = 2400;
    for _ in 0..50 {
        position += 480;
        handle.set_play_position(position - 2400);
        tick_at(&mut sync, &handle, position);
    }

    assert!(handle.rate_calls().iter().all(|&rate| rate == 48000.0));
    assert_eq!(handle.rate_calls().len(), 51);
}

/// Test: Capture inactivity pauses playback
/// Given playback is running
/// When capture reports inactive
/// Then the channel is paused
#[test]
fn test_inactive_capture_pauses_playback() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    tick_at(&mut sync, &handle, 2400);

    handle.set_capturing(false);
    tick_at(&mut sync, &handle, 2400);

    assert_eq!(sync.state(), SyncState::Paused);
    assert!(handle.is_paused());
    assert_eq!(handle.pause_calls(), vec![true]);

    // The paused channel is still polled and its progress still counted
    let played = sync.stats().samples_played;
    handle.set_play_position(500);
    tick_at(&mut sync, &handle, 2400);
    assert_eq!(sync.stats().samples_played, played + 500);

    handle.set_play_position(900);
    tick_at(&mut sync, &handle, 2400);
    assert_eq!(sync.stats().samples_played, played + 900);
    assert_eq!(sync.state(), SyncState::Paused);
    assert!(handle.pause_calls().iter().all(|&paused| paused));
}

/// Test: Resume on capture is opt-in
/// Given resume_on_capture is enabled and playback was paused
/// When capture reports active again
/// Then playback is unpaused
#[test]
fn test_resume_on_capture() {
    let handle = ScriptHandle::new();
    let config = SyncConfig {
        resume_on_capture: true,
        ..Default::default()
    };
    let mut sync = start(&handle, 48000, config);
    tick_at(&mut sync, &handle, 2400);

    handle.set_capturing(false);
    tick_at(&mut sync, &handle, 2400);
    assert_eq!(sync.state(), SyncState::Paused);

    handle.set_capturing(true);
    tick_at(&mut sync, &handle, 2880);
    assert_eq!(sync.state(), SyncState::Playing);
    assert!(!handle.is_paused());
    assert_eq!(handle.pause_calls(), vec![true, false]);
}

/// Test: Disconnected capture leaves the tick untouched
/// Given playback is running
/// When the capture position query reports a disconnect
/// Then all counters and the channel are unchanged
#[test]
fn test_disconnect_leaves_state_unchanged() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    tick_at(&mut sync, &handle, 2400);
    handle.set_play_position(300);
    tick_at(&mut sync, &handle, 2880);

    let before = sync.stats();
    let rate_calls = handle.rate_calls().len();

    handle.push_record_disconnect();
    handle.set_play_position(900);
    assert_eq!(sync.tick().unwrap(), TickOutcome::Disconnected);

    assert_eq!(sync.stats(), before);
    assert_eq!(handle.rate_calls().len(), rate_calls);
    assert!(handle.pause_calls().is_empty());
}

/// Test: Disconnect while buffering
#[test]
fn test_disconnect_while_buffering() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    tick_at(&mut sync, &handle, 1000);

    let before = sync.stats();
    handle.push_record_disconnect();
    assert_eq!(sync.tick().unwrap(), TickOutcome::Disconnected);
    assert_eq!(sync.stats(), before);
    assert!(!sync.has_channel());
}

/// Test: Disconnected capture state does not pause playback
#[test]
fn test_capture_state_disconnect_does_not_pause() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    tick_at(&mut sync, &handle, 2400);

    handle.push_capture_report(Err(BackendError::Disconnected));
    let outcome = tick_at(&mut sync, &handle, 2880);

    assert!(matches!(outcome, TickOutcome::Monitoring { .. }));
    assert_eq!(sync.state(), SyncState::Playing);
    assert!(handle.pause_calls().is_empty());
}

/// Test: Backend failures fail the tick
#[test]
fn test_backend_failure_fails_tick() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    handle.push_record_error(BackendError::Stream("device lost".into()));
    assert!(matches!(
        sync.tick(),
        Err(LoopbackError::Backend(BackendError::Stream(_)))
    ));

    tick_at(&mut sync, &handle, 2400);
    handle.push_play_error(BackendError::InvalidHandle("channel".into()));
    handle.push_record_position(2880);
    assert!(matches!(
        sync.tick(),
        Err(LoopbackError::Backend(BackendError::InvalidHandle(_)))
    ));

    handle.push_capture_report(Err(BackendError::Stream("query failed".into())));
    handle.push_record_position(3360);
    assert!(sync.tick().is_err());

    // The host keeps ticking afterwards
    assert!(matches!(
        tick_at(&mut sync, &handle, 3840),
        TickOutcome::Monitoring { .. }
    ));
}

/// Test: Playback start failure is reported and leaves the synchronizer buffering
#[test]
fn test_start_playback_failure() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    handle.fail_start_playback(BackendError::DeviceNotFound("output".into()));
    handle.push_record_position(2400);
    assert!(sync.tick().is_err());
    assert!(!sync.has_channel());
    assert_eq!(sync.state(), SyncState::Capturing);
}

/// Test: Rate failures surface
#[test]
fn test_set_rate_failure() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());

    handle.fail_set_rate(BackendError::Stream("rate".into()));
    handle.push_record_position(2400);
    assert!(sync.tick().is_err());
    // Playback did start before the rate was applied
    assert!(sync.has_channel());
}

/// Test: Invalid formats are rejected before touching the backend
#[test]
fn test_invalid_format_rejected() {
    let handle = ScriptHandle::new();
    let result = LoopbackSynchronizer::new(
        ScriptedBackend::new(handle.clone()),
        format(0),
        SyncConfig::default(),
    );
    assert!(matches!(
        result,
        Err(LoopbackError::InvalidFormat(AudioFormatError::ZeroSampleRate))
    ));

    let result = LoopbackSynchronizer::new(
        ScriptedBackend::new(handle.clone()),
        AudioFormat {
            sample_rate: 48000,
            channels: 0,
        },
        SyncConfig::default(),
    );
    assert!(matches!(
        result,
        Err(LoopbackError::InvalidFormat(AudioFormatError::ZeroChannels))
    ));
    assert_eq!(handle.buffers_created(), 0);
}

/// Test: Failed capture start releases the buffer
#[test]
fn test_capture_start_failure_releases_buffer() {
    let handle = ScriptHandle::new();
    handle.fail_start_capture(BackendError::NoInputDevices);

    let result = LoopbackSynchronizer::new(
        ScriptedBackend::new(handle.clone()),
        format(48000),
        SyncConfig::default(),
    );
    assert!(matches!(
        result,
        Err(LoopbackError::Backend(BackendError::NoInputDevices))
    ));
    assert_eq!(handle.buffers_created(), 1);
    assert_eq!(handle.buffers_released(), 1);
}

/// Test: Failed length query stops capture and releases the buffer
#[test]
fn test_buffer_length_failure_cleans_up() {
    let handle = ScriptHandle::new();
    handle.fail_buffer_length(BackendError::InvalidHandle("sound".into()));

    let result = LoopbackSynchronizer::new(
        ScriptedBackend::new(handle.clone()),
        format(48000),
        SyncConfig::default(),
    );
    assert!(result.is_err());
    assert_eq!(handle.capture_stops(), 1);
    assert_eq!(handle.buffers_released(), 1);
}

/// Test: Zero-length buffer is rejected
#[test]
fn test_zero_length_buffer_rejected() {
    let handle = ScriptHandle::new();
    handle.set_buffer_len(0);

    let result = LoopbackSynchronizer::new(
        ScriptedBackend::new(handle.clone()),
        format(48000),
        SyncConfig::default(),
    );
    assert!(matches!(
        result,
        Err(LoopbackError::Backend(BackendError::InvalidHandle(_)))
    ));
}

/// Test: Dropping the synchronizer stops capture and releases the buffer
#[test]
fn test_drop_releases_resources() {
    let handle = ScriptHandle::new();
    {
        let mut sync = start(&handle, 48000, SyncConfig::default());
        tick_at(&mut sync, &handle, 2400);
        assert!(handle.is_playing());
    }

    assert_eq!(handle.capture_stops(), 1);
    assert_eq!(handle.buffers_released(), 1);
    assert!(!handle.capture_started());
    assert!(!handle.is_playing());
}

/// Test: Independent synchronizers do not share state
#[test]
fn test_independent_instances() {
    let first = ScriptHandle::new();
    let second = ScriptHandle::new();
    let mut a = start(&first, 48000, SyncConfig::default());
    let mut b = start(&second, 48000, SyncConfig::default());

    tick_at(&mut a, &first, 5000);
    tick_at(&mut b, &second, 100);

    assert_eq!(a.stats().min_record_delta, Some(5000));
    assert_eq!(b.stats().min_record_delta, Some(100));
    assert_eq!(b.stats().last_record_pos, 100);
    assert!(a.has_channel());
    assert!(!b.has_channel());
}

/// Test: Drift correction holds latency near the target
/// Given a playback clock running fast or slow by up to 2000 ppm
/// When monitoring for 3000 ticks of 16 ms
/// Then the smoothed latency settles near the target band
/// And the native rate is used for most ticks
#[test]
fn test_simulated_drift_settles() {
    for drift_ppm in [-2000.0, -500.0, 500.0, 2000.0] {
        let handle = ScriptHandle::new();
        let mut sync = start(&handle, 48000, SyncConfig::default());
        let mut clock = ClockSimulation::new(format(48000), 16, 1, drift_ppm);

        let mut native = 0;
        let mut monitored = 0;
        let mut late_latency = Vec::new();
        for tick in 0..3000 {
            clock.advance(&handle);
            if let TickOutcome::Monitoring { adjustment, .. } = sync.tick().unwrap() {
                monitored += 1;
                if adjustment == RateAdjustment::Native {
                    native += 1;
                }
            }
            if tick >= 1500 {
                late_latency.push(sync.stats().actual_latency);
            }
        }

        let stats = sync.stats();
        let margin = 2.0 * stats.drift_threshold as f64;
        let target = stats.adjusted_latency as f64;
        assert!(
            late_latency.iter().all(|l| (l - target).abs() <= margin),
            "latency left the band at {} ppm",
            drift_ppm
        );
        assert!(
            native * 4 > monitored * 3,
            "native rate used {} of {} ticks at {} ppm",
            native,
            monitored,
            drift_ppm
        );
    }
}

/// Test: Coarse granularity in simulation keeps the widened target
#[test]
fn test_simulated_coarse_granularity() {
    let handle = ScriptHandle::new();
    let mut sync = start(&handle, 48000, SyncConfig::default());
    let mut clock = ClockSimulation::new(format(48000), 16, 5000, 0.0);

    for _ in 0..1000 {
        clock.advance(&handle);
        sync.tick().unwrap();
    }

    let stats = sync.stats();
    assert_eq!(stats.min_record_delta, Some(5000));
    assert_eq!(stats.adjusted_latency, 5000);
    assert!(sync.has_channel());
}
