//! micloop - Low-latency microphone monitoring

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use micloop::audio::scripted::{ClockSimulation, ScriptHandle, ScriptedBackend};
use micloop::audio::{
    input_device_format, list_input_devices, list_output_devices, AudioDevice, AudioFormat,
    CpalBackend, LoopbackSynchronizer, RateAdjustment, SyncStats, TickOutcome,
};
use micloop::config::{load_config, AppConfig};

/// Give up after this many failed ticks in a row
const MAX_CONSECUTIVE_TICK_FAILURES: u32 = 50;

#[derive(Parser)]
#[command(name = "micloop")]
#[command(about = "Low-latency microphone monitoring with clock-drift correction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "MICLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Monitor a recording device through the default output device
    Monitor {
        /// Recording device index (use 'devices list' to see available devices)
        #[arg(short, long, env = "MICLOOP_DEVICE")]
        device: Option<usize>,

        /// Target latency in milliseconds
        #[arg(long)]
        latency_ms: Option<u32>,

        /// Drift tolerance in milliseconds
        #[arg(long)]
        drift_ms: Option<u32>,

        /// Tick interval in milliseconds
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Sample rate in Hz (defaults to the device's native rate)
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Channel count (defaults to the device's native channels)
        #[arg(long)]
        channels: Option<u16>,

        /// Resume playback when capture becomes active again after a pause
        #[arg(long)]
        resume_on_capture: bool,
    },

    /// Run the synchronizer against simulated drifting clocks
    Simulate {
        /// Number of ticks to run
        #[arg(long, default_value = "3000")]
        ticks: u64,

        /// Playback clock error in parts per million (positive = playback fast)
        #[arg(long, default_value = "500", allow_hyphen_values = true)]
        drift_ppm: f64,

        /// Capture position granularity in samples
        #[arg(long, default_value = "1")]
        granularity: u32,

        /// Sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all devices
    List,
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn print_device(device: &AudioDevice) {
    let default_marker = if device.is_default { " (default)" } else { "" };
    match device.native_format {
        Some(format) => println!(
            "  [{}] {}{}  {} Hz, {} ch",
            device.index.0, device.name, default_marker, format.sample_rate, format.channels
        ),
        None => println!("  [{}] {}{}", device.index.0, device.name, default_marker),
    }
}

fn list_devices() {
    println!("Input devices:");
    match list_input_devices() {
        Ok(devices) if devices.is_empty() => println!("  (none)"),
        Ok(devices) => devices.iter().for_each(print_device),
        Err(e) => println!("  Error: {}", e),
    }

    println!("\nOutput devices:");
    match list_output_devices() {
        Ok(devices) if devices.is_empty() => println!("  (none)"),
        Ok(devices) => devices.iter().for_each(print_device),
        Err(e) => println!("  Error: {}", e),
    }
}

fn samples_to_ms(samples: f64, sample_rate: u32) -> f64 {
    samples * 1000.0 / f64::from(sample_rate)
}

/// Print synchronizer statistics
fn print_sync_stats(stats: &SyncStats, format: AudioFormat) {
    let rate = format.sample_rate;

    println!("\n═══════════════════════════════════════════════════════════════");
    println!(" Monitoring Statistics");
    println!("═══════════════════════════════════════════════════════════════");

    println!("\n State:            {:?}", stats.state);
    println!(" Format:           {} Hz, {} ch", rate, format.channels);
    println!(" Ticks:            {:>10}", stats.ticks);

    println!("\n Samples:");
    println!("   Recorded:       {:>10}", stats.samples_recorded);
    println!("   Played:         {:>10}", stats.samples_played);

    println!("\n Latency:");
    println!(
        "   Desired:        {:>10} samples ({:.2} ms)",
        stats.desired_latency,
        samples_to_ms(stats.desired_latency as f64, rate)
    );
    println!(
        "   Adjusted:       {:>10} samples ({:.2} ms)",
        stats.adjusted_latency,
        samples_to_ms(stats.adjusted_latency as f64, rate)
    );
    println!(
        "   Actual:         {:>10.1} samples ({:.2} ms)",
        stats.actual_latency,
        samples_to_ms(stats.actual_latency, rate)
    );
    println!(
        "   Drift band:     {:>10} samples",
        format!("±{}", stats.drift_threshold)
    );
    match stats.min_record_delta {
        Some(delta) => println!("   Granularity:    {:>10} samples", delta),
        None => println!("   Granularity:           n/a"),
    }

    println!("\n Playback:");
    println!("   Rate:           {:>10} Hz ({:?})", stats.playback_rate, stats.adjustment);

    println!("\n═══════════════════════════════════════════════════════════════\n");
}

async fn run_monitor(config: AppConfig) -> Result<()> {
    let native = input_device_format(config.sync.device())
        .context("Failed to query recording device")?;
    let format = AudioFormat {
        sample_rate: config.sample_rate.unwrap_or(native.sample_rate),
        channels: config.channels.unwrap_or(native.channels),
    };

    info!("Monitoring device {} with {:?}", config.sync.device_index, format);
    debug!("Config: {:?}", config);

    let mut synchronizer = LoopbackSynchronizer::new(CpalBackend::new(), format, config.sync)
        .context("Failed to start loopback capture")?;

    println!("\nMonitoring started. Press Ctrl+C to stop.\n");

    let mut interval = tokio::time::interval(Duration::from_millis(config.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_failures = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match synchronizer.tick() {
                    Ok(_) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        error!("Tick failed: {}", e);
                        if consecutive_failures >= MAX_CONSECUTIVE_TICK_FAILURES {
                            print_sync_stats(&synchronizer.stats(), synchronizer.format());
                            bail!("Giving up after {} consecutive tick failures: {}", consecutive_failures, e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    print_sync_stats(&synchronizer.stats(), synchronizer.format());
    Ok(())
}

fn run_simulate(
    config: AppConfig,
    ticks: u64,
    drift_ppm: f64,
    granularity: u32,
    sample_rate: u32,
) -> Result<()> {
    let format = AudioFormat {
        sample_rate,
        channels: 1,
    };

    info!(
        "Simulating {} ticks of {} ms: drift {} ppm, granularity {} samples",
        ticks, config.tick_ms, drift_ppm, granularity
    );

    let handle = ScriptHandle::new();
    let mut clock = ClockSimulation::new(format, config.tick_ms, granularity, drift_ppm);
    let mut synchronizer =
        LoopbackSynchronizer::new(ScriptedBackend::new(handle.clone()), format, config.sync)?;

    let (mut native, mut slower, mut faster) = (0u64, 0u64, 0u64);
    for _ in 0..ticks {
        clock.advance(&handle);
        if let TickOutcome::Monitoring { adjustment, .. } = synchronizer.tick()? {
            match adjustment {
                RateAdjustment::Native => native += 1,
                RateAdjustment::Slower => slower += 1,
                RateAdjustment::Faster => faster += 1,
            }
        }
    }

    print_sync_stats(&synchronizer.stats(), synchronizer.format());
    println!(" Rate decisions: native {}, slower {}, faster {}\n", native, slower, faster);
    Ok(())
}

/// Apply command line overrides on top of file configuration
#[allow(clippy::too_many_arguments)]
fn apply_monitor_overrides(
    config: &mut AppConfig,
    device: Option<usize>,
    latency_ms: Option<u32>,
    drift_ms: Option<u32>,
    tick_ms: Option<u64>,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    resume_on_capture: bool,
) {
    if let Some(device) = device {
        config.sync.device_index = device;
    }
    if let Some(latency_ms) = latency_ms {
        config.sync.latency_ms = latency_ms;
    }
    if let Some(drift_ms) = drift_ms {
        config.sync.drift_ms = drift_ms;
    }
    if let Some(tick_ms) = tick_ms {
        config.tick_ms = tick_ms;
    }
    if sample_rate.is_some() {
        config.sample_rate = sample_rate;
    }
    if channels.is_some() {
        config.channels = channels;
    }
    if resume_on_capture {
        config.sync.resume_on_capture = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Monitor {
            device,
            latency_ms,
            drift_ms,
            tick_ms,
            sample_rate,
            channels,
            resume_on_capture,
        } => {
            apply_monitor_overrides(
                &mut config,
                device,
                latency_ms,
                drift_ms,
                tick_ms,
                sample_rate,
                channels,
                resume_on_capture,
            );
            config.validate()?;
            run_monitor(config).await?;
        }
        Commands::Simulate {
            ticks,
            drift_ppm,
            granularity,
            sample_rate,
        } => {
            run_simulate(config, ticks, drift_ppm, granularity, sample_rate)?;
        }
    }

    Ok(())
}
