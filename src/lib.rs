//! micloop - Low-latency microphone monitoring
//!
//! Captures live input into a looping buffer and plays it back with a small,
//! stable delay, nudging the playback clock to absorb drift between the
//! capture and playback devices.

pub mod audio;
pub mod config;

pub use audio::{AudioFormat, LoopbackBackend, LoopbackSynchronizer, SyncConfig};
pub use config::AppConfig;
