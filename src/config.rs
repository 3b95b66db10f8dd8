//! Configuration loaded from environment variables

use std::time::Duration;

use crate::capture::CaptureTiming;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of radio units with a packet service
    pub radios: u8,

    /// Frame buffers in each radio's receive pool
    pub rx_buffers: usize,

    /// System-wide bound on outstanding transmit/analysis buffers
    pub common_buffers: usize,

    /// Pulse stream objects per radio
    pub pulse_streams: usize,

    /// Pulse segments per radio, shared by all stream chains
    pub pulse_segments: usize,

    /// Pulse records per segment
    pub pulse_segment_len: usize,

    /// Maximum decoded frame length in bytes
    pub frame_len: usize,

    /// Bounded wait for a radio command verdict
    pub command_timeout_ms: u64,

    /// Bounded wait for a prior session to finish closing
    pub close_wait_ms: u64,

    /// Capture unit sleeps after this many idle seconds
    pub icu_sleep_s: u64,

    /// Receive frequency used by the demo
    pub rx_frequency: u32,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            radios: env_or("PKT_RADIOS", 1),
            rx_buffers: env_or("PKT_RX_BUFFERS", 3),
            common_buffers: env_or("PKT_COMMON_BUFFERS", 3),
            pulse_streams: env_or("PKT_PULSE_STREAMS", 2),
            pulse_segments: env_or("PKT_PULSE_SEGMENTS", 6),
            pulse_segment_len: env_or("PKT_PULSE_SEGMENT_LEN", 1024),
            frame_len: env_or("PKT_FRAME_LEN", crate::ax25::MAX_FRAME_LEN),
            command_timeout_ms: env_or("PKT_COMMAND_TIMEOUT_MS", 2000),
            close_wait_ms: env_or("PKT_CLOSE_WAIT_MS", 5000),
            icu_sleep_s: env_or("PKT_ICU_SLEEP_S", 10),
            rx_frequency: env_or("PKT_RX_FREQUENCY", 144_800_000),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }

    pub fn capture_timing(&self) -> CaptureTiming {
        CaptureTiming {
            channel_idle: Duration::from_secs(self.icu_sleep_s),
            ..CaptureTiming::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            radios: 1,
            rx_buffers: 3,
            common_buffers: 3,
            pulse_streams: 2,
            pulse_segments: 6,
            pulse_segment_len: 1024,
            frame_len: crate::ax25::MAX_FRAME_LEN,
            command_timeout_ms: 2000,
            close_wait_ms: 5000,
            icu_sleep_s: 10,
            rx_frequency: 144_800_000,
        }
    }
}
