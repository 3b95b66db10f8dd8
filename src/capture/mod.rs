//! Interrupt-side capture of pulse-width encoded AFSK
//!
//! - `pulse`: three byte packed pulse records and in-band codes
//! - `queue`: chained pulse segments and the per-radio stream pool
//! - `channel`: CCA de-glitch and stream lifecycle driven by capture events
//! - `timer`: thread that fires the channel's one-shot timers

pub mod channel;
pub mod pulse;
pub mod queue;
pub mod timer;

pub use channel::{CaptureChannel, ChannelState};
pub use pulse::{PackedPulse, Pulse, PulseRecord, StreamCode};
pub use queue::{OpenError, QueueWrite, ReadOutcome, StreamLease, StreamPool, StreamStatus, StreamWriter};
pub use timer::TimerDriver;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Nominal AFSK bit period at 1200 baud
pub const AFSK_BIT_PERIOD: Duration = Duration::from_micros(833);

/// Timing of the capture channel's one-shot timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// CCA must stay high this long before a stream opens
    pub cca_lead: Duration,
    /// CCA must stay low this long before a stream closes
    pub cca_trail: Duration,
    /// An open stream with no pulse for this long is closed
    pub stream_idle: Duration,
    /// Capture sleeps after this long with no open stream
    pub channel_idle: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            cca_lead: AFSK_BIT_PERIOD * 16,
            cca_trail: AFSK_BIT_PERIOD * 8,
            stream_idle: Duration::from_millis(50),
            channel_idle: Duration::from_secs(10),
        }
    }
}

/// Capture statistics (atomic for lock-free updates)
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub streams_opened: AtomicU64,
    pub streams_closed: AtomicU64,
    pub pulses: AtomicU64,
    pub overflows: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub pulses: u64,
    pub overflows: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            pulses: self.pulses.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}
