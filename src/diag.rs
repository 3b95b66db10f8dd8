//! Per-radio diagnostic event bus
//!
//! Conditions are OR-ed into a pending flag word from any context
//! (interrupt side included) without blocking. An optional trace listener
//! drains the word and turns each flag into a named `tracing` record.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::hal::RadioId;

bitflags! {
    /// Named conditions raised by the receive pipeline
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        const CHANNEL_OPEN = 1 << 0;
        const DECODER_START = 1 << 1;
        const CHANNEL_STOP = 1 << 2;
        const CHANNEL_CLOSE = 1 << 3;
        const PWM_STREAM_OPEN = 1 << 4;
        const PWM_STREAM_CLOSE = 1 << 5;
        /// No pulse stream object available
        const PWM_FIFO_EMPTY = 1 << 6;
        /// No pulse segment available for a new stream
        const PWM_BUFFER_FAIL = 1 << 7;
        const PWM_QUEUE_FULL = 1 << 8;
        /// End marker could not be written
        const PWM_QUEUE_OVERRUN = 1 << 9;
        /// A stream was still open when a new one started
        const PWM_FIFO_REMNANT = 1 << 10;
        const PWM_NO_DATA = 1 << 11;
        const PWM_INVALID_INBAND = 1 << 12;
        const PWM_STREAM_TIMEOUT = 1 << 13;
        const RADIO_CCA_SPIKE = 1 << 14;
        const RADIO_CCA_GLITCH = 1 << 15;
        const ICU_SLEEP_TIMEOUT = 1 << 16;
        const ICU_OVERFLOW = 1 << 17;
        /// No frame buffer for a decoded frame
        const PKT_NO_BUFFER = 1 << 18;
        const PKT_BUFFER_FULL = 1 << 19;
        const PKT_FAILED_CB_THD = 1 << 20;
        const PKT_CRC_ERROR = 1 << 21;
        const PKT_INVALID_FRAME = 1 << 22;
        const DECODER_START_FAIL = 1 << 23;
    }
}

/// Event flag source of one radio
pub struct EventSource {
    radio: RadioId,
    pending: AtomicU32,
    traced: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl EventSource {
    pub fn new(radio: RadioId) -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        Arc::new(Self {
            radio,
            pending: AtomicU32::new(0),
            traced: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        })
    }

    pub fn radio(&self) -> RadioId {
        self.radio
    }

    /// Raise conditions. Safe from interrupt context.
    pub fn raise(&self, flags: EventFlags) {
        if flags.is_empty() {
            return;
        }
        self.pending.fetch_or(flags.bits(), Ordering::AcqRel);
        if self.traced.load(Ordering::Acquire) {
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Take and clear everything raised since the last take
    pub fn take(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    pub fn pending(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }
}

/// Background listener logging each raised condition by name
pub struct TraceListener {
    events: Arc<EventSource>,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TraceListener {
    pub fn spawn(events: Arc<EventSource>) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let source = events.clone();
        let handle = thread::Builder::new()
            .name(format!("pkt_trace_{}", events.radio()))
            .spawn(move || run_trace(source, shutdown_rx))?;

        events.traced.store(true, Ordering::Release);
        // Report anything raised before the listener existed
        let _ = events.wake_tx.try_send(());

        Ok(Self {
            events,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.events.traced.store(false, Ordering::Release);
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TraceListener {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_trace(events: Arc<EventSource>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(events.wake_rx) -> _ => trace_flags(events.radio(), events.take()),
            recv(shutdown) -> _ => break,
        }
    }
    trace_flags(events.radio(), events.take());
}

/// Log each flag at the severity its condition carries
pub fn trace_flags(radio: RadioId, flags: EventFlags) {
    for (name, _) in flags.iter_names() {
        match name {
            "PWM_QUEUE_OVERRUN" | "PWM_INVALID_INBAND" | "PKT_FAILED_CB_THD"
            | "DECODER_START_FAIL" => error!("PKT {} > {}", radio, describe(name)),
            "PWM_QUEUE_FULL" | "PWM_FIFO_EMPTY" | "PWM_BUFFER_FAIL" | "PKT_NO_BUFFER"
            | "PKT_BUFFER_FULL" | "PWM_NO_DATA" | "PWM_STREAM_TIMEOUT" | "ICU_OVERFLOW" => {
                warn!("PKT {} > {}", radio, describe(name))
            }
            "ICU_SLEEP_TIMEOUT" | "CHANNEL_OPEN" | "CHANNEL_CLOSE" | "CHANNEL_STOP"
            | "DECODER_START" => info!("PKT {} > {}", radio, describe(name)),
            _ => debug!("PKT {} > {}", radio, describe(name)),
        }
    }
}

fn describe(name: &str) -> &'static str {
    match name {
        "CHANNEL_OPEN" => "Receive channel opened",
        "DECODER_START" => "Reception enabled, decoder may start",
        "CHANNEL_STOP" => "Reception stopped",
        "CHANNEL_CLOSE" => "Receive channel closed",
        "PWM_STREAM_OPEN" => "PWM stream opened",
        "PWM_STREAM_CLOSE" => "PWM stream closed",
        "PWM_FIFO_EMPTY" => "PWM stream objects exhausted",
        "PWM_BUFFER_FAIL" => "PWM buffer segments exhausted",
        "PWM_QUEUE_FULL" => "PWM queue full",
        "PWM_QUEUE_OVERRUN" => "PWM queue overrun",
        "PWM_FIFO_REMNANT" => "PWM stream remnant closed",
        "PWM_NO_DATA" => "No PWM data from radio",
        "PWM_INVALID_INBAND" => "Invalid PWM in-band message",
        "PWM_STREAM_TIMEOUT" => "PWM stream timeout",
        "RADIO_CCA_SPIKE" => "CCA spike ignored",
        "RADIO_CCA_GLITCH" => "CCA glitch ignored",
        "ICU_SLEEP_TIMEOUT" => "PWM capture has entered sleep",
        "ICU_OVERFLOW" => "PWM capture overflow",
        "PKT_NO_BUFFER" => "Frame buffers exhausted",
        "PKT_BUFFER_FULL" => "Frame receive buffer full",
        "PKT_FAILED_CB_THD" => "Failed to create RX callback worker",
        "PKT_CRC_ERROR" => "Frame CRC error",
        "PKT_INVALID_FRAME" => "Invalid frame",
        "DECODER_START_FAIL" => "Decoder failed to start",
        _ => "Unknown condition",
    }
}
