//! Decode task interface
//!
//! The decode task runs on its own thread. It is driven by
//! [`DecoderCommand`]s, acknowledges through a broadcast of
//! [`DecoderAck`]s, drains pulse streams handed over by the capture
//! channel and feeds them to a [`Demodulator`]. Decoded frames go to a
//! [`FrameSink`], normally the packet service's dispatcher.

pub mod runner;

pub use runner::{run_decoder, ThreadedDecoder};

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tokio::sync::broadcast;

use crate::buffer::{FrameBuffer, FramePool, FrameStatus};
use crate::capture::{Pulse, StreamLease};
use crate::diag::EventSource;
use crate::hal::RadioId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderCommand {
    Start,
    Stop,
    /// Exit the decode thread
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderAck {
    Started,
    Stopped,
    Terminated,
}

/// Output of the demodulator for one pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodEvent {
    /// Opening flag found
    Sync,
    Byte(u8),
    /// Closing flag after at least one byte
    FrameEnd,
    /// Frame abandoned (abort sequence or bit error)
    Abort,
}

/// Bit-level demodulation of pulse widths into HDLC bytes
pub trait Demodulator: Send {
    fn feed(&mut self, pulse: Pulse, out: &mut Vec<DemodEvent>);

    /// Forget any partial state before a new stream
    fn reset(&mut self);
}

/// Receiver of decoded frames
pub trait FrameSink: Send + Sync {
    /// Opening flag seen and a frame buffer started
    fn record_sync(&self);

    /// Validate and deliver a completed frame
    fn deliver(&self, frame: FrameBuffer) -> FrameStatus;
}

/// Everything a decode task needs from its packet service
pub struct DecoderLink {
    pub radio: RadioId,
    pub commands: Receiver<DecoderCommand>,
    pub acks: broadcast::Sender<DecoderAck>,
    pub streams: Receiver<StreamLease>,
    pub frames: Arc<FramePool>,
    pub sink: Arc<dyn FrameSink>,
    pub events: Arc<EventSource>,
}

/// Starts a decode task for a service
pub trait DecoderLauncher: Send + Sync {
    fn launch(&self, link: DecoderLink) -> std::io::Result<()>;
}
