//! Decode thread: start/stop protocol and stream draining

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, TryRecvError};
use tracing::{debug, info, trace};

use super::{DecoderAck, DecoderCommand, DecoderLauncher, DecoderLink, DemodEvent, Demodulator};
use crate::buffer::FrameBuffer;
use crate::capture::{ReadOutcome, StreamLease, StreamStatus};
use crate::diag::EventFlags;

/// Longest gap between pulses inside a stream
const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for the capture side to close an abandoned stream
const CLOSE_WAIT: Duration = Duration::from_millis(200);

type DemodFactory = dyn Fn() -> Box<dyn Demodulator> + Send + Sync;

/// Launches each decode task on a dedicated thread
#[derive(Clone)]
pub struct ThreadedDecoder {
    factory: Arc<DemodFactory>,
}

impl ThreadedDecoder {
    pub fn new(factory: impl Fn() -> Box<dyn Demodulator> + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl DecoderLauncher for ThreadedDecoder {
    fn launch(&self, link: DecoderLink) -> std::io::Result<()> {
        let demod = (self.factory)();
        thread::Builder::new()
            .name(format!("pkt_dec_{}", link.radio))
            .spawn(move || run_decoder(link, demod))?;
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    streams: u64,
    frames: u64,
    discarded: u64,
}

/// Decode loop. Returns when terminated or when the service goes away.
pub fn run_decoder(link: DecoderLink, mut demod: Box<dyn Demodulator>) {
    info!("Radio {} decoder thread started", link.radio);
    let mut counters = Counters::default();
    let mut running = false;

    loop {
        let command = select! {
            recv(link.commands) -> cmd => cmd.unwrap_or(DecoderCommand::Terminate),
            recv(link.streams) -> lease => {
                let Ok(lease) = lease else {
                    break;
                };
                if !running {
                    discard_stream(&link, lease);
                    counters.discarded += 1;
                    continue;
                }
                counters.streams += 1;
                match decode_stream(&link, demod.as_mut(), lease, &mut counters) {
                    Some(cmd) => cmd,
                    None => continue,
                }
            }
        };

        match command {
            DecoderCommand::Start => {
                running = true;
                let _ = link.acks.send(DecoderAck::Started);
                debug!("Radio {} decoder started", link.radio);
            }
            DecoderCommand::Stop => {
                running = false;
                let _ = link.acks.send(DecoderAck::Stopped);
                debug!("Radio {} decoder stopped", link.radio);
            }
            DecoderCommand::Terminate => break,
        }
    }

    let _ = link.acks.send(DecoderAck::Terminated);
    info!(
        "Radio {} decoder thread exiting. Streams: {}, Frames: {}, Discarded: {}",
        link.radio, counters.streams, counters.frames, counters.discarded
    );
}

/// Stream arrived while stopped: ask capture to end it
fn discard_stream(link: &DecoderLink, mut lease: StreamLease) {
    lease.mark(StreamStatus::DECODE_RESET);
    trace!("Radio {} discarded stream {}", link.radio, lease.stream().id());
    lease.wait_closed(CLOSE_WAIT);
}

/// Drain one stream. Returns a command that arrived mid-stream.
fn decode_stream(
    link: &DecoderLink,
    demod: &mut dyn Demodulator,
    mut lease: StreamLease,
    counters: &mut Counters,
) -> Option<DecoderCommand> {
    demod.reset();
    let mut frame: Option<FrameBuffer> = None;
    let mut output = Vec::new();
    // Set once the stream has produced its frame or been abandoned
    let mut finished = false;

    loop {
        match link.commands.try_recv() {
            Ok(cmd) => {
                lease.mark(StreamStatus::DECODE_RESET);
                lease.wait_closed(CLOSE_WAIT);
                return Some(cmd);
            }
            Err(TryRecvError::Disconnected) => return Some(DecoderCommand::Terminate),
            Err(TryRecvError::Empty) => {}
        }

        let pulse = match lease.read(STREAM_READ_TIMEOUT) {
            ReadOutcome::Pulse(pulse) => pulse,
            ReadOutcome::End(code) => {
                trace!("Radio {} stream {} ended ({:?})", link.radio, lease.stream().id(), code);
                return None;
            }
            ReadOutcome::Invalid(raw) => {
                debug!("Radio {} invalid in-band code {:#x}", link.radio, raw);
                link.events.raise(EventFlags::PWM_INVALID_INBAND);
                lease.mark(StreamStatus::DECODE_RESET);
                lease.wait_closed(CLOSE_WAIT);
                return None;
            }
            ReadOutcome::Idle => {
                link.events.raise(EventFlags::PWM_STREAM_TIMEOUT);
                lease.mark(StreamStatus::DECODE_RESET);
                lease.wait_closed(CLOSE_WAIT);
                return None;
            }
        };

        if finished {
            continue;
        }

        output.clear();
        demod.feed(pulse, &mut output);
        for event in output.drain(..) {
            match event {
                DemodEvent::Sync => {
                    if frame.as_ref().is_some_and(|f| !f.is_empty()) {
                        frame = None;
                    }
                    if frame.is_none() {
                        match link.frames.try_acquire(link.radio) {
                            Ok(buffer) => {
                                link.sink.record_sync();
                                frame = Some(buffer);
                            }
                            Err(_) => {
                                link.events.raise(EventFlags::PKT_NO_BUFFER);
                                lease.mark(StreamStatus::DECODE_RESET);
                                finished = true;
                                break;
                            }
                        }
                    }
                }
                DemodEvent::Byte(byte) => {
                    let Some(buffer) = frame.as_mut() else {
                        continue;
                    };
                    if buffer.store(byte).is_err() {
                        link.events.raise(EventFlags::PKT_BUFFER_FULL);
                        lease.mark(StreamStatus::DECODE_RESET);
                        frame = None;
                        finished = true;
                        break;
                    }
                }
                DemodEvent::FrameEnd => {
                    let Some(mut buffer) = frame.take() else {
                        continue;
                    };
                    if buffer.is_empty() {
                        continue;
                    }
                    buffer.mark_received();
                    lease.mark(StreamStatus::DECODE_DONE);
                    let status = link.sink.deliver(buffer);
                    counters.frames += 1;
                    trace!("Radio {} frame delivered ({:?})", link.radio, status);
                    finished = true;
                    break;
                }
                DemodEvent::Abort => frame = None,
            }
        }
    }
}
