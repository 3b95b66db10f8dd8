//! Capture channel of one radio
//!
//! Owns the stream lifecycle: a de-glitched CCA leading edge opens a pulse
//! stream and hands its lease to the decoder, period callbacks append
//! pulses, and CCA trailing edge, decoder acknowledgement, errors or
//! timeouts close it with an in-band end marker.
//!
//! Every entry point runs in interrupt context and never waits on anything
//! but the channel's own short critical section. One-shot timers are kept as
//! deadlines and fired by [`CaptureChannel::service_timers`], normally from
//! the [`TimerDriver`](super::TimerDriver) thread.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use super::pulse::{PackedPulse, StreamCode};
use super::queue::{OpenError, QueueWrite, StreamLease, StreamPool, StreamStatus, StreamWriter};
use super::{CaptureStats, CaptureTiming};
use crate::diag::{EventFlags, EventSource};
use crate::error::HalError;
use crate::hal::{CaptureEvents, CaptureHal, Indicator, RadioId};

/// Capture channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for CCA
    Ready,
    /// A stream is open and buffering
    Active,
    /// Reception disabled, CCA ignored
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CcaEdge {
    Lead,
    Trail,
}

#[derive(Debug, Default)]
struct Timers {
    cca: Option<(Instant, CcaEdge)>,
    stream_idle: Option<Instant>,
    channel_idle: Option<Instant>,
}

impl Timers {
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.cca.map(|(at, _)| at),
            self.stream_idle,
            self.channel_idle,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

struct ChannelCore {
    state: ChannelState,
    attached: bool,
    active: Option<StreamWriter>,
    timers: Timers,
}

pub struct CaptureChannel {
    radio: RadioId,
    me: Weak<CaptureChannel>,
    hal: Arc<dyn CaptureHal>,
    pool: StreamPool,
    streams: Sender<StreamLease>,
    events: Arc<EventSource>,
    timing: CaptureTiming,
    stats: CaptureStats,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    core: Mutex<ChannelCore>,
}

fn push_pulse(writer: &mut StreamWriter, packed: PackedPulse) -> bool {
    match writer.write(packed) {
        QueueWrite::Written => true,
        QueueWrite::NeedsSwap => writer.extend() && writer.write(packed) == QueueWrite::Written,
        QueueWrite::Full => false,
    }
}

impl CaptureChannel {
    /// Create a detached channel. Leases of opened streams go to `streams`.
    pub fn new(
        radio: RadioId,
        hal: Arc<dyn CaptureHal>,
        pool: StreamPool,
        streams: Sender<StreamLease>,
        events: Arc<EventSource>,
        timing: CaptureTiming,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        Arc::new_cyclic(|me| Self {
            radio,
            me: me.clone(),
            hal,
            pool,
            streams,
            events,
            timing,
            stats: CaptureStats::default(),
            wake_tx,
            wake_rx,
            core: Mutex::new(ChannelCore {
                state: ChannelState::Stop,
                attached: false,
                active: None,
                timers: Timers::default(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn radio(&self) -> RadioId {
        self.radio
    }

    pub fn state(&self) -> ChannelState {
        self.lock().state
    }

    pub fn has_active_stream(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn pool(&self) -> &StreamPool {
        &self.pool
    }

    /// Signalled whenever a timer is armed
    pub fn timer_wake(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Bind the capture unit and register this channel as its sink.
    ///
    /// # Panics
    /// If the channel is already attached.
    pub fn attach(&self) -> Result<(), HalError> {
        let mut core = self.lock();
        assert!(!core.attached, "capture channel {} already attached", self.radio);
        let sink: Weak<dyn CaptureEvents> = self.me.clone();
        self.hal.attach_capture(self.radio, sink)?;
        core.attached = true;
        core.state = ChannelState::Stop;
        debug!("Radio {} capture attached", self.radio);
        Ok(())
    }

    /// Stop everything and release the capture unit
    pub fn detach(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        if !core.attached {
            return;
        }
        core.state = ChannelState::Stop;
        self.hal.stop_capture(self.radio);
        self.hal.stop_cca(self.radio);
        core.timers.clear();
        self.close_stream(core, EventFlags::empty(), StreamCode::DecodeStop);
        self.hal.detach_capture(self.radio);
        core.attached = false;
        debug!("Radio {} capture detached", self.radio);
    }

    /// Start watching CCA
    pub fn enable(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.state = ChannelState::Ready;
        self.hal.start_cca(self.radio);
        // Channel may already be busy
        if self.hal.read_cca(self.radio) {
            self.arm_cca(core, CcaEdge::Lead, Instant::now());
        }
    }

    /// Stop capture and CCA, closing any open stream
    pub fn disable(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.state = ChannelState::Stop;
        self.hal.stop_capture(self.radio);
        self.hal.stop_cca(self.radio);
        core.timers.clear();
        self.close_stream(core, EventFlags::empty(), StreamCode::DecodeStop);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().timers.next_deadline()
    }

    /// Fire every timer due at `now`. Returns the next pending deadline.
    pub fn service_timers(&self, now: Instant) -> Option<Instant> {
        let mut guard = self.lock();
        let core = &mut *guard;

        if let Some((at, edge)) = core.timers.cca {
            if at <= now {
                core.timers.cca = None;
                self.cca_expired(core, edge, now);
            }
        }

        if let Some(at) = core.timers.stream_idle {
            if at <= now {
                core.timers.stream_idle = None;
                if core.active.is_some() {
                    self.close_stream(core, EventFlags::PWM_NO_DATA, StreamCode::NoData);
                }
            }
        }

        if let Some(at) = core.timers.channel_idle {
            if at <= now {
                core.timers.channel_idle = None;
                if core.active.is_some() {
                    core.timers.channel_idle = Some(now + self.timing.channel_idle);
                } else {
                    self.hal.stop_capture(self.radio);
                    self.events.raise(EventFlags::ICU_SLEEP_TIMEOUT);
                }
            }
        }

        core.timers.next_deadline()
    }

    fn arm_cca(&self, core: &mut ChannelCore, edge: CcaEdge, now: Instant) {
        let delay = match edge {
            CcaEdge::Lead => self.timing.cca_lead,
            CcaEdge::Trail => self.timing.cca_trail,
        };
        core.timers.cca = Some((now + delay, edge));
        let _ = self.wake_tx.try_send(());
    }

    fn cca_expired(&self, core: &mut ChannelCore, edge: CcaEdge, now: Instant) {
        if core.state == ChannelState::Stop {
            return;
        }
        let busy = self.hal.read_cca(self.radio);
        match (edge, busy) {
            (CcaEdge::Lead, true) => self.open_stream(core, now),
            (CcaEdge::Lead, false) => self.events.raise(EventFlags::RADIO_CCA_SPIKE),
            (CcaEdge::Trail, false) => {
                self.close_stream(core, EventFlags::empty(), StreamCode::CcaClose)
            }
            (CcaEdge::Trail, true) => self.events.raise(EventFlags::RADIO_CCA_GLITCH),
        }
    }

    fn notifications(&self, on: bool) {
        self.hal.set_notifications(self.radio, on);
    }

    fn open_stream(&self, core: &mut ChannelCore, now: Instant) {
        if core.active.is_some() {
            self.close_stream(core, EventFlags::PWM_FIFO_REMNANT, StreamCode::Remnant);
        }

        let (writer, lease) = match self.pool.open() {
            Ok(pair) => pair,
            Err(OpenError::NoStream) => {
                self.notifications(false);
                self.hal.set_indicator(self.radio, Indicator::NoStream, true);
                self.events.raise(EventFlags::PWM_FIFO_EMPTY);
                return;
            }
            Err(OpenError::NoSegment) => {
                self.notifications(false);
                self.hal.set_indicator(self.radio, Indicator::NoSegment, true);
                self.events.raise(EventFlags::PWM_BUFFER_FAIL);
                return;
            }
        };
        self.hal.set_indicator(self.radio, Indicator::NoStream, false);
        self.hal.set_indicator(self.radio, Indicator::NoSegment, false);

        let id = writer.stream().id();
        if self.streams.try_send(lease).is_err() {
            // Writer and lease drop here, returning the stream to the pool
            self.notifications(false);
            self.events.raise(EventFlags::PWM_FIFO_EMPTY);
            warn!("Radio {} decoder not taking streams, dropped stream {}", self.radio, id);
            return;
        }

        core.active = Some(writer);
        core.timers.stream_idle = Some(now + self.timing.stream_idle);
        core.timers.channel_idle = Some(now + self.timing.channel_idle);
        let _ = self.wake_tx.try_send(());

        self.hal.start_capture(self.radio);
        self.notifications(true);
        self.hal.set_indicator(self.radio, Indicator::Squelch, true);
        core.state = ChannelState::Active;
        self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.events.raise(EventFlags::PWM_STREAM_OPEN);
        debug!("Radio {} stream {} opened", self.radio, id);
    }

    fn close_stream(&self, core: &mut ChannelCore, event: EventFlags, code: StreamCode) {
        let Some(writer) = core.active.take() else {
            return;
        };
        core.timers.stream_idle = None;
        self.hal.set_indicator(self.radio, Indicator::Squelch, false);
        self.notifications(false);

        let id = writer.stream().id();
        if !writer.terminate(code) {
            self.events.raise(EventFlags::PWM_QUEUE_OVERRUN);
        }
        self.events.raise(event | EventFlags::PWM_STREAM_CLOSE);
        self.stats.streams_closed.fetch_add(1, Ordering::Relaxed);

        if core.state == ChannelState::Active {
            core.state = ChannelState::Ready;
        }
        debug!("Radio {} stream {} closed ({:?})", self.radio, id, code);
    }
}

impl CaptureEvents for CaptureChannel {
    fn cca_edge(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        if core.state == ChannelState::Stop {
            return;
        }

        let now = Instant::now();
        if self.hal.read_cca(self.radio) {
            // Back high while the trail de-glitch runs: keep the stream
            if matches!(core.timers.cca, Some((_, CcaEdge::Trail))) {
                core.timers.cca = None;
            } else {
                self.arm_cca(core, CcaEdge::Lead, now);
            }
        } else if core.state == ChannelState::Active {
            self.arm_cca(core, CcaEdge::Trail, now);
        }
    }

    fn period(&self, width: u16, period: u16) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.timers.stream_idle = None;

        let status = match core.active.as_ref() {
            Some(writer) => writer.stream().status(),
            None => return,
        };
        if status.contains(StreamStatus::DECODE_DONE) {
            self.close_stream(core, EventFlags::empty(), StreamCode::AckDecodeEnd);
            return;
        }
        if status.contains(StreamStatus::DECODE_RESET) {
            self.close_stream(core, EventFlags::empty(), StreamCode::AckDecodeError);
            return;
        }
        if width == 0 {
            self.close_stream(core, EventFlags::empty(), StreamCode::ZeroWidth);
            return;
        }

        let packed = PackedPulse::data(width, period);
        let pushed = match core.active.as_mut() {
            Some(writer) => push_pulse(writer, packed),
            None => return,
        };
        if pushed {
            self.stats.pulses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hal.set_indicator(self.radio, Indicator::Overflow, true);
            self.close_stream(core, EventFlags::PWM_QUEUE_FULL, StreamCode::QueueFull);
        }
    }

    fn overflow(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        self.stats.overflows.fetch_add(1, Ordering::Relaxed);
        if core.active.is_some() {
            self.close_stream(core, EventFlags::ICU_OVERFLOW, StreamCode::IcuOverflow);
        } else {
            self.notifications(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::{Pulse, ReadOutcome};
    use crate::sim::SimRadio;

    const RADIO: RadioId = RadioId(1);
    const NO_WAIT: Duration = Duration::from_millis(0);

    struct Rig {
        sim: Arc<SimRadio>,
        channel: Arc<CaptureChannel>,
        events: Arc<EventSource>,
        leases: Receiver<StreamLease>,
        timing: CaptureTiming,
    }

    fn rig(streams: usize, segments: usize, segment_len: usize) -> Rig {
        let sim = SimRadio::new();
        let events = EventSource::new(RADIO);
        let (tx, leases) = bounded(streams);
        let timing = CaptureTiming::default();
        let channel = CaptureChannel::new(
            RADIO,
            sim.clone(),
            StreamPool::new(RADIO, streams, segments, segment_len),
            tx,
            events.clone(),
            timing,
        );
        channel.attach().unwrap();
        channel.enable();
        Rig {
            sim,
            channel,
            events,
            leases,
            timing,
        }
    }

    impl Rig {
        fn open(&self) -> StreamLease {
            self.sim.set_cca(RADIO, true);
            self.channel
                .service_timers(Instant::now() + self.timing.cca_lead + Duration::from_millis(1));
            assert_eq!(self.channel.state(), ChannelState::Active);
            self.leases.try_recv().unwrap()
        }

        fn drop_carrier(&self) {
            self.sim.set_cca(RADIO, false);
            self.channel
                .service_timers(Instant::now() + self.timing.cca_trail + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_stream_open_and_close() {
        let rig = rig(2, 4, 16);
        let mut lease = rig.open();
        assert!(rig.events.take().contains(EventFlags::PWM_STREAM_OPEN));
        assert!(rig.sim.indicator(RADIO, Indicator::Squelch));

        assert!(rig.sim.pulse(RADIO, 100, 300));
        assert!(rig.sim.pulse(RADIO, 120, 260));
        rig.drop_carrier();

        assert_eq!(lease.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 100, space: 200 }));
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 120, space: 140 }));
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::CcaClose));
        assert_eq!(rig.channel.state(), ChannelState::Ready);
        assert!(rig.events.take().contains(EventFlags::PWM_STREAM_CLOSE));
        assert_eq!(rig.channel.stats().snapshot().pulses, 2);
    }

    #[test]
    fn test_cca_spike_ignored() {
        let rig = rig(1, 2, 16);
        rig.sim.set_cca(RADIO, true);
        rig.sim.set_cca(RADIO, false);
        rig.channel
            .service_timers(Instant::now() + rig.timing.cca_lead + Duration::from_millis(1));

        assert_eq!(rig.channel.state(), ChannelState::Ready);
        assert!(rig.leases.try_recv().is_err());
        assert!(rig.events.take().contains(EventFlags::RADIO_CCA_SPIKE));
    }

    #[test]
    fn test_rising_edge_cancels_trail() {
        let rig = rig(1, 2, 16);
        let _lease = rig.open();
        rig.sim.set_cca(RADIO, false);
        rig.sim.set_cca(RADIO, true);
        rig.channel
            .service_timers(Instant::now() + rig.timing.cca_trail + Duration::from_millis(1));
        assert_eq!(rig.channel.state(), ChannelState::Active);
    }

    #[test]
    fn test_trail_glitch_keeps_stream() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        rig.sim.set_cca(RADIO, false);
        // Line is back up but the rising edge was never reported
        rig.sim.set_cca_level(RADIO, true);
        rig.channel
            .service_timers(Instant::now() + rig.timing.cca_trail + Duration::from_millis(1));

        assert!(rig.events.take().contains(EventFlags::RADIO_CCA_GLITCH));
        assert_eq!(rig.channel.state(), ChannelState::Active);
        assert!(rig.sim.pulse(RADIO, 100, 300));
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 100, space: 200 }));
    }

    #[test]
    fn test_new_stream_closes_remnant() {
        let rig = rig(2, 4, 16);
        let mut first = rig.open();
        rig.sim.pulse(RADIO, 100, 300);
        rig.events.take();

        // Falling edge missed, so the next rising edge starts a new stream
        rig.sim.set_cca_level(RADIO, false);
        rig.sim.set_cca(RADIO, true);
        rig.channel
            .service_timers(Instant::now() + rig.timing.cca_lead + Duration::from_millis(1));

        assert_eq!(first.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 100, space: 200 }));
        assert_eq!(first.read(NO_WAIT), ReadOutcome::End(StreamCode::Remnant));
        let flags = rig.events.take();
        assert!(flags.contains(EventFlags::PWM_FIFO_REMNANT | EventFlags::PWM_STREAM_OPEN));

        let mut second = rig.leases.try_recv().unwrap();
        assert_ne!(second.stream().id(), first.stream().id());
        assert_eq!(rig.channel.state(), ChannelState::Active);
        assert!(rig.sim.pulse(RADIO, 110, 300));
        assert_eq!(second.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 110, space: 190 }));
        assert_eq!(rig.channel.stats().snapshot().streams_opened, 2);
    }

    #[test]
    fn test_stream_dropped_without_decoder() {
        let rig = rig(1, 2, 16);
        let Rig {
            sim,
            channel,
            events,
            leases,
            timing,
        } = rig;
        drop(leases);

        sim.set_cca(RADIO, true);
        channel.service_timers(Instant::now() + timing.cca_lead + Duration::from_millis(1));

        assert!(events.take().contains(EventFlags::PWM_FIFO_EMPTY));
        assert_eq!(channel.state(), ChannelState::Ready);
        assert!(!channel.has_active_stream());
        assert!(!sim.notifications(RADIO));
        assert_eq!(channel.pool().streams_available(), 1);
    }

    #[test]
    fn test_zero_width_closes() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        rig.sim.pulse(RADIO, 0, 100);
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::ZeroWidth));
        assert!(!rig.channel.has_active_stream());
    }

    #[test]
    fn test_no_stream_available() {
        let rig = rig(1, 4, 16);
        let mut first = rig.open();
        rig.sim.pulse(RADIO, 90, 200);
        rig.drop_carrier();
        rig.events.take();

        // First lease is still held by the decoder
        rig.sim.set_cca(RADIO, true);
        rig.channel
            .service_timers(Instant::now() + rig.timing.cca_lead + Duration::from_millis(1));

        assert!(rig.events.take().contains(EventFlags::PWM_FIFO_EMPTY));
        assert_eq!(rig.channel.state(), ChannelState::Ready);
        assert!(!rig.channel.has_active_stream());
        assert!(!rig.sim.notifications(RADIO));
        assert!(rig.sim.indicator(RADIO, Indicator::NoStream));

        assert_eq!(first.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 90, space: 110 }));
        assert_eq!(first.read(NO_WAIT), ReadOutcome::End(StreamCode::CcaClose));
    }

    #[test]
    fn test_decoder_done_ack() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        lease.mark(StreamStatus::DECODE_DONE);
        rig.sim.pulse(RADIO, 100, 300);
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::AckDecodeEnd));
    }

    #[test]
    fn test_queue_full() {
        let rig = rig(1, 1, 2);
        let mut lease = rig.open();
        rig.sim.pulse(RADIO, 100, 300);
        rig.sim.pulse(RADIO, 110, 300);

        assert!(rig.events.take().contains(EventFlags::PWM_QUEUE_FULL));
        assert!(rig.sim.indicator(RADIO, Indicator::Overflow));
        assert!(matches!(lease.read(NO_WAIT), ReadOutcome::Pulse(_)));
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::QueueFull));
    }

    #[test]
    fn test_stream_without_data() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        rig.channel
            .service_timers(Instant::now() + rig.timing.stream_idle + Duration::from_millis(1));
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::NoData));
        assert!(rig.events.take().contains(EventFlags::PWM_NO_DATA));
    }

    #[test]
    fn test_channel_sleeps_when_idle() {
        let rig = rig(1, 2, 16);
        let _lease = rig.open();
        rig.sim.pulse(RADIO, 100, 300);
        rig.drop_carrier();
        assert!(rig.sim.capture_running(RADIO));

        rig.channel
            .service_timers(Instant::now() + rig.timing.channel_idle + Duration::from_millis(1));
        assert!(!rig.sim.capture_running(RADIO));
        assert!(rig.events.take().contains(EventFlags::ICU_SLEEP_TIMEOUT));
    }

    #[test]
    fn test_disable_closes_stream() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        rig.channel.disable();
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::DecodeStop));
        assert_eq!(rig.channel.state(), ChannelState::Stop);

        rig.sim.set_cca(RADIO, false);
        rig.sim.set_cca(RADIO, true);
        assert_eq!(rig.channel.next_deadline(), None);
    }

    #[test]
    fn test_overflow_closes_stream() {
        let rig = rig(1, 2, 16);
        let mut lease = rig.open();
        rig.sim.overflow(RADIO);
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::IcuOverflow));
        assert_eq!(rig.channel.stats().snapshot().overflows, 1);
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_double_attach_panics() {
        let rig = rig(1, 2, 16);
        let _ = rig.channel.attach();
    }
}
