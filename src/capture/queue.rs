//! Chained pulse segments carrying one capture session to the decoder
//!
//! A [`PulseStream`] is one continuous capture session. Its pulses live in
//! a chain of fixed-capacity [`PulseSegment`]s. The capture side holds a
//! [`StreamWriter`] on the tail segment; the decoder holds the matching
//! [`StreamLease`] and reads from the head. A segment's `next` link is set
//! once, before the in-band swap marker that tells the reader to follow it.
//!
//! The stream object and its segments come from a per-radio
//! [`StreamPool`]. Claiming never blocks. Budget is returned when the
//! reader moves past a segment and, for the rest of the chain, when the
//! last of writer and lease is dropped, so every claim is returned exactly
//! once on every exit path.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};

use super::pulse::{PackedPulse, Pulse, PulseRecord, StreamCode};
use crate::hal::RadioId;

bitflags! {
    /// Status shared by the capture side and the decoder
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamStatus: u32 {
        const STREAM_CLOSED = 1 << 0;
        /// Decoder has closed its frame; capture may end the stream
        const DECODE_DONE = 1 << 1;
        /// Decoder abandoned the stream; capture should end it
        const DECODE_RESET = 1 << 2;
    }
}

/// Result of writing a data record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWrite {
    Written,
    /// Only the slot reserved for an in-band record is left
    NeedsSwap,
    Full,
}

/// One fixed-capacity link of a pulse chain
pub struct PulseSegment {
    tx: Sender<PackedPulse>,
    rx: Receiver<PackedPulse>,
    next: OnceLock<Arc<PulseSegment>>,
}

impl PulseSegment {
    fn new(len: usize) -> Arc<Self> {
        let (tx, rx) = bounded(len);
        Arc::new(Self {
            tx,
            rx,
            next: OnceLock::new(),
        })
    }

    fn write_data(&self, pulse: PackedPulse) -> QueueWrite {
        let capacity = self.tx.capacity().unwrap_or(usize::MAX);
        let len = self.tx.len();
        if len >= capacity {
            return QueueWrite::Full;
        }
        if len + 1 >= capacity {
            return QueueWrite::NeedsSwap;
        }
        match self.tx.try_send(pulse) {
            Ok(()) => QueueWrite::Written,
            Err(_) => QueueWrite::Full,
        }
    }

    fn write_in_band(&self, code: StreamCode) -> bool {
        self.tx.try_send(PackedPulse::in_band(code)).is_ok()
    }

    fn link(&self, next: Arc<PulseSegment>) {
        let linked = self.next.set(next).is_ok();
        assert!(linked, "pulse segment linked twice");
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

struct PoolState {
    radio: RadioId,
    streams_free: AtomicUsize,
    segments_free: AtomicUsize,
    segment_len: usize,
    next_id: AtomicU64,
}

fn try_take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Why a stream could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    NoStream,
    NoSegment,
}

/// Per-radio budget of stream objects and pulse segments
#[derive(Clone)]
pub struct StreamPool {
    state: Arc<PoolState>,
}

impl StreamPool {
    pub fn new(radio: RadioId, streams: usize, segments: usize, segment_len: usize) -> Self {
        assert!(segment_len >= 2, "segment must hold data plus an in-band record");
        Self {
            state: Arc::new(PoolState {
                radio,
                streams_free: AtomicUsize::new(streams),
                segments_free: AtomicUsize::new(segments),
                segment_len,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn radio(&self) -> RadioId {
        self.state.radio
    }

    pub fn streams_available(&self) -> usize {
        self.state.streams_free.load(Ordering::Acquire)
    }

    pub fn segments_available(&self) -> usize {
        self.state.segments_free.load(Ordering::Acquire)
    }

    /// Claim a stream object and its first segment. Never blocks.
    pub fn open(&self) -> Result<(StreamWriter, StreamLease), OpenError> {
        if !try_take(&self.state.streams_free) {
            return Err(OpenError::NoStream);
        }
        if !try_take(&self.state.segments_free) {
            self.state.streams_free.fetch_add(1, Ordering::AcqRel);
            return Err(OpenError::NoSegment);
        }

        let head = PulseSegment::new(self.state.segment_len);
        let (closed_tx, closed_rx) = bounded(1);
        let stream = Arc::new(PulseStream {
            id: self.state.next_id.fetch_add(1, Ordering::Relaxed),
            status: AtomicU32::new(0),
            claimed: AtomicU32::new(1),
            released: AtomicU32::new(0),
            peak: AtomicU32::new(1),
            closed_tx,
            closed_rx,
            pool: self.clone(),
        });

        let writer = StreamWriter {
            stream: stream.clone(),
            tail: head.clone(),
        };
        let lease = StreamLease {
            stream,
            current: head,
            closing: None,
            ended: None,
        };
        Ok((writer, lease))
    }
}

/// One capture session shared by writer and lease
pub struct PulseStream {
    id: u64,
    status: AtomicU32,
    claimed: AtomicU32,
    released: AtomicU32,
    peak: AtomicU32,
    closed_tx: Sender<StreamCode>,
    closed_rx: Receiver<StreamCode>,
    pool: StreamPool,
}

impl PulseStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: StreamStatus) {
        self.status.fetch_or(status.bits(), Ordering::AcqRel);
    }

    pub fn segments_claimed(&self) -> u32 {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn segments_released(&self) -> u32 {
        self.released.load(Ordering::Acquire)
    }

    /// Most segments outstanding at once
    pub fn peak_outstanding(&self) -> u32 {
        self.peak.load(Ordering::Acquire)
    }

    fn note_claimed(&self) {
        let claimed = self.claimed.fetch_add(1, Ordering::AcqRel) + 1;
        let outstanding = claimed - self.released.load(Ordering::Acquire);
        self.peak.fetch_max(outstanding, Ordering::AcqRel);
    }

    fn note_released(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.pool.state.segments_free.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for PulseStream {
    fn drop(&mut self) {
        let outstanding = self.claimed.get_mut().saturating_sub(*self.released.get_mut());
        let state = &self.pool.state;
        state
            .segments_free
            .fetch_add(outstanding as usize, Ordering::AcqRel);
        state.streams_free.fetch_add(1, Ordering::AcqRel);
    }
}

/// Capture side of a stream, positioned on the tail segment
pub struct StreamWriter {
    stream: Arc<PulseStream>,
    tail: Arc<PulseSegment>,
}

impl StreamWriter {
    pub fn stream(&self) -> &PulseStream {
        &self.stream
    }

    pub fn write(&self, pulse: PackedPulse) -> QueueWrite {
        self.tail.write_data(pulse)
    }

    /// Chain one more segment behind the tail and move writing there.
    ///
    /// Uses the tail's reserved slot for the swap marker. Never blocks;
    /// returns false when no segment is available.
    pub fn extend(&mut self) -> bool {
        let state = &self.stream.pool.state;
        if !try_take(&state.segments_free) {
            return false;
        }
        let next = PulseSegment::new(state.segment_len);
        self.tail.link(next.clone());
        self.stream.note_claimed();

        if !self.tail.write_in_band(StreamCode::BufferSwap) {
            // Linked segment stays claimed and returns with the stream
            return false;
        }
        self.tail = next;
        true
    }

    /// Write the end marker and signal the completion token.
    ///
    /// Returns false if the end marker did not fit. The token is signalled
    /// regardless so the reader can still finish.
    pub fn terminate(self, code: StreamCode) -> bool {
        let written = self.tail.write_in_band(code);
        self.stream.set_status(StreamStatus::STREAM_CLOSED);
        let _ = self.stream.closed_tx.try_send(code);
        written
    }
}

/// What the decoder read from a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Pulse(Pulse),
    /// Stream ended with this code. Repeated reads keep returning it.
    End(StreamCode),
    /// Unknown in-band record or a swap with no linked segment
    Invalid(u16),
    /// Nothing arrived within the timeout
    Idle,
}

/// Decoder side of a stream
pub struct StreamLease {
    stream: Arc<PulseStream>,
    current: Arc<PulseSegment>,
    closing: Option<StreamCode>,
    ended: Option<StreamCode>,
}

impl StreamLease {
    pub fn stream(&self) -> &PulseStream {
        &self.stream
    }

    /// Flag decoder status for the capture side
    pub fn mark(&self, status: StreamStatus) {
        self.stream.set_status(status);
    }

    /// Read the next record in capture order, following swap markers.
    pub fn read(&mut self, timeout: Duration) -> ReadOutcome {
        if let Some(code) = self.ended {
            return ReadOutcome::End(code);
        }
        let deadline = Instant::now() + timeout;

        loop {
            match self.current.rx.try_recv() {
                Ok(packed) => {
                    if let Some(outcome) = self.accept(packed) {
                        return outcome;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            // Closed and drained without a readable end marker
            if let Some(code) = self.closing {
                self.ended = Some(code);
                return ReadOutcome::End(code);
            }

            let data = self.current.rx.clone();
            let closed = self.stream.closed_rx.clone();
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(data) -> msg => {
                    if let Ok(packed) = msg {
                        if let Some(outcome) = self.accept(packed) {
                            return outcome;
                        }
                    }
                }
                recv(closed) -> msg => {
                    if let Ok(code) = msg {
                        self.closing = Some(code);
                    }
                }
                default(remaining) => return ReadOutcome::Idle,
            }
        }
    }

    /// Wait for the capture side to signal the stream closed
    pub fn wait_closed(&mut self, timeout: Duration) -> Option<StreamCode> {
        if self.closing.is_none() {
            self.closing = self.stream.closed_rx.recv_timeout(timeout).ok();
        }
        self.closing
    }

    fn accept(&mut self, packed: PackedPulse) -> Option<ReadOutcome> {
        match packed.record() {
            PulseRecord::Pulse(pulse) => Some(ReadOutcome::Pulse(pulse)),
            PulseRecord::InBand(StreamCode::BufferSwap) => match self.current.next.get() {
                Some(next) => {
                    let next = next.clone();
                    self.current = next;
                    self.stream.note_released();
                    None
                }
                None => Some(ReadOutcome::Invalid(StreamCode::BufferSwap as u16)),
            },
            PulseRecord::InBand(code) => {
                self.ended = Some(code);
                Some(ReadOutcome::End(code))
            }
            PulseRecord::Invalid(raw) => Some(ReadOutcome::Invalid(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn pulse(mark: u16) -> PackedPulse {
        PackedPulse::data(mark, mark + 10)
    }

    fn write_all(writer: &mut StreamWriter, marks: impl IntoIterator<Item = u16>) {
        for mark in marks {
            match writer.write(pulse(mark)) {
                QueueWrite::Written => {}
                QueueWrite::NeedsSwap => {
                    assert!(writer.extend());
                    assert_eq!(writer.write(pulse(mark)), QueueWrite::Written);
                }
                QueueWrite::Full => panic!("segment full"),
            }
        }
    }

    #[test]
    fn test_order_across_segments() {
        let pool = StreamPool::new(RadioId(1), 1, 4, 4);
        let (mut writer, mut lease) = pool.open().unwrap();

        write_all(&mut writer, 1..=10);
        assert!(writer.terminate(StreamCode::CcaClose));

        let mut marks = Vec::new();
        let mut ends = 0;
        loop {
            match lease.read(NO_WAIT) {
                ReadOutcome::Pulse(p) => marks.push(p.mark),
                ReadOutcome::End(code) => {
                    assert_eq!(code, StreamCode::CcaClose);
                    ends += 1;
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(marks, (1..=10).collect::<Vec<_>>());
        assert_eq!(ends, 1);
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::End(StreamCode::CcaClose));
        assert_eq!(lease.wait_closed(NO_WAIT), Some(StreamCode::CcaClose));
    }

    #[test]
    fn test_budget_returned_once() {
        let pool = StreamPool::new(RadioId(1), 1, 3, 2);
        let (mut writer, lease) = pool.open().unwrap();
        assert_eq!(pool.streams_available(), 0);

        write_all(&mut writer, 1..=3);
        assert_eq!(writer.stream().segments_claimed(), 3);
        assert_eq!(pool.segments_available(), 0);

        // Chain cannot grow further
        assert_eq!(writer.write(pulse(4)), QueueWrite::NeedsSwap);
        assert!(!writer.extend());

        writer.terminate(StreamCode::QueueFull);
        assert_eq!(pool.streams_available(), 0);
        drop(lease);
        assert_eq!(pool.streams_available(), 1);
        assert_eq!(pool.segments_available(), 3);
    }

    #[test]
    fn test_reader_releases_segments() {
        let pool = StreamPool::new(RadioId(1), 1, 2, 2);
        let (mut writer, mut lease) = pool.open().unwrap();

        write_all(&mut writer, [1, 2]);
        assert_eq!(pool.segments_available(), 0);
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 1, space: 10 }));
        // Reading past the swap hands the first segment back
        assert_eq!(lease.read(NO_WAIT), ReadOutcome::Pulse(Pulse { mark: 2, space: 10 }));
        assert_eq!(pool.segments_available(), 1);

        write_all(&mut writer, [3, 4]);
        assert_eq!(writer.stream().segments_claimed(), 3);
        assert_eq!(writer.stream().segments_released(), 1);
        assert_eq!(writer.stream().peak_outstanding(), 2);

        drop(writer);
        drop(lease);
        assert_eq!(pool.segments_available(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let pool = StreamPool::new(RadioId(1), 1, 1, 8);
        let first = pool.open().unwrap();
        assert_eq!(pool.open().err(), Some(OpenError::NoStream));
        drop(first);

        let pool = StreamPool::new(RadioId(1), 2, 1, 8);
        let _first = pool.open().unwrap();
        assert_eq!(pool.open().err(), Some(OpenError::NoSegment));
        assert_eq!(pool.streams_available(), 1);
    }

    #[test]
    fn test_closed_without_marker() {
        let pool = StreamPool::new(RadioId(1), 1, 1, 4);
        let (writer, mut lease) = pool.open().unwrap();
        assert_eq!(writer.write(pulse(7)), QueueWrite::Written);

        // Token alone, as when the end marker did not fit
        writer.stream.set_status(StreamStatus::STREAM_CLOSED);
        writer.stream.closed_tx.try_send(StreamCode::QueueFull).unwrap();
        drop(writer);

        assert!(matches!(lease.read(NO_WAIT), ReadOutcome::Pulse(_)));
        assert_eq!(
            lease.read(Duration::from_millis(10)),
            ReadOutcome::End(StreamCode::QueueFull)
        );
    }

    #[test]
    fn test_idle_read() {
        let pool = StreamPool::new(RadioId(1), 1, 1, 4);
        let (_writer, mut lease) = pool.open().unwrap();
        assert_eq!(lease.read(Duration::from_millis(5)), ReadOutcome::Idle);
    }
}
