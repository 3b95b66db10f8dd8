//! Per-radio service state shared by the handler, the decoder and workers

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

use super::callback::{Completion, WorkerSpawner};
use crate::buffer::{FrameBuffer, FrameCallback, FramePool};
use crate::diag::EventSource;
use crate::hal::{RadioId, RxConfig};

/// Packet service lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Idle,
    Ready,
    Open,
    Pause,
    Decode,
    Stop,
    Close,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Ready => "READY",
            Self::Open => "OPEN",
            Self::Pause => "PAUSE",
            Self::Decode => "DECODE",
            Self::Stop => "STOP",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Receive counters, reset on each open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    /// Frame buffers opened on a sync
    pub sync: u64,
    /// Frames handed to the dispatcher
    pub frames: u64,
    /// Frames with valid structure
    pub valid: u64,
    /// Valid frames with a good CRC
    pub good: u64,
}

/// Snapshot of a service for reporting
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub radio: RadioId,
    pub state: ServiceState,
    pub rx: RxConfig,
    pub stats: ReceiveStats,
    pub callbacks_outstanding: usize,
}

pub(crate) struct ServiceCore {
    pub state: ServiceState,
    pub rx: RxConfig,
    pub stats: ReceiveStats,
    pub frames: Option<Arc<FramePool>>,
    pub callback: Option<FrameCallback>,
    pub callbacks_outstanding: usize,
}

/// Service state reachable from the decode thread, workers and reclaimer
pub(crate) struct ServiceShared {
    pub radio: RadioId,
    pub events: Arc<EventSource>,
    pub spawner: Arc<dyn WorkerSpawner>,
    core: Mutex<ServiceCore>,
    deliveries_tx: Sender<FrameBuffer>,
    deliveries_rx: Receiver<FrameBuffer>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
}

impl ServiceShared {
    pub fn new(radio: RadioId, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        let (deliveries_tx, deliveries_rx) = unbounded();
        let (completions_tx, completions_rx) = unbounded();
        Arc::new(Self {
            radio,
            events: EventSource::new(radio),
            spawner,
            core: Mutex::new(ServiceCore {
                state: ServiceState::Idle,
                rx: RxConfig::default(),
                stats: ReceiveStats::default(),
                frames: None,
                callback: None,
                callbacks_outstanding: 0,
            }),
            deliveries_tx,
            deliveries_rx,
            completions_tx,
            completions_rx,
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ServiceCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state
    }

    pub fn set_state(&self, state: ServiceState) {
        self.lock().state = state;
    }

    pub fn callbacks_outstanding(&self) -> usize {
        self.lock().callbacks_outstanding
    }

    pub fn deliveries(&self) -> &Receiver<FrameBuffer> {
        &self.deliveries_rx
    }

    pub fn deliver_to_queue(&self, frame: FrameBuffer) {
        // Receiver lives as long as self
        let _ = self.deliveries_tx.send(frame);
    }

    pub fn completions_tx(&self) -> &Sender<Completion> {
        &self.completions_tx
    }

    pub fn completions_rx(&self) -> &Receiver<Completion> {
        &self.completions_rx
    }
}
