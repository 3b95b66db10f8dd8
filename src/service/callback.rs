//! Callback workers and the completion reclaimer
//!
//! Each delivered frame with a registered callback runs on its own short
//! lived worker. The worker runs the callback, then hands its frame and
//! its own join handle to the per-radio reclaimer, which joins the worker,
//! returns the frame to its pool and decrements the outstanding count.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use tracing::{debug, error, trace};

use super::state::ServiceShared;
use crate::buffer::FrameBuffer;
use crate::diag::EventFlags;

/// Reclaimer poll interval while idle
const RECLAIM_POLL: Duration = Duration::from_millis(100);

/// How long a worker waits to learn its own handle
const HANDLE_WAIT: Duration = Duration::from_secs(1);

pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Creates callback workers
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, name: String, work: Work) -> io::Result<JoinHandle<()>>;
}

/// Spawns each worker as an OS thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, name: String, work: Work) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(work)
    }
}

/// Finished worker waiting to be reclaimed
pub(crate) struct Completion {
    pub frame: FrameBuffer,
    pub worker: Option<JoinHandle<()>>,
}

impl ServiceShared {
    /// Run the frame's callback on a new worker.
    ///
    /// The outstanding count is raised before the worker exists so the
    /// reclaimer can never see it drop below zero. If the worker cannot be
    /// created the frame goes straight back to its pool.
    pub(crate) fn spawn_callback(&self, frame: FrameBuffer) {
        self.lock().callbacks_outstanding += 1;

        let (handle_tx, handle_rx) = bounded::<JoinHandle<()>>(1);
        let completions = self.completions_tx().clone();
        let radio = self.radio;
        let work: Work = Box::new(move || run_worker(frame, handle_rx, completions, radio));

        match self.spawner.spawn(format!("pkt_cb_{}", self.radio), work) {
            Ok(handle) => {
                let _ = handle_tx.send(handle);
            }
            Err(e) => {
                {
                    let mut core = self.lock();
                    core.callbacks_outstanding = core.callbacks_outstanding.saturating_sub(1);
                }
                error!("Radio {} failed to create callback worker: {}", self.radio, e);
                self.events.raise(EventFlags::PKT_FAILED_CB_THD);
            }
        }
    }
}

fn run_worker(
    frame: FrameBuffer,
    handle_rx: Receiver<JoinHandle<()>>,
    completions: Sender<Completion>,
    radio: crate::hal::RadioId,
) {
    if let Some(callback) = frame.callback().cloned() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&frame)));
        if result.is_err() {
            error!("Radio {} frame callback panicked", radio);
        }
    }
    let worker = handle_rx.recv_timeout(HANDLE_WAIT).ok();
    let _ = completions.send(Completion { frame, worker });
}

/// Per-radio thread reclaiming finished callback workers
pub(crate) struct Reclaimer {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn spawn(shared: Arc<ServiceShared>) -> io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let completions = shared.completions_rx().clone();
        let handle = thread::Builder::new()
            .name(format!("pkt_rcl_{}", shared.radio))
            .spawn(move || run_reclaimer(shared, completions, shutdown_rx))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Ask the reclaimer to exit once every outstanding worker is reclaimed
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_reclaimer(shared: Arc<ServiceShared>, completions: Receiver<Completion>, shutdown: Receiver<()>) {
    debug!("Radio {} reclaimer started", shared.radio);
    let mut terminating = false;

    loop {
        if terminating && shared.callbacks_outstanding() == 0 {
            break;
        }
        let shutdown_rx = if terminating { never() } else { shutdown.clone() };

        select! {
            recv(completions) -> completion => {
                if let Ok(completion) = completion {
                    reclaim(&shared, completion);
                }
            }
            recv(shutdown_rx) -> _ => terminating = true,
            default(RECLAIM_POLL) => {}
        }
    }
    debug!("Radio {} reclaimer stopped", shared.radio);
}

fn reclaim(shared: &ServiceShared, completion: Completion) {
    let Completion { frame, worker } = completion;
    if let Some(worker) = worker {
        let _ = worker.join();
    }
    drop(frame);

    let mut core = shared.lock();
    core.callbacks_outstanding = core.callbacks_outstanding.saturating_sub(1);
    trace!(
        "Radio {} callback reclaimed, {} outstanding",
        shared.radio,
        core.callbacks_outstanding
    );
}
