//! Thread firing a capture channel's one-shot timers

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::debug;

use super::CaptureChannel;

/// Longest sleep when no timer is armed
const IDLE_WAIT: Duration = Duration::from_millis(500);

pub struct TimerDriver {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TimerDriver {
    pub fn spawn(channel: Arc<CaptureChannel>) -> std::io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let wake = channel.timer_wake();
        let handle = thread::Builder::new()
            .name(format!("pkt_tmr_{}", channel.radio()))
            .spawn(move || run_timers(channel, wake, shutdown_rx))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

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

impl Drop for TimerDriver {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_timers(channel: Arc<CaptureChannel>, wake: Receiver<()>, shutdown: Receiver<()>) {
    debug!("Radio {} timer driver started", channel.radio());
    loop {
        let wait = match channel.service_timers(Instant::now()) {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => IDLE_WAIT,
        };
        select! {
            recv(wake) -> _ => {}
            recv(shutdown) -> _ => break,
            default(wait) => {}
        }
    }
    debug!("Radio {} timer driver stopped", channel.radio());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureTiming, ChannelState, StreamPool};
    use crate::diag::EventSource;
    use crate::hal::RadioId;
    use crate::sim::SimRadio;

    #[test]
    fn test_driver_opens_stream() {
        let radio = RadioId(3);
        let sim = SimRadio::new();
        let (tx, leases) = bounded(1);
        let channel = CaptureChannel::new(
            radio,
            sim.clone(),
            StreamPool::new(radio, 1, 2, 16),
            tx,
            EventSource::new(radio),
            CaptureTiming::default(),
        );
        channel.attach().unwrap();
        channel.enable();

        let driver = TimerDriver::spawn(channel.clone()).unwrap();
        sim.set_cca(radio, true);

        let lease = leases.recv_timeout(Duration::from_secs(2));
        assert!(lease.is_ok());
        assert_eq!(channel.state(), ChannelState::Active);
        driver.stop();
    }
}
