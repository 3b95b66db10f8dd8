//! Simulated radio hardware and radio manager
//!
//! Drives the pipeline without hardware: [`SimRadio`] stands in for the
//! capture unit and CCA line, [`SimManager`] answers radio commands with
//! scripted verdicts, and [`ByteDemod`] is a demodulator for a pulse
//! encoding where each pulse width carries one byte.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::ax25::{encode_ui_frame, Address};
use crate::capture::Pulse;
use crate::decoder::{DemodEvent, Demodulator};
use crate::error::HalError;
use crate::hal::{
    CaptureEvents, CaptureHal, CommandReply, Encoding, Indicator, RadioCommand, RadioCommander,
    RadioId, RadioRequest,
};

/// Pulse width announcing an opening flag
pub const SYNC_MARK: u16 = 0x200;
/// Pulse width announcing a closing flag
pub const FRAME_END_MARK: u16 = 0x201;
/// Pulse width announcing an abort sequence
pub const ABORT_MARK: u16 = 0x202;

const PULSE_SPACE: u16 = 0x80;

#[derive(Default)]
struct Unit {
    sink: Option<Weak<dyn CaptureEvents>>,
    cca: bool,
    cca_enabled: bool,
    capturing: bool,
    notifications: bool,
    encoding: Encoding,
    indicators: HashSet<Indicator>,
    fail_attach: bool,
}

impl Unit {
    fn live_sink(&self) -> Option<Arc<dyn CaptureEvents>> {
        self.sink.as_ref().and_then(Weak::upgrade)
    }
}

/// Simulated capture units and CCA lines, any number of radios
#[derive(Default)]
pub struct SimRadio {
    units: Mutex<HashMap<RadioId, Unit>>,
}

impl SimRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn units(&self) -> MutexGuard<'_, HashMap<RadioId, Unit>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_unit<T>(&self, radio: RadioId, f: impl FnOnce(&mut Unit) -> T) -> T {
        f(self.units().entry(radio).or_default())
    }

    /// Drive the CCA line. An edge reaches the channel only while CCA
    /// callbacks are enabled.
    pub fn set_cca(&self, radio: RadioId, busy: bool) {
        let sink = self.with_unit(radio, |unit| {
            let changed = unit.cca != busy;
            unit.cca = busy;
            if changed && unit.cca_enabled {
                unit.live_sink()
            } else {
                None
            }
        });
        // Callbacks run without our lock; the channel calls back into us
        if let Some(sink) = sink {
            sink.cca_edge();
        }
    }

    /// Change the CCA level without reporting an edge, as when an edge
    /// is missed
    pub fn set_cca_level(&self, radio: RadioId, busy: bool) {
        self.with_unit(radio, |unit| unit.cca = busy);
    }

    /// Deliver one measured pulse. Returns false if capture would not
    /// have reported it.
    pub fn pulse(&self, radio: RadioId, width: u16, period: u16) -> bool {
        let sink = self.with_unit(radio, |unit| {
            if unit.capturing && unit.notifications {
                unit.live_sink()
            } else {
                None
            }
        });
        match sink {
            Some(sink) => {
                sink.period(width, period);
                true
            }
            None => false,
        }
    }

    pub fn overflow(&self, radio: RadioId) -> bool {
        let sink = self.with_unit(radio, |unit| {
            if unit.capturing && unit.notifications {
                unit.live_sink()
            } else {
                None
            }
        });
        match sink {
            Some(sink) => {
                sink.overflow();
                true
            }
            None => false,
        }
    }

    pub fn fail_next_attach(&self, radio: RadioId) {
        self.with_unit(radio, |unit| unit.fail_attach = true);
    }

    pub fn set_encoding(&self, radio: RadioId, encoding: Encoding) {
        self.with_unit(radio, |unit| unit.encoding = encoding);
    }

    pub fn indicator(&self, radio: RadioId, indicator: Indicator) -> bool {
        self.with_unit(radio, |unit| unit.indicators.contains(&indicator))
    }

    pub fn capture_running(&self, radio: RadioId) -> bool {
        self.with_unit(radio, |unit| unit.capturing)
    }

    pub fn notifications(&self, radio: RadioId) -> bool {
        self.with_unit(radio, |unit| unit.notifications)
    }

    pub fn is_attached(&self, radio: RadioId) -> bool {
        self.with_unit(radio, |unit| unit.live_sink().is_some())
    }
}

impl CaptureHal for SimRadio {
    fn attach_capture(&self, radio: RadioId, sink: Weak<dyn CaptureEvents>) -> Result<(), HalError> {
        self.with_unit(radio, |unit| {
            if unit.fail_attach {
                unit.fail_attach = false;
                return Err(HalError::NoCaptureUnit(radio));
            }
            if unit.live_sink().is_some() {
                return Err(HalError::Busy(radio));
            }
            unit.sink = Some(sink);
            Ok(())
        })
    }

    fn detach_capture(&self, radio: RadioId) {
        self.with_unit(radio, |unit| {
            unit.sink = None;
            unit.capturing = false;
            unit.notifications = false;
            unit.cca_enabled = false;
        });
    }

    fn start_cca(&self, radio: RadioId) {
        self.with_unit(radio, |unit| unit.cca_enabled = true);
    }

    fn stop_cca(&self, radio: RadioId) {
        self.with_unit(radio, |unit| unit.cca_enabled = false);
    }

    fn read_cca(&self, radio: RadioId) -> bool {
        self.with_unit(radio, |unit| unit.cca)
    }

    fn start_capture(&self, radio: RadioId) {
        self.with_unit(radio, |unit| unit.capturing = true);
    }

    fn stop_capture(&self, radio: RadioId) {
        self.with_unit(radio, |unit| unit.capturing = false);
    }

    fn set_notifications(&self, radio: RadioId, enabled: bool) {
        self.with_unit(radio, |unit| unit.notifications = enabled);
    }

    fn link_encoding(&self, radio: RadioId) -> Encoding {
        self.with_unit(radio, |unit| unit.encoding)
    }

    fn set_indicator(&self, radio: RadioId, indicator: Indicator, on: bool) {
        self.with_unit(radio, |unit| {
            if on {
                unit.indicators.insert(indicator);
            } else {
                unit.indicators.remove(&indicator);
            }
        });
    }
}

/// Scripted verdict for a radio command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimReply {
    Accept,
    Reject,
    /// Never answer, so the submitter times out
    Ignore,
}

/// Radio manager task answering commands from a script (default accept)
pub struct SimManager {
    tx: mpsc::Sender<RadioRequest>,
    script: Arc<Mutex<HashMap<RadioCommand, SimReply>>>,
    log: Arc<Mutex<Vec<RadioCommand>>>,
    task: JoinHandle<()>,
}

impl SimManager {
    /// Spawn on the current tokio runtime
    pub fn spawn(depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RadioRequest>(depth.max(1));
        let script = Arc::new(Mutex::new(HashMap::new()));
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let script = script.clone();
            let log = log.clone();
            async move {
                let mut parked: Vec<oneshot::Sender<CommandReply>> = Vec::new();
                while let Some(request) = rx.recv().await {
                    log.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(request.command);
                    let reply = script
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .get(&request.command)
                        .copied()
                        .unwrap_or(SimReply::Accept);
                    trace!(
                        "Sim manager radio {} {:?} -> {:?}",
                        request.radio,
                        request.command,
                        reply
                    );
                    match reply {
                        SimReply::Accept => {
                            let _ = request.reply.send(CommandReply::Accepted);
                        }
                        SimReply::Reject => {
                            let _ = request.reply.send(CommandReply::Rejected);
                        }
                        SimReply::Ignore => parked.push(request.reply),
                    }
                }
            }
        });

        Self {
            tx,
            script,
            log,
            task,
        }
    }

    pub fn commander(&self, timeout: Duration) -> RadioCommander {
        RadioCommander::new(self.tx.clone(), timeout)
    }

    /// Answer every later `command` with `reply`
    pub fn script(&self, command: RadioCommand, reply: SimReply) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command, reply);
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for SimManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Demodulator for the simulated pulse encoding: width `byte + 1` carries
/// a byte, the marks above carry flags
#[derive(Debug, Default)]
pub struct ByteDemod;

impl Demodulator for ByteDemod {
    fn feed(&mut self, pulse: Pulse, out: &mut Vec<DemodEvent>) {
        match pulse.mark {
            SYNC_MARK => out.push(DemodEvent::Sync),
            FRAME_END_MARK => out.push(DemodEvent::FrameEnd),
            ABORT_MARK => out.push(DemodEvent::Abort),
            mark @ 1..=0x100 => out.push(DemodEvent::Byte((mark - 1) as u8)),
            _ => {}
        }
    }

    fn reset(&mut self) {}
}

/// Pulses (width, period) carrying one framed packet
pub fn frame_pulses(frame: &[u8]) -> Vec<(u16, u16)> {
    let pulse = |mark: u16| (mark, mark + PULSE_SPACE);
    let mut pulses = Vec::with_capacity(frame.len() + 2);
    pulses.push(pulse(SYNC_MARK));
    pulses.extend(frame.iter().map(|&b| pulse(b as u16 + 1)));
    pulses.push(pulse(FRAME_END_MARK));
    pulses
}

/// APRS UI frame with FCS
pub fn aprs_frame(source: &str, ssid: u8, info: &[u8]) -> Vec<u8> {
    encode_ui_frame(
        &Address::new("APRS", 0),
        &Address::new(source, ssid),
        &[Address::new("WIDE1", 1)],
        info,
    )
}
