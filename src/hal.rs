//! Radio hardware abstraction consumed by the receive pipeline
//!
//! The capture side talks to the timer/capture unit and the CCA line
//! through [`CaptureHal`]. Radio commands (open/start/stop/close) go to an
//! external radio manager over a bounded command channel.

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::HalError;

/// Identifies one transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RadioId(pub u8);

impl fmt::Display for RadioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// Radio link level encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Encoding {
    #[default]
    Afsk,
    Fsk2,
}

/// Diagnostic outputs driven by the capture channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Squelch,
    Overflow,
    NoStream,
    NoSegment,
}

/// Interrupt-level entry points of a capture channel.
///
/// The hardware layer calls these from interrupt context. Implementations
/// must never block.
pub trait CaptureEvents: Send + Sync {
    /// CCA line changed level
    fn cca_edge(&self);

    /// Capture unit measured one pulse (width and full period in ticks)
    fn period(&self, width: u16, period: u16);

    /// Capture counter overflowed (pulse outside timing bounds)
    fn overflow(&self);
}

/// Timer/capture unit and CCA line of one radio
pub trait CaptureHal: Send + Sync {
    /// Bind the capture unit to a radio and register the interrupt sink
    fn attach_capture(&self, radio: RadioId, sink: Weak<dyn CaptureEvents>)
        -> Result<(), HalError>;

    /// Stop the unit and release the association
    fn detach_capture(&self, radio: RadioId);

    /// Enable CCA edge callbacks
    fn start_cca(&self, radio: RadioId);

    /// Disable CCA edge callbacks
    fn stop_cca(&self, radio: RadioId);

    /// Current CCA level (true = channel busy)
    fn read_cca(&self, radio: RadioId) -> bool;

    fn start_capture(&self, radio: RadioId);

    fn stop_capture(&self, radio: RadioId);

    /// Enable or disable period/overflow notifications
    fn set_notifications(&self, radio: RadioId, enabled: bool);

    /// Configured link encoding of the radio
    fn link_encoding(&self, radio: RadioId) -> Encoding;

    fn set_indicator(&self, _radio: RadioId, _indicator: Indicator, _on: bool) {}
}

/// Receive configuration sent along with radio commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RxConfig {
    pub encoding: Encoding,
    pub base_frequency: u32,
    pub step_hz: u32,
    pub channel: u8,
    pub squelch: u8,
}

/// Commands accepted by the radio manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioCommand {
    RxOpen,
    RxStart,
    RxStop,
    RxClose,
}

/// Radio manager verdict on a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    Accepted,
    Rejected,
}

/// Outcome of a bounded command submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    TimedOut,
    Rejected,
}

/// Request posted to the radio manager
#[derive(Debug)]
pub struct RadioRequest {
    pub radio: RadioId,
    pub command: RadioCommand,
    pub config: RxConfig,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Submits commands to the radio manager with a bounded wait
#[derive(Debug, Clone)]
pub struct RadioCommander {
    tx: mpsc::Sender<RadioRequest>,
    timeout: Duration,
}

impl RadioCommander {
    pub fn new(tx: mpsc::Sender<RadioRequest>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Submit a command and wait for the manager's verdict.
    ///
    /// Waiting for queue space counts against the same timeout. A manager
    /// that drops the request without replying is treated as a rejection.
    pub async fn submit(
        &self,
        radio: RadioId,
        command: RadioCommand,
        config: RxConfig,
    ) -> CommandOutcome {
        let (reply, reply_rx) = oneshot::channel();
        let request = RadioRequest {
            radio,
            command,
            config,
            reply,
        };

        let exchange = async {
            if self.tx.send(request).await.is_err() {
                return CommandOutcome::Rejected;
            }
            match reply_rx.await {
                Ok(CommandReply::Accepted) => CommandOutcome::Accepted,
                Ok(CommandReply::Rejected) | Err(_) => CommandOutcome::Rejected,
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(outcome) => {
                debug!("Radio {} command {:?} -> {:?}", radio, command, outcome);
                outcome
            }
            Err(_) => CommandOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_outcomes() {
        let (tx, mut rx) = mpsc::channel::<RadioRequest>(4);
        let commander = RadioCommander::new(tx, Duration::from_millis(50));

        let manager = tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Some(req) = rx.recv().await {
                match req.command {
                    RadioCommand::RxOpen => {
                        let _ = req.reply.send(CommandReply::Accepted);
                    }
                    RadioCommand::RxStart => {
                        let _ = req.reply.send(CommandReply::Rejected);
                    }
                    _ => parked.push(req),
                }
            }
        });

        let radio = RadioId(1);
        let cfg = RxConfig::default();
        assert_eq!(
            commander.submit(radio, RadioCommand::RxOpen, cfg).await,
            CommandOutcome::Accepted
        );
        assert_eq!(
            commander.submit(radio, RadioCommand::RxStart, cfg).await,
            CommandOutcome::Rejected
        );
        assert_eq!(
            commander.submit(radio, RadioCommand::RxStop, cfg).await,
            CommandOutcome::TimedOut
        );

        drop(commander);
        manager.abort();
    }

    #[test]
    fn test_radio_id_display() {
        assert_eq!(RadioId(1).to_string(), "01");
    }
}
