//! Packet radio receive pipeline
//!
//! Captures pulse-width encoded AFSK from the radio through an interrupt
//! driven capture channel, streams the pulses to a decoder task through
//! chained pulse segments, validates decoded AX.25 frames and delivers them
//! to a consumer either through a pull queue or a callback worker.
//!
//! Data flow:
//! 1. CCA edge is de-glitched and opens a pulse stream
//! 2. Period callbacks pack pulses into the stream's segment chain
//! 3. The decoder task drains the chain and assembles frame buffers
//! 4. Frames are validated (structure + CRC-16) and dispatched
//! 5. Callback workers are reclaimed by a per-radio reclaimer

pub mod ax25;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod diag;
pub mod error;
pub mod hal;
pub mod service;
pub mod sim;

pub use config::Config;
pub use error::{AcquireError, HalError, PoolError, ServiceError};
pub use hal::{Encoding, RadioId};
pub use service::{PacketService, ServiceRegistry, ServiceState};
