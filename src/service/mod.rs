//! Per-radio packet service
//!
//! - `state`: lifecycle states, receive counters, shared service core
//! - `handler`: the lifecycle state machine
//! - `dispatch`: frame validation and delivery
//! - `callback`: callback workers and their reclaimer
//! - `registry`: radio id to service table

pub mod callback;
pub mod dispatch;
pub mod handler;
pub mod registry;
pub mod state;

pub use callback::{ThreadSpawner, Work, WorkerSpawner};
pub use dispatch::classify;
pub use handler::{PacketService, ServicePorts};
pub use registry::ServiceRegistry;
pub use state::{ReceiveStats, ServiceState, ServiceStatus};
