//! Buffer pools shared across the receive pipeline

pub mod control;
pub mod frame;

pub use control::{BufferControl, TxBuffer};
pub use frame::{rx_pool_name, FrameBuffer, FrameCallback, FramePool, FrameStatus, PoolRegistry};
