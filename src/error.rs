//! Error types for the receive pipeline

use thiserror::Error;

use crate::hal::{RadioCommand, RadioId};
use crate::service::ServiceState;

/// Failures of task-context packet service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Operation not valid in the current state. Nothing was changed.
    #[error("{op} rejected for radio {radio} in state {state}")]
    Rejected {
        radio: RadioId,
        op: &'static str,
        state: ServiceState,
    },

    #[error("radio {radio} timed out waiting for {waiting_for}")]
    TimedOut {
        radio: RadioId,
        waiting_for: &'static str,
    },

    #[error("radio {radio} rejected command {command:?}")]
    CommandRejected { radio: RadioId, command: RadioCommand },

    #[error("no packet service for radio {0}")]
    NoSuchRadio(RadioId),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("failed to create {what} for radio {radio}")]
    Resource {
        radio: RadioId,
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hal(#[from] HalError),
}

impl ServiceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::CommandRejected { .. })
    }
}

/// Failure to obtain a unit of the common buffer resource
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("timed out waiting for a common packet buffer")]
    Timeout,

    /// The resource was torn down. Waiters never succeed after this.
    #[error("common packet buffer control was reset")]
    Reset,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("frame pool {0} exhausted")]
    Exhausted(String),

    #[error("frame buffer full")]
    BufferFull,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("no capture unit for radio {0}")]
    NoCaptureUnit(RadioId),

    #[error("capture unit for radio {0} already attached")]
    Busy(RadioId),
}
