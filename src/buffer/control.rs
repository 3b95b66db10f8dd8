//! System-wide counting resource for transmit/analysis buffers
//!
//! Every [`TxBuffer`] holds one permit of a fair (FIFO) semaphore and gives
//! it back when dropped, so each allocate-then-free cycle releases exactly
//! once on every path. Teardown takes every permit, then closes the
//! semaphore so pending and future waiters fail with
//! [`AcquireError::Reset`] instead of waiting forever.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::error::AcquireError;

pub struct BufferControl {
    permits: Arc<Semaphore>,
    max: u32,
    buffer_len: usize,
}

impl BufferControl {
    pub fn new(max: usize, buffer_len: usize) -> Self {
        let max = max.min(Semaphore::MAX_PERMITS).min(u32::MAX as usize);
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max: max as u32,
            buffer_len,
        }
    }

    pub fn max(&self) -> usize {
        self.max as usize
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_reset(&self) -> bool {
        self.permits.is_closed()
    }

    /// Allocate a buffer, waiting in arrival order for a free unit.
    ///
    /// `None` waits indefinitely.
    pub async fn allocate(&self, timeout: Option<Duration>) -> Result<TxBuffer, AcquireError> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| AcquireError::Timeout)?,
            None => acquire.await,
        }
        .map_err(|_| AcquireError::Reset)?;

        Ok(TxBuffer {
            data: Vec::with_capacity(self.buffer_len),
            _permit: permit,
        })
    }

    pub fn try_allocate(&self) -> Result<TxBuffer, AcquireError> {
        let permit = self.permits.clone().try_acquire_owned().map_err(|e| match e {
            TryAcquireError::Closed => AcquireError::Reset,
            TryAcquireError::NoPermits => AcquireError::Timeout,
        })?;
        Ok(TxBuffer {
            data: Vec::with_capacity(self.buffer_len),
            _permit: permit,
        })
    }

    /// Wait for every outstanding buffer, then reset the resource
    pub async fn shutdown(&self) {
        match self.permits.acquire_many(self.max).await {
            Ok(all) => {
                debug!("Buffer control drained ({} units)", self.max);
                self.permits.close();
                drop(all);
            }
            Err(_) => self.permits.close(),
        }
        info!("Buffer control reset");
    }
}

/// Buffer holding one unit of the common resource
#[derive(Debug)]
pub struct TxBuffer {
    data: Vec<u8>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for TxBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for TxBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}
