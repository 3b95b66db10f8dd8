//! Frame buffers and their named per-radio pools
//!
//! A [`FramePool`] keeps a fixed number of byte buffers on a free list.
//! Acquiring moves one into a [`FrameBuffer`] which holds a reference to
//! its pool; dropping the frame puts the bytes back. A pool lives as long
//! as its last holder, service or frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::error::PoolError;
use crate::hal::RadioId;

bitflags! {
    /// Validation result OR-ed into a frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameStatus: u8 {
        const FRAME_RDY = 1 << 0;
        const CRC_ERROR = 1 << 1;
        const INVALID_FRAME = 1 << 2;
    }
}

/// Consumer callback run on a worker for each delivered frame
pub type FrameCallback = Arc<dyn Fn(&FrameBuffer) + Send + Sync>;

/// Fixed-capacity pool of frame buffers
pub struct FramePool {
    name: String,
    capacity: usize,
    frame_len: usize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl FramePool {
    pub fn new(name: impl Into<String>, capacity: usize, frame_len: usize) -> Arc<Self> {
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = free_tx.try_send(Vec::with_capacity(frame_len));
        }
        Arc::new(Self {
            name: name.into(),
            capacity,
            frame_len,
            free_tx,
            free_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Buffers currently on the free list
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Take a buffer without waiting
    pub fn try_acquire(self: &Arc<Self>, radio: RadioId) -> Result<FrameBuffer, PoolError> {
        match self.free_rx.try_recv() {
            Ok(data) => Ok(self.wrap(radio, data)),
            Err(_) => Err(PoolError::Exhausted(self.name.clone())),
        }
    }

    /// Take a buffer, waiting up to `timeout` for one to be returned
    pub fn acquire_timeout(
        self: &Arc<Self>,
        radio: RadioId,
        timeout: Duration,
    ) -> Result<FrameBuffer, PoolError> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(data) => Ok(self.wrap(radio, data)),
            Err(_) => Err(PoolError::Exhausted(self.name.clone())),
        }
    }

    fn wrap(self: &Arc<Self>, radio: RadioId, data: Vec<u8>) -> FrameBuffer {
        FrameBuffer {
            data,
            pool: self.clone(),
            radio,
            status: FrameStatus::empty(),
            callback: None,
            received_at: Utc::now(),
        }
    }

    fn put(&self, mut data: Vec<u8>) {
        data.clear();
        let _ = self.free_tx.try_send(data);
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// One decoded candidate frame
pub struct FrameBuffer {
    data: Vec<u8>,
    pool: Arc<FramePool>,
    radio: RadioId,
    status: FrameStatus,
    callback: Option<FrameCallback>,
    received_at: DateTime<Utc>,
}

impl FrameBuffer {
    /// Append one decoded byte
    pub fn store(&mut self, byte: u8) -> Result<(), PoolError> {
        if self.data.len() >= self.pool.frame_len {
            return Err(PoolError::BufferFull);
        }
        self.data.push(byte);
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn radio(&self) -> RadioId {
        self.radio
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FrameStatus) {
        self.status |= status;
    }

    pub fn callback(&self) -> Option<&FrameCallback> {
        self.callback.as_ref()
    }

    pub fn set_callback(&mut self, callback: Option<FrameCallback>) {
        self.callback = callback;
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Stamp the end of reception
    pub fn mark_received(&mut self) {
        self.received_at = Utc::now();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("radio", &self.radio)
            .field("len", &self.data.len())
            .field("status", &self.status)
            .field("received_at", &self.received_at)
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.data));
    }
}

/// Name of a radio's receive pool
pub fn rx_pool_name(radio: RadioId) -> String {
    format!("pkt_rx_{}", radio)
}

/// Pools looked up by name, created by the first accessor
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Weak<FramePool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<Arc<FramePool>> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get(name).and_then(Weak::upgrade)
    }

    /// Share a live pool by name or create it
    pub fn find_or_create(&self, name: &str, capacity: usize, frame_len: usize) -> Arc<FramePool> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(name).and_then(Weak::upgrade) {
            return pool;
        }
        let pool = FramePool::new(name, capacity, frame_len);
        pools.insert(name.to_string(), Arc::downgrade(&pool));
        debug!("Created frame pool {} ({} x {} bytes)", name, capacity, frame_len);
        pool
    }
}
