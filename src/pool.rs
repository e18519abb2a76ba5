//! Send-scratch and receive-landing buffer management.
//!
//! Outgoing envelopes are built in scratch buffers checked out of a bounded
//! pool and returned once the transport accepts the send. Landing buffers
//! are a fixed set owned by the transport queue; the engine only tracks
//! which ones it is still processing so none is reposted early.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::{CourierError, Result};
use crate::transport::LandingId;

/// A bounded pool of send scratch buffers.
///
/// Checkout fails when every buffer is in flight; in this protocol that is
/// a configuration error, not a condition to wait out.
pub struct ScratchPool {
    queue: ArrayQueue<Vec<u8>>,
    capacity: usize,
    buf_size: usize,
}

impl ScratchPool {
    /// Create a pool of `capacity` buffers of `buf_size` bytes each.
    pub fn new(capacity: usize, buf_size: usize) -> Arc<Self> {
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(Vec::with_capacity(buf_size));
        }
        Arc::new(Self {
            queue,
            capacity,
            buf_size,
        })
    }

    /// Check out a buffer, resized to `len` bytes (zeroed).
    pub fn checkout(self: &Arc<Self>, len: usize) -> Result<ScratchBuf> {
        debug_assert!(len <= self.buf_size);
        let mut buf = self
            .queue
            .pop()
            .ok_or(CourierError::ScratchExhausted {
                capacity: self.capacity,
            })?;
        buf.clear();
        buf.resize(len, 0);
        Ok(ScratchBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn return_buf(&self, mut buf: Vec<u8>) {
        buf.clear();
        let _ = self.queue.push(buf);
    }

    /// Buffers currently available for checkout.
    pub fn available(&self) -> usize {
        self.queue.len()
    }
}

/// A scratch buffer checked out from a [`ScratchPool`]. Derefs to `[u8]`
/// and returns to the pool on drop.
pub struct ScratchBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<ScratchPool>,
}

impl Deref for ScratchBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("ScratchBuf used after drop")
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("ScratchBuf used after drop")
    }
}

impl Drop for ScratchBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buf(buf);
        }
    }
}

impl std::fmt::Debug for ScratchBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScratchBuf({} bytes)", self.len())
    }
}

/// Bookkeeping for the fixed set of landing buffers posted to the receive
/// queue.
#[derive(Debug)]
pub struct LandingLedger {
    posted: Vec<bool>,
    capacity: usize,
}

impl LandingLedger {
    /// Track `count` landing buffers of `capacity` bytes each. All start
    /// unposted; the engine posts them during initialization.
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            posted: vec![false; count],
            capacity,
        }
    }

    pub fn count(&self) -> usize {
        self.posted.len()
    }

    /// Per-buffer capacity: envelope plus the largest eager payload.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    pub fn ids(&self) -> impl Iterator<Item = LandingId> + '_ {
        (0..self.posted.len() as u32).map(LandingId)
    }

    /// Record that a buffer is posted to the transport.
    pub fn mark_posted(&mut self, id: LandingId) {
        self.posted[id.0 as usize] = true;
    }

    /// Record that a delivery occupies this buffer until processing ends.
    pub fn mark_held(&mut self, id: LandingId) {
        self.posted[id.0 as usize] = false;
    }

    /// Buffers currently held by in-progress (or unexpected) messages.
    pub fn held(&self) -> usize {
        self.posted.iter().filter(|p| !**p).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let pool = ScratchPool::new(2, 64);
        let buf = pool.checkout(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(pool.available(), 1);
        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let pool = ScratchPool::new(1, 64);
        let _held = pool.checkout(8).unwrap();
        assert!(matches!(
            pool.checkout(8),
            Err(CourierError::ScratchExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn test_checkout_zeroes_previous_contents() {
        let pool = ScratchPool::new(1, 64);
        {
            let mut buf = pool.checkout(4).unwrap();
            buf.copy_from_slice(&[0xAA; 4]);
        }
        let buf = pool.checkout(4).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_landing_ledger_tracks_held() {
        let mut ledger = LandingLedger::new(2, 128);
        for id in ledger.ids().collect::<Vec<_>>() {
            ledger.mark_posted(id);
        }
        assert_eq!(ledger.held(), 0);
        ledger.mark_held(LandingId(1));
        assert_eq!(ledger.held(), 1);
        ledger.mark_posted(LandingId(1));
        assert_eq!(ledger.held(), 0);
    }
}
