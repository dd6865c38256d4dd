//! Bounded pool of page-aligned I/O buffers (spec.md section 4.9).
//!
//! The query engine rents one buffer per requested id before issuing any
//! reads; admission is immediate-fail rather than blocking, since a client
//! that can't get buffers should be told "Read too busy" rather than made
//! to wait behind others (spec.md section 5, "pool `lock_buffers` (fails
//! immediately rather than blocks)").

use std::sync::Mutex;

use error::{Error, Result};
use raw::page_align;

struct Inner {
    /// Buffers currently checked out, by index into `free`'s original slot
    /// numbering; `free[i]` is `Some` iff slot `i` is available.
    free: Vec<Option<Vec<u8>>>,
}

/// A bounded pool of equally sized, page-aligned byte buffers.
///
/// Capacity is fixed at construction to `fa_entry_count` (spec.md section
/// 5: "the total concurrent consumer count is bounded by
/// `fa_entry_count`"), since the query engine rents one buffer per
/// requested archived id.
pub struct BufferPool {
    inner: Mutex<Inner>,
    buffer_size: usize,
}

/// RAII handle for buffers rented from a `BufferPool`; returns every buffer
/// to the pool on drop regardless of how the borrowing code exits (spec.md
/// section 9, "scoped acquisition... must release on every exit path").
pub struct PoolLease<'a> {
    pool: &'a BufferPool,
    slots: Vec<usize>,
    buffers: Vec<Vec<u8>>,
}

impl<'a> PoolLease<'a> {
    pub fn buffers_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.buffers
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.buffers
    }
}

impl<'a> Drop for PoolLease<'a> {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.lock().unwrap();
        for (slot, buf) in self.slots.drain(..).zip(self.buffers.drain(..)) {
            inner.free[slot] = Some(buf);
        }
    }
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let aligned = page_align(buffer_size as u64) as usize;
        let free = (0..capacity)
            .map(|_| Some(vec![0u8; aligned]))
            .collect();
        BufferPool {
            inner: Mutex::new(Inner { free }),
            buffer_size: aligned,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    /// Rents `count` buffers, failing immediately with
    /// `Error::ReadTooBusy` rather than waiting if that many aren't free.
    pub fn lock_buffers(&self, count: usize) -> Result<PoolLease> {
        let mut inner = self.inner.lock().unwrap();
        let available = inner.free.iter().filter(|b| b.is_some()).count();
        if available < count {
            return Err(Error::ReadTooBusy);
        }
        let mut slots = Vec::with_capacity(count);
        let mut buffers = Vec::with_capacity(count);
        for (idx, slot) in inner.free.iter_mut().enumerate() {
            if slots.len() == count {
                break;
            }
            if let Some(buf) = slot.take() {
                slots.push(idx);
                buffers.push(buf);
            }
        }
        drop(inner);
        Ok(PoolLease {
            pool: self,
            slots,
            buffers,
        })
    }
}
