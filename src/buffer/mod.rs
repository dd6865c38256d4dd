//! The multi-reader circular buffer (spec.md section 4.1).
//!
//! A single writer fills fixed-size blocks in order; any number of readers
//! track their own lag behind the writer. "Reserved" readers (the disk
//! writer, the decimator) can never be overrun: the writer blocks rather
//! than overwrite data they haven't consumed yet. "Lossy" readers
//! (subscribers) are silently dropped on overrun and observe a gap on
//! their next read.
//!
//! Per spec.md section 9's "cyclic graph" design note, readers never hold
//! a back-pointer to the buffer: a `ReaderId` is just an index into the
//! buffer's own reader table, so the buffer owns the only cycle.

pub mod pool;

use std::sync::{Condvar, Mutex, MutexGuard};

struct Slot<T> {
    data: T,
    gap: bool,
    timestamp_us: u64,
}

struct ReaderState {
    index: u64,
    reserved: bool,
    interrupted: bool,
    alive: bool,
}

struct State {
    write_index: u64,
    write_enabled: bool,
    readers: Vec<ReaderState>,
}

/// An opaque handle into a `RingBuffer`'s reader table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReaderId(usize);

/// Outcome of a single `read()` call.
pub enum ReadOutcome<T> {
    /// A full, in-sequence block.
    Data(T),
    /// The slot was marked as a source-signalled gap.
    Gap,
    /// A non-reserved reader fell behind by a full `block_count` and lost
    /// data; never returned for reserved readers.
    Overrun,
    /// `interrupt()` was called while this reader was blocked.
    Interrupted,
}

pub struct ReadResult<T> {
    pub outcome: ReadOutcome<T>,
    pub timestamp_us: u64,
}

/// A write slot reserved by the single writer, returned by `reserve_write`.
/// Borrow the payload with `Deref`/`DerefMut`, fill it, then pass the guard
/// to `commit_write`.
pub struct WriteGuard<'a, T: 'a> {
    index: u64,
    slot: MutexGuard<'a, Slot<T>>,
}

impl<'a, T> ::std::ops::Deref for WriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.slot.data
    }
}

impl<'a, T> ::std::ops::DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot.data
    }
}

pub struct RingBuffer<T> {
    blocks: Vec<Mutex<Slot<T>>>,
    state: Mutex<State>,
    /// Notified whenever `write_index` advances or `write_enabled` flips,
    /// or a reader is interrupted — i.e. anything a blocked `read` or
    /// `reserve_write` might be waiting on.
    advance: Condvar,
    /// Notified whenever a reader's index advances, i.e. anything a
    /// blocked `commit_write` backpressure wait might be waiting on.
    reader_advanced: Condvar,
    block_count: u64,
}

impl<T: Clone + Default> RingBuffer<T> {
    pub fn new(block_count: usize) -> Self {
        assert!(block_count > 0, "block_count must be nonzero");
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks.push(Mutex::new(Slot {
                data: T::default(),
                gap: false,
                timestamp_us: 0,
            }));
        }
        RingBuffer {
            blocks,
            state: Mutex::new(State {
                write_index: 0,
                write_enabled: true,
                readers: Vec::new(),
            }),
            advance: Condvar::new(),
            reader_advanced: Condvar::new(),
            block_count: block_count as u64,
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_count as usize
    }

    pub fn set_write_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.write_enabled = enabled;
        self.advance.notify_all();
    }

    /// Attaches a new reader at the current write index. `reserved`
    /// readers can never be overrun; the writer blocks for them instead.
    pub fn open_reader(&self, reserved: bool) -> ReaderId {
        let mut state = self.state.lock().unwrap();
        let index = state.write_index;
        state.readers.push(ReaderState {
            index,
            reserved,
            interrupted: false,
            alive: true,
        });
        ReaderId(state.readers.len() - 1)
    }

    /// Detaches a reader so it no longer participates in writer
    /// backpressure. Safe to call from the reader's own thread or another.
    pub fn close_reader(&self, reader: ReaderId) {
        let mut state = self.state.lock().unwrap();
        state.readers[reader.0].alive = false;
        self.reader_advanced.notify_all();
    }

    /// Wakes a reader blocked in `read`, causing it to observe
    /// `ReadOutcome::Interrupted`.
    pub fn interrupt(&self, reader: ReaderId) {
        let mut state = self.state.lock().unwrap();
        state.readers[reader.0].interrupted = true;
        self.advance.notify_all();
    }

    /// Returns the write slot at the current write index, blocking while
    /// writing is disabled. Never fails.
    pub fn reserve_write(&self) -> WriteGuard<T> {
        let mut state = self.state.lock().unwrap();
        while !state.write_enabled {
            state = self.advance.wait(state).unwrap();
        }
        let index = state.write_index;
        drop(state);
        let slot = self.blocks[(index % self.block_count) as usize]
            .lock()
            .unwrap();
        WriteGuard { index, slot }
    }

    /// Publishes the filled slot and advances the write index. If any
    /// reserved reader would otherwise have its oldest unread block
    /// overwritten by the next write, this call blocks until that reader
    /// catches up (spec.md section 4.1, "for a reserved reader the writer
    /// blocks waiting for it").
    pub fn commit_write(&self, mut guard: WriteGuard<T>, gap: bool, timestamp_us: u64) {
        guard.slot.gap = gap;
        guard.slot.timestamp_us = timestamp_us;
        let index = guard.index;
        drop(guard);

        let mut state = self.state.lock().unwrap();
        state.write_index = index + 1;
        self.advance.notify_all();

        loop {
            let stalled = state.readers.iter().any(|r| {
                r.alive && r.reserved && state.write_index.saturating_sub(r.index) >= self.block_count
            });
            if !stalled {
                break;
            }
            state = self.reader_advanced.wait(state).unwrap();
        }
    }

    /// Blocks until new data is available for `reader`, then returns it
    /// (cloned out of the slot — see DESIGN.md for why this buffer copies
    /// on read rather than handing back a zero-copy reference).
    pub fn read(&self, reader: ReaderId) -> ReadResult<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.readers[reader.0].interrupted {
                return ReadResult {
                    outcome: ReadOutcome::Interrupted,
                    timestamp_us: 0,
                };
            }
            if state.readers[reader.0].index != state.write_index {
                break;
            }
            state = self.advance.wait(state).unwrap();
        }

        let r = &state.readers[reader.0];
        let reserved = r.reserved;
        let read_index = r.index;
        let write_index = state.write_index;
        drop(state);

        let lag = write_index - read_index;
        let overrun = !reserved && lag > self.block_count;

        let slot = self.blocks[(read_index % self.block_count) as usize]
            .lock()
            .unwrap();
        let timestamp_us = slot.timestamp_us;

        let outcome = if overrun {
            ReadOutcome::Overrun
        } else if slot.gap {
            ReadOutcome::Gap
        } else {
            ReadOutcome::Data(slot.data.clone())
        };

        ReadResult {
            outcome,
            timestamp_us,
        }
    }

    /// Advances `reader`'s position. Returns `false` if the slot was
    /// overwritten while the caller held the data from `read` (only
    /// possible for non-reserved readers).
    pub fn release_read(&self, reader: ReaderId) -> bool {
        let mut state = self.state.lock().unwrap();
        let old_index = state.readers[reader.0].index;
        let ok = state.write_index.saturating_sub(old_index) <= self.block_count;
        state.readers[reader.0].index = old_index + 1;
        self.reader_advanced.notify_all();
        ok
    }

    pub fn write_index(&self) -> u64 {
        self.state.lock().unwrap().write_index
    }
}
