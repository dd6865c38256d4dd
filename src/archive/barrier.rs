//! Write-priority read/write exclusion barrier (spec.md section 4.2): "a
//! request to read waits while a write is in progress; a request to write
//! waits for no readers." Readers may run concurrently with each other;
//! at most one writer runs at a time, and a pending writer blocks new
//! readers from starting so it is never starved by a continuous stream of
//! reads.

use std::sync::{Condvar, Mutex};

struct State {
    readers: u32,
    writer_active: bool,
    writer_waiting: bool,
}

/// Guards an archive file's data areas against torn reads during a major
/// block write (spec.md section 4.2's "mutual exclusion... driven by a
/// condition variable").
pub struct RwBarrier {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct ReadPermit<'a> {
    barrier: &'a RwBarrier,
}

impl<'a> Drop for ReadPermit<'a> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.barrier.cond.notify_all();
        }
    }
}

pub struct WritePermit<'a> {
    barrier: &'a RwBarrier,
}

impl<'a> Drop for WritePermit<'a> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().unwrap();
        state.writer_active = false;
        self.barrier.cond.notify_all();
    }
}

impl RwBarrier {
    pub fn new() -> Self {
        RwBarrier {
            state: Mutex::new(State {
                readers: 0,
                writer_active: false,
                writer_waiting: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Used by the query engine's `request_read` (spec.md section 4.4,
    /// step 6) before each `pread` against the archive file.
    pub fn request_read(&self) -> ReadPermit {
        let mut state = self.state.lock().unwrap();
        while state.writer_active || state.writer_waiting {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
        ReadPermit { barrier: self }
    }

    /// Used by the disk writer before submitting a filled major block.
    pub fn request_write(&self) -> WritePermit {
        let mut state = self.state.lock().unwrap();
        state.writer_waiting = true;
        while state.readers > 0 || state.writer_active {
            state = self.cond.wait(state).unwrap();
        }
        state.writer_waiting = false;
        state.writer_active = true;
        WritePermit { barrier: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_run_concurrently() {
        let barrier = RwBarrier::new();
        let _r1 = barrier.request_read();
        let _r2 = barrier.request_read();
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let barrier = Arc::new(RwBarrier::new());
        let r1 = barrier.request_read();

        let barrier2 = Arc::clone(&barrier);
        let writer = thread::spawn(move || {
            let _w = barrier2.request_write();
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!writer.is_finished());

        drop(r1);
        writer.join().unwrap();
    }

    #[test]
    fn writer_excludes_readers() {
        let barrier = Arc::new(RwBarrier::new());
        let w = barrier.request_write();

        let barrier2 = Arc::clone(&barrier);
        let reader = thread::spawn(move || {
            let _r = barrier2.request_read();
        });

        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(w);
        reader.join().unwrap();
    }
}
