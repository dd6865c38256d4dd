//! Shared concurrency primitives that don't belong to any one component:
//! the shutdown broadcast (spec.md section 9, "signal-driven shutdown maps
//! to a cancellation token plus one shutdown channel") and re-exports of
//! the error stack used by every long-running thread.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub use error::ErrorStack;

/// A broadcast-once cancellation token, shared as `ShutdownHandle = Arc<Shutdown>`.
///
/// Every long-running thread (frame source, disk writer, decimator,
/// socket-accept, and per-connection handlers) holds a clone of the handle
/// and either checks `is_shutting_down()` at its natural suspension points
/// or blocks on `wait_timeout` there instead of a bare sleep, so shutdown
/// is observed promptly rather than after some arbitrary poll interval.
pub struct Shutdown {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> ShutdownHandle {
        Arc::new(Shutdown {
            state: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Posts the shutdown signal and wakes every waiter. Idempotent.
    pub fn post(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = true;
        self.cond.notify_all();
    }

    /// Blocks up to `timeout`, waking early if shutdown is posted.
    /// Returns `true` if shutdown was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = self.cond.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

pub type ShutdownHandle = Arc<Shutdown>;
