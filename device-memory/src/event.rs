//! Completion markers carried in `ArrowDeviceArray.sync_event`.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct EventState {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Signals that writes issued before it was recorded are visible.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    state: Arc<EventState>,
}

impl SyncEvent {
    pub fn pending() -> Self {
        Self {
            state: Arc::new(EventState::default()),
        }
    }

    pub fn completed() -> Self {
        let event = Self::pending();
        event.signal();
        event
    }

    pub fn signal(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }

    pub fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.cond.wait(&mut done);
        }
    }

    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.state.done.lock();
        if !*done {
            self.state.cond.wait_for(&mut done, timeout);
        }
        *done
    }

    /// Address stored in the device array's `sync_event` slot.
    pub fn as_raw(&self) -> *mut c_void {
        Arc::as_ptr(&self.state) as *mut c_void
    }

    /// Recovers an event from a `sync_event` slot, taking a new reference.
    ///
    /// # Safety
    /// `ptr` must come from [`SyncEvent::as_raw`] on an event that is still
    /// alive.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        let ptr = ptr as *const EventState;
        Arc::increment_strong_count(ptr);
        Self {
            state: Arc::from_raw(ptr),
        }
    }

    pub fn same_as(&self, other: &SyncEvent) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
