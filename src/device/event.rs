//! Completion events for device operations.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct EventState {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Handle tracking completion of one submitted device operation.
///
/// Events are cheap to clone; clones observe the same completion. A
/// default-constructed (or released) event is already complete, so waiting
/// on an event is always safe, including after a failed operation: the
/// worker signals events even when their operation panics.
#[derive(Clone, Debug, Default)]
pub struct Event {
    state: Option<Arc<EventState>>,
}

impl Event {
    /// An event that is already complete.
    pub fn complete() -> Event {
        Event { state: None }
    }

    pub(crate) fn pending() -> Event {
        Event {
            state: Some(Arc::new(EventState::default())),
        }
    }

    /// True when the tracked operation has finished (or no operation is
    /// tracked).
    pub fn is_complete(&self) -> bool {
        match &self.state {
            None => true,
            Some(state) => *state.done.lock(),
        }
    }

    /// Block until the tracked operation finishes.
    pub fn wait(&self) {
        if let Some(state) = &self.state {
            let mut done = state.done.lock();
            while !*done {
                state.cond.wait(&mut done);
            }
        }
    }

    /// Drop the tracked state, turning this handle into a complete event.
    pub fn release(&mut self) {
        self.state = None;
    }

    pub(crate) fn signal(&self) {
        if let Some(state) = &self.state {
            *state.done.lock() = true;
            state.cond.notify_all();
        }
    }
}
