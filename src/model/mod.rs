//! Event model shared by compiled execution graphs.
//!
//! Two kinds of handles live here:
//! - [`Event`]: a cheaply clonable, thread-safe handle to one record
//! - [`EventsRef`]: a graph-local shared buffer of events
//!
//! Batches are produced by an external queue and may cross threads; a graph
//! instance and its buffers belong to exactly one worker thread.

use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handle to one pipeline event.
///
/// Every buffer in a graph holds handles to the same underlying record, so
/// cloning an `Event` never copies its payload. The cancellation marker is
/// cooperative and advisory: a cancelled event is silently dropped at each
/// unit's buffering step rather than aborting the cycle.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug)]
struct EventInner {
    payload: Value,
    cancelled: AtomicBool,
}

impl Event {
    /// Create an event carrying the given payload.
    pub fn new(payload: Value) -> Self {
        Self {
            inner: Arc::new(EventInner {
                payload,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// The opaque payload this event carries.
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// Mark this event cancelled. Downstream units will drop it when
    /// buffering their inputs.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }
}

/// Graph-local shared buffer of events.
///
/// `compute` returns these handles; a memoizing unit hands the same handle
/// back on every call within a cycle, so pointer identity
/// (`Rc::ptr_eq`) distinguishes a memoized result from a fresh one.
pub type EventsRef = Rc<RefCell<Vec<Event>>>;

/// Wrap a vector of events into a buffer handle.
pub fn events(items: Vec<Event>) -> EventsRef {
    Rc::new(RefCell::new(items))
}

/// Fresh empty buffer handle.
pub fn empty_events() -> EventsRef {
    Rc::new(RefCell::new(Vec::new()))
}

/// Build a batch from raw payloads.
pub fn batch_from_payloads(payloads: Vec<Value>) -> EventsRef {
    events(payloads.into_iter().map(Event::new).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cancellation_is_shared_between_handles() {
        let event = Event::new(json!({"message": "a"}));
        let handle = event.clone();
        assert!(!handle.is_cancelled());
        event.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn batch_keeps_payload_order() {
        let batch = batch_from_payloads(vec![json!(1), json!(2)]);
        let items = batch.borrow();
        assert_eq!(items[0].payload(), &json!(1));
        assert_eq!(items[1].payload(), &json!(2));
    }
}
