//! Mock capabilities for tests and demos.
//!
//! Each mock instruments the calls it receives so tests can assert how often
//! a compiled unit actually drove its capability within a cycle.

use super::{EventCondition, FilterPlugin, FlushOptions, OutputPlugin, PluginError};
use crate::model::{Event, EventsRef};
use parking_lot::Mutex;
use serde_json::Value;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pass-through filter that counts invocations and records the payloads it
/// was handed.
#[derive(Default)]
pub struct CountingFilter {
    process_calls: AtomicUsize,
    flush_calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Value>>>,
    flushes: Mutex<Vec<FlushOptions>>,
    has_flush: bool,
    periodic_flush: bool,
}

impl CountingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A counting filter that declares flush support.
    pub fn with_flush(periodic: bool) -> Self {
        Self {
            has_flush: true,
            periodic_flush: periodic,
            ..Self::default()
        }
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    /// Payload snapshots of every `process` input, in call order.
    pub fn seen(&self) -> Vec<Vec<Value>> {
        self.seen.lock().clone()
    }

    /// Options of every `flush` call, in call order.
    pub fn flushes(&self) -> Vec<FlushOptions> {
        self.flushes.lock().clone()
    }
}

impl FilterPlugin for CountingFilter {
    fn process(&self, events: &[Event]) -> Result<Vec<Event>, PluginError> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .push(events.iter().map(|e| e.payload().clone()).collect());
        Ok(events.to_vec())
    }

    fn flush(&self, options: FlushOptions) -> Result<Vec<Event>, PluginError> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        self.flushes.lock().push(options);
        Ok(Vec::new())
    }

    fn has_flush(&self) -> bool {
        self.has_flush
    }

    fn periodic_flush(&self) -> bool {
        self.periodic_flush
    }
}

/// Filter that fails every call, for error propagation tests.
pub struct FailingFilter {
    name: String,
}

impl FailingFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl FilterPlugin for FailingFilter {
    fn process(&self, _events: &[Event]) -> Result<Vec<Event>, PluginError> {
        Err(PluginError::new(&self.name, "process failed"))
    }
}

/// Output that records how it was driven.
///
/// Buffer identity is recorded as a raw address so the mock stays
/// `Send + Sync` while still letting tests assert that the root-fed
/// optimization forwarded the batch handle itself.
#[derive(Default)]
pub struct RecordingOutput {
    receive_calls: AtomicUsize,
    received: Mutex<Vec<Vec<Value>>>,
    buffer_addrs: Mutex<Vec<usize>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Payload snapshots of every received buffer, in call order.
    pub fn received(&self) -> Vec<Vec<Value>> {
        self.received.lock().clone()
    }

    /// Whether the most recent call received exactly this buffer handle.
    pub fn last_buffer_was(&self, events: &EventsRef) -> bool {
        self.buffer_addrs.lock().last() == Some(&(Rc::as_ptr(events) as usize))
    }
}

impl OutputPlugin for RecordingOutput {
    fn receive(&self, events: &EventsRef) -> Result<(), PluginError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.buffer_addrs.lock().push(Rc::as_ptr(events) as usize);
        self.received
            .lock()
            .push(events.borrow().iter().map(|e| e.payload().clone()).collect());
        Ok(())
    }
}

/// Predicate fulfilled when a top-level payload field equals a value.
pub struct FieldEquals {
    field: String,
    value: Value,
    calls: AtomicUsize,
}

impl FieldEquals {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventCondition for FieldEquals {
    fn fulfilled(&self, event: &Event) -> Result<bool, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(event.payload().get(&self.field) == Some(&self.value))
    }
}
