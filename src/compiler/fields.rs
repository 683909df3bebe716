//! Field bag: the named, typed slots that become a compiled unit's state.
//!
//! Slots hold everything a unit's body closes over: event buffers, the
//! memoization flag, handles to upstream units, and handles to the external
//! capabilities the unit wraps. A unit owns its bag exclusively; slots that
//! reference upstream units are non-owning with respect to the graph.

use crate::dataset::DatasetRef;
use crate::model::{empty_events, EventsRef};
use crate::plugin::{EventCondition, FilterPlugin, OutputPlugin};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Reference to one slot in a [`FieldBag`].
///
/// Cheap to clone; fragments embed these to read or write unit state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    index: usize,
    name: Rc<str>,
}

impl FieldRef {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One captured value.
#[derive(Clone)]
pub enum SlotValue {
    /// Upstream unit handle.
    Dataset(DatasetRef),
    /// Event buffer owned by the unit (possibly shared with a complement).
    Events(EventsRef),
    /// Memoization flag.
    Flag(Rc<Cell<bool>>),
    /// Filter capability.
    Filter(Arc<dyn FilterPlugin>),
    /// Output capability.
    Output(Arc<dyn OutputPlugin>),
    /// Branch predicate capability.
    Condition(Arc<dyn EventCondition>),
}

impl SlotValue {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SlotValue::Dataset(_) => "dataset",
            SlotValue::Events(_) => "events",
            SlotValue::Flag(_) => "flag",
            SlotValue::Filter(_) => "filter",
            SlotValue::Output(_) => "output",
            SlotValue::Condition(_) => "condition",
        }
    }
}

/// Ordered collection of named slots captured by one compiled unit.
#[derive(Default)]
pub struct FieldBag {
    slots: Vec<(Rc<str>, SlotValue)>,
}

impl FieldBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, prefix: &str, value: SlotValue) -> FieldRef {
        let index = self.slots.len();
        let name: Rc<str> = format!("{prefix}{index}").into();
        self.slots.push((name.clone(), value));
        FieldRef { index, name }
    }

    /// Capture an upstream unit.
    pub fn add_dataset(&mut self, dataset: DatasetRef) -> FieldRef {
        self.add("parent", SlotValue::Dataset(dataset))
    }

    /// Allocate a fresh event buffer owned by the unit.
    pub fn add_events(&mut self) -> FieldRef {
        self.add("buffer", SlotValue::Events(empty_events()))
    }

    /// Capture an existing buffer cell, shared with another unit.
    pub fn add_shared_events(&mut self, events: EventsRef) -> FieldRef {
        self.add("buffer", SlotValue::Events(events))
    }

    /// Allocate a flag, initially unset.
    pub fn add_flag(&mut self) -> FieldRef {
        self.add("flag", SlotValue::Flag(Rc::new(Cell::new(false))))
    }

    pub fn add_filter(&mut self, filter: Arc<dyn FilterPlugin>) -> FieldRef {
        self.add("filter", SlotValue::Filter(filter))
    }

    pub fn add_output(&mut self, output: Arc<dyn OutputPlugin>) -> FieldRef {
        self.add("output", SlotValue::Output(output))
    }

    pub fn add_condition(&mut self, condition: Arc<dyn EventCondition>) -> FieldRef {
        self.add("condition", SlotValue::Condition(condition))
    }

    /// Resolve a reference against this bag. Returns `None` for a reference
    /// minted by a different bag.
    pub(crate) fn get(&self, field: &FieldRef) -> Option<&SlotValue> {
        let (name, value) = self.slots.get(field.index)?;
        (name == &field.name).then_some(value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &SlotValue)> {
        self.slots.iter().map(|(name, value)| (name.as_ref(), value))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_named_by_kind_and_position() {
        let mut fields = FieldBag::new();
        let buffer = fields.add_events();
        let flag = fields.add_flag();
        assert_eq!(buffer.name(), "buffer0");
        assert_eq!(flag.name(), "flag1");
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn foreign_reference_does_not_resolve() {
        let mut fields = FieldBag::new();
        let mut other = FieldBag::new();
        let _ = fields.add_flag();
        let foreign = other.add_events();
        assert!(fields.get(&foreign).is_none());
    }
}
