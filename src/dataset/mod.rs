//! Executable stage units.
//!
//! A unit is the compiled form of one pipeline stage. Units are wired into a
//! DAG at build time; at run time a cycle driver pulls the terminal unit and
//! data flows upstream-to-downstream through the units' buffers.

use crate::compiler::emit::{run_block, Scope, StmtFn};
use crate::model::{empty_events, EventsRef};
use crate::plugin::PluginError;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// The execution capability every compiled stage exposes.
///
/// Within one batch lifecycle a unit performs its underlying work at most
/// once, no matter how many downstream consumers pull it; repeated `compute`
/// calls before the next `clear` return the same memoized buffer handle.
/// `clear` propagates to upstream units first, then resets local buffers and
/// the memoization flag, so clearing is a depth-first sweep from any terminal
/// back to the roots.
pub trait Dataset {
    /// Pull this unit's output for the current cycle.
    fn compute(
        &self,
        batch: &EventsRef,
        flush_requested: bool,
        shutdown_requested: bool,
    ) -> Result<EventsRef, PluginError>;

    /// Reset cycle state, upstream first.
    fn clear(&self);
}

/// Shared handle to a unit inside one worker's graph instance.
///
/// Graph instances are single-threaded by design: handles are `Rc`, not
/// `Arc`, and a built graph never crosses threads. Each worker builds its
/// own instance tree.
pub type DatasetRef = Rc<dyn Dataset>;

/// Unit produced by the synthesizer: two compiled bodies over a captured
/// field bag.
pub(crate) struct CompiledDataset {
    name: String,
    compute_body: Vec<StmtFn>,
    clear_body: Vec<StmtFn>,
}

impl CompiledDataset {
    pub(crate) fn new(name: String, compute_body: Vec<StmtFn>, clear_body: Vec<StmtFn>) -> Self {
        Self {
            name,
            compute_body,
            clear_body,
        }
    }
}

impl fmt::Debug for CompiledDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledDataset({})", self.name)
    }
}

impl Dataset for CompiledDataset {
    fn compute(
        &self,
        batch: &EventsRef,
        flush_requested: bool,
        shutdown_requested: bool,
    ) -> Result<EventsRef, PluginError> {
        let scope = Scope {
            batch,
            flush_requested,
            shutdown_requested,
            event: None,
        };
        match run_block(&self.compute_body, &scope)? {
            Some(events) => Ok(events),
            // composer-built bodies always end in a return
            None => Ok(empty_events()),
        }
    }

    fn clear(&self) {
        let batch = empty_events();
        let scope = Scope {
            batch: &batch,
            flush_requested: false,
            shutdown_requested: false,
            event: None,
        };
        // clear bodies are checked effect-only and infallible at synthesis
        let _ = run_block(&self.clear_body, &scope);
    }
}

/// Positive branch of a branch/split stage, plus the exposed negative buffer.
///
/// Both branches are one evaluation: computing either side partitions the
/// upstream events into the positive and negative buffers exactly once per
/// cycle. The negative buffer is consumed through a [`Complement`].
pub struct SplitDataset {
    inner: DatasetRef,
    right: EventsRef,
}

impl SplitDataset {
    pub(crate) fn new(inner: DatasetRef, right: EventsRef) -> Self {
        Self { inner, right }
    }

    /// Buffer holding the events the predicate rejected.
    pub fn right(&self) -> &EventsRef {
        &self.right
    }
}

impl Dataset for SplitDataset {
    fn compute(
        &self,
        batch: &EventsRef,
        flush_requested: bool,
        shutdown_requested: bool,
    ) -> Result<EventsRef, PluginError> {
        self.inner.compute(batch, flush_requested, shutdown_requested)
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// Negative-branch counterpart of a [`SplitDataset`].
///
/// Shares the split's single evaluation and its negative buffer; this unit
/// computes nothing itself. Its memoization flag is independent of the
/// split's, because a consumer may pull the negative branch without anything
/// ever pulling the positive one.
pub struct Complement {
    parent: Rc<SplitDataset>,
    data: EventsRef,
    done: Cell<bool>,
}

impl Complement {
    /// Wrap a split's negative branch as a standalone unit.
    pub fn from(parent: Rc<SplitDataset>) -> DatasetRef {
        Rc::new(Self {
            data: parent.right().clone(),
            parent,
            done: Cell::new(false),
        })
    }
}

impl Dataset for Complement {
    fn compute(
        &self,
        batch: &EventsRef,
        flush_requested: bool,
        shutdown_requested: bool,
    ) -> Result<EventsRef, PluginError> {
        if self.done.get() {
            return Ok(self.data.clone());
        }
        // idempotent per cycle, so driving it here is safe even when the
        // positive branch is never pulled
        self.parent
            .compute(batch, flush_requested, shutdown_requested)?;
        self.done.set(true);
        Ok(self.data.clone())
    }

    fn clear(&self) {
        self.parent.clear();
        self.done.set(false);
    }
}
