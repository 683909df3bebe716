//! External processing capabilities consumed by compiled units.
//!
//! The graph core treats filters, outputs and branch predicates as opaque
//! collaborators behind these traits. Capability instances are shared by
//! every worker's graph instance, so implementations must be `Send + Sync`;
//! the calls themselves always happen on the owning worker's thread.

pub mod mock;

use crate::model::{Event, EventsRef};
use thiserror::Error;

/// Error raised by an external capability.
///
/// The compiled graph performs no retry, suppression or translation: a
/// failure from `process`, `flush`, `receive` or `fulfilled` propagates
/// unchanged out of the owning unit's `compute`. Recovery policy belongs to
/// the cycle driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plugin '{plugin}' failed: {message}")]
pub struct PluginError {
    plugin: String,
    message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Name of the capability that failed.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

/// Argument passed to [`FilterPlugin::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// True when this is the last flush the filter will ever see.
    pub final_flush: bool,
}

/// Filter capability: transforms an ordered sequence of events.
pub trait FilterPlugin: Send + Sync {
    /// Process buffered input events, returning the events to emit
    /// downstream.
    fn process(&self, events: &[Event]) -> Result<Vec<Event>, PluginError>;

    /// Emit events buffered inside the plugin. Only invoked when
    /// [`FilterPlugin::has_flush`] is true.
    fn flush(&self, options: FlushOptions) -> Result<Vec<Event>, PluginError> {
        let _ = options;
        Ok(Vec::new())
    }

    /// Whether the plugin buffers state that must be flushed.
    fn has_flush(&self) -> bool {
        false
    }

    /// Whether the plugin expects a flush on every flush-requested cycle
    /// rather than only at shutdown.
    fn periodic_flush(&self) -> bool {
        false
    }
}

/// Output capability: delivers events to an external destination.
pub trait OutputPlugin: Send + Sync {
    /// Receive one buffer of events.
    ///
    /// The buffer handle belongs to the calling unit and is cleared once
    /// `receive` returns; implementations must copy any events they retain.
    fn receive(&self, events: &EventsRef) -> Result<(), PluginError>;
}

/// Branch predicate capability, assumed pure and side-effect-free for the
/// duration of one cycle.
pub trait EventCondition: Send + Sync {
    fn fulfilled(&self, event: &Event) -> Result<bool, PluginError>;
}
