//! execflow compiles a declarative event-processing pipeline — a DAG of
//! filter, branch and output stages — into concrete executable units
//! optimized for repeated per-batch execution.
//!
//! Composition happens once per pipeline build:
//! - stage composers in [`compiler`] assemble each unit's `compute`/`clear`
//!   bodies from [`syntax`] fragments over a [`compiler::fields::FieldBag`]
//! - the synthesizer turns bodies into closures wired directly to upstream
//!   units and to the external capabilities in [`plugin`]
//! - [`pipeline`] walks a declarative [`pipeline::PipelineDef`] and returns
//!   the [`pipeline::ExecutionGraph`] a worker drives cycle by cycle
//!
//! At run time there is no per-event interpretive dispatch: topology,
//! buffering and control flow are baked into the units at build time.

pub mod compiler;
pub mod dataset;
pub mod model;
pub mod pipeline;
pub mod plugin;
pub mod syntax;

pub use compiler::{
    compile, filter_dataset, generated_source, output_dataset, root_dataset, root_datasets,
    split_dataset, terminal_dataset, CompileError, DatasetFlavor, FLUSH_FINAL, FLUSH_NOT_FINAL,
};
pub use compiler::fields::{FieldBag, FieldRef, SlotValue};
pub use dataset::{Complement, Dataset, DatasetRef, SplitDataset};
pub use model::{batch_from_payloads, empty_events, events, Event, EventsRef};
pub use pipeline::{
    build_execution_graph, BuildError, ExecutionGraph, PipelineDef, PluginRegistry, StageDef,
    StageInput, StageKind,
};
pub use plugin::{EventCondition, FilterPlugin, FlushOptions, OutputPlugin, PluginError};
pub use syntax::{Block, Constant, Expr, Method, MethodArg, Stmt};
