//! Declarative pipeline definitions and graph assembly.
//!
//! A [`PipelineDef`] names the stages of a pipeline and how they connect; it
//! is what an external configuration layer deserializes into. Assembly walks
//! the declared stages in order, threads the already-built upstream units
//! into the matching composer, and merges every output into the terminal
//! unit a cycle driver pulls. Structural mistakes are rejected here, at
//! build time, never during a cycle.

use crate::compiler::{self, CompileError};
use crate::dataset::{Complement, Dataset, DatasetRef, SplitDataset};
use crate::model::EventsRef;
use crate::plugin::{EventCondition, FilterPlugin, OutputPlugin, PluginError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Errors raised while assembling an execution graph from a definition.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate stage id: {0}")]
    DuplicateStage(String),
    #[error("stage '{stage}' references unknown upstream '{upstream}'")]
    DanglingReference { stage: String, upstream: String },
    #[error("stage '{stage}' requests the complement of '{upstream}', which is not a split stage")]
    NotASplit { stage: String, upstream: String },
    #[error("stage '{stage}' cannot consume output stage '{upstream}'")]
    OutputUpstream { stage: String, upstream: String },
    #[error("stage '{0}' declares no inputs")]
    NoInputs(String),
    #[error("pipeline defines no output stage")]
    NoOutputs,
    #[error("unknown {kind} plugin: {name}")]
    UnknownPlugin { kind: &'static str, name: String },
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Declarative description of one pipeline stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Pipeline identifier, used in diagnostics.
    pub id: String,
    /// Stages in declaration order. A stage may only reference stages
    /// declared before it, which also rules out cycles.
    pub stages: Vec<StageDef>,
}

/// One stage of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    pub kind: StageKind,
    /// Upstream edges; `Batch` wires the stage to the cycle's batch itself.
    pub inputs: Vec<StageInput>,
}

/// What a stage does, and which named capability it wraps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Filter { plugin: String },
    Split { condition: String },
    Output { plugin: String },
}

/// One upstream edge of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageInput {
    /// The batch supplied by the cycle driver.
    Batch,
    /// The output of an earlier stage (the positive branch, for splits).
    Stage(String),
    /// The negative branch of an earlier split stage.
    Complement(String),
}

/// Name → capability lookup used while building graphs.
#[derive(Default)]
pub struct PluginRegistry {
    filters: HashMap<String, Arc<dyn FilterPlugin>>,
    outputs: HashMap<String, Arc<dyn OutputPlugin>>,
    conditions: HashMap<String, Arc<dyn EventCondition>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter(&mut self, name: impl Into<String>, filter: Arc<dyn FilterPlugin>) {
        self.filters.insert(name.into(), filter);
    }

    pub fn register_output(&mut self, name: impl Into<String>, output: Arc<dyn OutputPlugin>) {
        self.outputs.insert(name.into(), output);
    }

    pub fn register_condition(
        &mut self,
        name: impl Into<String>,
        condition: Arc<dyn EventCondition>,
    ) {
        self.conditions.insert(name.into(), condition);
    }

    fn filter(&self, name: &str) -> Result<Arc<dyn FilterPlugin>, BuildError> {
        self.filters.get(name).cloned().ok_or_else(|| BuildError::UnknownPlugin {
            kind: "filter",
            name: name.to_string(),
        })
    }

    fn output(&self, name: &str) -> Result<Arc<dyn OutputPlugin>, BuildError> {
        self.outputs.get(name).cloned().ok_or_else(|| BuildError::UnknownPlugin {
            kind: "output",
            name: name.to_string(),
        })
    }

    fn condition(&self, name: &str) -> Result<Arc<dyn EventCondition>, BuildError> {
        self.conditions.get(name).cloned().ok_or_else(|| BuildError::UnknownPlugin {
            kind: "condition",
            name: name.to_string(),
        })
    }
}

enum StageUnit {
    Regular(DatasetRef),
    Split {
        split: Rc<SplitDataset>,
        complement: Option<DatasetRef>,
    },
}

struct BuiltStage {
    unit: StageUnit,
    consumed: bool,
}

/// One worker's compiled graph instance.
///
/// Owns the terminal unit the cycle driver pulls. Instances are
/// single-threaded; build one per worker.
pub struct ExecutionGraph {
    id: String,
    terminal: DatasetRef,
}

impl ExecutionGraph {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The terminal unit driving the whole graph.
    pub fn terminal(&self) -> &DatasetRef {
        &self.terminal
    }

    /// Run one cycle: pull the terminal unit with the driver's flags, then
    /// clear it to prepare for the next batch.
    pub fn cycle(
        &self,
        batch: &EventsRef,
        flush_requested: bool,
        shutdown_requested: bool,
    ) -> Result<(), PluginError> {
        self.terminal
            .compute(batch, flush_requested, shutdown_requested)?;
        self.terminal.clear();
        Ok(())
    }
}

/// Build one worker's execution graph instance from a definition.
///
/// Every call produces an independent instance tree, so memoization flags
/// and buffers are never shared across threads; capability instances from
/// the registry are shared by all workers.
pub fn build_execution_graph(
    def: &PipelineDef,
    plugins: &PluginRegistry,
) -> Result<ExecutionGraph, BuildError> {
    let output_total = def
        .stages
        .iter()
        .filter(|stage| matches!(stage.kind, StageKind::Output { .. }))
        .count();
    if output_total == 0 {
        return Err(BuildError::NoOutputs);
    }
    // The inline-clear optimization assumes exactly one terminal consumer.
    let sole_terminal = output_total == 1;

    let mut built: HashMap<String, BuiltStage> = HashMap::new();
    let mut output_ids: HashSet<String> = HashSet::new();
    let mut output_units: Vec<DatasetRef> = Vec::new();

    for stage in &def.stages {
        if built.contains_key(&stage.id) || output_ids.contains(&stage.id) {
            return Err(BuildError::DuplicateStage(stage.id.clone()));
        }
        if stage.inputs.is_empty() {
            return Err(BuildError::NoInputs(stage.id.clone()));
        }
        let parents = resolve_inputs(stage, &mut built, &output_ids)?;
        let config_source = format!("{}/{}", def.id, stage.id);
        match &stage.kind {
            StageKind::Filter { plugin } => {
                let unit = compiler::filter_dataset(parents, plugins.filter(plugin)?, &config_source)?;
                built.insert(
                    stage.id.clone(),
                    BuiltStage {
                        unit: StageUnit::Regular(unit),
                        consumed: false,
                    },
                );
            }
            StageKind::Split { condition } => {
                let split =
                    compiler::split_dataset(parents, plugins.condition(condition)?, &config_source)?;
                built.insert(
                    stage.id.clone(),
                    BuiltStage {
                        unit: StageUnit::Split {
                            split,
                            complement: None,
                        },
                        consumed: false,
                    },
                );
            }
            StageKind::Output { plugin } => {
                let unit = compiler::output_dataset(
                    parents,
                    plugins.output(plugin)?,
                    &config_source,
                    sole_terminal,
                )?;
                output_ids.insert(stage.id.clone());
                output_units.push(unit);
            }
        }
    }

    for (id, stage) in &built {
        if !stage.consumed {
            warn!(pipeline = %def.id, stage = %id, "stage feeds no downstream consumer and will never run");
        }
    }

    let terminal = compiler::terminal_dataset(output_units)?;
    Ok(ExecutionGraph {
        id: def.id.clone(),
        terminal,
    })
}

fn resolve_inputs(
    stage: &StageDef,
    built: &mut HashMap<String, BuiltStage>,
    output_ids: &HashSet<String>,
) -> Result<Vec<DatasetRef>, BuildError> {
    let mut parents = Vec::with_capacity(stage.inputs.len());
    for input in &stage.inputs {
        let parent = match input {
            StageInput::Batch => compiler::root_dataset(),
            StageInput::Stage(upstream) => {
                if output_ids.contains(upstream) {
                    return Err(BuildError::OutputUpstream {
                        stage: stage.id.clone(),
                        upstream: upstream.clone(),
                    });
                }
                let entry = built.get_mut(upstream).ok_or_else(|| {
                    BuildError::DanglingReference {
                        stage: stage.id.clone(),
                        upstream: upstream.clone(),
                    }
                })?;
                entry.consumed = true;
                match &entry.unit {
                    StageUnit::Regular(unit) => unit.clone(),
                    StageUnit::Split { split, .. } => {
                        let unit: DatasetRef = split.clone();
                        unit
                    }
                }
            }
            StageInput::Complement(upstream) => {
                if output_ids.contains(upstream) {
                    return Err(BuildError::NotASplit {
                        stage: stage.id.clone(),
                        upstream: upstream.clone(),
                    });
                }
                let entry = built.get_mut(upstream).ok_or_else(|| {
                    BuildError::DanglingReference {
                        stage: stage.id.clone(),
                        upstream: upstream.clone(),
                    }
                })?;
                entry.consumed = true;
                match &mut entry.unit {
                    StageUnit::Split { split, complement } => complement
                        .get_or_insert_with(|| Complement::from(split.clone()))
                        .clone(),
                    StageUnit::Regular(_) => {
                        return Err(BuildError::NotASplit {
                            stage: stage.id.clone(),
                            upstream: upstream.clone(),
                        })
                    }
                }
            }
        };
        parents.push(parent);
    }
    Ok(parents)
}
