//! Graph-to-executable compiler.
//!
//! One composer per stage kind assembles `compute`/`clear` bodies out of
//! syntax fragments and a field bag, then hands them to [`compile`] to
//! synthesize an executable unit:
//! - [`root_datasets`]: pass-through of the cycle's batch
//! - [`filter_dataset`]: buffering, filter invocation, optional flush
//! - [`split_dataset`]: predicate partition into positive/negative buffers
//! - [`output_dataset`]: delivery to an output capability
//! - [`terminal_dataset`]: merge of all leaf units into one entry point
//!
//! Graph topology, buffering strategy and control flow are baked into the
//! synthesized units at build time; a cycle executes no fragment dispatch.

pub mod emit;
pub mod fields;

use crate::dataset::{CompiledDataset, DatasetRef, SplitDataset};
use crate::model::empty_events;
use crate::plugin::{EventCondition, FilterPlugin, FlushOptions, OutputPlugin};
use crate::syntax::{Block, Constant, Expr, Method, MethodArg, Stmt};
use fields::{FieldBag, FieldRef};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Argument passed to a filter's flush at the terminal flush.
pub const FLUSH_FINAL: FlushOptions = FlushOptions { final_flush: true };

/// Argument passed to a filter's flush mid-stream.
pub const FLUSH_NOT_FINAL: FlushOptions = FlushOptions { final_flush: false };

/// Errors raised while composing or synthesizing units.
///
/// All of these are fatal to the pipeline build: no partially built graph is
/// left usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("terminal merge requires at least one upstream unit")]
    EmptyTerminal,
    #[error("unknown field slot '{0}'")]
    UnknownField(String),
    #[error("field slot '{field}' is a {found}, fragment expects a {expected}")]
    SlotMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("fragment cannot produce a {expected}: {fragment}")]
    FragmentMismatch {
        expected: &'static str,
        fragment: String,
    },
    #[error("loop variable used outside a for-each body")]
    EventOutsideLoop,
    #[error("clear body may not invoke fallible capability method '{0}'")]
    FallibleClear(&'static str),
    #[error("clear body may not return a value")]
    ReturnInClear,
}

/// Intended purpose of a synthesized unit, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFlavor {
    Root,
    Filter,
    Output,
    Conditional,
}

impl DatasetFlavor {
    fn display(self) -> &'static str {
        match self {
            DatasetFlavor::Root => "Root",
            DatasetFlavor::Filter => "Filter",
            DatasetFlavor::Output => "Output",
            DatasetFlavor::Conditional => "Conditional",
        }
    }
}

struct SourceRegistry {
    entries: Vec<(String, String)>,
    seen: HashMap<String, String>,
    counter: usize,
}

impl SourceRegistry {
    fn register(&mut self, flavor: DatasetFlavor, body: String) -> String {
        let key = format!("{}|{body}", flavor.display());
        if let Some(name) = self.seen.get(&key) {
            return name.clone();
        }
        let name = format!("{}Dataset{}", flavor.display(), self.counter);
        self.counter += 1;
        let source = format!("dataset {name} {{\n{body}}}\n");
        self.entries.push((name.clone(), source));
        self.seen.insert(key, name.clone());
        name
    }
}

/// Synthesizing a unit is not reentrant-safe: this lock serializes it
/// process-wide. It is taken only while building a graph, never during
/// steady-state execution.
static REGISTRY: Lazy<Mutex<SourceRegistry>> = Lazy::new(|| {
    Mutex::new(SourceRegistry {
        entries: Vec::new(),
        seen: HashMap::new(),
        counter: 0,
    })
});

/// Compile and instantiate one executable unit from method bodies and the
/// fields they capture.
///
/// Each invocation yields an independent unit; identical bodies share one
/// entry in the generated-source registry.
pub fn compile(
    compute: Block,
    clear: Block,
    fields: FieldBag,
    flavor: DatasetFlavor,
    config_source: &str,
) -> Result<DatasetRef, CompileError> {
    let mut registry = REGISTRY.lock();
    let compute_body = emit::compile_compute(&compute, &fields)?;
    let clear_body = emit::compile_clear(&clear, &fields)?;
    let body = render_unit(&compute, &clear, &fields, config_source);
    let name = registry.register(flavor, body);
    debug!(
        unit = %name,
        flavor = flavor.display(),
        config = config_source,
        "synthesized dataset"
    );
    Ok(Rc::new(CompiledDataset::new(name, compute_body, clear_body)))
}

/// Formatted source of every synthesized unit, for operator inspection.
/// Not used by the execution path.
pub fn generated_source() -> Vec<String> {
    let registry = REGISTRY.lock();
    let mut entries: Vec<&(String, String)> = registry.entries.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .into_iter()
        .flat_map(|(_, source)| source.lines().map(str::to_string).collect::<Vec<_>>())
        .collect()
}

fn render_unit(compute: &Block, clear: &Block, fields: &FieldBag, config_source: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  // {config_source}");
    if !fields.is_empty() {
        let slots: Vec<String> = fields
            .iter()
            .map(|(name, slot)| format!("{name}: {}", slot.kind()))
            .collect();
        let _ = writeln!(out, "  fields {{ {} }}", slots.join(", "));
    }
    let _ = writeln!(out, "  compute {{");
    compute.render(&mut out, 2);
    let _ = writeln!(out, "  }}");
    let _ = writeln!(out, "  clear {{");
    clear.render(&mut out, 2);
    let _ = writeln!(out, "  }}");
    out
}

thread_local! {
    static ROOT: DatasetRef = synthesize_root();
}

fn synthesize_root() -> DatasetRef {
    compile(
        Block::wrap(vec![Stmt::Return(Expr::Arg(MethodArg::Batch))]),
        Block::new(),
        FieldBag::new(),
        DatasetFlavor::Root,
        "(root)",
    )
    .expect("root dataset body is statically valid")
}

/// Root units at the beginning of the execution tree: stateless
/// pass-throughs of the cycle's batch, used wherever a stage's only upstream
/// is the batch itself.
pub fn root_datasets() -> Vec<DatasetRef> {
    vec![root_dataset()]
}

/// This thread's shared root unit. Graph instances are thread-local, so one
/// stateless instance serves every graph built on the thread.
pub fn root_dataset() -> DatasetRef {
    ROOT.with(Rc::clone)
}

fn is_root(dataset: &DatasetRef) -> bool {
    ROOT.with(|root| Rc::ptr_eq(root, dataset))
}

/// Compose the unit for a filter stage.
///
/// `config_source` labels the originating configuration fragment; it only
/// shows up in diagnostics.
pub fn filter_dataset(
    parents: Vec<DatasetRef>,
    filter: Arc<dyn FilterPlugin>,
    config_source: &str,
) -> Result<DatasetRef, CompileError> {
    let mut fields = FieldBag::new();
    let parent_fields: Vec<FieldRef> = parents
        .into_iter()
        .map(|parent| fields.add_dataset(parent))
        .collect();
    let input = fields.add_events();
    let output = fields.add_events();
    let has_flush = filter.has_flush();
    let periodic_flush = filter.periodic_flush();
    let filter_field = fields.add_filter(filter);
    let done = fields.add_flag();

    let mut compute = return_if_done(&output, &done)
        .add(buffer_parents(&parent_fields, &input))
        .then(Stmt::Effect(Expr::field(&output).call(
            Method::Extend,
            vec![Expr::field(&filter_field).call(Method::Process, vec![Expr::field(&input)])],
        )))
        .then(Stmt::Effect(
            Expr::field(&input).call(Method::Clear, Vec::new()),
        ));
    if has_flush {
        compute = compute.then(call_filter_flush(&output, &filter_field, !periodic_flush));
    }
    let compute = compute
        .then(Stmt::Assign {
            field: done.clone(),
            value: Expr::Constant(Constant::True),
        })
        .then(Stmt::Return(Expr::field(&output)));

    let clear = clear_all(&parent_fields)
        .then(Stmt::Effect(
            Expr::field(&output).call(Method::Clear, Vec::new()),
        ))
        .then(Stmt::Assign {
            field: done,
            value: Expr::Constant(Constant::False),
        });

    compile(compute, clear, fields, DatasetFlavor::Filter, config_source)
}

/// Compose the split unit for a branch stage.
///
/// The returned split computes the positive branch; its negative buffer is
/// exposed through [`SplitDataset::right`] and consumed by a
/// [`crate::dataset::Complement`].
pub fn split_dataset(
    parents: Vec<DatasetRef>,
    condition: Arc<dyn EventCondition>,
    config_source: &str,
) -> Result<Rc<SplitDataset>, CompileError> {
    let mut fields = FieldBag::new();
    let parent_fields: Vec<FieldRef> = parents
        .into_iter()
        .map(|parent| fields.add_dataset(parent))
        .collect();
    let if_data = fields.add_events();
    let negative = empty_events();
    let else_data = fields.add_shared_events(negative.clone());
    let buffer = fields.add_events();
    let condition_field = fields.add_condition(condition);
    let done = fields.add_flag();

    let compute = return_if_done(&if_data, &done)
        .add(buffer_parents(&parent_fields, &buffer))
        .then(Stmt::ForEach {
            source: Expr::field(&buffer),
            body: Block::wrap(vec![Stmt::If {
                condition: Expr::field(&condition_field)
                    .call(Method::Fulfilled, vec![Expr::EventVar]),
                then_branch: Block::wrap(vec![Stmt::Effect(
                    Expr::field(&if_data).call(Method::Push, vec![Expr::EventVar]),
                )]),
                else_branch: Block::wrap(vec![Stmt::Effect(
                    Expr::field(&else_data).call(Method::Push, vec![Expr::EventVar]),
                )]),
            }]),
        })
        .then(Stmt::Effect(
            Expr::field(&buffer).call(Method::Clear, Vec::new()),
        ))
        .then(Stmt::Assign {
            field: done.clone(),
            value: Expr::Constant(Constant::True),
        })
        .then(Stmt::Return(Expr::field(&if_data)));

    let clear = clear_all(&parent_fields)
        .then(Stmt::Effect(
            Expr::field(&if_data).call(Method::Clear, Vec::new()),
        ))
        .then(Stmt::Effect(
            Expr::field(&else_data).call(Method::Clear, Vec::new()),
        ))
        .then(Stmt::Assign {
            field: done,
            value: Expr::Constant(Constant::False),
        });

    let inner = compile(
        compute,
        clear,
        fields,
        DatasetFlavor::Conditional,
        config_source,
    )?;
    Ok(Rc::new(SplitDataset::new(inner, negative)))
}

/// Compose the unit for an output stage.
///
/// `terminal` marks the sole terminal consumer of the whole graph: such a
/// unit clears its upstreams inline at the end of `compute`, because nothing
/// else will drive the clear path for the cycle. Otherwise clearing is
/// deferred to the unit's own `clear`, invoked by the cycle driver.
pub fn output_dataset(
    parents: Vec<DatasetRef>,
    output: Arc<dyn OutputPlugin>,
    config_source: &str,
    terminal: bool,
) -> Result<DatasetRef, CompileError> {
    // Short-circuit the trivial "no filters, single output" pipeline shape:
    // forward the batch handle itself, with no buffering.
    if let [parent] = parents.as_slice() {
        if is_root(parent) {
            return output_dataset_from_root(output, config_source);
        }
    }
    let mut fields = FieldBag::new();
    let parent_fields: Vec<FieldRef> = parents
        .into_iter()
        .map(|parent| fields.add_dataset(parent))
        .collect();
    let input = fields.add_events();
    let output_field = fields.add_output(output);
    let (clear, inline_clear) = if terminal {
        (Block::new(), clear_all(&parent_fields))
    } else {
        (clear_all(&parent_fields), Block::new())
    };

    let compute = buffer_parents(&parent_fields, &input)
        .then(Stmt::Effect(
            Expr::field(&output_field).call(Method::Receive, vec![Expr::field(&input)]),
        ))
        .then(Stmt::Effect(
            Expr::field(&input).call(Method::Clear, Vec::new()),
        ))
        .add(inline_clear);

    compile_output(compute, clear, fields, config_source)
}

fn output_dataset_from_root(
    output: Arc<dyn OutputPlugin>,
    config_source: &str,
) -> Result<DatasetRef, CompileError> {
    let mut fields = FieldBag::new();
    let output_field = fields.add_output(output);
    let compute = Block::wrap(vec![Stmt::Effect(
        Expr::field(&output_field).call(Method::Receive, vec![Expr::Arg(MethodArg::Batch)]),
    )]);
    compile_output(compute, Block::new(), fields, config_source)
}

/// Merge leaf units into the single entry point a cycle driver pulls.
///
/// With one parent the parent itself is returned, unwrapped. With more, the
/// merged unit drives every parent once and then clears them, so every leaf
/// in a multi-output graph runs exactly once per cycle.
pub fn terminal_dataset(mut parents: Vec<DatasetRef>) -> Result<DatasetRef, CompileError> {
    match parents.len() {
        0 => Err(CompileError::EmptyTerminal),
        1 => Ok(parents.remove(0)),
        _ => {
            let mut fields = FieldBag::new();
            let parent_fields: Vec<FieldRef> = parents
                .into_iter()
                .map(|parent| fields.add_dataset(parent))
                .collect();
            let mut compute = Block::new();
            for parent in &parent_fields {
                compute.push(Stmt::Effect(compute_call(parent)));
            }
            let compute = compute.add(clear_all(&parent_fields));
            let clear = clear_all(&parent_fields);
            compile_output(compute, clear, fields, "(terminal)")
        }
    }
}

fn compile_output(
    compute: Block,
    clear: Block,
    fields: FieldBag,
    config_source: &str,
) -> Result<DatasetRef, CompileError> {
    compile(
        compute.then(Stmt::Return(Expr::Constant(Constant::EmptyEvents))),
        clear,
        fields,
        DatasetFlavor::Output,
        config_source,
    )
}

fn compute_call(parent: &FieldRef) -> Expr {
    Expr::field(parent).compute()
}

fn clear_all(fields: &[FieldRef]) -> Block {
    Block::wrap(
        fields
            .iter()
            .map(|field| Stmt::Effect(Expr::field(field).call(Method::Clear, Vec::new())))
            .collect(),
    )
}

/// For each parent: pull its output and append the surviving (non-cancelled)
/// events into `buffer`.
fn buffer_parents(parents: &[FieldRef], buffer: &FieldRef) -> Block {
    Block::wrap(
        parents
            .iter()
            .map(|parent| Stmt::ForEach {
                source: compute_call(parent),
                body: Block::wrap(vec![Stmt::If {
                    condition: Expr::EventVar.call(Method::IsCancelled, Vec::new()).not(),
                    then_branch: Block::wrap(vec![Stmt::Effect(
                        Expr::field(buffer).call(Method::Push, vec![Expr::EventVar]),
                    )]),
                    else_branch: Block::new(),
                }]),
            })
            .collect(),
    )
}

fn return_if_done(buffer: &FieldRef, done: &FieldRef) -> Block {
    Block::wrap(vec![Stmt::If {
        condition: Expr::field(done),
        then_branch: Block::wrap(vec![Stmt::Return(Expr::field(buffer))]),
        else_branch: Block::new(),
    }])
}

fn call_filter_flush(output: &FieldRef, filter: &FieldRef, shutdown_only: bool) -> Stmt {
    // A filter without periodic flush only ever sees its one terminal flush;
    // a periodically flushed filter is told on each flush whether this is
    // the end.
    let (condition, options) = if shutdown_only {
        (
            Expr::Arg(MethodArg::FlushRequested).and(Expr::Arg(MethodArg::ShutdownRequested)),
            Expr::Constant(Constant::FlushFinal),
        )
    } else {
        (
            Expr::Arg(MethodArg::FlushRequested),
            Expr::ternary(
                Expr::Arg(MethodArg::ShutdownRequested),
                Expr::Constant(Constant::FlushFinal),
                Expr::Constant(Constant::FlushNotFinal),
            ),
        )
    };
    Stmt::If {
        condition,
        then_branch: Block::wrap(vec![Stmt::Effect(Expr::field(output).call(
            Method::Extend,
            vec![Expr::field(filter).call(Method::Flush, vec![options])],
        ))]),
        else_branch: Block::new(),
    }
}
