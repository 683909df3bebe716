//! Fragment-to-closure compilation.
//!
//! Each fragment is compiled once, at synthesis time, into a boxed closure
//! that has already resolved and captured its slot handles; executing a unit
//! afterwards involves no fragment inspection. Mismatches between fragments
//! and slots surface here as [`CompileError`]s, never during a cycle.

use super::fields::{FieldBag, FieldRef, SlotValue};
use super::{CompileError, FLUSH_FINAL, FLUSH_NOT_FINAL};
use crate::model::{empty_events, events, Event, EventsRef};
use crate::plugin::{FlushOptions, PluginError};
use crate::syntax::{Block, Constant, Expr, Method, MethodArg, Stmt};

/// Execution context for one `compute` or `clear` invocation.
pub(crate) struct Scope<'a> {
    pub batch: &'a EventsRef,
    pub flush_requested: bool,
    pub shutdown_requested: bool,
    /// Event bound by the innermost for-each, when inside one.
    pub event: Option<&'a Event>,
}

impl<'a> Scope<'a> {
    fn with_event(&self, event: &'a Event) -> Scope<'a> {
        Scope {
            batch: self.batch,
            flush_requested: self.flush_requested,
            shutdown_requested: self.shutdown_requested,
            event: Some(event),
        }
    }

    fn event(&self) -> &Event {
        // loop-variable use outside a for-each is rejected at synthesis time
        self.event.expect("loop variable bound by enclosing for-each")
    }
}

/// Outcome of one compiled statement.
pub(crate) enum Exec {
    Next,
    Return(EventsRef),
}

pub(crate) type StmtFn = Box<dyn Fn(&Scope<'_>) -> Result<Exec, PluginError>>;
type BoolFn = Box<dyn Fn(&Scope<'_>) -> Result<bool, PluginError>>;
type EventsFn = Box<dyn Fn(&Scope<'_>) -> Result<EventsRef, PluginError>>;
type FlushFn = Box<dyn Fn(&Scope<'_>) -> Result<FlushOptions, PluginError>>;

/// Run a compiled body, stopping at the first early return.
pub(crate) fn run_block(
    stmts: &[StmtFn],
    scope: &Scope<'_>,
) -> Result<Option<EventsRef>, PluginError> {
    for stmt in stmts {
        if let Exec::Return(out) = stmt(scope)? {
            return Ok(Some(out));
        }
    }
    Ok(None)
}

/// Compile a `compute` body.
pub(crate) fn compile_compute(
    block: &Block,
    fields: &FieldBag,
) -> Result<Vec<StmtFn>, CompileError> {
    compile_block(block, fields, false)
}

/// Compile a `clear` body. Clear bodies may only contain infallible,
/// effect-only fragments: they run outside the error path of `compute`.
pub(crate) fn compile_clear(block: &Block, fields: &FieldBag) -> Result<Vec<StmtFn>, CompileError> {
    ensure_effect_only(block)?;
    compile_block(block, fields, false)
}

fn compile_block(block: &Block, fields: &FieldBag, in_loop: bool) -> Result<Vec<StmtFn>, CompileError> {
    block
        .stmts()
        .iter()
        .map(|stmt| compile_stmt(stmt, fields, in_loop))
        .collect()
}

fn compile_stmt(stmt: &Stmt, fields: &FieldBag, in_loop: bool) -> Result<StmtFn, CompileError> {
    match stmt {
        Stmt::Assign { field, value } => {
            let flag = flag_slot(fields, field)?;
            let value = compile_bool(value, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                flag.set(value(scope)?);
                Ok(Exec::Next)
            }))
        }
        Stmt::Effect(expr) => compile_effect(expr, fields, in_loop),
        Stmt::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let condition = compile_bool(condition, fields, in_loop)?;
            let then_branch = compile_block(then_branch, fields, in_loop)?;
            let else_branch = compile_block(else_branch, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                let branch = if condition(scope)? {
                    &then_branch
                } else {
                    &else_branch
                };
                match run_block(branch, scope)? {
                    Some(out) => Ok(Exec::Return(out)),
                    None => Ok(Exec::Next),
                }
            }))
        }
        Stmt::ForEach { source, body } => {
            let source = compile_events(source, fields, in_loop)?;
            let body = compile_block(body, fields, true)?;
            Ok(Box::new(move |scope| {
                let source_events = source(scope)?;
                // iterate a snapshot of handles so the body may freely push
                // into other buffers
                let items: Vec<Event> = source_events.borrow().iter().cloned().collect();
                for event in &items {
                    let inner = scope.with_event(event);
                    if let Some(out) = run_block(&body, &inner)? {
                        return Ok(Exec::Return(out));
                    }
                }
                Ok(Exec::Next)
            }))
        }
        Stmt::Return(expr) => {
            let value = compile_events(expr, fields, in_loop)?;
            Ok(Box::new(move |scope| Ok(Exec::Return(value(scope)?))))
        }
    }
}

fn compile_effect(expr: &Expr, fields: &FieldBag, in_loop: bool) -> Result<StmtFn, CompileError> {
    let Expr::Call {
        target,
        method,
        args,
    } = expr
    else {
        return Err(mismatch("effect", expr));
    };
    match method {
        Method::Clear => {
            require_no_args(args, expr)?;
            match slot(fields, target_field(target)?)? {
                SlotValue::Dataset(parent) => {
                    let parent = parent.clone();
                    Ok(Box::new(move |_| {
                        parent.clear();
                        Ok(Exec::Next)
                    }))
                }
                SlotValue::Events(buffer) => {
                    let buffer = buffer.clone();
                    Ok(Box::new(move |_| {
                        buffer.borrow_mut().clear();
                        Ok(Exec::Next)
                    }))
                }
                other => Err(slot_mismatch(target_field(target)?, "dataset or events", other)),
            }
        }
        Method::Push => {
            let buffer = events_slot(fields, target_field(target)?)?;
            require_event_arg(args, expr, in_loop)?;
            Ok(Box::new(move |scope| {
                buffer.borrow_mut().push(scope.event().clone());
                Ok(Exec::Next)
            }))
        }
        Method::Extend => {
            let buffer = events_slot(fields, target_field(target)?)?;
            let incoming = single_events_arg(args, expr, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                let incoming = incoming(scope)?;
                let items: Vec<Event> = incoming.borrow().iter().cloned().collect();
                buffer.borrow_mut().extend(items);
                Ok(Exec::Next)
            }))
        }
        Method::Receive => {
            let output = output_slot(fields, target_field(target)?)?;
            let incoming = single_events_arg(args, expr, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                let incoming = incoming(scope)?;
                output.receive(&incoming)?;
                Ok(Exec::Next)
            }))
        }
        // events-producing calls may also run purely for effect
        Method::Compute | Method::Process | Method::Flush => {
            let value = compile_events(expr, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                value(scope)?;
                Ok(Exec::Next)
            }))
        }
        Method::Fulfilled | Method::IsCancelled => Err(mismatch("effect", expr)),
    }
}

fn compile_bool(expr: &Expr, fields: &FieldBag, in_loop: bool) -> Result<BoolFn, CompileError> {
    match expr {
        Expr::Constant(Constant::True) => Ok(Box::new(|_| Ok(true))),
        Expr::Constant(Constant::False) => Ok(Box::new(|_| Ok(false))),
        Expr::Arg(MethodArg::FlushRequested) => Ok(Box::new(|scope| Ok(scope.flush_requested))),
        Expr::Arg(MethodArg::ShutdownRequested) => {
            Ok(Box::new(|scope| Ok(scope.shutdown_requested)))
        }
        Expr::Field(field) => {
            let flag = flag_slot(fields, field)?;
            Ok(Box::new(move |_| Ok(flag.get())))
        }
        Expr::Not(inner) => {
            let inner = compile_bool(inner, fields, in_loop)?;
            Ok(Box::new(move |scope| Ok(!inner(scope)?)))
        }
        Expr::And(lhs, rhs) => {
            let lhs = compile_bool(lhs, fields, in_loop)?;
            let rhs = compile_bool(rhs, fields, in_loop)?;
            Ok(Box::new(move |scope| Ok(lhs(scope)? && rhs(scope)?)))
        }
        Expr::Ternary {
            condition,
            if_true,
            if_false,
        } => {
            let condition = compile_bool(condition, fields, in_loop)?;
            let if_true = compile_bool(if_true, fields, in_loop)?;
            let if_false = compile_bool(if_false, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                if condition(scope)? {
                    if_true(scope)
                } else {
                    if_false(scope)
                }
            }))
        }
        Expr::Call {
            target,
            method: Method::Fulfilled,
            args,
        } => {
            let condition = condition_slot(fields, target_field(target)?)?;
            require_event_arg(args, expr, in_loop)?;
            Ok(Box::new(move |scope| condition.fulfilled(scope.event())))
        }
        Expr::Call {
            target,
            method: Method::IsCancelled,
            args,
        } => {
            require_no_args(args, expr)?;
            require_event_target(target, expr, in_loop)?;
            Ok(Box::new(move |scope| Ok(scope.event().is_cancelled())))
        }
        other => Err(mismatch("boolean", other)),
    }
}

fn compile_events(expr: &Expr, fields: &FieldBag, in_loop: bool) -> Result<EventsFn, CompileError> {
    match expr {
        Expr::Field(field) => {
            let buffer = events_slot(fields, field)?;
            Ok(Box::new(move |_| Ok(buffer.clone())))
        }
        Expr::Arg(MethodArg::Batch) => Ok(Box::new(|scope| Ok(scope.batch.clone()))),
        Expr::Constant(Constant::EmptyEvents) => Ok(Box::new(|_| Ok(empty_events()))),
        Expr::Call {
            target,
            method: Method::Compute,
            args,
        } => {
            let parent = dataset_slot(fields, target_field(target)?)?;
            require_compute_args(args, expr)?;
            Ok(Box::new(move |scope| {
                parent.compute(scope.batch, scope.flush_requested, scope.shutdown_requested)
            }))
        }
        Expr::Call {
            target,
            method: Method::Process,
            args,
        } => {
            let filter = filter_slot(fields, target_field(target)?)?;
            let input = single_events_arg(args, expr, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                let input = input(scope)?;
                let processed = filter.process(&input.borrow())?;
                Ok(events(processed))
            }))
        }
        Expr::Call {
            target,
            method: Method::Flush,
            args,
        } => {
            let filter = filter_slot(fields, target_field(target)?)?;
            let options = match args.as_slice() {
                [options] => compile_flush_options(options, fields, in_loop)?,
                _ => return Err(mismatch("flush options argument", expr)),
            };
            Ok(Box::new(move |scope| {
                let flushed = filter.flush(options(scope)?)?;
                Ok(events(flushed))
            }))
        }
        other => Err(mismatch("events", other)),
    }
}

fn compile_flush_options(
    expr: &Expr,
    fields: &FieldBag,
    in_loop: bool,
) -> Result<FlushFn, CompileError> {
    match expr {
        Expr::Constant(Constant::FlushFinal) => Ok(Box::new(|_| Ok(FLUSH_FINAL))),
        Expr::Constant(Constant::FlushNotFinal) => Ok(Box::new(|_| Ok(FLUSH_NOT_FINAL))),
        Expr::Ternary {
            condition,
            if_true,
            if_false,
        } => {
            let condition = compile_bool(condition, fields, in_loop)?;
            let if_true = compile_flush_options(if_true, fields, in_loop)?;
            let if_false = compile_flush_options(if_false, fields, in_loop)?;
            Ok(Box::new(move |scope| {
                if condition(scope)? {
                    if_true(scope)
                } else {
                    if_false(scope)
                }
            }))
        }
        other => Err(mismatch("flush options", other)),
    }
}

fn ensure_effect_only(block: &Block) -> Result<(), CompileError> {
    for stmt in block.stmts() {
        match stmt {
            Stmt::Return(_) => return Err(CompileError::ReturnInClear),
            Stmt::Assign { value, .. } => check_infallible(value)?,
            Stmt::Effect(expr) => check_infallible(expr)?,
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                check_infallible(condition)?;
                ensure_effect_only(then_branch)?;
                ensure_effect_only(else_branch)?;
            }
            Stmt::ForEach { source, body } => {
                check_infallible(source)?;
                ensure_effect_only(body)?;
            }
        }
    }
    Ok(())
}

fn check_infallible(expr: &Expr) -> Result<(), CompileError> {
    match expr {
        Expr::Call {
            target,
            method,
            args,
        } => {
            if matches!(
                method,
                Method::Compute
                    | Method::Process
                    | Method::Flush
                    | Method::Receive
                    | Method::Fulfilled
            ) {
                return Err(CompileError::FallibleClear(method.name()));
            }
            check_infallible(target)?;
            args.iter().try_for_each(check_infallible)
        }
        Expr::Not(inner) => check_infallible(inner),
        Expr::And(lhs, rhs) => {
            check_infallible(lhs)?;
            check_infallible(rhs)
        }
        Expr::Ternary {
            condition,
            if_true,
            if_false,
        } => {
            check_infallible(condition)?;
            check_infallible(if_true)?;
            check_infallible(if_false)
        }
        Expr::Constant(_) | Expr::Arg(_) | Expr::EventVar | Expr::Field(_) => Ok(()),
    }
}

fn slot<'a>(fields: &'a FieldBag, field: &FieldRef) -> Result<&'a SlotValue, CompileError> {
    fields
        .get(field)
        .ok_or_else(|| CompileError::UnknownField(field.name().to_string()))
}

fn slot_mismatch(field: &FieldRef, expected: &'static str, found: &SlotValue) -> CompileError {
    CompileError::SlotMismatch {
        field: field.name().to_string(),
        expected,
        found: found.kind(),
    }
}

fn mismatch(expected: &'static str, fragment: &Expr) -> CompileError {
    CompileError::FragmentMismatch {
        expected,
        fragment: fragment.to_string(),
    }
}

fn target_field(expr: &Expr) -> Result<&FieldRef, CompileError> {
    match expr {
        Expr::Field(field) => Ok(field),
        other => Err(mismatch("field reference", other)),
    }
}

fn require_no_args(args: &[Expr], expr: &Expr) -> Result<(), CompileError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(mismatch("no arguments", expr))
    }
}

fn require_event_arg(args: &[Expr], expr: &Expr, in_loop: bool) -> Result<(), CompileError> {
    match args {
        [Expr::EventVar] => {
            if in_loop {
                Ok(())
            } else {
                Err(CompileError::EventOutsideLoop)
            }
        }
        _ => Err(mismatch("event argument", expr)),
    }
}

fn require_event_target(target: &Expr, expr: &Expr, in_loop: bool) -> Result<(), CompileError> {
    match target {
        Expr::EventVar => {
            if in_loop {
                Ok(())
            } else {
                Err(CompileError::EventOutsideLoop)
            }
        }
        _ => Err(mismatch("event target", expr)),
    }
}

fn require_compute_args(args: &[Expr], expr: &Expr) -> Result<(), CompileError> {
    match args {
        [Expr::Arg(MethodArg::Batch), Expr::Arg(MethodArg::FlushRequested), Expr::Arg(MethodArg::ShutdownRequested)] => {
            Ok(())
        }
        _ => Err(mismatch("compute arguments", expr)),
    }
}

fn single_events_arg(
    args: &[Expr],
    expr: &Expr,
    fields: &FieldBag,
    in_loop: bool,
) -> Result<EventsFn, CompileError> {
    match args {
        [arg] => compile_events(arg, fields, in_loop),
        _ => Err(mismatch("events argument", expr)),
    }
}

fn events_slot(fields: &FieldBag, field: &FieldRef) -> Result<EventsRef, CompileError> {
    match slot(fields, field)? {
        SlotValue::Events(buffer) => Ok(buffer.clone()),
        other => Err(slot_mismatch(field, "events", other)),
    }
}

fn dataset_slot(
    fields: &FieldBag,
    field: &FieldRef,
) -> Result<crate::dataset::DatasetRef, CompileError> {
    match slot(fields, field)? {
        SlotValue::Dataset(dataset) => Ok(dataset.clone()),
        other => Err(slot_mismatch(field, "dataset", other)),
    }
}

fn flag_slot(
    fields: &FieldBag,
    field: &FieldRef,
) -> Result<std::rc::Rc<std::cell::Cell<bool>>, CompileError> {
    match slot(fields, field)? {
        SlotValue::Flag(flag) => Ok(flag.clone()),
        other => Err(slot_mismatch(field, "flag", other)),
    }
}

fn filter_slot(
    fields: &FieldBag,
    field: &FieldRef,
) -> Result<std::sync::Arc<dyn crate::plugin::FilterPlugin>, CompileError> {
    match slot(fields, field)? {
        SlotValue::Filter(filter) => Ok(filter.clone()),
        other => Err(slot_mismatch(field, "filter", other)),
    }
}

fn output_slot(
    fields: &FieldBag,
    field: &FieldRef,
) -> Result<std::sync::Arc<dyn crate::plugin::OutputPlugin>, CompileError> {
    match slot(fields, field)? {
        SlotValue::Output(output) => Ok(output.clone()),
        other => Err(slot_mismatch(field, "output", other)),
    }
}

fn condition_slot(
    fields: &FieldBag,
    field: &FieldRef,
) -> Result<std::sync::Arc<dyn crate::plugin::EventCondition>, CompileError> {
    match slot(fields, field)? {
        SlotValue::Condition(condition) => Ok(condition.clone()),
        other => Err(slot_mismatch(field, "condition", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::mock::CountingFilter;
    use std::sync::Arc;

    #[test]
    fn assign_rejects_non_flag_slot() {
        let mut fields = FieldBag::new();
        let buffer = fields.add_events();
        let stmt = Stmt::Assign {
            field: buffer,
            value: Expr::Constant(Constant::True),
        };
        let err = compile_stmt(&stmt, &fields, false).err().expect("must be rejected");
        assert!(matches!(err, CompileError::SlotMismatch { expected: "flag", .. }));
    }

    #[test]
    fn loop_variable_outside_loop_is_rejected() {
        let mut fields = FieldBag::new();
        let buffer = fields.add_events();
        let stmt = Stmt::Effect(Expr::field(&buffer).call(Method::Push, vec![Expr::EventVar]));
        let err = compile_stmt(&stmt, &fields, false).err().expect("must be rejected");
        assert!(matches!(err, CompileError::EventOutsideLoop));
    }

    #[test]
    fn clear_body_rejects_capability_calls() {
        let mut fields = FieldBag::new();
        let input = fields.add_events();
        let filter = fields.add_filter(Arc::new(CountingFilter::new()));
        let block = Block::wrap(vec![Stmt::Effect(
            Expr::field(&filter).call(Method::Process, vec![Expr::field(&input)]),
        )]);
        let err = compile_clear(&block, &fields).err().expect("must be rejected");
        assert!(matches!(err, CompileError::FallibleClear("process")));
    }

    #[test]
    fn foreign_field_reference_is_rejected() {
        let fields = FieldBag::new();
        let mut other = FieldBag::new();
        let foreign = other.add_events();
        let stmt = Stmt::Return(Expr::field(&foreign));
        let err = compile_stmt(&stmt, &fields, false).err().expect("must be rejected");
        assert!(matches!(err, CompileError::UnknownField(_)));
    }
}
