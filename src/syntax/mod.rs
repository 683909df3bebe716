//! Syntax fragments used to assemble the bodies of compiled units.
//!
//! This is not a general-purpose IR. The fragment set covers exactly the
//! method bodies the pipeline model needs: sequential buffering, a
//! conditional branch, iteration over a buffer, early return, and field
//! reads/writes. Fragments render to the pseudo-source kept in the
//! generated-source registry and compile (in `compiler::emit`) into the
//! closures a unit executes.

use crate::compiler::fields::FieldRef;
use std::fmt;
use std::fmt::Write as _;

/// Identifier fragments for the arguments of `compute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodArg {
    /// The batch handed to the graph for this cycle.
    Batch,
    /// Whether the cycle driver requested a flush.
    FlushRequested,
    /// Whether the cycle driver requested shutdown.
    ShutdownRequested,
}

/// Literal fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    True,
    False,
    /// The terminal flush argument.
    FlushFinal,
    /// The mid-stream flush argument.
    FlushNotFinal,
    /// A fresh empty event buffer.
    EmptyEvents,
}

/// Methods a fragment may invoke on a field slot or the loop variable.
///
/// The set is closed: call targets are typed slots, and synthesis rejects a
/// method applied to the wrong slot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `dataset.compute(batch, flush_requested, shutdown_requested)`
    Compute,
    /// `dataset.clear()` or `buffer.clear()`
    Clear,
    /// `filter.process(buffer)`
    Process,
    /// `filter.flush(options)`
    Flush,
    /// `output.receive(buffer)`
    Receive,
    /// `condition.fulfilled(event)`
    Fulfilled,
    /// `event.is_cancelled()`
    IsCancelled,
    /// `buffer.push(event)`
    Push,
    /// `buffer.extend(events)`
    Extend,
}

impl Method {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Method::Compute => "compute",
            Method::Clear => "clear",
            Method::Process => "process",
            Method::Flush => "flush",
            Method::Receive => "receive",
            Method::Fulfilled => "fulfilled",
            Method::IsCancelled => "is_cancelled",
            Method::Push => "push",
            Method::Extend => "extend",
        }
    }
}

/// Expression fragment.
#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Constant),
    Arg(MethodArg),
    /// The event bound by the innermost enclosing [`Stmt::ForEach`].
    EventVar,
    /// Read of a field slot.
    Field(FieldRef),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Ternary {
        condition: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Call {
        target: Box<Expr>,
        method: Method,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Read the given field slot.
    pub fn field(field: &FieldRef) -> Self {
        Expr::Field(field.clone())
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn and(self, rhs: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn ternary(condition: Expr, if_true: Expr, if_false: Expr) -> Self {
        Expr::Ternary {
            condition: Box::new(condition),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    /// Invoke a method on this expression.
    pub fn call(self, method: Method, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: Box::new(self),
            method,
            args,
        }
    }

    /// `self.compute(batch, flush_requested, shutdown_requested)`.
    pub fn compute(self) -> Self {
        self.call(
            Method::Compute,
            vec![
                Expr::Arg(MethodArg::Batch),
                Expr::Arg(MethodArg::FlushRequested),
                Expr::Arg(MethodArg::ShutdownRequested),
            ],
        )
    }
}

/// Statement fragment.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Overwrite a flag field.
    Assign { field: FieldRef, value: Expr },
    /// Evaluate a call for its side effect.
    Effect(Expr),
    If {
        condition: Expr,
        then_branch: Block,
        else_branch: Block,
    },
    /// Iterate the events of a buffer, binding each to the loop variable.
    ForEach { source: Expr, body: Block },
    /// Early return of an event buffer.
    Return(Expr),
}

/// An ordered sequence of statements forming (part of) a method body.
#[derive(Debug, Clone, Default)]
pub struct Block(Vec<Stmt>);

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(stmts: Vec<Stmt>) -> Self {
        Self(stmts)
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.0.push(stmt);
    }

    /// Append another block, returning self for chaining.
    pub fn add(mut self, other: Block) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Append one statement, returning self for chaining.
    pub fn then(mut self, stmt: Stmt) -> Self {
        self.0.push(stmt);
        self
    }

    pub(crate) fn render(&self, out: &mut String, indent: usize) {
        for stmt in &self.0 {
            stmt.render(out, indent);
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::True => write!(f, "true"),
            Constant::False => write!(f, "false"),
            Constant::FlushFinal => write!(f, "FLUSH_FINAL"),
            Constant::FlushNotFinal => write!(f, "FLUSH_NOT_FINAL"),
            Constant::EmptyEvents => write!(f, "[]"),
        }
    }
}

impl fmt::Display for MethodArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodArg::Batch => write!(f, "batch"),
            MethodArg::FlushRequested => write!(f, "flush_requested"),
            MethodArg::ShutdownRequested => write!(f, "shutdown_requested"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(c) => write!(f, "{c}"),
            Expr::Arg(arg) => write!(f, "{arg}"),
            Expr::EventVar => write!(f, "event"),
            Expr::Field(field) => write!(f, "{field}"),
            Expr::Not(inner) => write!(f, "!{inner}"),
            Expr::And(lhs, rhs) => write!(f, "{lhs} && {rhs}"),
            Expr::Ternary {
                condition,
                if_true,
                if_false,
            } => write!(f, "{condition} ? {if_true} : {if_false}"),
            Expr::Call {
                target,
                method,
                args,
            } => {
                write!(f, "{target}.{}(", method.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Stmt {
    fn render(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        match self {
            Stmt::Assign { field, value } => {
                let _ = writeln!(out, "{pad}{field} = {value};");
            }
            Stmt::Effect(expr) => {
                let _ = writeln!(out, "{pad}{expr};");
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let _ = writeln!(out, "{pad}if {condition} {{");
                then_branch.render(out, indent + 1);
                if else_branch.is_empty() {
                    let _ = writeln!(out, "{pad}}}");
                } else {
                    let _ = writeln!(out, "{pad}}} else {{");
                    else_branch.render(out, indent + 1);
                    let _ = writeln!(out, "{pad}}}");
                }
            }
            Stmt::ForEach { source, body } => {
                let _ = writeln!(out, "{pad}for event in {source} {{");
                body.render(out, indent + 1);
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::Return(expr) => {
                let _ = writeln!(out, "{pad}return {expr};");
            }
        }
    }
}
