//! Everything needed to execute compiled closure templates: frames, cell
//! values, closures, the interpreter loop and the foreign-procedure bridge.

use core::fmt;
use std::rc::Rc;

use crate::value::{Symbol, Value};

pub mod cell;
pub mod chunk;
pub mod closure;
pub mod frame;
pub mod interpreter;
pub mod scheme_base;

/// Procedure arity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Min(usize),
}

impl Arity {
    pub fn is_satisfied(&self, len: usize) -> bool {
        match self {
            Self::Exact(e) => *e == len,
            Self::Min(m) => *m <= len,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(e) => write!(f, "exactly {e}"),
            Self::Min(m) => write!(f, "at least {m}"),
        }
    }
}

/// Errors raised by foreign procedures
#[derive(thiserror::Error, Debug)]
pub enum ForeignError {
    #[error("{name}: expected {expected} argument(s), got {got}")]
    Arity {
        name: Box<str>,
        expected: Arity,
        got: usize,
    },
    #[error("{name}: expected a {expected}, got {got}")]
    WrongType {
        name: Box<str>,
        expected: &'static str,
        got: Box<str>,
    },
    #[error("{0}: fixnum overflow")]
    Overflow(Box<str>),
    #[error("output failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ForeignError {
    pub fn wrong_type(name: &str, expected: &'static str, got: &Value) -> Self {
        Self::WrongType {
            name: Box::from(name),
            expected,
            got: Box::from(got.to_string()),
        }
    }
}

/// Native code callable from Scheme.
///
/// Foreign procedures run to completion as a leaf call: they see their
/// arguments as a plain slice and never touch the interpreter's frames.
pub trait Callback {
    fn name(&self) -> &str;

    fn arity(&self) -> Arity;

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError>;
}

#[derive(Clone)]
pub struct ForeignProcedure(Rc<dyn Callback>);

impl<T: Callback + 'static> From<T> for ForeignProcedure {
    fn from(value: T) -> Self {
        Self(Rc::new(value))
    }
}

impl ForeignProcedure {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn arity(&self) -> Arity {
        self.0.arity()
    }

    /// Checks arity, then hands the arguments to the callback.
    pub fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        let arity = self.0.arity();
        if !arity.is_satisfied(args.len()) {
            return Err(ForeignError::Arity {
                name: Box::from(self.0.name()),
                expected: arity,
                got: args.len(),
            });
        }
        self.0.call(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ForeignProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<primitive-procedure {} {:p}>",
            self.0.name(),
            Rc::as_ptr(&self.0)
        )
    }
}

/// Fatal runtime errors. The VM is left as-is when one is returned and must be
/// bootstrapped again before it runs anything else.
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    #[error("vm must be bootstrapped before running (currently {0:?})")]
    NotBootstrapped(interpreter::VmState),
    #[error("template has no registry; it was already bootstrapped")]
    MissingRegistry,
    #[error("unbound global variable: {0}")]
    UnboundGlobal(Symbol),
    #[error("global variable name must be a symbol, got {0}")]
    GlobalNameNotSymbol(Box<str>),
    #[error("attempt to call a non-procedure: {0}")]
    NotCallable(Box<str>),
    #[error("procedure expects {expected} argument(s), got {got}")]
    Arity { expected: Arity, got: usize },
    #[error(transparent)]
    Foreign(#[from] ForeignError),
    #[error("frame slot {0} is out of range")]
    SlotOutOfRange(usize),
    #[error("constant {0} is out of range")]
    ConstOutOfRange(usize),
    #[error("cell value {0} is out of range")]
    CellOutOfRange(usize),
    #[error("fresh cell {0} is out of range")]
    FreshCellOutOfRange(usize),
    #[error("closure template {0} is out of range")]
    TemplateOutOfRange(usize),
    #[error("program counter {0} ran past the end of the code")]
    PcOutOfRange(usize),
}
