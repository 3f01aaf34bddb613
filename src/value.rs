//! Representation of Scheme values
use core::fmt;
use std::{cell::RefCell, rc::Rc};

use crate::runtime::{
    cell::CellValue,
    closure::{Closure, ClosureTemplate},
    ForeignProcedure,
};

pub use symbol::Symbol;

pub mod symbol;

pub type Integer = i64;

/// Every value the compiler and the VM can touch.
///
/// Atoms are stored inline; everything with identity lives behind an [`Rc`]
/// so cloning a value never copies the object it refers to.
#[derive(Clone, Default)]
pub enum Value {
    /// The empty list, written `()`
    Nil,
    /// Result of `define`, `set!` and one-armed `if`
    #[default]
    Unspecified,
    Boolean(bool),
    Fixnum(Integer),
    Symbol(Symbol),
    Pair(Rc<Pair>),
    Closure(Rc<Closure>),
    Template(Rc<ClosureTemplate>),
    Cell(Rc<CellValue>),
    Foreign(ForeignProcedure),
}

/// A mutable cons cell
pub struct Pair {
    car: RefCell<Value>,
    cdr: RefCell<Value>,
}

impl Pair {
    pub fn car(&self) -> Value {
        self.car.borrow().clone()
    }

    pub fn cdr(&self) -> Value {
        self.cdr.borrow().clone()
    }

    pub fn set_car(&self, value: Value) {
        *self.car.borrow_mut() = value;
    }

    pub fn set_cdr(&self, value: Value) {
        *self.cdr.borrow_mut() = value;
    }
}

// Dropping a long list would otherwise recurse once per element.
impl Drop for Pair {
    fn drop(&mut self) {
        let mut rest = self.cdr.take();
        while let Value::Pair(pair) = rest {
            rest = match Rc::try_unwrap(pair) {
                Ok(pair) => pair.cdr.take(),
                Err(_) => break,
            };
        }
    }
}

impl Value {
    pub fn cons(car: Value, cdr: Value) -> Self {
        Self::Pair(Rc::new(Pair {
            car: RefCell::new(car),
            cdr: RefCell::new(cdr),
        }))
    }

    pub fn symbol(text: impl AsRef<str>) -> Self {
        Self::Symbol(Symbol::intern(text))
    }

    /// Builds a list out of `items`, ending in `tail` instead of `()`.
    pub fn list_with_tail<I>(items: I, tail: Value) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        items
            .into_iter()
            .rev()
            .fold(tail, |rest, item| Value::cons(item, rest))
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self::list_with_tail(items, Value::Nil)
    }

    /// Splits a (possibly improper) list into its elements and whatever
    /// non-pair value terminates it. A proper list ends in [`Value::Nil`].
    pub fn list_to_vec(&self) -> (Vec<Value>, Value) {
        let mut items = vec![];
        let mut rest = self.clone();
        while let Value::Pair(pair) = rest {
            items.push(pair.car());
            rest = pair.cdr();
        }
        (items, rest)
    }

    /// Only `#f` and `()` are false.
    pub fn to_bool(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, Value::Unspecified)
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    pub fn is_fixnum(&self) -> bool {
        matches!(self, Value::Fixnum(_))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Value::Symbol(_))
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Value::Pair(_))
    }

    pub fn is_closure(&self) -> bool {
        matches!(self, Value::Closure(_))
    }

    pub fn is_template(&self) -> bool {
        matches!(self, Value::Template(_))
    }

    pub fn is_cell(&self) -> bool {
        matches!(self, Value::Cell(_))
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Value::Foreign(_))
    }

    /// Anything `Call` can invoke
    pub fn is_procedure(&self) -> bool {
        self.is_closure() || self.is_foreign()
    }

    pub fn as_fixnum(&self) -> Option<Integer> {
        match self {
            Self::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(sym) => Some(*sym),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<&Pair> {
        match self {
            Self::Pair(pair) => Some(pair),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Unspecified => "unspecified",
            Value::Boolean(_) => "boolean",
            Value::Fixnum(_) => "fixnum",
            Value::Symbol(_) => "symbol",
            Value::Pair(_) => "pair",
            Value::Closure(_) => "procedure",
            Value::Template(_) => "procedure-skeleton",
            Value::Cell(_) => "cellvalue",
            Value::Foreign(_) => "primitive-procedure",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Integer> for Value {
    fn from(value: Integer) -> Self {
        Self::Fixnum(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Self::Symbol(value)
    }
}

// Pairs compare by structure, everything with identity compares by pointer.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::Unspecified, Value::Unspecified) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => pairs_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Template(a), Value::Template(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Cell(a), Value::Cell(b)) => Rc::ptr_eq(a, b),
            (Value::Foreign(a), Value::Foreign(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// Compares two lists element by element, following the cdr chain in a loop.
fn pairs_eq(a: &Rc<Pair>, b: &Rc<Pair>) -> bool {
    let (mut a, mut b) = (a.clone(), b.clone());
    loop {
        if Rc::ptr_eq(&a, &b) {
            return true;
        }
        if a.car() != b.car() {
            return false;
        }
        match (a.cdr(), b.cdr()) {
            (Value::Pair(next_a), Value::Pair(next_b)) => (a, b) = (next_a, next_b),
            (rest_a, rest_b) => return rest_a == rest_b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "()"),
            Value::Unspecified => write!(f, "#<unspecified>"),
            Value::Boolean(true) => write!(f, "#t"),
            Value::Boolean(false) => write!(f, "#f"),
            Value::Fixnum(n) => write!(f, "{n}"),
            Value::Symbol(sym) => write!(f, "{sym}"),
            Value::Pair(pair) => {
                write!(f, "({}", pair.car())?;
                let mut rest = pair.cdr();
                while let Value::Pair(next) = rest {
                    write!(f, " {}", next.car())?;
                    rest = next.cdr();
                }
                if !rest.is_nil() {
                    write!(f, " . {rest}")?;
                }
                write!(f, ")")
            }
            Value::Closure(_) => write!(f, "#<procedure>"),
            Value::Template(_) => write!(f, "#<procedure-skeleton>"),
            Value::Cell(_) => write!(f, "#<cellvalue>"),
            Value::Foreign(proc) => write!(f, "#<primitive-procedure {}>", proc.name()),
        }
    }
}

// Closures and cells can reach themselves, so Debug never descends into them.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Fixnum(n) => write!(f, "Fixnum({n})"),
            Value::Symbol(sym) => write!(f, "{sym:?}"),
            Value::Pair(_) => write!(f, "Pair{self}"),
            Value::Closure(closure) => write!(f, "#<procedure {:p}>", Rc::as_ptr(closure)),
            Value::Cell(cell) => write!(f, "{cell:?}"),
            Value::Foreign(proc) => write!(f, "{proc:?}"),
            other => write!(f, "{other}"),
        }
    }
}
