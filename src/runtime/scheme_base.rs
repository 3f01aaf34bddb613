//! The builtin foreign procedures every program starts with.
use std::{cell::RefCell, io::Write, rc::Rc};

use super::{interpreter::Vm, Arity, Callback, ForeignError, ForeignProcedure};
use crate::value::{Integer, Value};

/// Shared writer that `display` and `newline` print to
pub type OutputPort = Rc<RefCell<dyn Write>>;

/// Installs the builtins, printing to standard output.
pub fn open_lib(vm: &mut Vm) {
    open_lib_with_output(vm, Rc::new(RefCell::new(std::io::stdout())));
}

/// Installs the builtins, printing to `port`.
pub fn open_lib_with_output(vm: &mut Vm, port: OutputPort) {
    let procedures: [ForeignProcedure; 8] = [
        Add.into(),
        Sub.into(),
        Less.into(),
        Display(port.clone()).into(),
        Newline(port).into(),
        Cons.into(),
        Car.into(),
        Cdr.into(),
    ];
    for procedure in procedures {
        let name = procedure.name().to_string();
        vm.define_global(&name, Value::Foreign(procedure));
    }
}

fn fixnum(name: &str, value: &Value) -> Result<Integer, ForeignError> {
    value
        .as_fixnum()
        .ok_or_else(|| ForeignError::wrong_type(name, "fixnum", value))
}

fn overflow(name: &str) -> ForeignError {
    ForeignError::Overflow(Box::from(name))
}

struct Add;

impl Callback for Add {
    fn name(&self) -> &str {
        "+"
    }

    fn arity(&self) -> Arity {
        Arity::Min(0)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        args.iter()
            .try_fold(0, |sum: Integer, arg| {
                sum.checked_add(fixnum("+", arg)?).ok_or_else(|| overflow("+"))
            })
            .map(Value::Fixnum)
    }
}

struct Sub;

impl Callback for Sub {
    fn name(&self) -> &str {
        "-"
    }

    fn arity(&self) -> Arity {
        Arity::Min(1)
    }

    /// `(- x)` is `x` itself; `(- x y ...)` subtracts left to right.
    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        let Some((first, rest)) = args.split_first() else {
            return Err(ForeignError::Arity {
                name: Box::from("-"),
                expected: self.arity(),
                got: 0,
            });
        };
        rest.iter()
            .try_fold(fixnum("-", first)?, |acc, arg| {
                acc.checked_sub(fixnum("-", arg)?).ok_or_else(|| overflow("-"))
            })
            .map(Value::Fixnum)
    }
}

struct Less;

impl Callback for Less {
    fn name(&self) -> &str {
        "<"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(2)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        let [a, b] = args else {
            return Err(ForeignError::Arity {
                name: Box::from("<"),
                expected: self.arity(),
                got: args.len(),
            });
        };
        Ok(Value::Boolean(fixnum("<", a)? < fixnum("<", b)?))
    }
}

struct Display(OutputPort);

impl Callback for Display {
    fn name(&self) -> &str {
        "display"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        let mut port = self.0.borrow_mut();
        for arg in args {
            write!(port, "{arg}")?;
        }
        port.flush()?;
        Ok(Value::Unspecified)
    }
}

struct Newline(OutputPort);

impl Callback for Newline {
    fn name(&self) -> &str {
        "newline"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(0)
    }

    fn call(&self, _args: &[Value]) -> Result<Value, ForeignError> {
        let mut port = self.0.borrow_mut();
        writeln!(port)?;
        port.flush()?;
        Ok(Value::Unspecified)
    }
}

struct Cons;

impl Callback for Cons {
    fn name(&self) -> &str {
        "cons"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(2)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        let [car, cdr] = args else {
            return Err(ForeignError::Arity {
                name: Box::from("cons"),
                expected: self.arity(),
                got: args.len(),
            });
        };
        Ok(Value::cons(car.clone(), cdr.clone()))
    }
}

struct Car;

impl Callback for Car {
    fn name(&self) -> &str {
        "car"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        pair_field("car", args, |pair| pair.car())
    }
}

struct Cdr;

impl Callback for Cdr {
    fn name(&self) -> &str {
        "cdr"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn call(&self, args: &[Value]) -> Result<Value, ForeignError> {
        pair_field("cdr", args, |pair| pair.cdr())
    }
}

fn pair_field(
    name: &str,
    args: &[Value],
    field: impl FnOnce(&crate::value::Pair) -> Value,
) -> Result<Value, ForeignError> {
    let [arg] = args else {
        return Err(ForeignError::Arity {
            name: Box::from(name),
            expected: Arity::Exact(1),
            got: args.len(),
        });
    };
    arg.as_pair()
        .map(field)
        .ok_or_else(|| ForeignError::wrong_type(name, "pair", arg))
}
