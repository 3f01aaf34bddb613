//! A small Scheme compiled to register bytecode.
//!
//! Source text is read into [`Value`]s by [`general_parser::read`], turned
//! into a tree of closure templates by [`compiler::compile`], and executed by
//! [`Vm`]. Templates can also be stored as binary chunks with
//! [`runtime::chunk`].
pub mod compiler;
pub mod general_parser;
pub mod lexer;
pub mod runtime;
pub mod value;

pub use compiler::{compile, CompileError, SyntaxError};
pub use general_parser::{read, ParseError};
pub use runtime::{
    closure::ClosureTemplate,
    interpreter::{Vm, VmState, VmStats},
    scheme_base::{open_lib, open_lib_with_output},
    Arity, Callback, ForeignError, ForeignProcedure, VmError,
};
pub use value::{Symbol, Value};

/// Any failure between source text and a result
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("read error: {0}")]
    Parse(#[from] ParseError),
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("runtime error: {0}")]
    Runtime(#[from] VmError),
}

/// Reads and compiles `source` into a root template.
pub fn compile_source(source: &str) -> Result<ClosureTemplate, Error> {
    let exprs = read(source)?;
    Ok(compile(&exprs)?)
}

/// Reads, compiles, bootstraps and runs `source` on `vm`, returning the
/// program's exit value.
pub fn run_source(vm: &mut Vm, source: &str) -> Result<Value, Error> {
    let mut root = compile_source(source)?;
    vm.bootstrap(&mut root)?;
    Ok(vm.run()?)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use arbtest::arbtest;
    use assert2::{check, let_assert};

    use crate::{open_lib, open_lib_with_output, run_source, Error, Value, Vm};

    #[test]
    fn global_mutation_is_visible() {
        let mut vm = Vm::new();
        let_assert!(Ok(Value::Fixnum(2)) = run_source(&mut vm, "(define x 1) (set! x 2) x"));
    }

    #[test]
    fn errors_are_tagged_by_stage() {
        let mut vm = Vm::new();
        open_lib(&mut vm);
        let_assert!(Err(Error::Parse(_)) = run_source(&mut vm, "(+ 1"));
        let_assert!(Err(Error::Compile(_)) = run_source(&mut vm, "(if)"));
        let_assert!(Err(Error::Runtime(_)) = run_source(&mut vm, "(car '())"));
        let_assert!(Ok(Value::Fixnum(3)) = run_source(&mut vm, "(+ 1 2)"));
    }

    #[test]
    fn display_goes_to_the_port() {
        let out = Rc::new(RefCell::new(Vec::<u8>::new()));
        let mut vm = Vm::new();
        open_lib_with_output(&mut vm, out.clone());
        let_assert!(
            Ok(Value::Unspecified) =
                run_source(&mut vm, "(display '(1 . #t)) (newline) (display 'done)")
        );
        check!(out.borrow().as_slice() == b"(1 . #t)\ndone");
    }

    #[test]
    fn long_lists_built_by_programs_can_be_dropped() {
        let mut vm = Vm::new();
        open_lib(&mut vm);
        let src = "
            (define build
              (lambda (n acc)
                (if (< n 1) acc (build (- n 1) (cons n acc)))))
            (build 300000 '())";
        let_assert!(Ok(list) = run_source(&mut vm, src));
        let_assert!(Ok(again) = run_source(&mut vm, "(build 300000 '())"));
        check!(list == again);
        drop(vm);
        drop((list, again));
    }

    #[test]
    fn sums_match_the_host() {
        arbtest(|u| {
            let terms: Vec<i32> = u.arbitrary()?;
            let expected = terms.iter().map(|n| i64::from(*n)).sum::<i64>();
            let source = format!(
                "(+ {})",
                terms
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            );

            let mut vm = Vm::new();
            open_lib(&mut vm);
            match run_source(&mut vm, &source) {
                Ok(value) => {
                    check!(value == Value::Fixnum(expected), "{source}");
                }
                // too many operands for one call
                Err(Error::Compile(_)) => {
                    check!(terms.len() > 500);
                }
                Err(err) => panic!("{source}: {err}"),
            }
            Ok(())
        });
    }
}
