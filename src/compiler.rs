//! Compile s-expressions into closure templates for the register VM.
//!
//! Every lambda body becomes one template. Names resolve to one of three
//! places: a slot of the body's own frame, one of the closure's cell values,
//! or the global table. A name bound in an enclosing body is reached through
//! a cell: the enclosing body promotes the frame slot to a *fresh cell* and
//! the inner template's cell recipe picks it up when the closure is built.
//!
//! For example:
//!
//! ```text
//! (define make-counter
//!   (lambda ()
//!     (define n 0)
//!     (lambda () (set! n (+ n 1)) n)))
//! ```
//!
//! compiles the inner lambda to
//!
//! ```text
//! frame size: 5, args: 0
//! cell recipe: fresh[0]
//!   k(0) = +
//!   k(1) = 1
//!   k(2) = #<unspecified>
//!    0  [r(0) = g(k(0))]
//!    1  [r(1) = c(0).get]
//!    2  [r(2) = k(1)]
//!    3  [r(3) = r(0).call(r(1), r(2))]
//!    4  [c(0).set(r(3))]
//!    5  [r(4) = c(0).get]
//!    6  [return r(4)]
//! ```
//!
//! while the outer one lists frame slot 0 (`n`) among its fresh cells.
//!
//! Lambda bodies are compiled only after the enclosing body has been fully
//! walked, because a nested lambda may still promote more of the enclosing
//! frame to cells.

use std::rc::Rc;

use crate::{
    runtime::closure::{CellRecipe, ClosureTemplate},
    value::{Symbol, Value},
};
use bytecode::Instruction;
use environment::{Binding, Scope, ScopeId};

pub mod bytecode;
pub mod environment;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("{form} requires {expected}")]
    BadArity {
        form: &'static str,
        expected: &'static str,
    },
    #[error("{form} -- not a well-formed list")]
    ImproperList { form: &'static str },
    #[error("{form} requires a symbol, got {got}")]
    ExpectedSymbol { form: &'static str, got: Box<str> },
    #[error("lambda -- formal arguments must be symbols, got {0}")]
    BadFormal(Box<str>),
    #[error("lambda -- missing expression")]
    MissingBody,
    #[error("cannot evaluate the empty combination ()")]
    EmptyCombination,
    #[error("define of {0} would shadow a captured cell value")]
    ShadowsCapturedCell(Symbol),
    #[error("{0} cannot appear in source code")]
    NotAnExpression(Box<str>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    #[error("{what} {index} does not fit its operand field")]
    OperandOverflow { what: &'static str, index: usize },
    #[error("instruction {0} was reserved but never emitted")]
    UnresolvedPlaceholder(usize),
}

/// Where the value of a just-compiled expression can be found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Local(u16),
    Const(u16),
    Cell(u16),
    Global(Symbol),
}

impl From<Binding> for Operand {
    fn from(binding: Binding) -> Self {
        match binding {
            Binding::Frame(slot) => Operand::Local(slot),
            Binding::Cell(idx) => Operand::Cell(idx),
            Binding::Global(sym) => Operand::Global(sym),
        }
    }
}

/// A lambda whose body waits for its enclosing scope to finish
struct DeferredLambda {
    scope: ScopeId,
    formals: Value,
    body: Vec<Value>,
    instr_index: usize,
    dest: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialForm {
    Define,
    Set,
    If,
    Quote,
    Lambda,
    Begin,
}

impl SpecialForm {
    fn of(sym: Symbol) -> Option<Self> {
        Some(match sym.as_str() {
            "define" => Self::Define,
            "set!" => Self::Set,
            "if" => Self::If,
            "quote" => Self::Quote,
            "lambda" => Self::Lambda,
            "begin" => Self::Begin,
            _ => return None,
        })
    }
}

/// Compiles a unit of top-level expressions into a root template carrying
/// the registry of every nested template.
pub fn compile(exprs: &[Value]) -> Result<ClosureTemplate, CompileError> {
    let mut compiler = Compiler::new();
    compiler.visit_body(exprs)?;
    let root = compiler.finish_scope()?;
    log::debug!(
        "compiled {} top-level expression(s): {} instruction(s), {} nested template(s)",
        exprs.len(),
        root.instructions.len(),
        root.registry.as_ref().map_or(0, Vec::len)
    );
    Ok(root)
}

struct Compiler {
    /// Scopes being compiled; every scope's parent sits below it
    scopes: Vec<Scope>,
    current: ScopeId,
    deferred: Vec<DeferredLambda>,
    registry: Vec<Rc<ClosureTemplate>>,
}

fn proper_list(form: &'static str, args: &Value) -> Result<Vec<Value>, SyntaxError> {
    let (items, rest) = args.list_to_vec();
    if rest.is_nil() {
        Ok(items)
    } else {
        Err(SyntaxError::ImproperList { form })
    }
}

fn expect_symbol(form: &'static str, value: &Value) -> Result<Symbol, SyntaxError> {
    value.as_symbol().ok_or_else(|| SyntaxError::ExpectedSymbol {
        form,
        got: Box::from(value.to_string()),
    })
}

impl Compiler {
    fn new() -> Self {
        Self {
            scopes: vec![Scope::new(None)],
            current: 0,
            deferred: vec![],
            registry: vec![],
        }
    }

    fn scope(&mut self) -> &mut Scope {
        &mut self.scopes[self.current]
    }

    fn emit(&mut self, instr: Instruction) -> Result<usize, CompileError> {
        self.scope().emit(instr)
    }

    fn alloc_slot(&mut self) -> Result<u16, CompileError> {
        self.scope().alloc_slot()
    }

    fn add_const(&mut self, value: Value) -> Result<u16, CompileError> {
        self.scope().add_const(value)
    }

    fn unspecified(&mut self) -> Result<Operand, CompileError> {
        Ok(Operand::Const(self.add_const(Value::Unspecified)?))
    }

    /// Compiles a body: every expression in order, the last one in tail
    /// position, then a `Return` of its value.
    fn visit_body(&mut self, exprs: &[Value]) -> Result<(), CompileError> {
        let mut last = None;
        for (idx, expr) in exprs.iter().enumerate() {
            last = Some(self.visit(expr, idx + 1 == exprs.len())?);
        }
        let last = match last {
            Some(operand) => operand,
            None => self.unspecified()?,
        };
        let src = self.to_local(last)?;
        self.emit(Instruction::Return { src })?;
        Ok(())
    }

    fn visit(&mut self, expr: &Value, tail: bool) -> Result<Operand, CompileError> {
        match expr {
            Value::Symbol(sym) => Ok(self.resolve(self.current, *sym)?.into()),
            Value::Fixnum(_) | Value::Boolean(_) | Value::Unspecified => {
                Ok(Operand::Const(self.add_const(expr.clone())?))
            }
            Value::Pair(pair) => {
                let head = pair.car();
                let args = pair.cdr();
                match head.as_symbol().and_then(SpecialForm::of) {
                    Some(form) => self.visit_special_form(form, &args, tail),
                    None => self.visit_application(&head, &args, tail),
                }
            }
            Value::Nil => Err(SyntaxError::EmptyCombination.into()),
            other => Err(SyntaxError::NotAnExpression(Box::from(other.to_string())).into()),
        }
    }

    /// Finds where `sym` lives as seen from `scope`, capturing it through a
    /// cell if an enclosing scope binds it. The result is cached in `scope`
    /// so repeated lookups share one cell recipe entry.
    fn resolve(&mut self, scope: ScopeId, sym: Symbol) -> Result<Binding, CompileError> {
        if let Some(binding) = self.scopes[scope].locals.get(&sym) {
            return Ok(*binding);
        }
        let Some(parent) = self.scopes[scope].parent else {
            return Ok(Binding::Global(sym));
        };

        let recipe = match self.resolve(parent, sym)? {
            global @ Binding::Global(_) => return Ok(global),
            Binding::Frame(slot) => CellRecipe::fresh(self.scopes[parent].fresh_cell_for(slot)?),
            Binding::Cell(idx) => CellRecipe::inherited(idx.into()),
        };
        let binding = Binding::Cell(self.scopes[scope].push_recipe(recipe)?);
        self.scopes[scope].locals.insert(sym, binding);
        Ok(binding)
    }

    fn visit_special_form(
        &mut self,
        form: SpecialForm,
        args: &Value,
        tail: bool,
    ) -> Result<Operand, CompileError> {
        match form {
            SpecialForm::Define => {
                let [name, expr] = <[Value; 2]>::try_from(proper_list("define", args)?)
                    .map_err(|_| SyntaxError::BadArity {
                        form: "define",
                        expected: "2 args",
                    })?;
                let name = expect_symbol("define", &name)?;
                let value = self.visit(&expr, false)?;
                self.visit_define(name, value)?;
                self.unspecified()
            }
            SpecialForm::Set => {
                let [name, expr] = <[Value; 2]>::try_from(proper_list("set!", args)?)
                    .map_err(|_| SyntaxError::BadArity {
                        form: "set!",
                        expected: "2 args",
                    })?;
                let name = expect_symbol("set!", &name)?;
                let value = self.visit(&expr, false)?;
                self.visit_set(name, value)?;
                self.unspecified()
            }
            SpecialForm::If => self.visit_if(args, tail),
            SpecialForm::Quote => {
                let [datum] = <[Value; 1]>::try_from(proper_list("quote", args)?).map_err(
                    |_| SyntaxError::BadArity {
                        form: "quote",
                        expected: "1 arg",
                    },
                )?;
                Ok(Operand::Const(self.add_const(datum)?))
            }
            SpecialForm::Lambda => {
                let mut parts = proper_list("lambda", args)?;
                if parts.len() < 2 {
                    return Err(SyntaxError::MissingBody.into());
                }
                let body = parts.split_off(1);
                let formals = parts.swap_remove(0);

                let dest = self.alloc_slot()?;
                let instr_index = self.scope().reserve();
                self.deferred.push(DeferredLambda {
                    scope: self.current,
                    formals,
                    body,
                    instr_index,
                    dest,
                });
                Ok(Operand::Local(dest))
            }
            SpecialForm::Begin => {
                let exprs = proper_list("begin", args)?;
                let Some((last, init)) = exprs.split_last() else {
                    return self.unspecified();
                };
                for expr in init {
                    self.visit(expr, false)?;
                }
                self.visit(last, tail)
            }
        }
    }

    fn visit_if(&mut self, args: &Value, tail: bool) -> Result<Operand, CompileError> {
        let result = self.alloc_slot()?;
        let parts = proper_list("if", args)?;
        let (pred, consequent, alternative) = match parts.as_slice() {
            [pred, consequent] => (pred, consequent, None),
            [pred, consequent, alternative] => (pred, consequent, Some(alternative)),
            _ => {
                return Err(SyntaxError::BadArity {
                    form: "if",
                    expected: "2 to 3 args",
                }
                .into())
            }
        };

        let pred = self.visit(pred, false)?;
        let cond = self.to_local(pred)?;
        let branch_if_false = self.scope().reserve();

        let value = self.visit(consequent, tail)?;
        self.set_frame_slot(result, value)?;
        let offset = self.scope().len() - branch_if_false;
        self.patch_branch(branch_if_false, Some(cond), offset)?;

        let branch = self.scope().reserve();
        let value = match alternative {
            Some(alternative) => self.visit(alternative, tail)?,
            None => self.unspecified()?,
        };
        self.set_frame_slot(result, value)?;
        let offset = self.scope().len() - branch - 1;
        self.patch_branch(branch, None, offset)?;

        Ok(Operand::Local(result))
    }

    fn patch_branch(
        &mut self,
        at: usize,
        cond: Option<u16>,
        offset: usize,
    ) -> Result<(), CompileError> {
        let offset = u32::try_from(offset).map_err(|_| CompileError::OperandOverflow {
            what: "branch offset",
            index: offset,
        })?;
        let instr = match cond {
            Some(cond) => Instruction::BranchIfFalse { cond, offset },
            None => Instruction::Branch { offset },
        };
        self.scope().patch(at, instr)
    }

    fn visit_application(
        &mut self,
        head: &Value,
        args: &Value,
        tail: bool,
    ) -> Result<Operand, CompileError> {
        let args = proper_list("application", args)?;
        // callee and arguments must sit in consecutive slots
        let proc = self.alloc_slot()?;
        let arg_slots = args
            .iter()
            .map(|_| self.alloc_slot())
            .collect::<Result<Vec<_>, _>>()?;

        let value = self.visit(head, false)?;
        self.set_frame_slot(proc, value)?;
        for (arg, slot) in args.iter().zip(arg_slots) {
            let value = self.visit(arg, false)?;
            self.set_frame_slot(slot, value)?;
        }

        let dest = self.alloc_slot()?;
        let argc = u16::try_from(args.len()).map_err(|_| CompileError::OperandOverflow {
            what: "argument count",
            index: args.len(),
        })?;
        self.emit(if tail {
            Instruction::TailCall { dest, proc, argc }
        } else {
            Instruction::Call { dest, proc, argc }
        })?;
        Ok(Operand::Local(dest))
    }

    fn visit_define(&mut self, name: Symbol, value: Operand) -> Result<(), CompileError> {
        match self.scope().locals.get(&name).copied() {
            Some(Binding::Frame(slot)) => self.set_frame_slot(slot, value),
            Some(Binding::Cell(_)) => Err(SyntaxError::ShadowsCapturedCell(name).into()),
            Some(Binding::Global(_)) | None if self.scope().is_toplevel() => {
                self.set_global(name, value)
            }
            Some(Binding::Global(_)) | None => {
                let slot = self.alloc_slot()?;
                self.scope().locals.insert(name, Binding::Frame(slot));
                self.set_frame_slot(slot, value)
            }
        }
    }

    fn visit_set(&mut self, name: Symbol, value: Operand) -> Result<(), CompileError> {
        match self.resolve(self.current, name)? {
            Binding::Frame(slot) => self.set_frame_slot(slot, value),
            Binding::Cell(cell) => {
                let src = self.to_local(value)?;
                self.emit(Instruction::StoreCell { cell, src })?;
                Ok(())
            }
            Binding::Global(sym) => self.set_global(sym, value),
        }
    }

    fn set_global(&mut self, name: Symbol, value: Operand) -> Result<(), CompileError> {
        let src = self.to_local(value)?;
        let name = self.add_const(Value::Symbol(name))?;
        self.emit(Instruction::StoreGlobal { name, src })?;
        Ok(())
    }

    /// Makes sure the value sits in a frame slot, loading it into a new one
    /// if needed.
    fn to_local(&mut self, operand: Operand) -> Result<u16, CompileError> {
        if let Operand::Local(slot) = operand {
            return Ok(slot);
        }
        let slot = self.alloc_slot()?;
        self.set_frame_slot(slot, operand)?;
        Ok(slot)
    }

    fn set_frame_slot(&mut self, dest: u16, operand: Operand) -> Result<(), CompileError> {
        let instr = match operand {
            Operand::Local(src) => Instruction::MoveLocal { dest, src },
            Operand::Const(konst) => Instruction::LoadConst { dest, konst },
            Operand::Cell(cell) => Instruction::LoadCell { dest, cell },
            Operand::Global(sym) => Instruction::LoadGlobal {
                dest,
                name: self.add_const(Value::Symbol(sym))?,
            },
        };
        self.emit(instr)?;
        Ok(())
    }

    /// Compiles every lambda deferred in the current scope, then assembles
    /// the scope into a template and pops it.
    fn finish_scope(&mut self) -> Result<ClosureTemplate, CompileError> {
        let id = self.current;
        let first = self
            .deferred
            .iter()
            .position(|lambda| lambda.scope == id)
            .unwrap_or(self.deferred.len());
        for lambda in self.deferred.split_off(first) {
            self.compile_lambda(lambda)?;
        }

        let scope = self.scopes.remove(id);
        self.current = scope.parent.unwrap_or_default();
        let registry = scope
            .is_toplevel()
            .then(|| std::mem::take(&mut self.registry));
        scope.into_template(registry)
    }

    fn compile_lambda(&mut self, lambda: DeferredLambda) -> Result<(), CompileError> {
        let (params, rest) = lambda.formals.list_to_vec();
        let params = params
            .iter()
            .map(|param| {
                param
                    .as_symbol()
                    .ok_or_else(|| SyntaxError::BadFormal(Box::from(param.to_string())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let rest = match rest {
            Value::Nil => None,
            Value::Symbol(sym) => Some(sym),
            other => return Err(SyntaxError::BadFormal(Box::from(other.to_string())).into()),
        };

        self.scopes.push(Scope::new(Some(lambda.scope)));
        self.current = self.scopes.len() - 1;
        self.scope().arg_count = params.len();
        self.scope().variadic = rest.is_some();
        for name in params.into_iter().chain(rest) {
            let slot = self.alloc_slot()?;
            self.scope().locals.insert(name, Binding::Frame(slot));
        }

        self.visit_body(&lambda.body)?;
        let template = self.finish_scope()?;

        let template_index = self.registry.len();
        self.registry.push(Rc::new(template));
        let template =
            u16::try_from(template_index).map_err(|_| CompileError::OperandOverflow {
                what: "closure template",
                index: template_index,
            })?;
        self.scopes[lambda.scope].patch(
            lambda.instr_index,
            Instruction::BuildClosure {
                dest: lambda.dest,
                template,
            },
        )
    }
}
