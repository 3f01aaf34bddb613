//! The register VM: a fetch-dispatch loop over closure templates.
//!
//! Activation records are [`Frame`]s. A non-tail call to a closure saves the
//! caller's activation in a [`Dump`]; the dumps form a singly linked chain
//! that is the VM's call stack, entirely separate from the host stack.
use std::{collections::HashMap, ops::ControlFlow, rc::Rc};

use super::{
    cell::{CellRegistry, CellValue},
    closure::{Closure, ClosureTemplate},
    frame::Frame,
    VmError,
};
use crate::{
    compiler::bytecode::Instruction,
    value::{Symbol, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmState {
    /// Nothing has been bootstrapped yet
    #[default]
    Idle,
    /// Ready to [`Vm::run`]
    Bootstrapped,
    /// Inside the dispatch loop, or left there by an error
    Running,
    /// The last run finished; its result is [`Vm::exit_value`]
    Halted,
}

/// Counters kept across every run of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub instructions: u64,
    pub closure_calls: u64,
    pub tail_calls: u64,
    pub foreign_calls: u64,
    pub dumps_pushed: u64,
    pub max_dump_depth: usize,
}

/// A caller's activation, saved by `Call` and restored by `Return`.
struct Dump {
    frame: Frame,
    consts: Rc<[Value]>,
    closure: Option<Rc<Closure>>,
    fresh_cells: Vec<Rc<CellValue>>,
    code: Rc<[Instruction]>,
    pc: usize,
    return_addr: usize,
    prev: Option<Box<Dump>>,
}

impl Drop for Dump {
    fn drop(&mut self) {
        // unlink iteratively; a deep chain would overflow the host stack
        let mut next = self.prev.take();
        while let Some(mut dump) = next {
            next = dump.prev.take();
        }
    }
}

pub struct Vm {
    frame: Frame,
    consts: Rc<[Value]>,
    /// The running closure; `None` while executing a root template
    closure: Option<Rc<Closure>>,
    /// Cells promoted from the current frame at activation entry
    fresh_cells: Vec<Rc<CellValue>>,
    code: Rc<[Instruction]>,
    pc: usize,
    /// Slot of the caller's frame that receives this activation's result
    return_addr: usize,
    dump: Option<Box<Dump>>,
    dump_depth: usize,
    globals: HashMap<Symbol, Value>,
    registry: Vec<Rc<ClosureTemplate>>,
    open_cells: CellRegistry,
    exit_value: Value,
    state: VmState,
    stats: VmStats,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            frame: Frame::default(),
            consts: Rc::from(vec![]),
            closure: None,
            fresh_cells: vec![],
            code: Rc::from(vec![]),
            pc: 0,
            return_addr: 0,
            dump: None,
            dump_depth: 0,
            globals: HashMap::new(),
            registry: vec![],
            open_cells: CellRegistry::default(),
            exit_value: Value::Unspecified,
            state: VmState::Idle,
            stats: VmStats::default(),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    /// Number of saved activations below the current one.
    pub fn dump_depth(&self) -> usize {
        self.dump_depth
    }

    /// Result of the last completed run.
    pub fn exit_value(&self) -> &Value {
        &self.exit_value
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.insert(Symbol::intern(name), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(&Symbol::get(name)?)
    }

    /// Installs `template` as the program to run and takes over its registry.
    ///
    /// Whatever activation state a previous run left behind is discarded.
    /// Globals are kept.
    pub fn bootstrap(&mut self, template: &mut ClosureTemplate) -> Result<(), VmError> {
        let registry = template.registry.take().ok_or(VmError::MissingRegistry)?;

        let escaped = self.open_cells.escape_all();
        if self.dump.take().is_some() {
            self.frame = Frame::new(template.frame_size);
        } else {
            self.frame.resize(template.frame_size);
        }
        self.dump_depth = 0;
        self.registry = registry;
        self.consts = template.consts.clone();
        self.code = template.instructions.clone();
        self.closure = None;
        self.pc = 0;
        self.return_addr = 0;
        self.exit_value = Value::Unspecified;
        self.open_fresh_cells(template)?;
        self.state = VmState::Bootstrapped;

        log::debug!(
            "bootstrapped: {} instruction(s), frame size {}, {} template(s) registered, {escaped} stale cell(s) escaped",
            self.code.len(),
            template.frame_size,
            self.registry.len(),
        );
        Ok(())
    }

    /// Runs the bootstrapped program to completion and returns its result.
    pub fn run(&mut self) -> Result<Value, VmError> {
        if self.state != VmState::Bootstrapped {
            return Err(VmError::NotBootstrapped(self.state));
        }
        self.state = VmState::Running;

        loop {
            let instr = *self
                .code
                .get(self.pc)
                .ok_or(VmError::PcOutOfRange(self.pc))?;
            log::trace!("{:4}  {instr}", self.pc);
            self.pc += 1;
            self.stats.instructions += 1;
            if self.dispatch(instr)?.is_break() {
                break;
            }
        }

        self.state = VmState::Halted;
        Ok(self.exit_value.clone())
    }

    fn dispatch(&mut self, instr: Instruction) -> Result<ControlFlow<()>, VmError> {
        match instr {
            Instruction::Halt => {
                self.exit_value = Value::Unspecified;
                return Ok(ControlFlow::Break(()));
            }
            Instruction::MoveLocal { dest, src } => {
                let value = self.frame.get(src.into())?;
                self.frame.set(dest.into(), value)?;
            }
            Instruction::LoadGlobal { dest, name } => {
                let name = self.global_name(name)?;
                let value = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or(VmError::UnboundGlobal(name))?;
                self.frame.set(dest.into(), value)?;
            }
            Instruction::LoadCell { dest, cell } => {
                let value = self.cell(cell)?.get()?;
                self.frame.set(dest.into(), value)?;
            }
            Instruction::LoadConst { dest, konst } => {
                let value = self.konst(konst)?;
                self.frame.set(dest.into(), value)?;
            }
            Instruction::StoreGlobal { name, src } => {
                let name = self.global_name(name)?;
                let value = self.frame.get(src.into())?;
                self.globals.insert(name, value);
            }
            Instruction::StoreCell { cell, src } => {
                let value = self.frame.get(src.into())?;
                self.cell(cell)?.set(value)?;
            }
            Instruction::BuildClosure { dest, template } => {
                let idx = usize::from(template);
                let template = self
                    .registry
                    .get(idx)
                    .cloned()
                    .ok_or(VmError::TemplateOutOfRange(idx))?;
                let cells = self.closure.as_ref().map_or(&[][..], |c| &c.cells[..]);
                let closure = Closure::build(template, &self.fresh_cells, cells)?;
                self.frame.set(dest.into(), Value::Closure(Rc::new(closure)))?;
            }
            Instruction::Call { dest, proc, argc } => self.call(dest, proc, argc, false)?,
            Instruction::TailCall { dest, proc, argc } => self.call(dest, proc, argc, true)?,
            Instruction::Return { src } => {
                let value = self.frame.get(src.into())?;
                self.open_cells.escape_frame(&self.frame);
                let return_addr = self.return_addr;
                match self.dump.take() {
                    Some(dump) => {
                        self.restore(dump);
                        log::debug!("return to depth {}", self.dump_depth);
                        self.frame.set(return_addr, value)?;
                    }
                    None => {
                        self.exit_value = value;
                        return Ok(ControlFlow::Break(()));
                    }
                }
            }
            Instruction::Branch { offset } => self.jump(offset),
            Instruction::BranchIfFalse { cond, offset } => {
                if !self.frame.get(cond.into())?.to_bool() {
                    self.jump(offset);
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn call(&mut self, dest: u16, proc: u16, argc: u16, tail: bool) -> Result<(), VmError> {
        let proc = usize::from(proc);
        let callee = self.frame.get(proc)?;
        let args = (proc + 1..=proc + usize::from(argc))
            .map(|slot| self.frame.get(slot))
            .collect::<Result<Vec<_>, _>>()?;

        match callee {
            Value::Foreign(foreign) => {
                self.stats.foreign_calls += 1;
                let value = foreign.call(&args)?;
                self.frame.set(dest.into(), value)?;
            }
            Value::Closure(closure) => {
                let frame = bind_arguments(&closure.template, args)?;
                if tail {
                    self.stats.tail_calls += 1;
                    self.open_cells.escape_frame(&self.frame);
                } else {
                    self.stats.closure_calls += 1;
                    self.push_dump();
                    self.return_addr = dest.into();
                    log::debug!("call at depth {}", self.dump_depth);
                }
                self.enter(closure, frame)?;
            }
            other => return Err(VmError::NotCallable(Box::from(other.to_string()))),
        }
        Ok(())
    }

    fn enter(&mut self, closure: Rc<Closure>, frame: Frame) -> Result<(), VmError> {
        self.frame = frame;
        self.consts = closure.template.consts.clone();
        self.code = closure.template.instructions.clone();
        self.pc = 0;
        self.open_fresh_cells(&closure.template)?;
        self.closure = Some(closure);
        Ok(())
    }

    fn push_dump(&mut self) {
        let dump = Dump {
            frame: self.frame.clone(),
            consts: self.consts.clone(),
            closure: self.closure.take(),
            fresh_cells: std::mem::take(&mut self.fresh_cells),
            code: self.code.clone(),
            pc: self.pc,
            return_addr: self.return_addr,
            prev: self.dump.take(),
        };
        self.dump = Some(Box::new(dump));
        self.dump_depth += 1;
        self.stats.dumps_pushed += 1;
        self.stats.max_dump_depth = self.stats.max_dump_depth.max(self.dump_depth);
    }

    fn restore(&mut self, mut dump: Box<Dump>) {
        self.frame = dump.frame.clone();
        self.consts = dump.consts.clone();
        self.closure = dump.closure.take();
        self.fresh_cells = std::mem::take(&mut dump.fresh_cells);
        self.code = dump.code.clone();
        self.pc = dump.pc;
        self.return_addr = dump.return_addr;
        self.dump = dump.prev.take();
        self.dump_depth -= 1;
    }

    fn open_fresh_cells(&mut self, template: &ClosureTemplate) -> Result<(), VmError> {
        let cells = template
            .fresh_cells
            .iter()
            .map(|slot| {
                let cell = Rc::new(CellValue::open(self.frame.clone(), *slot)?);
                self.open_cells.register(cell.clone());
                Ok(cell)
            })
            .collect::<Result<Vec<_>, VmError>>()?;
        self.fresh_cells = cells;
        Ok(())
    }

    fn jump(&mut self, offset: u32) {
        self.pc += offset as usize;
    }

    fn konst(&self, idx: u16) -> Result<Value, VmError> {
        let idx = usize::from(idx);
        self.consts
            .get(idx)
            .cloned()
            .ok_or(VmError::ConstOutOfRange(idx))
    }

    fn global_name(&self, idx: u16) -> Result<Symbol, VmError> {
        let name = self.konst(idx)?;
        name.as_symbol()
            .ok_or_else(|| VmError::GlobalNameNotSymbol(Box::from(name.to_string())))
    }

    fn cell(&self, idx: u16) -> Result<&CellValue, VmError> {
        let idx = usize::from(idx);
        self.closure
            .as_ref()
            .and_then(|closure| closure.cells.get(idx))
            .map(|cell| &**cell)
            .ok_or(VmError::CellOutOfRange(idx))
    }
}

/// Lays out a callee's frame: positional arguments first, then the rest list
/// of a variadic template.
fn bind_arguments(template: &ClosureTemplate, mut args: Vec<Value>) -> Result<Frame, VmError> {
    let arity = template.arity();
    if !arity.is_satisfied(args.len()) {
        return Err(VmError::Arity {
            expected: arity,
            got: args.len(),
        });
    }
    if template.variadic {
        let rest = args.split_off(template.arg_count);
        args.push(Value::list(rest));
    }

    let frame = Frame::new(template.frame_size);
    for (slot, arg) in args.into_iter().enumerate() {
        frame.set(slot, arg)?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use assert2::{check, let_assert};

    use super::{Vm, VmState};
    use crate::{
        compiler::{bytecode::Instruction, compile},
        general_parser::read,
        runtime::{closure::ClosureTemplate, scheme_base::open_lib, Arity, VmError},
        value::Value,
    };

    fn template(src: &str) -> ClosureTemplate {
        let exprs = read(src).unwrap_or_else(|err| panic!("reader failed: {err}"));
        compile(&exprs).unwrap_or_else(|err| panic!("compile failed: {err}"))
    }

    fn eval(vm: &mut Vm, src: &str) -> Result<Value, VmError> {
        vm.bootstrap(&mut template(src))?;
        vm.run()
    }

    fn vm() -> Vm {
        let mut vm = Vm::new();
        open_lib(&mut vm);
        vm
    }

    #[test]
    fn run_requires_bootstrap() {
        let mut vm = vm();
        let_assert!(Err(VmError::NotBootstrapped(VmState::Idle)) = vm.run());

        let_assert!(Ok(_) = eval(&mut vm, "1"));
        check!(vm.state() == VmState::Halted);
        let_assert!(Err(VmError::NotBootstrapped(VmState::Halted)) = vm.run());
    }

    #[test]
    fn registry_is_taken_once() {
        let mut vm = vm();
        let mut root = template("(lambda (x) x)");
        let_assert!(Ok(()) = vm.bootstrap(&mut root));
        check!(root.registry.is_none());
        let_assert!(Err(VmError::MissingRegistry) = vm.bootstrap(&mut root));
    }

    #[test]
    fn arithmetic() {
        let mut vm = vm();
        let_assert!(Ok(Value::Fixnum(6)) = eval(&mut vm, "(+ 1 2 3)"));
        let_assert!(Ok(Value::Fixnum(7)) = eval(&mut vm, "(- 10 1 2)"));
        let_assert!(Ok(Value::Boolean(true)) = eval(&mut vm, "(< 1 2)"));
        let_assert!(Ok(Value::Boolean(false)) = eval(&mut vm, "(< 2 1)"));
    }

    #[test]
    fn one_armed_if_is_unspecified() {
        let mut vm = vm();
        let_assert!(Ok(Value::Unspecified) = eval(&mut vm, "(if #f 1)"));
        let_assert!(Ok(Value::Fixnum(1)) = eval(&mut vm, "(if 0 1 2)"));
        let_assert!(Ok(Value::Fixnum(2)) = eval(&mut vm, "(if '() 1 2)"));
    }

    #[test]
    fn counter_closes_over_a_shared_cell() {
        let mut vm = vm();
        let src = "
            (define make-counter
              (lambda ()
                (define n 0)
                (lambda () (set! n (+ n 1)) n)))
            (define counter (make-counter))
            (define first (counter))
            (define second (counter))
            (cons first second)";
        let_assert!(Ok(value) = eval(&mut vm, src));
        check!(value == Value::cons(Value::Fixnum(1), Value::Fixnum(2)));
    }

    #[test]
    fn tail_calls_escape_the_replaced_frame() {
        let mut vm = vm();
        let src = "
            (define id (lambda (f) f))
            (define mk (lambda (x) (id (lambda () (set! x (+ x 1)) x))))
            (define g (mk 5))";
        let_assert!(Ok(_) = eval(&mut vm, src));
        check!(vm.stats().tail_calls == 1);
        check!(vm.open_cells.is_empty());

        let_assert!(Some(Value::Closure(g)) = vm.global("g"));
        let_assert!([cell] = &g.cells[..]);
        check!(cell.is_escaped());
        let cell = Rc::clone(cell);

        let_assert!(Ok(Value::Fixnum(7)) = eval(&mut vm, "(g) (g)"));
        let_assert!(Ok(Value::Fixnum(7)) = cell.get());
    }

    #[test]
    fn sibling_closures_see_each_others_writes() {
        let mut vm = vm();
        let src = "
            (define make-box
              (lambda (v)
                (cons (lambda () v) (lambda (new) (set! v new)))))
            (define box (make-box 1))
            ((cdr box) 42)
            ((car box))";
        let_assert!(Ok(Value::Fixnum(42)) = eval(&mut vm, src));
    }

    #[test]
    fn captures_thread_through_intermediate_closures() {
        let mut vm = vm();
        let src = "
            (define outer
              (lambda (x)
                (lambda ()
                  (lambda () (set! x (+ x 1)) x))))
            (define bump ((outer 10)))
            (bump)
            (bump)";
        let_assert!(Ok(Value::Fixnum(12)) = eval(&mut vm, src));
    }

    #[test]
    fn tail_calls_push_no_dumps() {
        let mut vm = vm();
        let src = "
            (define loop
              (lambda (n)
                (if (< n 1) 'done (loop (- n 1)))))
            (loop 100000)";
        let_assert!(Ok(value) = eval(&mut vm, src));
        check!(value == Value::symbol("done"));
        let stats = vm.stats();
        check!(stats.dumps_pushed == 0);
        check!(stats.max_dump_depth == 0);
        check!(stats.tail_calls == 100001);
        check!(vm.dump_depth() == 0);
    }

    #[test]
    fn non_tail_recursion_grows_the_dump_chain() {
        let mut vm = vm();
        let src = "
            (define count
              (lambda (n)
                (if (< n 1) 0 (+ 1 (count (- n 1))))))
            (count 100)";
        let_assert!(Ok(Value::Fixnum(100)) = eval(&mut vm, src));
        check!(vm.stats().max_dump_depth == 100);
        check!(vm.dump_depth() == 0);
    }

    #[test]
    fn variadic_binding() {
        let mut vm = vm();
        let_assert!(Ok(value) = eval(&mut vm, "((lambda (x . rest) rest) 1 2 3)"));
        check!(value == Value::list([Value::Fixnum(2), Value::Fixnum(3)]));
        let_assert!(Ok(Value::Nil) = eval(&mut vm, "((lambda (x . rest) rest) 1)"));
        let_assert!(Ok(value) = eval(&mut vm, "((lambda args args) 1 2)"));
        check!(value == Value::list([Value::Fixnum(1), Value::Fixnum(2)]));
    }

    #[test]
    fn closure_arity_is_checked() {
        let mut vm = vm();
        let_assert!(
            Err(VmError::Arity { expected, got }) = eval(&mut vm, "((lambda (x) x))")
        );
        check!(expected == Arity::Exact(1));
        check!(got == 0);
        let_assert!(
            Err(VmError::Arity { expected, .. }) = eval(&mut vm, "((lambda (x . r) x))")
        );
        check!(expected == Arity::Min(1));
    }

    #[test]
    fn runtime_errors() {
        let mut vm = vm();
        let_assert!(Err(VmError::UnboundGlobal(name)) = eval(&mut vm, "nowhere"));
        check!(name.as_str() == "nowhere");
        let_assert!(Err(VmError::NotCallable(_)) = eval(&mut vm, "(1 2)"));
        let_assert!(Err(VmError::Foreign(_)) = eval(&mut vm, "(car 1)"));
    }

    #[test]
    fn globals_survive_failed_runs() {
        let mut vm = vm();
        let_assert!(Ok(_) = eval(&mut vm, "(define x 1) (set! x 2)"));
        let_assert!(Err(_) = eval(&mut vm, "(define f (lambda (n) (+ 1 (f (car n))))) (f 0)"));
        check!(vm.state() == VmState::Running);
        let_assert!(Ok(Value::Fixnum(2)) = eval(&mut vm, "x"));
        check!(vm.global("x") == Some(&Value::Fixnum(2)));
    }

    #[test]
    fn deep_dump_chain_is_dropped_without_recursion() {
        let mut vm = vm();
        let src = "
            (define f (lambda (n) (if (< n 1) (car n) (+ 1 (f (- n 1))))))
            (f 200000)";
        let_assert!(Err(VmError::Foreign(_)) = eval(&mut vm, src));
        check!(vm.dump_depth() == 200000);
        let_assert!(Ok(Value::Fixnum(3)) = eval(&mut vm, "3"));
        check!(vm.dump_depth() == 0);
    }

    #[test]
    fn halt_stops_with_unspecified() {
        let mut vm = vm();
        let mut root = ClosureTemplate {
            instructions: Rc::from(vec![
                Instruction::LoadConst { dest: 0, konst: 0 },
                Instruction::Halt,
                Instruction::Return { src: 0 },
            ]),
            consts: Rc::from(vec![Value::Fixnum(5)]),
            frame_size: 1,
            cell_recipe: Box::new([]),
            fresh_cells: Box::new([]),
            arg_count: 0,
            variadic: false,
            registry: Some(vec![]),
        };
        let_assert!(Ok(()) = vm.bootstrap(&mut root));
        let_assert!(Ok(Value::Unspecified) = vm.run());
        check!(vm.stats().instructions == 2);
    }

    #[test]
    fn define_global_is_visible_to_programs() {
        let mut vm = vm();
        vm.define_global("answer", Value::Fixnum(42));
        let_assert!(Ok(Value::Fixnum(43)) = eval(&mut vm, "(+ answer 1)"));
    }
}
