use std::collections::HashMap;

use super::{
    bytecode::{Instruction, OPERAND_MAX},
    CompileError,
};
use crate::{
    runtime::closure::{CellRecipe, ClosureTemplate},
    value::{Integer, Symbol, Value},
};

/// Index of a scope in the compiler's scope stack
pub(super) type ScopeId = usize;

/// Where a name lives, as seen from one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A slot in this scope's own frame
    Frame(u16),
    /// One of this scope's cell values
    Cell(u16),
    /// Not bound by any enclosing lambda
    Global(Symbol),
}

/// An instruction slot that may still be waiting for its final form
#[derive(Debug, Clone, Copy)]
pub(super) enum Emitted {
    Ready(Instruction),
    Pending,
}

/// Atoms are deduplicated in the constant pool; pairs never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Unspecified,
    Boolean(bool),
    Fixnum(Integer),
    Symbol(Symbol),
}

impl ConstKey {
    fn of(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Nil => Self::Nil,
            Value::Unspecified => Self::Unspecified,
            Value::Boolean(b) => Self::Boolean(*b),
            Value::Fixnum(n) => Self::Fixnum(*n),
            Value::Symbol(sym) => Self::Symbol(*sym),
            _ => return None,
        })
    }
}

fn operand(what: &'static str, index: usize) -> Result<u16, CompileError> {
    u16::try_from(index)
        .ok()
        .filter(|idx| *idx <= OPERAND_MAX)
        .ok_or(CompileError::OperandOverflow { what, index })
}

/// Compile-time state of one lambda body (or of the top level).
#[derive(Debug, Default)]
pub(super) struct Scope {
    pub parent: Option<ScopeId>,
    /// Frame locals and cells resolved so far, by name
    pub locals: HashMap<Symbol, Binding>,
    pub arg_count: usize,
    pub variadic: bool,
    instructions: Vec<Emitted>,
    consts: Vec<Value>,
    const_index: HashMap<ConstKey, u16>,
    frame_size: usize,
    cell_recipe: Vec<CellRecipe>,
    fresh_cells: Vec<usize>,
    /// frame slot -> index into `fresh_cells`
    fresh_cell_index: HashMap<u16, usize>,
}

impl Scope {
    pub fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            ..Default::default()
        }
    }

    pub fn is_toplevel(&self) -> bool {
        self.parent.is_none()
    }

    pub fn alloc_slot(&mut self) -> Result<u16, CompileError> {
        let slot = operand("frame slot", self.frame_size)?;
        self.frame_size += 1;
        Ok(slot)
    }

    pub fn add_const(&mut self, value: Value) -> Result<u16, CompileError> {
        let key = ConstKey::of(&value);
        if let Some(idx) = key.and_then(|key| self.const_index.get(&key)) {
            return Ok(*idx);
        }
        let idx = operand("constant", self.consts.len())?;
        self.consts.push(value);
        if let Some(key) = key {
            self.const_index.insert(key, idx);
        }
        Ok(idx)
    }

    /// The fresh cell promoting `slot`, created on first request so that every
    /// closure capturing the slot shares one cell.
    pub fn fresh_cell_for(&mut self, slot: u16) -> Result<u32, CompileError> {
        let idx = *self.fresh_cell_index.entry(slot).or_insert_with(|| {
            self.fresh_cells.push(slot.into());
            self.fresh_cells.len() - 1
        });
        u32::try_from(idx).map_err(|_| CompileError::OperandOverflow {
            what: "fresh cell",
            index: idx,
        })
    }

    pub fn push_recipe(&mut self, recipe: CellRecipe) -> Result<u16, CompileError> {
        let idx = operand("cell value", self.cell_recipe.len())?;
        self.cell_recipe.push(recipe);
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn emit(&mut self, instr: Instruction) -> Result<usize, CompileError> {
        let idx = self.instructions.len();
        self.instructions.push(Emitted::Pending);
        self.patch(idx, instr)?;
        Ok(idx)
    }

    /// Reserves an instruction slot to be [`Self::patch`]ed later.
    pub fn reserve(&mut self) -> usize {
        self.instructions.push(Emitted::Pending);
        self.instructions.len() - 1
    }

    pub fn patch(&mut self, idx: usize, instr: Instruction) -> Result<(), CompileError> {
        if !instr.fits() {
            return Err(CompileError::OperandOverflow {
                what: "instruction operand",
                index: idx,
            });
        }
        if let Some(emitted) = self.instructions.get_mut(idx) {
            *emitted = Emitted::Ready(instr);
        }
        Ok(())
    }

    /// Bundles the finished scope into a template.
    pub fn into_template(
        self,
        registry: Option<Vec<std::rc::Rc<ClosureTemplate>>>,
    ) -> Result<ClosureTemplate, CompileError> {
        let instructions = self
            .instructions
            .into_iter()
            .enumerate()
            .map(|(idx, emitted)| match emitted {
                Emitted::Ready(instr) => Ok(instr),
                Emitted::Pending => Err(CompileError::UnresolvedPlaceholder(idx)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClosureTemplate {
            instructions: instructions.into(),
            consts: self.consts.into(),
            frame_size: self.frame_size,
            cell_recipe: self.cell_recipe.into_boxed_slice(),
            fresh_cells: self.fresh_cells.into_boxed_slice(),
            arg_count: self.arg_count,
            variadic: self.variadic,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::Scope;
    use crate::{
        compiler::{bytecode::Instruction, CompileError},
        value::Value,
    };

    #[test]
    fn atoms_are_deduplicated() {
        let mut scope = Scope::new(None);
        let_assert!(Ok(a) = scope.add_const(Value::Fixnum(1)));
        let_assert!(Ok(b) = scope.add_const(Value::symbol("x")));
        let_assert!(Ok(c) = scope.add_const(Value::Fixnum(1)));
        check!(a == c);
        check!(a != b);

        let pair = Value::cons(Value::Fixnum(1), Value::Nil);
        let_assert!(Ok(p) = scope.add_const(pair.clone()));
        let_assert!(Ok(q) = scope.add_const(pair));
        check!(p != q);
    }

    #[test]
    fn fresh_cells_are_memoized_per_slot() {
        let mut scope = Scope::new(None);
        let_assert!(Ok(first) = scope.fresh_cell_for(3));
        let_assert!(Ok(second) = scope.fresh_cell_for(5));
        let_assert!(Ok(again) = scope.fresh_cell_for(3));
        check!(first == again);
        check!(first != second);
    }

    #[test]
    fn frame_slots_are_bounded() {
        let mut scope = Scope::new(None);
        for _ in 0..512 {
            let_assert!(Ok(_) = scope.alloc_slot());
        }
        let_assert!(Err(CompileError::OperandOverflow { index: 512, .. }) = scope.alloc_slot());
    }

    #[test]
    fn conditional_branches_stay_short() {
        let mut scope = Scope::new(None);
        let at = scope.reserve();
        let long = Instruction::BranchIfFalse {
            cond: 1,
            offset: 512,
        };
        let_assert!(Err(CompileError::OperandOverflow { index: 0, .. }) = scope.patch(at, long));
        let_assert!(Ok(()) = scope.patch(at, Instruction::Branch { offset: 512 }));
    }

    #[test]
    fn pending_instructions_block_assembly() {
        let mut unresolved = Scope::new(None);
        unresolved.reserve();
        let_assert!(Err(CompileError::UnresolvedPlaceholder(0)) = unresolved.into_template(None));

        let mut scope = Scope::new(None);
        let idx = scope.reserve();
        let_assert!(Ok(1) = scope.emit(Instruction::Halt));
        let_assert!(Ok(()) = scope.patch(idx, Instruction::Return { src: 0 }));
        let_assert!(Ok(template) = scope.into_template(None));
        check!(template.instructions.len() == 2);
        check!(template.instructions[0] == Instruction::Return { src: 0 });
    }
}
