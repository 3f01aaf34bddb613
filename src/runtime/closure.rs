//! Closure templates ("skeletons") and their runtime instances.
use core::fmt;
use std::rc::Rc;

use super::{cell::CellValue, Arity, VmError};
use crate::{compiler::bytecode::Instruction, value::Value};

/// One packed entry of a template's cell recipe.
///
/// The low bit tells where the cell comes from when a closure is built:
/// set means "the building activation's fresh cells", clear means "the
/// building closure's own cell values". The remaining bits are the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRecipe(u32);

impl CellRecipe {
    pub fn fresh(index: u32) -> Self {
        Self((index << 1) | 1)
    }

    pub fn inherited(index: u32) -> Self {
        Self(index << 1)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 >> 1) as usize
    }

    pub fn from_fresh(self) -> bool {
        self.0 & 1 == 1
    }
}

impl fmt::Display for CellRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_fresh() {
            write!(f, "fresh[{}]", self.index())
        } else {
            write!(f, "cell[{}]", self.index())
        }
    }
}

/// The immutable compiled description of a procedure body.
///
/// Only the root template of a compilation unit carries a `registry`: the
/// flat table every `BuildClosure` indexes into. The VM takes it over at
/// bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureTemplate {
    pub instructions: Rc<[Instruction]>,
    pub consts: Rc<[Value]>,
    pub frame_size: usize,
    pub cell_recipe: Box<[CellRecipe]>,
    /// Frame slots promoted to cells when an activation of this template begins
    pub fresh_cells: Box<[usize]>,
    pub arg_count: usize,
    pub variadic: bool,
    pub registry: Option<Vec<Rc<ClosureTemplate>>>,
}

impl ClosureTemplate {
    pub fn arity(&self) -> Arity {
        if self.variadic {
            Arity::Min(self.arg_count)
        } else {
            Arity::Exact(self.arg_count)
        }
    }

    /// Disassembly of this template followed by every registry entry.
    pub fn disassemble(&self) -> String {
        let mut out = format!("== root ==\n{self}");
        for (idx, template) in self.registry.iter().flatten().enumerate() {
            out.push_str(&format!("== template {idx} ==\n{template}"));
        }
        out
    }
}

impl fmt::Display for ClosureTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "frame size: {}, args: {}{}",
            self.frame_size,
            self.arg_count,
            if self.variadic { " + rest" } else { "" }
        )?;
        if !self.cell_recipe.is_empty() {
            let recipe = self
                .cell_recipe
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            writeln!(f, "cell recipe: {}", recipe.join(" "))?;
        }
        if !self.fresh_cells.is_empty() {
            writeln!(f, "fresh cells: {:?}", self.fresh_cells)?;
        }
        for (idx, konst) in self.consts.iter().enumerate() {
            writeln!(f, "  k({idx}) = {konst}")?;
        }
        for (pc, instr) in self.instructions.iter().enumerate() {
            writeln!(f, "{pc:4}  {instr}")?;
        }
        Ok(())
    }
}

/// A template bound to a concrete captured environment.
pub struct Closure {
    pub template: Rc<ClosureTemplate>,
    pub cells: Box<[Rc<CellValue>]>,
}

impl Closure {
    /// Resolves `template`'s cell recipe against the building activation's
    /// fresh cells and the building closure's own cells. Only references are
    /// forwarded; no value is copied.
    pub fn build(
        template: Rc<ClosureTemplate>,
        fresh_cells: &[Rc<CellValue>],
        cells: &[Rc<CellValue>],
    ) -> Result<Self, VmError> {
        let cells = template
            .cell_recipe
            .iter()
            .map(|recipe| {
                let idx = recipe.index();
                if recipe.from_fresh() {
                    fresh_cells
                        .get(idx)
                        .cloned()
                        .ok_or(VmError::FreshCellOutOfRange(idx))
                } else {
                    cells.get(idx).cloned().ok_or(VmError::CellOutOfRange(idx))
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { template, cells })
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<procedure cells={}>", self.cells.len())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use assert2::{check, let_assert};

    use super::{CellRecipe, Closure, ClosureTemplate};
    use crate::{
        compiler::bytecode::Instruction,
        runtime::{cell::CellValue, frame::Frame, Arity, VmError},
        value::Value,
    };

    fn template(recipe: Vec<CellRecipe>) -> Rc<ClosureTemplate> {
        Rc::new(ClosureTemplate {
            instructions: Rc::from(vec![Instruction::Return { src: 0 }]),
            consts: Rc::from(vec![]),
            frame_size: 1,
            cell_recipe: recipe.into_boxed_slice(),
            fresh_cells: Box::new([]),
            arg_count: 1,
            variadic: false,
            registry: None,
        })
    }

    #[test]
    fn recipe_packing() {
        let fresh = CellRecipe::fresh(3);
        check!(fresh.raw() == 7);
        check!(fresh.from_fresh());
        check!(fresh.index() == 3);

        let inherited = CellRecipe::inherited(2);
        check!(inherited.raw() == 4);
        check!(!inherited.from_fresh());
        check!(inherited.index() == 2);
        check!(CellRecipe::from_raw(4) == inherited);
    }

    #[test]
    fn build_forwards_cell_references() {
        let frame = Frame::new(2);
        let_assert!(Ok(fresh) = CellValue::open(frame.clone(), 0));
        let fresh = Rc::new(fresh);
        let held = Rc::new(CellValue::escaped(Value::Fixnum(10)));

        let_assert!(
            Ok(closure) = Closure::build(
                template(vec![CellRecipe::inherited(0), CellRecipe::fresh(0)]),
                &[fresh.clone()],
                &[held.clone()],
            )
        );
        check!(Rc::ptr_eq(&closure.cells[0], &held));
        check!(Rc::ptr_eq(&closure.cells[1], &fresh));
    }

    #[test]
    fn build_rejects_dangling_recipe() {
        let result = Closure::build(template(vec![CellRecipe::fresh(1)]), &[], &[]);
        let_assert!(Err(VmError::FreshCellOutOfRange(1)) = result);
    }

    #[test]
    fn template_arity() {
        let mut t = (*template(vec![])).clone();
        check!(t.arity() == Arity::Exact(1));
        t.variadic = true;
        check!(t.arity() == Arity::Min(1));
    }
}
