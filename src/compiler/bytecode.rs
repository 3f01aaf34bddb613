//! The register-machine instruction set and its fixed-width encoding.
//!
//! Every instruction is one 32-bit word:
//!
//! ```text
//!  31      27 26          18 17           9 8            0
//! +----------+--------------+--------------+--------------+
//! |  opcode  |      A       |      B       |      C       |   ABC
//! +----------+--------------+--------------+--------------+
//! |  opcode  |             Bx              |    unused    |   Bx
//! +----------+-----------------------------+--------------+
//! ```
//!
//! Bx starts where B does and runs up through A, so only `Branch` can use
//! all 18 bits. `BranchIfFalse` keeps its condition in A and its offset in
//! B, which limits it to [`OPERAND_MAX`].
//!
//! `r(n)` below is frame slot `n`, `k(n)` constant `n`, `c(n)` the running
//! closure's cell value `n`, `g(k(n))` the global named by constant `n`.
use core::fmt;

use arbitrary::{Arbitrary, Unstructured};

/// Largest value of an A, B or C operand
pub const OPERAND_MAX: u16 = (1 << 9) - 1;
/// Largest value of a Bx operand
pub const WIDE_OPERAND_MAX: u32 = (1 << 18) - 1;

const OPCODE_SHIFT: u32 = 32 - 5;
const A_SHIFT: u32 = 32 - 5 - 9;
const B_SHIFT: u32 = 32 - 5 - 9 - 9;
const OPERAND_MASK: u32 = OPERAND_MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
#[repr(u8)]
pub enum Opcode {
    Halt = 1,
    MoveLocal,
    LoadGlobal,
    LoadCell,
    LoadConst,
    StoreGlobal,
    StoreCell,
    BuildClosure,
    Call,
    TailCall,
    Return,
    Branch,
    BranchIfFalse,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        use Opcode::*;
        Some(match op {
            1 => Halt,
            2 => MoveLocal,
            3 => LoadGlobal,
            4 => LoadCell,
            5 => LoadConst,
            6 => StoreGlobal,
            7 => StoreCell,
            8 => BuildClosure,
            9 => Call,
            10 => TailCall,
            11 => Return,
            12 => Branch,
            13 => BranchIfFalse,
            _ => return None,
        })
    }

    /// Whether B extends through A as one 18-bit operand
    pub fn is_wide(self) -> bool {
        matches!(self, Opcode::Branch)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
}

/// A decoded instruction. Operand fields are frame slots unless named
/// otherwise; branch offsets are relative to the already-advanced pc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    Halt,
    /// `r(dest) = r(src)`
    MoveLocal { dest: u16, src: u16 },
    /// `r(dest) = g(k(name))`
    LoadGlobal { dest: u16, name: u16 },
    /// `r(dest) = c(cell)`
    LoadCell { dest: u16, cell: u16 },
    /// `r(dest) = k(konst)`
    LoadConst { dest: u16, konst: u16 },
    /// `g(k(name)) = r(src)`
    StoreGlobal { name: u16, src: u16 },
    /// `c(cell) = r(src)`
    StoreCell { cell: u16, src: u16 },
    /// `r(dest) = build a closure from registry[template]`
    BuildClosure { dest: u16, template: u16 },
    /// `r(dest) = r(proc)(r(proc + 1), ..., r(proc + argc))`
    Call { dest: u16, proc: u16, argc: u16 },
    /// Like `Call`, but replaces the running activation
    TailCall { dest: u16, proc: u16, argc: u16 },
    Return { src: u16 },
    /// `pc += offset`
    Branch { offset: u32 },
    /// `if not r(cond): pc += offset`
    BranchIfFalse { cond: u16, offset: u32 },
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Halt => Opcode::Halt,
            Instruction::MoveLocal { .. } => Opcode::MoveLocal,
            Instruction::LoadGlobal { .. } => Opcode::LoadGlobal,
            Instruction::LoadCell { .. } => Opcode::LoadCell,
            Instruction::LoadConst { .. } => Opcode::LoadConst,
            Instruction::StoreGlobal { .. } => Opcode::StoreGlobal,
            Instruction::StoreCell { .. } => Opcode::StoreCell,
            Instruction::BuildClosure { .. } => Opcode::BuildClosure,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::TailCall { .. } => Opcode::TailCall,
            Instruction::Return { .. } => Opcode::Return,
            Instruction::Branch { .. } => Opcode::Branch,
            Instruction::BranchIfFalse { .. } => Opcode::BranchIfFalse,
        }
    }

    /// `(A, B, C)`, with Bx standing in for B on a `Branch`
    fn operands(&self) -> (u32, u32, u32) {
        use Instruction::*;
        match *self {
            Halt => (0, 0, 0),
            MoveLocal { dest: a, src: b }
            | LoadGlobal { dest: a, name: b }
            | LoadCell { dest: a, cell: b }
            | LoadConst { dest: a, konst: b }
            | StoreGlobal { name: a, src: b }
            | StoreCell { cell: a, src: b }
            | BuildClosure {
                dest: a,
                template: b,
            } => (a.into(), b.into(), 0),
            Call { dest, proc, argc } | TailCall { dest, proc, argc } => {
                (dest.into(), proc.into(), argc.into())
            }
            Return { src } => (0, src.into(), 0),
            Branch { offset } => (0, offset, 0),
            BranchIfFalse { cond, offset } => (cond.into(), offset, 0),
        }
    }

    /// Whether every operand fits its encoded field
    pub fn fits(&self) -> bool {
        let (a, b, c) = self.operands();
        let b_max = if self.opcode().is_wide() {
            WIDE_OPERAND_MAX
        } else {
            OPERAND_MASK
        };
        a <= OPERAND_MASK && b <= b_max && c <= OPERAND_MASK
    }

    pub fn encode(&self) -> u32 {
        debug_assert!(self.fits(), "operand overflow in {self}");
        let (a, b, c) = self.operands();
        let op = self.opcode();
        let b_mask = if op.is_wide() {
            WIDE_OPERAND_MAX
        } else {
            OPERAND_MASK
        };
        (op as u32) << OPCODE_SHIFT
            | (a & OPERAND_MASK) << A_SHIFT
            | (b & b_mask) << B_SHIFT
            | (c & OPERAND_MASK)
    }

    pub fn decode(word: u32) -> Result<Self, DecodeError> {
        let op_num = (word >> OPCODE_SHIFT) as u8;
        let op = Opcode::from_u8(op_num).ok_or(DecodeError::UnknownOpcode(op_num))?;
        // fields are at most 9 bits wide, so the narrowing is lossless
        let a = ((word >> A_SHIFT) & OPERAND_MASK) as u16;
        let b = ((word >> B_SHIFT) & OPERAND_MASK) as u16;
        let c = (word & OPERAND_MASK) as u16;
        let bx = (word >> B_SHIFT) & WIDE_OPERAND_MAX;

        Ok(match op {
            Opcode::Halt => Instruction::Halt,
            Opcode::MoveLocal => Instruction::MoveLocal { dest: a, src: b },
            Opcode::LoadGlobal => Instruction::LoadGlobal { dest: a, name: b },
            Opcode::LoadCell => Instruction::LoadCell { dest: a, cell: b },
            Opcode::LoadConst => Instruction::LoadConst { dest: a, konst: b },
            Opcode::StoreGlobal => Instruction::StoreGlobal { name: a, src: b },
            Opcode::StoreCell => Instruction::StoreCell { cell: a, src: b },
            Opcode::BuildClosure => Instruction::BuildClosure {
                dest: a,
                template: b,
            },
            Opcode::Call => Instruction::Call {
                dest: a,
                proc: b,
                argc: c,
            },
            Opcode::TailCall => Instruction::TailCall {
                dest: a,
                proc: b,
                argc: c,
            },
            Opcode::Return => Instruction::Return { src: b },
            Opcode::Branch => Instruction::Branch { offset: bx },
            Opcode::BranchIfFalse => Instruction::BranchIfFalse {
                cond: a,
                offset: b.into(),
            },
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match *self {
            Halt => write!(f, "[halt]"),
            MoveLocal { dest, src } => write!(f, "[r({dest}) = r({src})]"),
            LoadGlobal { dest, name } => write!(f, "[r({dest}) = g(k({name}))]"),
            LoadCell { dest, cell } => write!(f, "[r({dest}) = c({cell}).get]"),
            LoadConst { dest, konst } => write!(f, "[r({dest}) = k({konst})]"),
            StoreGlobal { name, src } => write!(f, "[g(k({name})) = r({src})]"),
            StoreCell { cell, src } => write!(f, "[c({cell}).set(r({src}))]"),
            BuildClosure { dest, template } => {
                write!(f, "[r({dest}) = buildclosure(registry[{template}])]")
            }
            Call { dest, proc, argc } | TailCall { dest, proc, argc } => {
                let verb = if matches!(self, Call { .. }) {
                    "call"
                } else {
                    "tailcall"
                };
                let first = u32::from(proc) + 1;
                let last = u32::from(proc) + u32::from(argc);
                match argc {
                    0 => write!(f, "[r({dest}) = r({proc}).{verb}()]"),
                    1 => write!(f, "[r({dest}) = r({proc}).{verb}(r({first}))]"),
                    2 => write!(f, "[r({dest}) = r({proc}).{verb}(r({first}), r({last}))]"),
                    _ => write!(f, "[r({dest}) = r({proc}).{verb}(r({first}), ..., r({last}))]"),
                }
            }
            Return { src } => write!(f, "[return r({src})]"),
            Branch { offset } => write!(f, "[pc += {offset}]"),
            BranchIfFalse { cond, offset } => write!(f, "[if not r({cond}): pc += {offset}]"),
        }
    }
}

// Only generates instructions whose operands fit their fields.
impl<'a> Arbitrary<'a> for Instruction {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut operand = || u.int_in_range(0..=OPERAND_MAX);
        let (a, b, c) = (operand()?, operand()?, operand()?);
        let bx = u.int_in_range(0..=WIDE_OPERAND_MAX)?;
        Ok(match u.arbitrary::<Opcode>()? {
            Opcode::Halt => Instruction::Halt,
            Opcode::MoveLocal => Instruction::MoveLocal { dest: a, src: b },
            Opcode::LoadGlobal => Instruction::LoadGlobal { dest: a, name: b },
            Opcode::LoadCell => Instruction::LoadCell { dest: a, cell: b },
            Opcode::LoadConst => Instruction::LoadConst { dest: a, konst: b },
            Opcode::StoreGlobal => Instruction::StoreGlobal { name: a, src: b },
            Opcode::StoreCell => Instruction::StoreCell { cell: a, src: b },
            Opcode::BuildClosure => Instruction::BuildClosure {
                dest: a,
                template: b,
            },
            Opcode::Call => Instruction::Call {
                dest: a,
                proc: b,
                argc: c,
            },
            Opcode::TailCall => Instruction::TailCall {
                dest: a,
                proc: b,
                argc: c,
            },
            Opcode::Return => Instruction::Return { src: b },
            Opcode::Branch => Instruction::Branch { offset: bx },
            Opcode::BranchIfFalse => Instruction::BranchIfFalse {
                cond: a,
                offset: b.into(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    use super::{DecodeError, Instruction, Opcode, OPERAND_MAX, WIDE_OPERAND_MAX};

    #[test]
    fn opcode_numbering() {
        check!(Opcode::Halt as u8 == 1);
        check!(Opcode::Call as u8 == 9);
        check!(Opcode::BranchIfFalse as u8 == 13);
        for op in 1..=13u8 {
            let_assert!(Some(opcode) = Opcode::from_u8(op));
            check!(opcode as u8 == op);
        }
        check!(Opcode::from_u8(0).is_none());
        check!(Opcode::from_u8(14).is_none());
    }

    #[test]
    fn field_layout() {
        let call = Instruction::Call {
            dest: 3,
            proc: 1,
            argc: 2,
        };
        check!(call.encode() == (9 << 27) | (3 << 18) | (1 << 9) | 2);

        let ret = Instruction::Return { src: 4 };
        check!(ret.encode() == (11 << 27) | (4 << 9));

        let branch = Instruction::BranchIfFalse {
            cond: 7,
            offset: OPERAND_MAX.into(),
        };
        check!(branch.encode() == (13 << 27) | (7 << 18) | (511 << 9));

        let jump = Instruction::Branch { offset: 2 };
        check!(jump.encode() == 0x6000_0400);
        let jump = Instruction::Branch {
            offset: WIDE_OPERAND_MAX,
        };
        check!(jump.encode() == (12 << 27) | (WIDE_OPERAND_MAX << 9));
    }

    #[test]
    fn branch_words_decode_from_bit_nine() {
        check!(
            Instruction::decode((12 << 27) | (2 << 9)) == Ok(Instruction::Branch { offset: 2 })
        );
        check!(
            Instruction::decode((12 << 27) | (0x2_0001 << 9))
                == Ok(Instruction::Branch { offset: 0x2_0001 })
        );
        check!(
            Instruction::decode((13 << 27) | (4 << 18) | (9 << 9))
                == Ok(Instruction::BranchIfFalse { cond: 4, offset: 9 })
        );
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        check!(Instruction::decode(0) == Err(DecodeError::UnknownOpcode(0)));
        check!(Instruction::decode(31 << 27) == Err(DecodeError::UnknownOpcode(31)));
    }

    #[test]
    fn encoding_agrees_with_decoding() {
        arbtest(|u| {
            let instr: Instruction = u.arbitrary()?;
            check!(instr.fits());
            let_assert!(Ok(decoded) = Instruction::decode(instr.encode()));
            check!(decoded == instr);
            Ok(())
        });
    }

    #[test]
    fn operand_overflow_is_detected() {
        check!(!(Instruction::LoadConst { dest: 512, konst: 0 }).fits());
        check!((Instruction::Branch { offset: 512 }).fits());
        check!((Instruction::BranchIfFalse { cond: 0, offset: 511 }).fits());
        check!(!(Instruction::BranchIfFalse { cond: 0, offset: 512 }).fits());
        check!(!(Instruction::Branch {
            offset: WIDE_OPERAND_MAX + 1
        })
        .fits());
    }

    #[test]
    fn display_matches_register_notation() {
        check!(Instruction::LoadConst { dest: 1, konst: 0 }.to_string() == "[r(1) = k(0)]");
        check!(
            Instruction::TailCall {
                dest: 5,
                proc: 1,
                argc: 3
            }
            .to_string()
                == "[r(5) = r(1).tailcall(r(2), ..., r(4))]"
        );
        check!(
            Instruction::BranchIfFalse { cond: 2, offset: 3 }.to_string()
                == "[if not r(2): pc += 3]"
        );
    }
}
