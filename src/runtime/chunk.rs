//! Binary chunks: a compiled root template and its registry on disk.
//!
//! ```text
//! chunk    := "-sanya--" template count template*
//! template := count word*            ; instructions
//!             count const*           ; constant pool
//!             number                 ; frame size
//!             count number*          ; packed cell recipe
//!             count number*          ; fresh-cell frame slots
//!             number                 ; positional argument count
//!             ( 0x00 | 0x01 )        ; variadic flag
//!             '\n'
//! const    := 'S' count byte*  |  'I' number  |  'P' const const
//!           | 'u'  |  't'  |  'f'  |  '?'
//! ```
//!
//! Every `count`, `number` and `word` is a 32-bit little-endian integer.
use std::{
    io::{self, Read, Write},
    rc::Rc,
};

use super::closure::{CellRecipe, ClosureTemplate};
use crate::{
    compiler::bytecode::{DecodeError, Instruction},
    value::{Symbol, Value},
};

pub const CHUNK_HEADER: &[u8; 8] = b"-sanya--";

const K_SYMBOL: u8 = b'S';
const K_FIXNUM: u8 = b'I';
const K_PAIR: u8 = b'P';
const K_NIL: u8 = b'u';
const K_TRUE: u8 = b't';
const K_FALSE: u8 = b'f';
const K_UNSPECIFIED: u8 = b'?';

#[derive(thiserror::Error, Debug)]
pub enum ChunkError {
    #[error("wrong chunk header")]
    BadHeader,
    #[error("unknown constant tag {0:#04x}")]
    UnknownTag(u8),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("variadic flag must be 0 or 1, got {0:#04x}")]
    BadVarargsFlag(u8),
    #[error("template record does not end in a newline")]
    MissingNewline,
    #[error("{0} does not fit in 32 bits")]
    NumberOutOfRange(i64),
    #[error("symbol name is not valid UTF-8")]
    BadSymbol,
    #[error("{0} cannot be stored in a chunk")]
    UnserializableConstant(Box<str>),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Writes `root` and its registry.
pub fn dump<W: Write>(root: &ClosureTemplate, mut out: W) -> Result<(), ChunkError> {
    out.write_all(CHUNK_HEADER)?;
    dump_template(root, &mut out)?;
    let registry = root.registry.as_deref().unwrap_or_default();
    dump_count(registry.len(), &mut out)?;
    for template in registry {
        dump_template(template, &mut out)?;
    }
    out.flush()?;
    Ok(())
}

/// Reads a chunk back into a root template carrying its registry.
pub fn load<R: Read>(mut input: R) -> Result<ClosureTemplate, ChunkError> {
    let mut header = [0; CHUNK_HEADER.len()];
    input.read_exact(&mut header)?;
    if &header != CHUNK_HEADER {
        return Err(ChunkError::BadHeader);
    }

    let mut root = load_template(&mut input)?;
    let count = load_u32(&mut input)?;
    let registry = (0..count)
        .map(|_| load_template(&mut input).map(Rc::new))
        .collect::<Result<Vec<_>, _>>()?;
    root.registry = Some(registry);
    log::debug!(
        "loaded chunk: {} instruction(s) at the root, {count} template(s)",
        root.instructions.len()
    );
    Ok(root)
}

fn dump_template(template: &ClosureTemplate, out: &mut impl Write) -> Result<(), ChunkError> {
    dump_count(template.instructions.len(), out)?;
    for instr in template.instructions.iter() {
        out.write_all(&instr.encode().to_le_bytes())?;
    }

    dump_count(template.consts.len(), out)?;
    for konst in template.consts.iter() {
        dump_const(konst, out)?;
    }

    dump_count(template.frame_size, out)?;

    dump_count(template.cell_recipe.len(), out)?;
    for recipe in template.cell_recipe.iter() {
        out.write_all(&recipe.raw().to_le_bytes())?;
    }

    dump_count(template.fresh_cells.len(), out)?;
    for slot in template.fresh_cells.iter() {
        dump_count(*slot, out)?;
    }

    dump_count(template.arg_count, out)?;
    out.write_all(&[u8::from(template.variadic), b'\n'])?;
    Ok(())
}

fn dump_count(n: usize, out: &mut impl Write) -> Result<(), ChunkError> {
    let n = i32::try_from(n)
        .map_err(|_| ChunkError::NumberOutOfRange(i64::try_from(n).unwrap_or(i64::MAX)))?;
    out.write_all(&n.to_le_bytes())?;
    Ok(())
}

fn dump_const(konst: &Value, out: &mut impl Write) -> Result<(), ChunkError> {
    // the cdr chain of a list is walked in a loop, only cars recurse
    let mut konst = konst.clone();
    loop {
        match konst {
            Value::Symbol(sym) => {
                let name = sym.as_str();
                out.write_all(&[K_SYMBOL])?;
                dump_count(name.len(), out)?;
                out.write_all(name.as_bytes())?;
            }
            Value::Fixnum(n) => {
                let n = i32::try_from(n).map_err(|_| ChunkError::NumberOutOfRange(n))?;
                out.write_all(&[K_FIXNUM])?;
                out.write_all(&n.to_le_bytes())?;
            }
            Value::Pair(pair) => {
                out.write_all(&[K_PAIR])?;
                dump_const(&pair.car(), out)?;
                konst = pair.cdr();
                continue;
            }
            Value::Nil => out.write_all(&[K_NIL])?,
            Value::Boolean(true) => out.write_all(&[K_TRUE])?,
            Value::Boolean(false) => out.write_all(&[K_FALSE])?,
            Value::Unspecified => out.write_all(&[K_UNSPECIFIED])?,
            other => {
                return Err(ChunkError::UnserializableConstant(Box::from(
                    other.to_string(),
                )))
            }
        }
        return Ok(());
    }
}

fn load_template(input: &mut impl Read) -> Result<ClosureTemplate, ChunkError> {
    let count = load_u32(input)?;
    let instructions = (0..count)
        .map(|_| Ok(Instruction::decode(load_u32(input)?)?))
        .collect::<Result<Vec<_>, ChunkError>>()?;

    let count = load_u32(input)?;
    let consts = (0..count)
        .map(|_| load_const(input))
        .collect::<Result<Vec<_>, _>>()?;

    let frame_size = load_usize(input)?;

    let count = load_u32(input)?;
    let cell_recipe = (0..count)
        .map(|_| load_u32(input).map(CellRecipe::from_raw))
        .collect::<Result<Vec<_>, _>>()?;

    let count = load_u32(input)?;
    let fresh_cells = (0..count)
        .map(|_| load_usize(input))
        .collect::<Result<Vec<_>, _>>()?;

    let arg_count = load_usize(input)?;
    let variadic = match load_u8(input)? {
        0 => false,
        1 => true,
        flag => return Err(ChunkError::BadVarargsFlag(flag)),
    };
    if load_u8(input)? != b'\n' {
        return Err(ChunkError::MissingNewline);
    }

    Ok(ClosureTemplate {
        instructions: instructions.into(),
        consts: consts.into(),
        frame_size,
        cell_recipe: cell_recipe.into_boxed_slice(),
        fresh_cells: fresh_cells.into_boxed_slice(),
        arg_count,
        variadic,
        registry: None,
    })
}

fn load_const(input: &mut impl Read) -> Result<Value, ChunkError> {
    let mut cars = vec![];
    let tail = loop {
        let value = match load_u8(input)? {
            K_SYMBOL => {
                let len = load_usize(input)?;
                let mut name = vec![0; len];
                input.read_exact(&mut name)?;
                let name = String::from_utf8(name).map_err(|_| ChunkError::BadSymbol)?;
                Value::Symbol(Symbol::intern(name))
            }
            K_FIXNUM => Value::Fixnum(load_u32(input)? as i32 as i64),
            K_PAIR => {
                cars.push(load_const(input)?);
                continue;
            }
            K_NIL => Value::Nil,
            K_TRUE => Value::Boolean(true),
            K_FALSE => Value::Boolean(false),
            K_UNSPECIFIED => Value::Unspecified,
            tag => return Err(ChunkError::UnknownTag(tag)),
        };
        break value;
    };
    Ok(Value::list_with_tail(cars, tail))
}

fn load_u8(input: &mut impl Read) -> Result<u8, ChunkError> {
    let mut byte = [0];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn load_u32(input: &mut impl Read) -> Result<u32, ChunkError> {
    let mut bytes = [0; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn load_usize(input: &mut impl Read) -> Result<usize, ChunkError> {
    Ok(load_u32(input)? as usize)
}
