//! Cell values: the shared, heap-escapable bindings captured by closures.
use core::fmt;
use std::{cell::RefCell, rc::Rc};

use slotmap::{new_key_type, SlotMap};

use super::{frame::Frame, VmError};
use crate::value::Value;

enum CellState {
    /// Reads and writes go straight through to a live frame slot
    Open { frame: Frame, slot: usize },
    /// The owning frame is gone; the cell holds the value itself
    Escaped(Value),
}

/// One mutable binding shared by every closure that captured it.
pub struct CellValue(RefCell<CellState>);

impl CellValue {
    /// Opens a cell aliasing `frame[slot]`.
    pub fn open(frame: Frame, slot: usize) -> Result<Self, VmError> {
        if slot >= frame.len() {
            return Err(VmError::SlotOutOfRange(slot));
        }
        Ok(Self(RefCell::new(CellState::Open { frame, slot })))
    }

    pub fn escaped(value: Value) -> Self {
        Self(RefCell::new(CellState::Escaped(value)))
    }

    pub fn get(&self) -> Result<Value, VmError> {
        match &*self.0.borrow() {
            CellState::Open { frame, slot } => frame.get(*slot),
            CellState::Escaped(value) => Ok(value.clone()),
        }
    }

    pub fn set(&self, value: Value) -> Result<(), VmError> {
        match &mut *self.0.borrow_mut() {
            CellState::Open { frame, slot } => frame.set(*slot, value),
            CellState::Escaped(held) => {
                *held = value;
                Ok(())
            }
        }
    }

    pub fn is_escaped(&self) -> bool {
        matches!(&*self.0.borrow(), CellState::Escaped(_))
    }

    /// Escapes the cell if it is open on exactly `frame`, snapshotting the
    /// slot's current value. Returns whether the cell escaped just now.
    pub fn try_escape(&self, frame: &Frame) -> bool {
        let mut state = self.0.borrow_mut();
        let value = match &*state {
            CellState::Open {
                frame: owner,
                slot,
            } if owner.ptr_eq(frame) => owner.get(*slot).unwrap_or_default(),
            _ => return false,
        };
        *state = CellState::Escaped(value);
        true
    }
}

impl fmt::Debug for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.borrow() {
            CellState::Open { frame, slot } => {
                write!(f, "#<cellvalue frame={frame:?} slot={slot}>")
            }
            CellState::Escaped(value) => write!(f, "#<escaped cellvalue value={value}>"),
        }
    }
}

new_key_type! {
    pub struct CellKey;
}

/// Every open cell across all live frames, so a frame teardown can escape
/// exactly the cells that alias it.
#[derive(Default)]
pub struct CellRegistry {
    open: SlotMap<CellKey, Rc<CellValue>>,
}

impl CellRegistry {
    pub fn register(&mut self, cell: Rc<CellValue>) -> CellKey {
        self.open.insert(cell)
    }

    /// Escapes and forgets every registered cell open on `frame`; cells of
    /// other frames stay registered. Returns how many cells escaped.
    pub fn escape_frame(&mut self, frame: &Frame) -> usize {
        let before = self.open.len();
        self.open.retain(|_, cell| !cell.try_escape(frame));
        let escaped = before - self.open.len();
        if escaped > 0 {
            log::trace!("escaped {escaped} cell value(s) from {frame:?}");
        }
        escaped
    }

    /// Escapes every cell still open, whatever frame it belongs to.
    pub fn escape_all(&mut self) -> usize {
        let mut escaped = 0;
        for (_, cell) in self.open.drain() {
            let frame = match &*cell.0.borrow() {
                CellState::Open { frame, .. } => Some(frame.clone()),
                CellState::Escaped(_) => None,
            };
            if frame.is_some_and(|frame| cell.try_escape(&frame)) {
                escaped += 1;
            }
        }
        escaped
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use assert2::{check, let_assert};

    use super::{CellRegistry, CellValue};
    use crate::{runtime::frame::Frame, value::Value};

    #[test]
    fn open_cell_aliases_its_slot() {
        let frame = Frame::new(2);
        let_assert!(Ok(cell) = CellValue::open(frame.clone(), 1));
        let_assert!(Ok(()) = frame.set(1, Value::Fixnum(5)));
        let_assert!(Ok(Value::Fixnum(5)) = cell.get());

        let_assert!(Ok(()) = cell.set(Value::Fixnum(6)));
        let_assert!(Ok(Value::Fixnum(6)) = frame.get(1));
    }

    #[test]
    fn escape_snapshots_and_detaches() {
        let frame = Frame::new(1);
        let_assert!(Ok(cell) = CellValue::open(frame.clone(), 0));
        let_assert!(Ok(()) = cell.set(Value::Fixnum(1)));

        check!(!cell.try_escape(&Frame::new(1)));
        check!(!cell.is_escaped());

        check!(cell.try_escape(&frame));
        check!(cell.is_escaped());
        let_assert!(Ok(()) = frame.set(0, Value::Fixnum(99)));
        let_assert!(Ok(Value::Fixnum(1)) = cell.get());
    }

    #[test]
    fn escaping_twice_is_a_no_op() {
        let frame = Frame::new(1);
        let_assert!(Ok(()) = frame.set(0, Value::symbol("kept")));
        let mut registry = CellRegistry::default();
        let_assert!(Ok(cell) = CellValue::open(frame.clone(), 0));
        let cell = Rc::new(cell);
        registry.register(cell.clone());

        check!(registry.escape_frame(&frame) == 1);
        check!(registry.escape_frame(&frame) == 0);
        check!(!cell.try_escape(&frame));
        let_assert!(Ok(value) = cell.get());
        check!(value == Value::symbol("kept"));
    }

    #[test]
    fn sweep_leaves_other_frames_alone() {
        let outer = Frame::new(1);
        let inner = Frame::new(1);
        let mut registry = CellRegistry::default();
        for frame in [&outer, &inner, &inner] {
            let_assert!(Ok(cell) = CellValue::open(frame.clone(), 0));
            registry.register(Rc::new(cell));
        }

        check!(registry.escape_frame(&inner) == 2);
        check!(registry.len() == 1);
        check!(registry.escape_all() == 1);
        check!(registry.is_empty());
    }

    #[test]
    fn opening_past_the_frame_fails() {
        check!(CellValue::open(Frame::new(1), 1).is_err());
    }
}
