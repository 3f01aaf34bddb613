use core::fmt;
use std::{cell::RefCell, rc::Rc};

use super::VmError;
use crate::value::Value;

/// Local storage of one activation: arguments, locals and temporaries.
///
/// Frames are shared handles so that open cell values can keep reading and
/// writing the slot they alias; identity is what [`Frame::ptr_eq`] compares.
#[derive(Clone, Default)]
pub struct Frame(Rc<RefCell<Vec<Value>>>);

impl Frame {
    pub fn new(size: usize) -> Self {
        Self(Rc::new(RefCell::new(vec![Value::Unspecified; size])))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the frame to at least `new_size` slots. Frames never shrink.
    pub fn resize(&self, new_size: usize) {
        let mut slots = self.0.borrow_mut();
        if slots.len() < new_size {
            slots.resize(new_size, Value::Unspecified);
        }
    }

    pub fn get(&self, slot: usize) -> Result<Value, VmError> {
        self.0
            .borrow()
            .get(slot)
            .cloned()
            .ok_or(VmError::SlotOutOfRange(slot))
    }

    pub fn set(&self, slot: usize, value: Value) -> Result<(), VmError> {
        let mut slots = self.0.borrow_mut();
        let target = slots.get_mut(slot).ok_or(VmError::SlotOutOfRange(slot))?;
        *target = value;
        Ok(())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<frame {:p} size={}>", Rc::as_ptr(&self.0), self.len())
    }
}
