//! Deferred-filled cells for embedded pointer targets.

use std::cell::RefCell;
use std::rc::Rc;

/// The decoded form of an embedded NDR pointer.
///
/// When a structure's immediate members are read, an embedded pointer
/// contributes only its referent ID; the pointed-to value arrives when the
/// enclosing aggregate's deferred reads run. `NdrEmbedded` is the cell
/// that receives it; by the time the reader returns the structure to the
/// caller, a non-null cell is populated.
pub struct NdrEmbedded<T> {
    slot: Option<Rc<RefCell<Option<T>>>>,
}

impl<T> NdrEmbedded<T> {
    /// A cell holding an already-present value, for building values on the
    /// encode side.
    pub fn new(value: T) -> Self {
        Self {
            slot: Some(Rc::new(RefCell::new(Some(value)))),
        }
    }

    /// The decoded form of a zero referent.
    pub(crate) fn null() -> Self {
        Self { slot: None }
    }

    /// An unfilled cell whose value a deferred read will supply.
    pub(crate) fn pending() -> Self {
        Self {
            slot: Some(Rc::new(RefCell::new(None))),
        }
    }

    /// Shared handle on the slot, captured by the deferred read.
    pub(crate) fn share(&self) -> Rc<RefCell<Option<T>>> {
        self.slot
            .as_ref()
            .map(Rc::clone)
            .expect("share on a null pointer cell")
    }

    /// True if the wire carried a zero referent.
    pub fn is_null(&self) -> bool {
        self.slot.is_none()
    }

    /// Take the decoded value. `None` for a null pointer, or if the
    /// deferred read never ran because decoding failed.
    pub fn into_option(self) -> Option<T> {
        let slot = self.slot?;
        match Rc::try_unwrap(slot) {
            Ok(cell) => cell.into_inner(),
            Err(shared) => shared.borrow_mut().take(),
        }
    }
}

impl<T: Clone> NdrEmbedded<T> {
    /// Clone the decoded value out without consuming the cell.
    pub fn to_option(&self) -> Option<T> {
        self.slot.as_ref().and_then(|slot| slot.borrow().clone())
    }
}

impl<T> From<Option<T>> for NdrEmbedded<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::new(value),
            None => Self::null(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for NdrEmbedded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.slot {
            None => f.write_str("NdrEmbedded(null)"),
            Some(slot) => write!(f, "NdrEmbedded({:?})", slot.borrow()),
        }
    }
}
