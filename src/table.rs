use crate::types::{check_limits, Limits};
use crate::{Error, TrapCode};
use core::cell::RefCell;
use core::fmt;

/// Default maximum when a table declares no explicit limit.
const DEFAULT_TABLE_MAX: u32 = 65536;

/// Runtime representation of the funcref table.
///
/// A table is an array of function references, held as global function
/// indices. Module code calls through it with `CALL_INDIRECT`; slots that
/// were never filled by an element segment trap when called.
pub struct TableInstance {
    limits: Limits,
    buffer: RefCell<Vec<Option<u32>>>,
}

impl fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableInstance")
            .field("limits", &self.limits)
            .field("len", &self.buffer.borrow().len())
            .finish()
    }
}

impl TableInstance {
    /// Allocates a table of `initial` uninitialized slots.
    ///
    /// A missing maximum defaults to 65536 slots.
    pub fn alloc(initial: u32, maximum: Option<u32>) -> Result<TableInstance, Error> {
        let limits = Limits::new(initial, Some(maximum.unwrap_or(DEFAULT_TABLE_MAX)), false);
        check_limits(&limits)?;
        Ok(TableInstance {
            buffer: RefCell::new(vec![None; initial as usize]),
            limits,
        })
    }

    /// Current number of slots.
    pub fn size(&self) -> u32 {
        self.buffer.borrow().len() as u32
    }

    /// Maximum number of slots.
    pub fn maximum(&self) -> u32 {
        self.limits.maximum().unwrap_or(DEFAULT_TABLE_MAX)
    }

    /// Grows the table by `by` uninitialized slots.
    pub fn grow(&self, by: u32) -> Result<(), Error> {
        let mut buffer = self.buffer.borrow_mut();
        let new_size = (buffer.len() as u32)
            .checked_add(by)
            .filter(|&s| s <= self.maximum())
            .ok_or_else(|| {
                Error::Table(format!(
                    "trying to grow table by {} slots when there are already {}",
                    by,
                    buffer.len()
                ))
            })?;
        buffer.resize(new_size as usize, None);
        Ok(())
    }

    /// Reads a slot; trapping accessor used by indirect calls.
    pub fn get(&self, index: u32) -> Result<u32, TrapCode> {
        let buffer = self.buffer.borrow();
        let slot = buffer
            .get(index as usize)
            .ok_or(TrapCode::TableAccessOutOfBounds)?;
        slot.ok_or(TrapCode::ElemUninitialized)
    }

    /// Writes a slot; used by element segment initialization.
    pub fn set(&self, index: u32, func_idx: Option<u32>) -> Result<(), Error> {
        let mut buffer = self.buffer.borrow_mut();
        let len = buffer.len();
        let slot = buffer.get_mut(index as usize).ok_or_else(|| {
            Error::Table(format!(
                "table slot {} is out of bounds of {}",
                index, len
            ))
        })?;
        *slot = func_idx;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TableInstance;
    use crate::TrapCode;
    use assert_matches::assert_matches;

    #[test]
    fn unset_slots_trap_as_uninitialized() {
        let table = TableInstance::alloc(4, None).unwrap();
        assert_matches!(table.get(0), Err(TrapCode::ElemUninitialized));
        assert_matches!(table.get(4), Err(TrapCode::TableAccessOutOfBounds));
    }

    #[test]
    fn set_then_get() {
        let table = TableInstance::alloc(4, None).unwrap();
        table.set(2, Some(7)).unwrap();
        assert_eq!(table.get(2).unwrap(), 7);
    }

    #[test]
    fn growth_is_bounded_by_the_maximum() {
        let table = TableInstance::alloc(1, Some(2)).unwrap();
        table.grow(1).unwrap();
        assert!(table.grow(1).is_err());
        assert_eq!(table.size(), 2);
    }
}
