use crate::module::{GlobalEntry, InitKind};
use crate::value::Value;
use crate::{Error, TrapCode, ValueType};
use core::cell::RefCell;
use core::fmt;

#[derive(Debug, Clone, Copy)]
struct GlobalSlot {
    value_type: ValueType,
    mutable: bool,
    offset: u32,
}

/// Runtime storage of a module's local globals: one zeroed buffer plus an
/// offset table, laid out by each global's size and natural alignment in
/// declaration order.
///
/// Imported globals do not live here; the instance resolves those to host
/// addresses.
pub struct GlobalsInstance {
    data: RefCell<Vec<u8>>,
    slots: Vec<GlobalSlot>,
}

impl fmt::Debug for GlobalsInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GlobalsInstance")
            .field("count", &self.slots.len())
            .field("data_size", &self.data.borrow().len())
            .finish()
    }
}

impl GlobalsInstance {
    /// Lays out and initializes storage for the given declarations.
    ///
    /// `Zero` globals stay zero-filled, `Const` globals receive their
    /// payload, `DataOffset` globals receive the offset value itself (the
    /// module-address of their static data).
    pub fn alloc(entries: &[GlobalEntry]) -> Result<GlobalsInstance, Error> {
        let mut slots = Vec::with_capacity(entries.len());
        let mut offset = 0u32;
        for entry in entries {
            let align = entry.value_type.alignment() as u32;
            offset = (offset + align - 1) & !(align - 1);
            slots.push(GlobalSlot {
                value_type: entry.value_type,
                mutable: entry.mutable,
                offset,
            });
            offset = offset
                .checked_add(entry.value_type.size() as u32)
                .ok_or_else(|| Error::Global("globals buffer exceeds 4 GiB".into()))?;
        }

        let globals = GlobalsInstance {
            data: RefCell::new(vec![0u8; offset as usize]),
            slots,
        };

        for (idx, entry) in entries.iter().enumerate() {
            match entry.init {
                InitKind::Zero => {}
                InitKind::Const(value) => {
                    if value.value_type() != entry.value_type {
                        return Err(Error::Global(format!(
                            "global {} initializer type {:?} does not match {:?}",
                            idx,
                            value.value_type(),
                            entry.value_type
                        )));
                    }
                    globals.write(idx as u32, value);
                }
                InitKind::DataOffset(data_offset) => {
                    let value = Value::from_bits(entry.value_type, data_offset as u64);
                    globals.write(idx as u32, value);
                }
            }
        }

        Ok(globals)
    }

    /// Number of local globals.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Total buffer size in bytes.
    pub fn data_size(&self) -> usize {
        self.data.borrow().len()
    }

    /// Byte offset of a global within the buffer; this is the symbol value
    /// relocations use for local globals.
    pub fn offset_of(&self, index: u32) -> Option<u32> {
        self.slots.get(index as usize).map(|s| s.offset)
    }

    /// Value type of a global.
    pub fn type_of(&self, index: u32) -> Option<ValueType> {
        self.slots.get(index as usize).map(|s| s.value_type)
    }

    /// Reads a global by index.
    pub fn get(&self, index: u32) -> Result<Value, TrapCode> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(TrapCode::InvalidOperand)?;
        let data = self.data.borrow();
        let start = slot.offset as usize;
        let bytes = &data[start..start + slot.value_type.size()];
        Ok(Value::from_le_slice(slot.value_type, bytes))
    }

    /// Writes a global by index.
    ///
    /// Traps with [`TrapCode::TypeMismatch`] when the value's tag does not
    /// match the declared type and with [`TrapCode::InvalidOperand`] when
    /// the global is immutable.
    pub fn set(&self, index: u32, value: Value) -> Result<(), TrapCode> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(TrapCode::InvalidOperand)?;
        if !slot.mutable {
            return Err(TrapCode::InvalidOperand);
        }
        if value.value_type() != slot.value_type {
            return Err(TrapCode::TypeMismatch);
        }
        self.write(index, value);
        Ok(())
    }

    /// Writes a 32-bit little-endian word at a raw buffer offset; the
    /// relocation applier's store primitive.
    pub fn patch_u32(&self, offset: u32, word: u32) -> Result<(), Error> {
        let mut data = self.data.borrow_mut();
        let start = offset as usize;
        let end = start
            .checked_add(4)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| {
                Error::Instantiation(format!(
                    "relocation offset {:#x} outside the globals buffer",
                    offset
                ))
            })?;
        data[start..end].copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    fn write(&self, index: u32, value: Value) {
        let slot = self.slots[index as usize];
        let mut data = self.data.borrow_mut();
        let start = slot.offset as usize;
        value.write_le(&mut data[start..start + slot.value_type.size()]);
    }
}
