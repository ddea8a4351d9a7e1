use crate::memory_units::{Bytes, Pages, RoundUpTo};
use crate::types::Limits;
use crate::value::Value;
use crate::{Error, TrapCode, ValueType};
use core::cell::RefCell;
use core::fmt;

/// Size of a page of linear memory - 64KiB.
///
/// The size of a memory is always an integer multiple of a page size.
pub const LINEAR_MEMORY_PAGE_SIZE: Bytes = Bytes(65536);

/// Maximal number of pages.
const LINEAR_MEMORY_MAX_PAGES: Pages = Pages(65536);

enum Backing {
    /// Memory allocated and owned by the instance.
    Owned(RefCell<Vec<u8>>),
    /// Memory provided by the host through an `env.memory` import. The host
    /// guarantees the region stays valid and fixed for the instance's
    /// lifetime; it cannot grow.
    External { ptr: *mut u8, len: usize },
}

/// Runtime representation of linear memory.
///
/// A memory is a contiguous, mutable array of raw bytes. Module code loads
/// and stores typed values at byte addresses; an access not within the
/// bounds of the current size traps.
///
/// Typed accesses are checked for the target type's natural alignment, which
/// is what the 32-bit targets this VM is built for require.
pub struct MemoryInstance {
    limits: Limits,
    backing: Backing,
}

impl fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("limits", &self.limits)
            .field("size_bytes", &self.size_bytes())
            .field("external", &matches!(self.backing, Backing::External { .. }))
            .finish()
    }
}

impl MemoryInstance {
    /// Allocates a zeroed memory of `initial` pages, growable up to
    /// `maximum` pages.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `initial` exceeds `maximum` or either exceeds the
    /// 65536-page (4 GiB) address space.
    pub fn alloc(initial: Pages, maximum: Option<Pages>) -> Result<MemoryInstance, Error> {
        validate_memory(initial, maximum)?;
        let initial_bytes: Bytes = initial.into();
        let limits = Limits::new(
            initial.0 as u32,
            maximum.map(|m| m.0 as u32),
            false,
        );
        Ok(MemoryInstance {
            limits,
            backing: Backing::Owned(RefCell::new(vec![0u8; initial_bytes.0])),
        })
    }

    /// Wraps a host-provided memory region instead of allocating.
    ///
    /// Used when the module imports its memory as `env.memory`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` bytes that stay valid, writable and fixed
    /// in place for the lifetime of the instance using this memory.
    pub unsafe fn from_host(ptr: *mut u8, len: usize) -> MemoryInstance {
        let pages: Pages = Bytes(len).round_up_to();
        MemoryInstance {
            limits: Limits::new(pages.0 as u32, Some(pages.0 as u32), false),
            backing: Backing::External { ptr, len },
        }
    }

    /// Current size in bytes; always a multiple of the page size for owned
    /// memories.
    pub fn size_bytes(&self) -> usize {
        match &self.backing {
            Backing::Owned(buf) => buf.borrow().len(),
            Backing::External { len, .. } => *len,
        }
    }

    /// Current size in pages.
    pub fn size_pages(&self) -> u32 {
        let pages: Pages = Bytes(self.size_bytes()).round_up_to();
        pages.0 as u32
    }

    /// Maximum size in pages, if limited.
    pub fn maximum(&self) -> Option<u32> {
        self.limits.maximum()
    }

    /// Base address of the memory bytes.
    ///
    /// The FFI layer hands `base + offset` to host functions; the pointer is
    /// invalidated by [`grow`](Self::grow), which instance-level callers
    /// serialize behind the instance mutex.
    pub fn base_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Owned(buf) => buf.borrow_mut().as_mut_ptr(),
            Backing::External { ptr, .. } => *ptr,
        }
    }

    /// Translates a host address to a module-memory offset, if the address
    /// lies within this memory.
    pub fn host_addr_to_offset(&self, addr: u64) -> Option<u32> {
        let base = self.base_ptr() as u64;
        let len = self.size_bytes() as u64;
        if addr >= base && addr < base + len {
            Some((addr - base) as u32)
        } else {
            None
        }
    }

    /// Grows the memory by `additional` pages, zero-filled.
    ///
    /// Returns the previous size in pages.
    ///
    /// # Errors
    ///
    /// Returns `Err` when growing past the maximum, past the 4 GiB address
    /// space, or on host-provided memory.
    pub fn grow(&self, additional: Pages) -> Result<Pages, Error> {
        let buf = match &self.backing {
            Backing::Owned(buf) => buf,
            Backing::External { .. } => {
                return Err(Error::Memory(
                    "cannot grow host-provided memory".to_string(),
                ))
            }
        };
        let size_before: Pages = Bytes(buf.borrow().len()).round_up_to();
        let new_size: Pages = size_before + additional;
        let maximum = self
            .limits
            .maximum()
            .map(|m| Pages(m as usize))
            .unwrap_or(LINEAR_MEMORY_MAX_PAGES);
        if new_size > maximum {
            return Err(Error::Memory(format!(
                "trying to grow memory by {} pages when already have {}",
                additional.0, size_before.0,
            )));
        }
        let new_bytes: Bytes = new_size.into();
        buf.borrow_mut().resize(new_bytes.0, 0);
        Ok(size_before)
    }

    /// Copies bytes out of memory at the given offset.
    pub fn get_into(&self, offset: u32, target: &mut [u8]) -> Result<(), TrapCode> {
        let range = self.checked_range(offset as usize, target.len())?;
        match &self.backing {
            Backing::Owned(buf) => target.copy_from_slice(&buf.borrow()[range]),
            Backing::External { ptr, .. } => unsafe {
                core::ptr::copy_nonoverlapping(
                    ptr.add(range.start),
                    target.as_mut_ptr(),
                    target.len(),
                );
            },
        }
        Ok(())
    }

    /// Copies bytes out of memory into a fresh vector.
    pub fn get(&self, offset: u32, size: usize) -> Result<Vec<u8>, TrapCode> {
        let mut out = vec![0u8; size];
        self.get_into(offset, &mut out)?;
        Ok(out)
    }

    /// Copies bytes into memory at the given offset.
    pub fn set(&self, offset: u32, value: &[u8]) -> Result<(), TrapCode> {
        let range = self.checked_range(offset as usize, value.len())?;
        match &self.backing {
            Backing::Owned(buf) => buf.borrow_mut()[range].copy_from_slice(value),
            Backing::External { ptr, .. } => unsafe {
                core::ptr::copy_nonoverlapping(value.as_ptr(), ptr.add(range.start), value.len());
            },
        }
        Ok(())
    }

    /// Loads a typed value from `offset`, checking bounds and the type's
    /// natural alignment.
    pub fn load_value(&self, offset: u32, ty: ValueType) -> Result<Value, TrapCode> {
        if offset as usize % ty.alignment() != 0 {
            return Err(TrapCode::UnalignedAccess);
        }
        let mut bytes = [0u8; 16];
        let size = ty.size();
        self.get_into(offset, &mut bytes[..size])?;
        Ok(Value::from_le_slice(ty, &bytes[..size]))
    }

    /// Stores a typed value at `offset`, checking bounds and alignment.
    pub fn store_value(&self, offset: u32, value: Value) -> Result<(), TrapCode> {
        let ty = value.value_type();
        if offset as usize % ty.alignment() != 0 {
            return Err(TrapCode::UnalignedAccess);
        }
        let mut bytes = [0u8; 16];
        let size = ty.size();
        value.write_le(&mut bytes[..size]);
        self.set(offset, &bytes[..size])
    }

    fn checked_range(&self, offset: usize, size: usize) -> Result<core::ops::Range<usize>, TrapCode> {
        let end = offset
            .checked_add(size)
            .ok_or(TrapCode::MemoryAccessOutOfBounds)?;
        if end > self.size_bytes() {
            return Err(TrapCode::MemoryAccessOutOfBounds);
        }
        Ok(offset..end)
    }
}

fn validate_memory(initial: Pages, maximum: Option<Pages>) -> Result<(), Error> {
    if initial > LINEAR_MEMORY_MAX_PAGES {
        return Err(Error::Memory(format!(
            "initial size of {} pages exceeds the addressable maximum",
            initial.0
        )));
    }
    if let Some(maximum) = maximum {
        if initial > maximum {
            return Err(Error::Memory(format!(
                "maximum of {} pages is less than initial {}",
                maximum.0, initial.0
            )));
        }
        if maximum > LINEAR_MEMORY_MAX_PAGES {
            return Err(Error::Memory(format!(
                "maximum size of {} pages exceeds the addressable maximum",
                maximum.0
            )));
        }
    }
    Ok(())
}
