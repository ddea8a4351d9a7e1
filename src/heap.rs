//! Sub-allocator serving module `malloc`/`ALLOCA` requests out of the tail
//! of linear memory, above the static data image.
//!
//! The allocator tracks offsets, never host pointers, and keeps all of its
//! bookkeeping host-side: module code cannot corrupt the free list. Any
//! offset it hands out lies inside a registered region, which the
//! instantiator constrains to `[align_up(static_data_end, 8), memory_size)`.

use crate::Error;
use core::cell::RefCell;
use std::collections::BTreeMap;

/// Minimum alignment of every allocation, matching the widest scalar.
pub const HEAP_MIN_ALIGN: u32 = 8;

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    start: u32,
    size: u32,
}

/// Multi-region first-fit heap over linear-memory offsets.
#[derive(Debug)]
pub struct SandboxHeap {
    inner: RefCell<HeapInner>,
}

#[derive(Debug, Default)]
struct HeapInner {
    /// Free blocks ordered by start offset; adjacent blocks are coalesced.
    free: Vec<FreeBlock>,
    /// Live allocations: offset -> size.
    allocated: BTreeMap<u32, u32>,
    /// Registered region bounds, for the containment invariant.
    regions: Vec<(u32, u32)>,
}

impl SandboxHeap {
    /// Creates an empty heap with no regions.
    pub fn new() -> SandboxHeap {
        SandboxHeap {
            inner: RefCell::new(HeapInner::default()),
        }
    }

    /// Registers the span `[start, end)` as allocatable.
    pub fn add_region(&self, start: u32, end: u32) -> Result<(), Error> {
        if start >= end {
            return Err(Error::Instantiation(format!(
                "degenerate heap region {:#x}..{:#x}",
                start, end
            )));
        }
        let mut inner = self.inner.borrow_mut();
        inner.regions.push((start, end));
        inner.free.push(FreeBlock {
            start,
            size: end - start,
        });
        inner.free.sort_by_key(|b| b.start);
        Ok(())
    }

    /// Allocates `size` bytes aligned to `align` (at least
    /// [`HEAP_MIN_ALIGN`]). Zero-size requests round up to one byte so every
    /// allocation has a distinct offset.
    pub fn alloc(&self, size: u32, align: u32) -> Result<u32, Error> {
        let align = align.max(HEAP_MIN_ALIGN);
        if !align.is_power_of_two() {
            return Err(Error::Instantiation(format!(
                "heap alignment {} is not a power of two",
                align
            )));
        }
        let size = size.max(1);
        let mut inner = self.inner.borrow_mut();

        for i in 0..inner.free.len() {
            let block = inner.free[i];
            let aligned = align_up(block.start, align);
            let padding = aligned - block.start;
            let Some(needed) = padding.checked_add(size) else {
                continue;
            };
            if needed > block.size {
                continue;
            }

            // Carve the allocation out of the block, returning the head
            // padding and the tail remainder to the free list.
            inner.free.remove(i);
            if padding > 0 {
                inner.free.push(FreeBlock {
                    start: block.start,
                    size: padding,
                });
            }
            let tail = block.size - needed;
            if tail > 0 {
                inner.free.push(FreeBlock {
                    start: aligned + size,
                    size: tail,
                });
            }
            inner.free.sort_by_key(|b| b.start);
            inner.allocated.insert(aligned, size);
            return Ok(aligned);
        }

        Err(Error::Instantiation(format!(
            "sandbox heap exhausted allocating {} bytes",
            size
        )))
    }

    /// Releases an allocation.
    ///
    /// # Errors
    ///
    /// Returns `Err` for an offset that is not a live allocation.
    pub fn free(&self, offset: u32) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let size = inner.allocated.remove(&offset).ok_or_else(|| {
            Error::Instantiation(format!("free of unallocated offset {:#x}", offset))
        })?;
        inner.free.push(FreeBlock {
            start: offset,
            size,
        });
        inner.free.sort_by_key(|b| b.start);
        inner.coalesce();
        Ok(())
    }

    /// Grows or shrinks an allocation, returning the new offset and the
    /// number of bytes the caller must copy from the old location.
    ///
    /// The heap does not own the memory bytes; when the offset moves, the
    /// caller performs the copy and this call has already released the old
    /// block.
    pub fn realloc(&self, offset: u32, new_size: u32) -> Result<(u32, u32), Error> {
        let old_size = {
            let inner = self.inner.borrow();
            *inner.allocated.get(&offset).ok_or_else(|| {
                Error::Instantiation(format!("realloc of unallocated offset {:#x}", offset))
            })?
        };
        if new_size <= old_size {
            return Ok((offset, new_size));
        }
        self.free(offset)?;
        let new_offset = match self.alloc(new_size, HEAP_MIN_ALIGN) {
            Ok(o) => o,
            Err(e) => {
                // Roll the free back so the original allocation survives.
                let restored = self.alloc_at(offset, old_size);
                debug_assert!(restored.is_ok());
                return Err(e);
            }
        };
        Ok((new_offset, old_size))
    }

    /// Whether `offset` lies within a registered region.
    pub fn contains(&self, offset: u32) -> bool {
        self.inner
            .borrow()
            .regions
            .iter()
            .any(|&(start, end)| offset >= start && offset < end)
    }

    /// Size of the live allocation at `offset`, if any.
    pub fn size_of(&self, offset: u32) -> Option<u32> {
        self.inner.borrow().allocated.get(&offset).copied()
    }

    /// Total free bytes across all regions.
    pub fn free_bytes(&self) -> u32 {
        self.inner.borrow().free.iter().map(|b| b.size).sum()
    }

    /// Re-establishes an allocation at a fixed offset; used to undo a free
    /// when a realloc cannot be satisfied.
    fn alloc_at(&self, offset: u32, size: u32) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let idx = inner
            .free
            .iter()
            .position(|b| b.start <= offset && offset + size <= b.start + b.size)
            .ok_or_else(|| {
                Error::Instantiation(format!("cannot re-place allocation at {:#x}", offset))
            })?;
        let block = inner.free.remove(idx);
        if offset > block.start {
            inner.free.push(FreeBlock {
                start: block.start,
                size: offset - block.start,
            });
        }
        let tail = (block.start + block.size) - (offset + size);
        if tail > 0 {
            inner.free.push(FreeBlock {
                start: offset + size,
                size: tail,
            });
        }
        inner.free.sort_by_key(|b| b.start);
        inner.allocated.insert(offset, size);
        Ok(())
    }
}

impl Default for SandboxHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapInner {
    fn coalesce(&mut self) {
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free.len());
        for block in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.start + last.size == block.start => {
                    last.size += block.size;
                }
                _ => merged.push(block),
            }
        }
        self.free = merged;
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}
