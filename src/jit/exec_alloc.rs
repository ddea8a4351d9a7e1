//! Executable-memory allocation for compiled code and trampolines.
//!
//! Allocation prefers a preconfigured pool (the fast, instruction-bus
//! -reachable region on the reference platform) and falls back to mapping
//! fresh pages with execute permission. Every returned block must pass the
//! [`is_executable`] predicate or the allocation is rolled back and fails.

use crate::Error;
use spin::Mutex;
use std::sync::Arc;

/// Queries whether the page holding `ptr` is mapped executable.
pub fn is_executable(ptr: *const u8) -> bool {
    region::query(ptr)
        .map(|r| r.is_executable())
        .unwrap_or(false)
}

struct Mapping {
    base: *mut u8,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of RWX anonymous memory.
    fn new(len: usize) -> Result<Mapping, Error> {
        let len = round_up_page(len);
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Jit("executable mapping failed".into()));
        }
        Ok(Mapping {
            base: base as *mut u8,
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        debug_assert_eq!(rc, 0, "munmap failed");
    }
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

struct PoolInner {
    mapping: Mapping,
    free: Mutex<Vec<(usize, usize)>>,
}

/// Pool-first executable allocator.
pub struct ExecAllocator {
    pool: Option<Arc<PoolInner>>,
}

impl ExecAllocator {
    /// Creates an allocator. `pool_size` of zero disables the pool; every
    /// block then maps its own pages.
    pub fn new(pool_size: usize) -> Result<ExecAllocator, Error> {
        let pool = if pool_size == 0 {
            None
        } else {
            let mapping = Mapping::new(pool_size)?;
            let len = mapping.len;
            Some(Arc::new(PoolInner {
                mapping,
                free: Mutex::new(vec![(0, len)]),
            }))
        };
        Ok(ExecAllocator { pool })
    }

    /// Allocates `size` bytes of executable memory.
    pub fn alloc(&self, size: usize) -> Result<ExecBlock, Error> {
        let size = size.max(1);
        if let Some(pool) = &self.pool {
            if let Some(offset) = pool_carve(pool, size) {
                let ptr = unsafe { pool.mapping.base.add(offset) };
                let block = ExecBlock {
                    ptr,
                    len: size,
                    owner: BlockOwner::Pool {
                        pool: Arc::clone(pool),
                        offset,
                    },
                };
                return check_block(block);
            }
        }
        let mapping = Mapping::new(size)?;
        let block = ExecBlock {
            ptr: mapping.base,
            len: size,
            owner: BlockOwner::Mapped(mapping),
        };
        check_block(block)
    }
}

fn check_block(block: ExecBlock) -> Result<ExecBlock, Error> {
    if !is_executable(block.as_ptr()) {
        // Dropping the block rolls the allocation back.
        return Err(Error::Jit("allocated block is not executable".into()));
    }
    Ok(block)
}

fn pool_carve(pool: &PoolInner, size: usize) -> Option<usize> {
    let size = round_up(size, 16);
    let mut free = pool.free.lock();
    let idx = free.iter().position(|&(_, len)| len >= size)?;
    let (offset, len) = free[idx];
    if len == size {
        free.remove(idx);
    } else {
        free[idx] = (offset + size, len - size);
    }
    Some(offset)
}

enum BlockOwner {
    Pool { pool: Arc<PoolInner>, offset: usize },
    Mapped(Mapping),
}

/// An owned span of executable memory; freed on drop by whoever allocated
/// it.
pub struct ExecBlock {
    ptr: *mut u8,
    len: usize,
    owner: BlockOwner,
}

unsafe impl Send for ExecBlock {}
unsafe impl Sync for ExecBlock {}

impl ExecBlock {
    /// Base address of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Copies `code` into the block.
    ///
    /// # Errors
    ///
    /// Returns `Err` when `code` does not fit.
    pub fn write(&mut self, code: &[u8]) -> Result<(), Error> {
        if code.len() > self.len {
            return Err(Error::Jit(format!(
                "code of {} bytes does not fit a {}-byte block",
                code.len(),
                self.len
            )));
        }
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr, code.len());
        }
        Ok(())
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        if let BlockOwner::Pool { pool, offset } = &self.owner {
            pool.free.lock().push((*offset, round_up(self.len, 16)));
        }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn round_up_page(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    round_up(len.max(1), page.max(4096))
}

#[cfg(test)]
mod tests {
    use super::{is_executable, ExecAllocator};

    #[test]
    fn mapped_blocks_are_executable() {
        let allocator = ExecAllocator::new(0).unwrap();
        let block = allocator.alloc(64).unwrap();
        assert!(is_executable(block.as_ptr()));
    }

    #[test]
    fn pool_blocks_are_reused_after_drop() {
        let allocator = ExecAllocator::new(4096).unwrap();
        let first = allocator.alloc(2048).unwrap();
        let _second = allocator.alloc(2048).unwrap();
        // The pool is exhausted; freeing the first block must make its
        // span allocatable again.
        drop(first);
        let third = allocator.alloc(2048).unwrap();
        assert!(is_executable(third.as_ptr()));
    }

    #[test]
    fn code_must_fit_the_block() {
        let allocator = ExecAllocator::new(0).unwrap();
        let mut block = allocator.alloc(8).unwrap();
        assert!(block.write(&[0u8; 64]).is_err());
        block.write(&[0xC3]).unwrap();
    }

    #[test]
    fn text_segment_functions_pass_the_predicate() {
        assert!(is_executable(is_executable as usize as *const u8));
    }
}
