//! Wrappers completing OUT-marshalling after an asynchronous host call.
//!
//! An import whose `immeta` marks an argument with the async handler gets
//! its host function wrapped: the wrapper substitutes host-side scratch
//! buffers for the OUT pointers, invokes the real host function, and copies
//! the scratch back into module memory when the call completes. From the
//! VM's perspective the caller is suspended until both the host function
//! and the OUT copies are done.
//!
//! Wrapper records are owned by the instance and released at teardown, so a
//! host that retains the scratch pointer past the call does not dangle
//! until the instance itself goes away.

use super::abi::{self, ArgClass, RawRet, RetKind};
use crate::instance::Instance;
use crate::registry::HostFnPtr;
use crate::{Error, TrapCode};
use spin::Mutex;

/// One pending OUT copy: scratch bytes destined for a module offset.
#[derive(Debug)]
struct OutRecord {
    module_offset: u32,
    scratch: Vec<u8>,
}

/// One wrapped host call's OUT state.
#[derive(Debug)]
pub(crate) struct AsyncWrapper {
    host_fn: usize,
    outs: Mutex<Vec<OutRecord>>,
}

impl AsyncWrapper {
    pub(crate) fn new(host_fn: usize) -> AsyncWrapper {
        AsyncWrapper {
            host_fn,
            outs: Mutex::new(Vec::new()),
        }
    }

    /// Calls the wrapped host function with the packed arguments.
    ///
    /// # Safety
    ///
    /// Same contract as [`abi::raw_call`]: the captured function pointer
    /// must match the classified argument and return sequence.
    pub(crate) unsafe fn invoke(
        &self,
        args: &[ArgClass],
        ret: RetKind,
        variadic: bool,
    ) -> Result<RawRet, Error> {
        let ptr = self.host_fn as HostFnPtr;
        if variadic {
            abi::raw_call_variadic(ptr, args, ret)
        } else {
            abi::raw_call(ptr, args, ret)
        }
    }

    /// Registers a scratch buffer standing in for the OUT pointer at
    /// `module_offset`, seeded with `initial` (non-empty for INOUT).
    /// Returns the host address the call passes instead of the pointer.
    pub(crate) fn add_out(&self, module_offset: u32, size: u32, initial: &[u8]) -> u64 {
        let mut scratch = vec![0u8; size as usize];
        scratch[..initial.len()].copy_from_slice(initial);
        let mut outs = self.outs.lock();
        outs.push(OutRecord {
            module_offset,
            scratch,
        });
        outs.last().expect("just pushed").scratch.as_ptr() as u64
    }

    /// Copies every scratch buffer back into module memory. Called when the
    /// wrapped host function has returned.
    pub(crate) fn complete(&self, instance: &Instance<'_>) -> Result<(), TrapCode> {
        for out in self.outs.lock().iter() {
            instance.memory().set(out.module_offset, &out.scratch)?;
        }
        Ok(())
    }
}

/// Instance-scoped registry of live wrappers, freed on teardown.
#[derive(Debug)]
pub(crate) struct WrapperRegistry {
    wrappers: Mutex<Vec<Box<AsyncWrapper>>>,
}

impl WrapperRegistry {
    pub(crate) fn new() -> WrapperRegistry {
        WrapperRegistry {
            wrappers: Mutex::new(Vec::new()),
        }
    }

    /// Takes ownership of a wrapper for the instance's lifetime and returns
    /// a reference valid until teardown.
    pub(crate) fn adopt(&self, wrapper: Box<AsyncWrapper>) -> &AsyncWrapper {
        let mut wrappers = self.wrappers.lock();
        wrappers.push(wrapper);
        // The box pins the wrapper; the registry only ever appends.
        unsafe { &*(&**wrappers.last().expect("just pushed") as *const AsyncWrapper) }
    }

    /// Number of live wrappers.
    pub(crate) fn len(&self) -> usize {
        self.wrappers.lock().len()
    }
}
