//! The native tier: per-function code generation, the compiled-code cache,
//! and the seam the architecture backends plug into.
//!
//! Functions tagged HOT by their producer are handed to the configured
//! [`CodeGenerator`] the first time they are entered. A successful compile
//! is installed in the [`JitCache`] and every later entry goes through it;
//! a failed compile falls back to the interpreter on the default path, or
//! surfaces the failure on the JIT-only path used from inside native code.
//!
//! The instruction-selecting backends for the supported architectures live
//! out of tree; [`predecode::BaselineGenerator`] is the in-tree generator,
//! lowering a body to a pre-decoded op vector with no fetch/decode work at
//! run time.

pub mod exec_alloc;
pub mod predecode;

use crate::instance::Instance;
use crate::module::Module;
use crate::runner::ExecutionContext;
use crate::{Error, Trap};
use core::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Compiled form of one function.
///
/// Entry contract: the current frame of `ctx` is the callee's register
/// window, arguments already in `R0..`; on successful return the result, if
/// any, has been written to `R0`.
pub trait CompiledCode {
    /// Runs the compiled body on the current frame.
    fn enter(&self, instance: &Instance<'_>, ctx: &mut ExecutionContext) -> Result<(), Trap>;

    /// Size of the generated artifact in bytes, as accounted by the cache.
    fn code_size(&self) -> usize;
}

/// A cache entry: the code plus its size.
pub struct CompiledFunc {
    code: Box<dyn CompiledCode>,
}

impl CompiledFunc {
    /// Wraps a generated body.
    pub fn new(code: Box<dyn CompiledCode>) -> CompiledFunc {
        CompiledFunc { code }
    }

    /// Enters the compiled code on the current frame.
    pub(crate) fn call(
        &self,
        instance: &Instance<'_>,
        ctx: &mut ExecutionContext,
    ) -> Result<(), Trap> {
        self.code.enter(instance, ctx)
    }

    /// Generated code size in bytes.
    pub fn code_size(&self) -> usize {
        self.code.code_size()
    }
}

/// Generates native code for one function.
///
/// Implementations for the supported instruction sets are provided by the
/// platform layer; this crate ships the baseline generator.
pub trait CodeGenerator {
    /// Compiles the local function `local_idx` of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Jit`] when the body uses a construct the generator
    /// cannot lower; the dispatcher falls back to the interpreter.
    fn compile(&self, module: &Module<'_>, local_idx: u32) -> Result<CompiledFunc, Error>;
}

/// Mapping from local function index to its compiled entry.
///
/// Entries are single-owner: `remove` drops the code, and the cache going
/// away frees everything it still holds.
pub struct JitCache {
    entries: RefCell<BTreeMap<u32, Rc<CompiledFunc>>>,
}

impl JitCache {
    /// Creates an empty cache.
    pub fn new() -> JitCache {
        JitCache {
            entries: RefCell::new(BTreeMap::new()),
        }
    }

    /// Installs a compiled function, replacing any previous entry.
    pub fn insert(&self, local_idx: u32, func: CompiledFunc) {
        self.entries.borrow_mut().insert(local_idx, Rc::new(func));
    }

    /// Looks up the compiled entry for a function.
    pub fn lookup(&self, local_idx: u32) -> Option<Rc<CompiledFunc>> {
        self.entries.borrow().get(&local_idx).cloned()
    }

    /// Removes and frees an entry. Returns whether one existed.
    pub fn remove(&self, local_idx: u32) -> bool {
        self.entries.borrow_mut().remove(&local_idx).is_some()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Total size of all cached artifacts.
    pub fn total_code_size(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .map(|f| f.code_size())
            .sum()
    }
}

impl Default for JitCache {
    fn default() -> Self {
        Self::new()
    }
}
