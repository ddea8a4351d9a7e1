//! # espb
//!
//! This library loads, links and executes ESPB code modules: compact binary
//! modules in the spirit of WebAssembly, but simpler, designed for
//! resource-constrained 32-bit targets with first-class bidirectional
//! interoperation with native host code.
//!
//! An ESPB module contains definitions of:
//!
//! - typed function signatures and function bodies,
//! - global variables,
//! - a linear memory and a funcref table,
//! - data and element segments,
//! - relocations,
//! - host-call marshalling metadata (`immeta`) and host-side callback
//!   metadata (`cbmeta`).
//!
//! ## Loading
//!
//! [`Module::parse`] decodes the section-structured binary into an immutable
//! [`Module`] that borrows the input buffer. All cross-references (signature
//! indices, function indices, segment targets) are range-checked during
//! parsing; a module that parses is safe to instantiate.
//!
//! ## Instantiation
//!
//! [`Instance::instantiate`] allocates linear memory, globals and the table,
//! resolves imports against a [`SymbolRegistry`], applies relocations,
//! initializes data and element segments, registers the sandbox heap over the
//! tail of linear memory and runs the start function, if any. Failure at any
//! step releases everything allocated so far.
//!
//! ## Execution
//!
//! Exported functions are invoked through [`Instance::invoke_export`] with an
//! array of typed [`Value`]s. Execution happens on an [`ExecutionContext`]
//! owning the shadow stack; functions tagged HOT are handed to the JIT tier
//! and fall back to the interpreter when compilation is not possible.
//!
//! # Examples
//!
//! ```no_run
//! use espb::{Config, Instance, Module, SymbolRegistry, Value, ValueType};
//!
//! # fn main() -> Result<(), espb::Error> {
//! # let image: Vec<u8> = Vec::new();
//! let module = Module::parse(&image)?;
//! let registry = SymbolRegistry::new();
//! let instance = Instance::instantiate(&module, &registry, Config::default())?;
//!
//! let mut results = [Value::default_of(ValueType::I32)];
//! instance.invoke_export("add", &[Value::I32(10), Value::I32(32)], &mut results)?;
//! assert_eq!(results[0], Value::I32(42));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_ret_no_self)]

use core::fmt;
use downcast_rs::{impl_downcast, Downcast};
use std::error;

/// Error type which can be produced by module code or by the host environment.
///
/// Under some conditions execution produces a `Trap`, which immediately aborts
/// the current call chain. Traps cannot be handled by module code; they unwind
/// every frame of the current [`ExecutionContext`] and are reported to the
/// embedder.
#[derive(Debug)]
pub struct Trap {
    code: TrapCode,
}

impl Trap {
    /// Create new trap.
    pub fn new(code: TrapCode) -> Trap {
        Trap { code }
    }

    /// Returns the code of this trap.
    pub fn code(&self) -> &TrapCode {
        &self.code
    }

    /// Converts into the code of this trap.
    pub fn into_code(self) -> TrapCode {
        self.code
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Trap: {:?}", self.code)
    }
}

impl error::Error for Trap {}

/// Cause of a [`Trap`].
#[derive(Debug)]
pub enum TrapCode {
    /// Attempt to load or store at an address outside the bounds of linear
    /// memory.
    ///
    /// Since addresses are interpreted as unsigned integers, out of bounds
    /// access can't happen with negative addresses (they always wrap).
    MemoryAccessOutOfBounds,

    /// Attempt to access a table element at an index outside the table.
    TableAccessOutOfBounds,

    /// Attempt to call through an uninitialized table slot.
    ElemUninitialized,

    /// Attempt to divide by zero with a trapping integer divider.
    DivisionByZero,

    /// Signed division overflow (`i32::MIN / -1` and friends).
    IntegerOverflow,

    /// The shadow stack grew past its configured limit.
    ///
    /// This is likely caused by some infinite or very deep recursion.
    StackOverflow,

    /// A value was popped from an empty evaluation stack. Produced by
    /// malformed initializer expressions.
    StackUnderflow,

    /// The interpreter met an opcode it does not recognise.
    InvalidOpcode(u8),

    /// An opcode operand was malformed or truncated.
    InvalidOperand,

    /// A virtual register index lies outside the current frame's window.
    InvalidRegisterIndex(u8),

    /// A function index is out of range, or an imported function was called
    /// through an internal-only path.
    InvalidFuncIndex(u32),

    /// A typed opcode met operands of an unexpected type, or a call was made
    /// with a mismatching signature.
    TypeMismatch,

    /// Memory access with an alignment the target type does not allow.
    UnalignedAccess,

    /// A callback target could not be resolved.
    UnresolvedCallback,

    /// The module requires a feature this runtime does not support.
    FeatureNotSupported,

    /// Error specified by the host.
    ///
    /// Typically returned from a host function invoked through the FFI layer.
    Host(Box<dyn HostError>),
}

impl TrapCode {
    /// Whether this trap was specified by the host.
    pub fn is_host(&self) -> bool {
        matches!(self, TrapCode::Host(_))
    }
}

/// Internal runtime error.
#[derive(Debug)]
pub enum Error {
    /// Malformed module image: bad magic, unsupported version, truncated
    /// buffer, invalid section table or section body, invalid initializer
    /// expression. Might occur only at load time.
    Format(String),
    /// Linking failure: out-of-range index, unresolvable import, type
    /// mismatch on an import binding.
    Link(String),
    /// Error while instantiating a module: allocation failure, invalid
    /// data/element offset, start-function failure.
    Instantiation(String),
    /// Host-call marshalling failure: unresolved import at call time,
    /// malformed variadic type blob, call-shape preparation failure.
    Ffi(String),
    /// Native code generation failure.
    Jit(String),
    /// Function-level error (bad export name, argument mismatch).
    Function(String),
    /// Memory-level error.
    Memory(String),
    /// Table-level error.
    Table(String),
    /// Global-level error.
    Global(String),
    /// Trap.
    Trap(Trap),
    /// Custom embedder error.
    Host(Box<dyn HostError>),
}

impl Error {
    /// Returns a reference to a [`HostError`] if this `Error` represents some
    /// host error.
    ///
    /// I.e. if this error has variant [`Host`][`Error::Host`] or
    /// [`Trap`][`Error::Trap`] with a [host][`TrapCode::Host`] code.
    pub fn as_host_error(&self) -> Option<&dyn HostError> {
        match self {
            Error::Host(host_err) => Some(&**host_err),
            Error::Trap(Trap {
                code: TrapCode::Host(host_err),
            }) => Some(&**host_err),
            _ => None,
        }
    }

    /// Returns a [`HostError`] if this `Error` represents some host error,
    /// otherwise returns the original error.
    pub fn try_into_host_error(self) -> Result<Box<dyn HostError>, Self> {
        match self {
            Error::Host(host_err) => Ok(host_err),
            Error::Trap(Trap {
                code: TrapCode::Host(host_err),
            }) => Ok(host_err),
            other => Err(other),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Format(ref s) => write!(f, "Format: {}", s),
            Error::Link(ref s) => write!(f, "Link: {}", s),
            Error::Instantiation(ref s) => write!(f, "Instantiation: {}", s),
            Error::Ffi(ref s) => write!(f, "Ffi: {}", s),
            Error::Jit(ref s) => write!(f, "Jit: {}", s),
            Error::Function(ref s) => write!(f, "Function: {}", s),
            Error::Memory(ref s) => write!(f, "Memory: {}", s),
            Error::Table(ref s) => write!(f, "Table: {}", s),
            Error::Global(ref s) => write!(f, "Global: {}", s),
            Error::Trap(ref t) => write!(f, "Trap: {:?}", t),
            Error::Host(ref e) => write!(f, "User: {}", e),
        }
    }
}

impl error::Error for Error {}

/// Trait that allows the host to return custom errors.
///
/// It should be useful for representing custom traps, troubles at
/// instantiation time or other host specific conditions.
///
/// # Examples
///
/// ```rust
/// use std::fmt;
/// use espb::{Error, HostError};
///
/// #[derive(Debug)]
/// struct MyError {
///     code: u32,
/// }
///
/// impl fmt::Display for MyError {
///     fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
///         write!(f, "MyError, code={}", self.code)
///     }
/// }
///
/// impl HostError for MyError {}
///
/// fn failable_fn() -> Result<(), Error> {
///     let my_error = MyError { code: 1312 };
///     Err(Error::Host(Box::new(my_error)))
/// }
///
/// match failable_fn() {
///     Err(err) => {
///         let my_error = err.as_host_error().unwrap();
///         assert_eq!(my_error.downcast_ref::<MyError>().unwrap().code, 1312);
///     }
///     _ => panic!(),
/// }
/// ```
pub trait HostError: fmt::Display + fmt::Debug + Downcast + Send + Sync {}
impl_downcast!(HostError);

impl<U> From<U> for Error
where
    U: HostError + Sized,
{
    fn from(e: U) -> Self {
        Error::Host(Box::new(e))
    }
}

impl<U> From<U> for Trap
where
    U: HostError + Sized,
{
    fn from(e: U) -> Self {
        Trap::new(TrapCode::Host(Box::new(e)))
    }
}

impl From<Trap> for Error {
    fn from(e: Trap) -> Error {
        Error::Trap(e)
    }
}

impl From<TrapCode> for Trap {
    fn from(e: TrapCode) -> Trap {
        Trap::new(e)
    }
}

impl From<TrapCode> for Error {
    fn from(e: TrapCode) -> Error {
        Error::Trap(Trap::new(e))
    }
}

/// Tunable runtime constants.
///
/// A `Config` is consumed by [`Instance::instantiate`]; the defaults suit a
/// host-side test environment and match the sizes the runtime ships with on
/// embedded targets.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lower clamp for linear memory, in 64 KiB pages. The effective memory
    /// size is the maximum of this and the module's declared initial size.
    pub min_memory_pages: u32,
    /// Upper clamp for linear memory, in 64 KiB pages.
    pub max_memory_pages: u32,
    /// Initial shadow-stack capacity, in [`Value`] slots.
    pub initial_stack_values: usize,
    /// Shadow-stack growth step, in [`Value`] slots.
    pub stack_increment_values: usize,
    /// Hard shadow-stack limit; exceeding it traps with
    /// [`TrapCode::StackOverflow`].
    pub max_stack_values: usize,
    /// Maximum call depth.
    pub max_call_depth: usize,
    /// Bytes reserved for the executable-memory pool. Zero disables the pool;
    /// every executable allocation then maps its own pages.
    pub exec_pool_size: usize,
    /// Coerce a zero-parameter callback signature to a single pointer
    /// parameter when building a trampoline.
    ///
    /// Timer services on the reference platform invoke their callbacks with
    /// one pointer argument even when the module declares none; enabling this
    /// keeps such modules working. Off, the declared signature is used as-is.
    pub coerce_zero_param_callbacks: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            min_memory_pages: 1,
            max_memory_pages: 64,
            initial_stack_values: 4096,
            stack_increment_values: 1024,
            max_stack_values: 64 * 1024,
            max_call_depth: 1024,
            exec_pool_size: 0,
            coerce_zero_param_callbacks: true,
        }
    }
}

mod global;
mod heap;
mod instance;
mod memory;
pub mod nan_preserving_float;
mod registry;
mod runner;
mod table;
mod types;
mod value;

pub mod ffi;
pub mod isa;
pub mod jit;
pub mod module;

pub use self::global::GlobalsInstance;
pub use self::heap::SandboxHeap;
pub use self::instance::Instance;
pub use self::memory::{MemoryInstance, LINEAR_MEMORY_PAGE_SIZE};
pub use self::module::Module;
pub use self::registry::{HostFnPtr, HostSymbol, SymbolRegistry, SymbolTable};
pub use self::runner::{ExecutionContext, MAX_FRAME_ALLOCAS};
pub use self::table::TableInstance;
pub use self::types::{GlobalDescriptor, Limits, MemoryDescriptor, Signature, TableDescriptor};
pub use self::value::{FromValue, LittleEndianConvert, Value, ValueType};

/// Page-granular sizes and units.
pub mod memory_units {
    pub use memory_units::wasm32::*;
    pub use memory_units::{size_of, ByteSize, Bytes, RoundUpTo};
}
