//! Callback trampolines: native entry points that re-enter the VM.
//!
//! When module code hands a function to the host (a timer callback, an
//! event handler), the host must receive something it can call with its
//! own ABI. The marshaller swaps the argument for a *trampoline*: a native
//! function bound to a [`ClosureRecord`] describing the module function to
//! re-enter and the opaque user-data pointer whose identity must be
//! preserved.
//!
//! The portable trampoline backend is a fixed pool of native entry points,
//! one per slot, each forwarding its register arguments and slot number to
//! a universal handler. Binding a slot is the closure-preparation step an
//! architecture-specific backend would do by emitting code; the pool lives
//! in the text segment and passes the same `is_executable` gate emitted
//! trampolines must pass.
//!
//! Slot assignment is process-wide and mutex-guarded; the records
//! themselves are owned by the instance that created them and are torn
//! down before it, never after.

use crate::instance::Instance;
use crate::jit::exec_alloc;
use crate::module::CallbackMeta;
use crate::runner::ExecutionContext;
use crate::types::Signature;
use crate::value::Value;
use crate::{Error, ValueType};
use spin::Mutex;

/// Number of concurrently live trampolines in the pool.
pub const NUM_TRAMPOLINE_SLOTS: usize = 16;

/// Upper bound on callback arity; the trampoline entry points forward this
/// many register words.
pub const MAX_CALLBACK_ARGS: usize = 4;

type TrampolineFn = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;

/// Process-wide binding of slot -> live record, guarded by one mutex.
/// A zero entry is a free slot.
static SLOT_BINDINGS: Mutex<[usize; NUM_TRAMPOLINE_SLOTS]> =
    Mutex::new([0; NUM_TRAMPOLINE_SLOTS]);

macro_rules! trampolines {
    ($($idx:expr => $name:ident),* $(,)?) => {
        $(
            unsafe extern "C" fn $name(a: usize, b: usize, c: usize, d: usize) -> usize {
                trampoline_entry($idx, [a, b, c, d])
            }
        )*
        static TRAMPOLINE_FNS: [TrampolineFn; NUM_TRAMPOLINE_SLOTS] = [$($name),*];
    };
}

trampolines! {
    0 => tramp_0, 1 => tramp_1, 2 => tramp_2, 3 => tramp_3,
    4 => tramp_4, 5 => tramp_5, 6 => tramp_6, 7 => tramp_7,
    8 => tramp_8, 9 => tramp_9, 10 => tramp_10, 11 => tramp_11,
    12 => tramp_12, 13 => tramp_13, 14 => tramp_14, 15 => tramp_15,
}

/// One live callback closure: everything needed to turn a native invocation
/// back into a module call.
pub(crate) struct ClosureRecord {
    /// The native entry point handed to the host.
    trampoline: TrampolineFn,
    /// The bound pool slot; the portable rendition of the closure block.
    slot: usize,
    /// The owning instance. The record never outlives it; teardown order is
    /// records first, instance second.
    instance: *const (),
    /// Module-local index of the callback target. Resolved to a global
    /// index at call time.
    target_func: u16,
    /// The signature the host sees (the target's, possibly arity-coerced).
    host_sig: Signature,
    /// Number of parameters the module function actually declares.
    module_params: usize,
    /// The user-data value module code supplied, substituted verbatim.
    user_data: Value,
    /// Host-call argument slot carrying the user data.
    user_data_idx: Option<u8>,
    /// Reuse key: which import and argument slot this record serves.
    import_idx: u16,
    param_idx: u8,
}

// The raw instance pointer is only dereferenced while the instance is
// alive, which the teardown order guarantees.
unsafe impl Send for ClosureRecord {}
unsafe impl Sync for ClosureRecord {}

impl ClosureRecord {
    /// Host address of the trampoline.
    pub(crate) fn trampoline_addr(&self) -> u64 {
        self.trampoline as usize as u64
    }
}

impl Drop for ClosureRecord {
    fn drop(&mut self) {
        SLOT_BINDINGS.lock()[self.slot] = 0;
    }
}

/// Instance-scoped list of live closure records.
pub(crate) struct CallbackRegistry {
    records: Mutex<Vec<Box<ClosureRecord>>>,
}

impl CallbackRegistry {
    pub(crate) fn new() -> CallbackRegistry {
        CallbackRegistry {
            records: Mutex::new(Vec::new()),
        }
    }

    fn find(&self, import_idx: u16, meta: &CallbackMeta, user_data: &Value) -> Option<u64> {
        self.records
            .lock()
            .iter()
            .find(|r| {
                r.import_idx == import_idx
                    && r.param_idx == meta.param_idx
                    && r.target_func == meta.target_func
                    && r.user_data == *user_data
            })
            .map(|r| r.trampoline_addr())
    }

    /// Number of live records; teardown asserts on this.
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// Builds (or reuses) the trampoline for one `cbmeta` entry of an import.
///
/// `user_data` is the value module code passed in the user-data argument
/// slot; the universal handler substitutes exactly this value back,
/// bit-identical, whatever the host passes at invocation time.
///
/// The instance address is captured in the record, so the instance must not
/// move while any callback is live; [`crate::Instance`] is not movable once
/// callbacks exist.
pub(crate) fn create_callback(
    instance: &Instance<'_>,
    import_idx: u16,
    meta: &CallbackMeta,
    user_data: Value,
) -> Result<u64, Error> {
    let registry = instance.callbacks();
    if let Some(addr) = registry.find(import_idx, meta, &user_data) {
        return Ok(addr);
    }

    let module = instance.module();
    let target_sig = module
        .func_signature(meta.target_func as u32)
        .ok_or_else(|| {
            Error::Ffi(format!(
                "callback target {} has no signature",
                meta.target_func
            ))
        })?;

    // CIF preparation: the host-visible parameter list. The timer-shape
    // quirk coerces a declared-zero-parameter callback to one pointer
    // parameter when the configuration asks for it.
    let module_params = target_sig.params().len();
    let host_params: Vec<ValueType> =
        if module_params == 0 && instance.config().coerce_zero_param_callbacks {
            vec![ValueType::Ptr]
        } else {
            target_sig.params().to_vec()
        };

    if host_params.len() > MAX_CALLBACK_ARGS {
        return Err(Error::Ffi(format!(
            "callback arity {} exceeds the trampoline limit {}",
            host_params.len(),
            MAX_CALLBACK_ARGS
        )));
    }
    for ty in &host_params {
        if ty.is_float() || *ty == ValueType::V128 {
            return Err(Error::Ffi(format!(
                "callback parameter type {:?} is not word-class",
                ty
            )));
        }
    }
    if let Some(ret) = target_sig.return_type() {
        if ret.is_float() || ret == ValueType::V128 {
            return Err(Error::Ffi(format!(
                "callback return type {:?} is not word-class",
                ret
            )));
        }
    }

    let host_sig = Signature::new(host_params, target_sig.returns().to_vec());

    // Reserve a pool slot. The pool mutex is the process-wide list guard;
    // the sentinel keeps the slot claimed between reservation and binding.
    let slot = {
        let mut bindings = SLOT_BINDINGS.lock();
        let slot = bindings
            .iter()
            .position(|&r| r == 0)
            .ok_or_else(|| Error::Ffi("trampoline pool exhausted".into()))?;
        bindings[slot] = usize::MAX;
        slot
    };
    let trampoline = TRAMPOLINE_FNS[slot];

    if !exec_alloc::is_executable(trampoline as usize as *const u8) {
        SLOT_BINDINGS.lock()[slot] = 0;
        return Err(Error::Ffi("trampoline memory is not executable".into()));
    }

    let record = Box::new(ClosureRecord {
        trampoline,
        slot,
        instance: instance as *const Instance<'_> as *const (),
        target_func: meta.target_func,
        host_sig,
        module_params,
        user_data,
        user_data_idx: meta.user_data_idx,
        import_idx,
        param_idx: meta.param_idx,
    });
    let addr = record.trampoline_addr();
    SLOT_BINDINGS.lock()[slot] = &*record as *const ClosureRecord as usize;
    registry.records.lock().push(record);
    Ok(addr)
}

/// The universal handler every trampoline lands in.
///
/// Converts incoming native arguments to typed values, substitutes the
/// preserved user-data, spins up a fresh execution context and runs the
/// target module function. The native return slot receives the result with
/// type-correct truncation; a trap cannot cross the native boundary, so it
/// is logged and zero is returned.
fn trampoline_entry(slot: usize, raw: [usize; MAX_CALLBACK_ARGS]) -> usize {
    let record_addr = SLOT_BINDINGS.lock()[slot];
    if record_addr == 0 || record_addr == usize::MAX {
        log::error!("trampoline slot {} invoked while unbound", slot);
        return 0;
    }
    let record = unsafe { &*(record_addr as *const ClosureRecord) };
    let instance = unsafe { &*(record.instance as *const Instance<'static>) };

    let mut args = Vec::with_capacity(record.host_sig.params().len());
    for (i, ty) in record.host_sig.params().iter().enumerate() {
        let value = if record.user_data_idx == Some(i as u8) {
            record.user_data
        } else {
            native_to_value(instance, *ty, raw[i])
        };
        args.push(value);
    }
    // Arity coercion only widens what the host passes; the module function
    // still receives its declared parameters.
    args.truncate(record.module_params);

    let global_idx = record.target_func as u32 + instance.module().num_imported_funcs();
    let mut ctx = ExecutionContext::new(instance.config());
    let mut result = None;
    match instance.execute(&mut ctx, global_idx, &args, &mut result) {
        Ok(()) => result.map(value_to_native).unwrap_or(0),
        Err(err) => {
            log::error!("callback into function {} trapped: {}", global_idx, err);
            0
        }
    }
}

/// Converts one incoming native word to a typed value.
///
/// Pointer arguments that land inside linear memory are translated back to
/// module offsets; everything else is truncated to the declared width.
fn native_to_value(instance: &Instance<'_>, ty: ValueType, raw: usize) -> Value {
    match ty {
        ValueType::Ptr => match instance.memory().host_addr_to_offset(raw as u64) {
            Some(offset) => Value::Ptr(offset as u64),
            None => Value::Ptr(raw as u64),
        },
        other => Value::from_bits(other, raw as u64),
    }
}

/// Writes a result value back through the native return register.
fn value_to_native(value: Value) -> usize {
    let width = value.value_type().size() * 8;
    let bits = value.to_bits();
    if width >= 64 {
        bits as usize
    } else {
        (bits & ((1u64 << width) - 1)) as usize
    }
}
