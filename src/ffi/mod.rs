//! Host FFI: synthesising native calls from module call sites.
//!
//! For every import call the marshaller maps module value types to native
//! ABI descriptors, pins a storage location per argument (promoting
//! small-width integers, translating module-memory offsets to host
//! addresses), wires callback trampolines per `cbmeta`, applies
//! IN/OUT/INOUT pointer marshalling per `immeta`, and finally enters the
//! host function through the raw call primitive in [`abi`].

pub mod abi;
pub(crate) mod async_wrap;
pub(crate) mod callback;

use crate::instance::Instance;
use crate::module::{
    ImportKind, MarshalDirection, MarshalHandler, MarshalSize, FUNC_REF_CALLBACK_BIT,
    FUNC_REF_DATA_OFFSET_BIT,
};
use crate::types::Signature;
use crate::value::Value;
use crate::{Error, HostError, Trap, TrapCode, ValueType};
use abi::{ArgClass, NativeType, RawRet, RetKind};
use core::fmt;

/// Host-call failure surfaced as a trap: unresolved import, malformed
/// variadic blob, unsupported call shape.
#[derive(Debug)]
pub struct FfiCallError(String);

impl fmt::Display for FfiCallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl HostError for FfiCallError {}

fn ffi_trap(message: impl Into<String>) -> Trap {
    Trap::new(TrapCode::Host(Box::new(FfiCallError(message.into()))))
}

fn error_to_trap(err: Error) -> Trap {
    match err {
        Error::Trap(trap) => trap,
        other => ffi_trap(other.to_string()),
    }
}

/// A host-side temporary standing in for a marshalled pointer argument.
struct TempBuf {
    module_offset: u32,
    buf: Vec<u8>,
    writeback: bool,
}

/// Calls the imported host function `import_idx` with `args` from the
/// caller's registers.
///
/// `ext_types` is the decoded extended type blob for a variadic call site;
/// its length is the total argument count and its tail types the variadic
/// arguments.
pub(crate) fn call_import(
    instance: &Instance<'_>,
    import_idx: u16,
    args: &mut Vec<Value>,
    ext_types: Option<&[ValueType]>,
) -> Result<Option<Value>, Trap> {
    let module = instance.module();
    let import = module
        .imports()
        .get(import_idx as usize)
        .ok_or_else(|| Trap::new(TrapCode::InvalidFuncIndex(import_idx as u32)))?;
    let ImportKind::Func { sig_idx, .. } = &import.kind else {
        return Err(Trap::new(TrapCode::TypeMismatch));
    };
    let sig = &module.signatures()[*sig_idx as usize];
    let ptr = instance
        .resolved_func_ptr(import_idx)
        .ok_or_else(|| ffi_trap(format!("unresolved import {}.{}", import.module, import.name)))?;

    let nfixed = sig.params().len();
    if let Some(ext) = ext_types {
        if ext.len() != args.len() || ext.len() < nfixed {
            return Err(ffi_trap(format!(
                "variadic type blob describes {} arguments for a call with {} ({} fixed)",
                ext.len(),
                args.len(),
                nfixed
            )));
        }
    } else if args.len() != nfixed {
        return Err(ffi_trap(format!(
            "import {}.{} takes {} arguments, called with {}",
            import.module,
            import.name,
            nfixed,
            args.len()
        )));
    }

    // Auto-wire callbacks: each cbmeta entry replaces the argument at its
    // callback slot with a trampoline address and preserves the user-data
    // argument verbatim.
    if let Some(cbs) = module.callbacks_of_import(import_idx) {
        for entry in &cbs.entries {
            if (entry.param_idx as usize) >= args.len() {
                log::warn!(
                    "cbmeta for import {} names argument {} of a {}-argument call; skipped",
                    import_idx,
                    entry.param_idx,
                    args.len()
                );
                continue;
            }
            let user_data = entry
                .user_data_idx
                .and_then(|i| args.get(i as usize))
                .copied()
                .unwrap_or(Value::Ptr(0));
            let addr = callback::create_callback(instance, import_idx, entry, user_data)
                .map_err(error_to_trap)?;
            args[entry.param_idx as usize] = Value::U64(addr);
        }
    }

    // Pointer marshalling. Standard-handler arguments copy through per-call
    // temporaries; async-handler OUT arguments go through a wrapper owned
    // by the instance so the scratch outlives the call.
    let mut temps: Vec<TempBuf> = Vec::new();
    let mut wrapper = None;
    if let Some(marshalling) = module.marshalling_of_import(import_idx) {
        if marshalling
            .args
            .iter()
            .any(|a| a.handler == MarshalHandler::Async)
        {
            wrapper = Some(
                instance
                    .async_wrappers()
                    .adopt(Box::new(async_wrap::AsyncWrapper::new(ptr as usize))),
            );
        }
        for rule in &marshalling.args {
            let index = rule.arg_index as usize;
            if index >= args.len() {
                log::warn!(
                    "immeta for import {} names argument {} of a {}-argument call; skipped",
                    import_idx,
                    rule.arg_index,
                    args.len()
                );
                continue;
            }
            let module_offset = untag_offset(args[index].to_bits());
            let size = match rule.size {
                MarshalSize::Const(s) => s as u32,
                MarshalSize::FromArg(i) => args
                    .get(i as usize)
                    .map(|v| v.to_bits() as u32)
                    .ok_or_else(|| ffi_trap("size-from-arg index out of range"))?,
            };
            let initial = match rule.direction {
                MarshalDirection::In | MarshalDirection::InOut => instance
                    .memory()
                    .get(module_offset, size as usize)
                    .map_err(Trap::new)?,
                MarshalDirection::Out => Vec::new(),
            };
            let host_addr = match (rule.handler, rule.direction) {
                (MarshalHandler::Async, MarshalDirection::Out | MarshalDirection::InOut) => {
                    wrapper
                        .as_ref()
                        .expect("wrapper exists when an async rule does")
                        .add_out(module_offset, size, &initial)
                }
                _ => {
                    let mut buf = vec![0u8; size as usize];
                    buf[..initial.len()].copy_from_slice(&initial);
                    temps.push(TempBuf {
                        module_offset,
                        buf,
                        writeback: rule.direction != MarshalDirection::In,
                    });
                    temps.last().expect("just pushed").buf.as_ptr() as u64
                }
            };
            args[index] = Value::U64(host_addr);
        }
    }

    // Classify and pack.
    let mut classes = Vec::with_capacity(args.len());
    for (i, value) in args.iter().enumerate() {
        let ty = if i < nfixed {
            sig.params()[i]
        } else {
            ext_types.expect("checked above")[i]
        };
        classes.push(classify_arg(instance, *value, ty, i >= nfixed).map_err(error_to_trap)?);
    }
    let ret = RetKind::of(sig.return_type()).map_err(error_to_trap)?;

    // An async-marshalled import is entered through its wrapper, which owns
    // the captured host function pointer and the OUT scratch.
    let raw = unsafe {
        if let Some(wrapper) = wrapper {
            wrapper.invoke(&classes, ret, ext_types.is_some())
        } else if ext_types.is_some() {
            abi::raw_call_variadic(ptr, &classes, ret)
        } else {
            abi::raw_call(ptr, &classes, ret)
        }
    }
    .map_err(error_to_trap)?;

    // OUT copies: per-call temporaries now, wrapper scratch on completion.
    for temp in &temps {
        if temp.writeback {
            instance
                .memory()
                .set(temp.module_offset, &temp.buf)
                .map_err(Trap::new)?;
        }
    }
    if let Some(wrapper) = wrapper {
        wrapper.complete(instance).map_err(Trap::new)?;
    }

    Ok(unpack_return(instance, raw, sig.return_type()))
}

/// Calls a bare native function pointer with the expected module signature;
/// the path indirect calls take for targets that are neither local
/// functions nor function-pointer-map entries.
pub(crate) fn call_native_ptr(
    instance: &Instance<'_>,
    ptr: u64,
    sig: &Signature,
    args: &mut Vec<Value>,
) -> Result<Option<Value>, Trap> {
    if args.len() != sig.params().len() {
        return Err(Trap::new(TrapCode::TypeMismatch));
    }
    let mut classes = Vec::with_capacity(args.len());
    for (i, value) in args.iter().enumerate() {
        classes.push(classify_arg(instance, *value, sig.params()[i], false).map_err(error_to_trap)?);
    }
    let ret = RetKind::of(sig.return_type()).map_err(error_to_trap)?;
    let raw = unsafe { abi::raw_call(ptr as *const (), &classes, ret) }.map_err(error_to_trap)?;
    Ok(unpack_return(instance, raw, sig.return_type()))
}

/// Strips the function-reference tag bits from a marshalled offset.
fn untag_offset(bits: u64) -> u32 {
    let bits = bits as u32;
    bits & !(FUNC_REF_CALLBACK_BIT | FUNC_REF_DATA_OFFSET_BIT)
}

/// Pins one argument's storage classification.
///
/// Small-width integers are promoted into a full word with their own
/// signedness; pointer-typed values that look like in-memory offsets become
/// host addresses; variadic floats are promoted to double.
fn classify_arg(
    instance: &Instance<'_>,
    value: Value,
    declared: ValueType,
    variadic_tail: bool,
) -> Result<ArgClass, Error> {
    // Pre-translated host addresses (trampolines, marshalling temps) are
    // carried as U64 and bypass both conversion and translation.
    if let Value::U64(addr) = value {
        if declared == ValueType::Ptr {
            return Ok(ArgClass::Word(addr));
        }
    }

    let value = value
        .convert(declared)
        .map_err(|_| Error::Ffi(format!("argument cannot convert to {:?}", declared)))?;

    Ok(match NativeType::of(declared)? {
        NativeType::SInt8 => ArgClass::Word(value.to_bits() as i8 as i64 as u64),
        NativeType::SInt16 => ArgClass::Word(value.to_bits() as i16 as i64 as u64),
        NativeType::SInt32 => ArgClass::Word(value.to_bits() as i32 as i64 as u64),
        NativeType::UInt8 | NativeType::UInt16 | NativeType::UInt32 => {
            ArgClass::Word(value.to_bits())
        }
        NativeType::SInt64 | NativeType::UInt64 => ArgClass::Word(value.to_bits()),
        NativeType::Float => {
            let f = f32::from_bits(value.to_bits() as u32);
            if variadic_tail {
                // The ABI demands float-to-double promotion in a variadic
                // tail.
                ArgClass::Double(f as f64)
            } else {
                ArgClass::Float(f)
            }
        }
        NativeType::Double => ArgClass::Double(f64::from_bits(value.to_bits())),
        NativeType::Pointer => ArgClass::Word(translate_pointer(instance, value.to_bits())),
        NativeType::Void => {
            return Err(Error::Ffi("void argument".into()));
        }
    })
}

/// Translates a pointer-typed argument to a host address.
///
/// Values inside the current memory size are offsets and become
/// `memory_base + offset`; values carrying the callback or data-offset tag
/// bit are untagged first, with the same precedence as indirect-call
/// classification; anything else is passed through as an already-host
/// address.
fn translate_pointer(instance: &Instance<'_>, bits: u64) -> u64 {
    let memory = instance.memory();
    let untagged = if bits <= u32::MAX as u64 {
        let bits32 = bits as u32;
        if bits32 & FUNC_REF_CALLBACK_BIT != 0 {
            (bits32 & !FUNC_REF_CALLBACK_BIT) as u64
        } else if bits32 & FUNC_REF_DATA_OFFSET_BIT != 0 {
            (bits32 & !FUNC_REF_DATA_OFFSET_BIT) as u64
        } else {
            bits
        }
    } else {
        bits
    };
    if untagged < memory.size_bytes() as u64 {
        memory.base_ptr() as u64 + untagged
    } else {
        bits
    }
}

/// Converts the raw native return into a module value.
fn unpack_return(
    instance: &Instance<'_>,
    raw: RawRet,
    return_type: Option<ValueType>,
) -> Option<Value> {
    let ty = return_type?;
    Some(match raw {
        RawRet::Void => return None,
        RawRet::Float(f) => Value::from_bits(ValueType::F32, f.to_bits() as u64),
        RawRet::Double(d) => Value::from_bits(ValueType::F64, d.to_bits()),
        RawRet::Word(w) => {
            if ty == ValueType::Ptr {
                // Host functions return host addresses; fold addresses
                // inside linear memory back into module offsets.
                match instance.memory().host_addr_to_offset(w) {
                    Some(offset) => Value::Ptr(offset as u64),
                    None => Value::Ptr(w),
                }
            } else {
                Value::from_bits(ty, w)
            }
        }
    })
}
