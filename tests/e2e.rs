//! End-to-end scenarios: real images through parse, instantiate and
//! execute, with host functions on the other side of the FFI boundary.

mod common;

use assert_matches::assert_matches;
use common::{Asm, ImageBuilder, REG_NONE};
use espb::isa::Opcode;
use espb::{
    Config, Error, ExecutionContext, HostSymbol, Instance, Module, SymbolRegistry, SymbolTable,
    TrapCode, Value, ValueType,
};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use espb::ValueType::{I32, Ptr, U32};

fn instantiate<'m>(
    module: &'m Module<'m>,
    registry: &SymbolRegistry,
) -> Instance<'m> {
    Instance::instantiate(module, registry, Config::default()).expect("instantiation failed")
}

fn call_i32(instance: &Instance<'_>, name: &str, args: &[Value]) -> i32 {
    let mut results = [Value::default_of(I32)];
    instance
        .invoke_export(name, args, &mut results)
        .unwrap_or_else(|e| panic!("{} failed: {}", name, e));
    match results[0] {
        Value::I32(v) => v,
        other => panic!("{} returned {:?}", name, other),
    }
}

#[test]
fn add_two_numbers() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[I32, I32], &[I32]);
    let code = Asm::new().binop(Opcode::Add, 2, 0, 1).ret(2).finish();
    let add = b.func(sig, 3, false, code);
    b.memory(1, Some(4)).export_func("add", add);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(
        call_i32(&instance, "add", &[Value::I32(10), Value::I32(32)]),
        42
    );
}

#[test]
fn strlen_of_first_passive_segment() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let code = Asm::new()
        .ldc_i32(1, 0) // address cursor
        .ldc_i32(0, 0) // length
        .ldc_i32(3, 1)
        .label("loop")
        .load(2, 1, ValueType::U8, 0)
        .br_ifz(2, "done")
        .binop(Opcode::Add, 0, 0, 3)
        .binop(Opcode::Add, 1, 1, 3)
        .br("loop")
        .label("done")
        .ret(0)
        .finish();
    let strlen = b.func(sig, 4, false, code);
    b.memory(1, None)
        .passive_data(b"hello\0")
        .export_func("strlen_of_literal", strlen);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    // The first passive segment lands at offset 0 by convention.
    assert_eq!(instance.first_passive_size(), 6);
    assert_eq!(call_i32(&instance, "strlen_of_literal", &[]), 5);
}

static TIMER_CB: AtomicU64 = AtomicU64::new(0);
static TIMER_USER: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn host_set_timer(_period: u64, cb: u64, user: u64) -> u64 {
    TIMER_CB.store(cb, Ordering::SeqCst);
    TIMER_USER.store(user, Ordering::SeqCst);
    0
}

#[test]
fn timer_callback_preserves_user_data() {
    let mut b = ImageBuilder::new();
    let timer_sig = b.signature(&[U32, Ptr, Ptr], &[]);
    let cb_sig = b.signature(&[Ptr], &[]);
    let void_sig = b.signature(&[], &[]);
    let count_sig = b.signature(&[], &[I32]);
    let set_timer = b.import_func("env", "set_timer", timer_sig, 0);
    let counter = b.global_zero(I32);

    // The callback bumps the counter only when it sees the exact user-data
    // value it handed out.
    let cb_code = Asm::new()
        .ldc_ptr(1, 0xDEAD_BEEF)
        .binop(Opcode::Eq, 2, 0, 1)
        .br_ifz(2, "skip")
        .global_get(3, counter as u16)
        .ldc_i32(4, 1)
        .binop(Opcode::Add, 3, 3, 4)
        .global_set(counter as u16, 3)
        .label("skip")
        .ret_void()
        .finish();
    let cb = b.func(cb_sig, 5, false, cb_code);
    let cb_local = (cb - 1) as u32; // one import precedes the locals

    let run_code = Asm::new()
        .ldc_i32(1, 2000)
        .ldc_func(2, cb_local)
        .ldc_ptr(3, 0xDEAD_BEEF)
        .call_import(REG_NONE, set_timer, &[1, 2, 3])
        .ret_void()
        .finish();
    let run = b.func(void_sig, 4, false, run_code);

    let count_code = Asm::new().global_get(0, counter as u16).ret(0).finish();
    let get_count = b.func(count_sig, 1, false, count_code);

    b.memory(1, None)
        .export_func("run", run)
        .export_func("get_count", get_count)
        .cbmeta(set_timer, &[(1, 2, cb_local as u16)]);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env")
            .define("set_timer", HostSymbol::Func(host_set_timer as *const ())),
    );
    let instance = instantiate(&module, &registry);

    let mut results: [Value; 0] = [];
    instance.invoke_export("run", &[], &mut results).unwrap();

    let cb_addr = TIMER_CB.load(Ordering::SeqCst);
    let user = TIMER_USER.load(Ordering::SeqCst);
    assert_ne!(cb_addr, 0, "callback argument was not auto-wired");
    assert_eq!(user, 0xDEAD_BEEF, "user-data argument must pass through verbatim");

    // The host fires the timer twice.
    let trampoline: unsafe extern "C" fn(usize, usize, usize, usize) -> usize =
        unsafe { std::mem::transmute(cb_addr as usize) };
    unsafe {
        trampoline(user as usize, 0, 0, 0);
        trampoline(user as usize, 0, 0, 0);
    }

    assert_eq!(call_i32(&instance, "get_count", &[]), 2);
}

static PRINTF_OUT: Mutex<String> = Mutex::new(String::new());

unsafe extern "C" fn host_printf(fmt: u64, a1: u64, a2: u64) -> u64 {
    let fmt = CStr::from_ptr(fmt as *const c_char).to_str().unwrap();
    let arg = CStr::from_ptr(a2 as *const c_char).to_str().unwrap();
    let formatted = fmt
        .replacen("%d", &(a1 as i32).to_string(), 1)
        .replacen("%s", arg, 1);
    let len = formatted.len();
    *PRINTF_OUT.lock().unwrap() = formatted;
    len as u64
}

#[test]
fn printf_variadic_type_blob() {
    let mut b = ImageBuilder::new();
    let printf_sig = b.signature(&[Ptr], &[I32]);
    let main_sig = b.signature(&[], &[I32]);
    let printf = b.import_func("env", "printf", printf_sig, 0);

    let code = Asm::new()
        .ldc_ptr(1, 0x100)
        .ldc_i32(2, 7)
        .ldc_ptr(3, 0x110)
        .call_import(0, printf, &[1, 2, 3])
        .ext_types(&[Ptr, I32, Ptr])
        .ret(0)
        .finish();
    let main = b.func(main_sig, 4, false, code);

    b.memory(1, None)
        .active_data(0x100, b"%d %s\n\0")
        .active_data(0x110, b"x\0")
        .export_func("main", main);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env")
            .define("printf", HostSymbol::Func(host_printf as *const ())),
    );
    let instance = instantiate(&module, &registry);

    let written = call_i32(&instance, "main", &[]);
    assert_eq!(*PRINTF_OUT.lock().unwrap(), "7 x\n");
    assert_eq!(written, 4);
}

#[test]
fn indirect_call_through_function_pointer_map() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);

    let f_code = Asm::new().ldc_i32(0, 42).ret(0).finish();
    let f = b.func(sig, 1, false, f_code);

    // The data image stores f's address at 0x10; the caller dereferences
    // nothing, it calls through the location's offset.
    let caller_code = Asm::new()
        .ldc_ptr(1, 0x10)
        .call_indirect_ptr(0, sig, 1, &[])
        .ret(0)
        .finish();
    let caller = b.func(sig, 2, false, caller_code);

    // Same call with the data-offset tag bit set.
    let tagged_code = Asm::new()
        .ldc_ptr(1, 0x4000_0010)
        .call_indirect_ptr(0, sig, 1, &[])
        .ret(0)
        .finish();
    let tagged = b.func(sig, 2, false, tagged_code);

    b.memory(1, None)
        .active_data(0x10, &[0u8; 4])
        .fpmap_entry(0x10, f as u16)
        .export_func("call_via_map", caller)
        .export_func("call_via_tagged_ptr", tagged);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "call_via_map", &[]), 42);
    assert_eq!(call_i32(&instance, "call_via_tagged_ptr", &[]), 42);
}

#[test]
fn indirect_call_through_table() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[I32], &[I32]);

    let double_code = Asm::new().binop(Opcode::Add, 1, 0, 0).ret(1).finish();
    let double = b.func(sig, 2, false, double_code);

    let caller_code = Asm::new()
        .ldc_i32(2, 0) // table slot
        .call_indirect(1, sig, 2, &[0])
        .ret(1)
        .finish();
    let caller = b.func(sig, 3, false, caller_code);

    b.memory(1, None)
        .table(2, Some(2))
        .element(0, &[double])
        .export_func("call_slot0", caller);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "call_slot0", &[Value::I32(21)]), 42);
}

#[test]
fn jit_fallback_on_uncompilable_body() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);

    // HOT, but uses ALLOCA, which the baseline generator refuses.
    let code = Asm::new()
        .ldc_i32(1, 16)
        .alloca(2, 1)
        .ldc_i32(3, 7)
        .store(2, 3, I32, 0)
        .load(4, 2, I32, 0)
        .ret(4)
        .finish();
    let hot_alloca = b.func(sig, 5, true, code);
    b.memory(1, None).export_func("hot_alloca", hot_alloca);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    // Default path: compile fails, interpreter fallback, correct result.
    assert_eq!(call_i32(&instance, "hot_alloca", &[]), 7);
    assert_eq!(instance.jit_cache().len(), 0);

    // JIT-only path: the compile failure surfaces.
    let mut ctx = ExecutionContext::new(&Config::default());
    let mut result = None;
    let err = instance
        .execute_jit_only(&mut ctx, hot_alloca, &[], &mut result)
        .unwrap_err();
    assert_matches!(err, Error::Jit(_));
}

#[test]
fn hot_function_compiles_and_matches_the_interpreter() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[I32, I32], &[I32]);

    // (a * b) - (a + b), one HOT copy and one cold copy.
    fn body() -> Vec<u8> {
        Asm::new()
            .binop(Opcode::Mul, 2, 0, 1)
            .binop(Opcode::Add, 3, 0, 1)
            .binop(Opcode::Sub, 2, 2, 3)
            .ret(2)
            .finish()
    }
    let hot = b.func(sig, 4, true, body());
    let cold = b.func(sig, 4, false, body());
    b.memory(1, None)
        .export_func("hot", hot)
        .export_func("cold", cold);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    for (a, b_arg) in [(3, 4), (0, 0), (-5, 9), (i32::MAX, 2)] {
        let args = [Value::I32(a), Value::I32(b_arg)];
        assert_eq!(
            call_i32(&instance, "hot", &args),
            call_i32(&instance, "cold", &args),
        );
    }
    // The HOT body went through the code generator.
    assert_eq!(instance.jit_cache().len(), 1);
    assert!(instance.jit_cache().total_code_size() > 0);
}

unsafe extern "C" fn host_peek(p: u64) -> u64 {
    *(p as *const u8) as u64
}

#[test]
fn tagged_pointer_arguments_translate_across_the_ffi() {
    let mut b = ImageBuilder::new();
    let peek_sig = b.signature(&[Ptr], &[I32]);
    let main_sig = b.signature(&[], &[I32]);
    let peek = b.import_func("env", "peek", peek_sig, 0);

    // The pointer argument carries the data-offset tag; the marshaller
    // must untag it and hand the host a real address into linear memory.
    let code = Asm::new()
        .ldc_ptr(1, 0x4000_0020)
        .call_import(0, peek, &[1])
        .ret(0)
        .finish();
    let main = b.func(main_sig, 2, false, code);

    b.memory(1, None)
        .active_data(0x20, b"hi\0")
        .export_func("main", main);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env").define("peek", HostSymbol::Func(host_peek as *const ())),
    );
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "main", &[]), b'h' as i32);
}

static FILL_CALLS: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn host_fill(buf: u64, len: u64) -> u64 {
    FILL_CALLS.fetch_add(1, Ordering::SeqCst);
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, len as usize);
    for (i, byte) in slice.iter_mut().enumerate() {
        *byte = (i + 1) as u8;
    }
    0
}

#[test]
fn out_marshalling_copies_back_into_module_memory() {
    let mut b = ImageBuilder::new();
    let fill_sig = b.signature(&[Ptr, U32], &[]);
    let main_sig = b.signature(&[], &[I32]);
    let fill = b.import_func("env", "fill", fill_sig, 0);

    let code = Asm::new()
        .ldc_ptr(1, 0x200)
        .ldc_i32(2, 4)
        .call_import(REG_NONE, fill, &[1, 2])
        .load(0, 1, I32, 0)
        .ret(0)
        .finish();
    let main = b.func(main_sig, 3, false, code);

    b.memory(1, None)
        .export_func("main", main)
        // Argument 0 is an OUT pointer whose size comes from argument 1.
        .immeta(fill, &[[0, 2, 1, 1, 0]]);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env").define("fill", HostSymbol::Func(host_fill as *const ())),
    );
    let instance = instantiate(&module, &registry);

    // The host wrote 01 02 03 04 into scratch; after copy-back the module
    // reads it at 0x200.
    assert_eq!(call_i32(&instance, "main", &[]), 0x0403_0201);
}

#[test]
fn out_marshalling_untags_data_offset_pointers() {
    let mut b = ImageBuilder::new();
    let fill_sig = b.signature(&[Ptr, U32], &[]);
    let main_sig = b.signature(&[], &[I32]);
    let fill = b.import_func("env", "fill", fill_sig, 0);

    // The OUT pointer carries the data-offset tag; the copy-back must land
    // at the untagged module offset.
    let code = Asm::new()
        .ldc_ptr(1, 0x4000_0240)
        .ldc_i32(2, 4)
        .call_import(REG_NONE, fill, &[1, 2])
        .ldc_i32(3, 0x240)
        .load(0, 3, I32, 0)
        .ret(0)
        .finish();
    let main = b.func(main_sig, 4, false, code);

    b.memory(1, None)
        .export_func("main", main)
        .immeta(fill, &[[0, 2, 1, 1, 0]]);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env").define("fill", HostSymbol::Func(host_fill as *const ())),
    );
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "main", &[]), 0x0403_0201);
}

static ASYNC_FILL_CALLS: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn host_async_fill(buf: u64, len: u64) -> u64 {
    ASYNC_FILL_CALLS.fetch_add(1, Ordering::SeqCst);
    let slice = std::slice::from_raw_parts_mut(buf as *mut u8, len as usize);
    slice.fill(0x5A);
    0
}

#[test]
fn async_out_marshalling_completes_and_is_owned_by_the_instance() {
    let mut b = ImageBuilder::new();
    let fill_sig = b.signature(&[Ptr, U32], &[]);
    let main_sig = b.signature(&[], &[I32]);
    let fill = b.import_func("env", "fill_async", fill_sig, 0);

    let code = Asm::new()
        .ldc_ptr(1, 0x300)
        .ldc_i32(2, 4)
        .call_import(REG_NONE, fill, &[1, 2])
        .load(0, 1, I32, 0)
        .ret(0)
        .finish();
    let main = b.func(main_sig, 3, false, code);

    b.memory(1, None)
        .export_func("main", main)
        // Async handler for the OUT pointer.
        .immeta(fill, &[[0, 2, 1, 1, 1]]);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env")
            .define("fill_async", HostSymbol::Func(host_async_fill as *const ())),
    );
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "main", &[]), 0x5A5A_5A5Au32 as i32);
    assert_eq!(ASYNC_FILL_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_size_data_segment_is_a_no_op() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let code = Asm::new().ldc_i32(0, 1).ret(0).finish();
    let f = b.func(sig, 1, false, code);
    b.memory(1, None)
        .active_data(0x20, &[])
        .export_func("f", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);
    assert_eq!(call_i32(&instance, "f", &[]), 1);
}

#[test]
fn zero_size_body_traps() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let f = b.func(sig, 1, false, Vec::new());
    b.memory(1, None).export_func("f", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    let mut results = [Value::default_of(I32)];
    let err = instance.invoke_export("f", &[], &mut results).unwrap_err();
    assert_matches!(err, Error::Trap(_));
}

#[test]
fn division_by_zero_traps() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[I32, I32], &[I32]);
    let code = Asm::new().binop(Opcode::Div, 2, 0, 1).ret(2).finish();
    let divide = b.func(sig, 3, false, code);
    b.memory(1, None).export_func("divide", divide);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(
        call_i32(&instance, "divide", &[Value::I32(10), Value::I32(2)]),
        5
    );
    let mut results = [Value::default_of(I32)];
    let err = instance
        .invoke_export("divide", &[Value::I32(1), Value::I32(0)], &mut results)
        .unwrap_err();
    assert_matches!(
        err,
        Error::Trap(trap) if matches!(trap.code(), TrapCode::DivisionByZero)
    );
}

unsafe extern "C" fn host_nop() -> u64 {
    0
}

#[test]
fn jit_only_path_rejects_imported_functions() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[]);
    let import = b.import_func("env", "nop", sig, 0);
    let code = Asm::new().ret_void().finish();
    let f = b.func(sig, 1, false, code);
    b.memory(1, None).export_func("f", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_table(
        0,
        SymbolTable::for_module("env").define("nop", HostSymbol::Func(host_nop as *const ())),
    );
    let instance = instantiate(&module, &registry);

    let mut ctx = ExecutionContext::new(&Config::default());
    let mut result = None;
    let err = instance
        .execute_jit_only(&mut ctx, import as u32, &[], &mut result)
        .unwrap_err();
    assert_matches!(
        err,
        Error::Trap(trap) if matches!(trap.code(), TrapCode::InvalidFuncIndex(_))
    );
}

#[test]
fn memory_relocations_patch_the_data_image() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let code = Asm::new()
        .ldc_i32(1, 0x40)
        .load(0, 1, I32, 0)
        .ret(0)
        .finish();
    let f = b.func(sig, 2, false, code);
    b.memory(1, None)
        // Data symbol 0 is the memory base (zero); the addend is the word.
        .relocations(7, &[(0, 0x40, 0, 0x123)])
        .export_func("read_reloc", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "read_reloc", &[]), 0x123);
}

#[test]
fn code_relocations_are_skipped_not_fatal() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let code = Asm::new().ldc_i32(0, 9).ret(0).finish();
    let f = b.func(sig, 1, false, code);
    b.memory(1, None)
        .relocations(6, &[(0, 0, 0, 0)])
        .export_func("f", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);
    assert_eq!(call_i32(&instance, "f", &[]), 9);
}

#[test]
fn fast_indexed_import_resolution() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[]);
    let main_sig = b.signature(&[], &[I32]);
    // INDEXED | FAST_IDF, symbol 5.
    let nop = b.import_func("env", "ignored", sig, 0x10 | 0x40 | 0x05);
    let code = Asm::new()
        .call_import(REG_NONE, nop, &[])
        .ldc_i32(0, 1)
        .ret(0)
        .finish();
    let main = b.func(main_sig, 1, false, code);
    b.memory(1, None).export_func("main", main);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    registry.register_fast_idf(5, host_nop as *const ());
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "main", &[]), 1);
}

#[test]
fn heap_allocations_stay_above_static_data() {
    let mut b = ImageBuilder::new();
    let sig = b.signature(&[], &[I32]);
    let code = Asm::new()
        .ldc_i32(1, 64)
        .alloca(2, 1)
        .conv(0, 2, I32)
        .ret(0)
        .finish();
    let f = b.func(sig, 3, false, code);
    b.memory(1, None)
        .active_data(0, &[0xEE; 0x80])
        .export_func("grab", f);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(instance.static_data_end(), 0x80);
    let offset = call_i32(&instance, "grab", &[]) as u32;
    assert!(offset >= 0x80);
    assert!((offset as usize) < instance.memory().size_bytes());
    assert_eq!(offset % 8, 0);
}

#[test]
fn start_function_runs_at_instantiation() {
    let mut b = ImageBuilder::new();
    let void_sig = b.signature(&[], &[]);
    let get_sig = b.signature(&[], &[I32]);
    let flag = b.global_zero(I32);

    let start_code = Asm::new()
        .ldc_i32(0, 77)
        .global_set(flag as u16, 0)
        .ret_void()
        .finish();
    let start = b.func(void_sig, 1, false, start_code);

    let get_code = Asm::new().global_get(0, flag as u16).ret(0).finish();
    let get = b.func(get_sig, 1, false, get_code);

    b.memory(1, None).export_func("get", get).start(start);

    let image = b.build();
    let module = Module::parse(&image).unwrap();
    let registry = SymbolRegistry::new();
    let instance = instantiate(&module, &registry);

    assert_eq!(call_i32(&instance, "get", &[]), 77);
}
