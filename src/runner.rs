//! The execution engine: shadow stack, runtime frames and the interpreter.
//!
//! # Shadow stack
//!
//! All frames live in one contiguous, growable buffer of [`Value`] slots,
//! distinct from the host call stack. A frame is a *register window* of
//! `num_regs` slots; `fp` is the base of the current window and `sp` is one
//! past its end. A parallel call stack of [`RuntimeFrame`] records remembers
//! how to restore the caller.
//!
//! Roughly, the stack layout looks like this
//!
//! | caller window    |
//! |  - R0            |
//! |  - R1            |
//! +------------------+  <-- fp
//! | callee window    |
//! |  - R0            |
//! |  - R1            |
//! +------------------+  <-- sp
//!
//! # Single-frame contract
//!
//! A return pops exactly the frame it entered with: the caller's `fp` and
//! `sp` are restored from the `RuntimeFrame`, every frame-tracked ALLOCA
//! pointer is released, and a window snapshot (taken for indirect calls, so
//! native code cannot observe or corrupt the caller) is copied back
//! verbatim.
//!
//! The interpreter itself is iterative: module-level calls push and pop
//! frames inside one Rust-level loop. Host re-entry through callbacks and
//! compiled code is the only place recursion happens.

use crate::ffi;
use crate::instance::Instance;
use crate::isa::{InstructionReader, Opcode, EXT_TYPE_SENTINEL};
use crate::module::FuncBody;
use crate::value::Value;
use crate::{Config, Trap, TrapCode, ValueType};

/// Maximum number of ALLOCA allocations tracked per frame.
pub const MAX_FRAME_ALLOCAS: usize = 16;

/// Register operand meaning "discard the result".
pub(crate) const REG_NONE: u8 = 0xFF;

/// Bookkeeping for one active call.
#[derive(Debug)]
pub(crate) struct RuntimeFrame {
    /// Where the caller resumes.
    return_pc: usize,
    /// Caller's frame pointer.
    caller_fp: usize,
    /// Caller's local function index; `u32::MAX` marks an entry frame whose
    /// return leaves the interpreter.
    caller_func: u32,
    /// Caller register receiving the callee's result.
    ret_reg: u8,
    /// Snapshot of the caller's window, taken for indirect calls so the
    /// callee cannot see it and the caller is restored verbatim.
    saved_window: Option<Box<[Value]>>,
    /// Heap offsets to release when the frame exits.
    allocas: [u32; MAX_FRAME_ALLOCAS],
    alloca_count: u8,
}

/// Per-call-chain VM state: the shadow stack and its frames.
///
/// Contexts are cheap to create; host threads may each own one, but a
/// context itself is never shared.
#[derive(Debug)]
pub struct ExecutionContext {
    stack: Vec<Value>,
    sp: usize,
    fp: usize,
    frames: Vec<RuntimeFrame>,
    increment: usize,
    max_values: usize,
    max_depth: usize,
}

impl ExecutionContext {
    /// Creates a context sized by the configuration.
    pub fn new(config: &Config) -> ExecutionContext {
        ExecutionContext {
            stack: Vec::with_capacity(config.initial_stack_values),
            sp: 0,
            fp: 0,
            frames: Vec::new(),
            increment: config.stack_increment_values.max(1),
            max_values: config.max_stack_values,
            max_depth: config.max_call_depth,
        }
    }

    /// Current call depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Size of the current register window.
    fn window_len(&self) -> usize {
        self.sp - self.fp
    }

    /// Reads a register of the current window.
    #[inline]
    pub(crate) fn reg(&self, idx: u8) -> Result<Value, TrapCode> {
        if (idx as usize) >= self.window_len() {
            return Err(TrapCode::InvalidRegisterIndex(idx));
        }
        Ok(self.stack[self.fp + idx as usize])
    }

    /// Writes a register of the current window.
    #[inline]
    pub(crate) fn set_reg(&mut self, idx: u8, value: Value) -> Result<(), TrapCode> {
        if (idx as usize) >= self.window_len() {
            return Err(TrapCode::InvalidRegisterIndex(idx));
        }
        self.stack[self.fp + idx as usize] = value;
        Ok(())
    }

    /// Pushes a fresh window of `num_regs` registers and the frame record
    /// remembering the caller.
    pub(crate) fn push_frame(
        &mut self,
        num_regs: u16,
        return_pc: usize,
        caller_func: u32,
        ret_reg: u8,
        snapshot_caller: bool,
    ) -> Result<(), TrapCode> {
        if self.frames.len() >= self.max_depth {
            return Err(TrapCode::StackOverflow);
        }
        let new_sp = self.sp + num_regs as usize;
        if new_sp > self.max_values {
            return Err(TrapCode::StackOverflow);
        }
        if new_sp > self.stack.len() {
            let grown = (self.stack.len() + self.increment).max(new_sp);
            self.stack.resize(grown.min(self.max_values), Value::I32(0));
        }
        let saved_window = snapshot_caller
            .then(|| self.stack[self.fp..self.sp].to_vec().into_boxed_slice());
        self.frames.push(RuntimeFrame {
            return_pc,
            caller_fp: self.fp,
            caller_func,
            ret_reg,
            saved_window,
            allocas: [0; MAX_FRAME_ALLOCAS],
            alloca_count: 0,
        });
        self.fp = self.sp;
        self.sp = new_sp;
        for slot in &mut self.stack[self.fp..self.sp] {
            *slot = Value::I32(0);
        }
        Ok(())
    }

    /// Pops the current frame, releasing its ALLOCA pointers and restoring
    /// the caller's window.
    pub(crate) fn pop_frame(&mut self, instance: &Instance<'_>) -> Option<RuntimeFrame> {
        let frame = self.frames.pop()?;
        for &offset in &frame.allocas[..frame.alloca_count as usize] {
            if let Err(err) = instance.heap().free(offset) {
                log::warn!("leak: frame-tracked alloca at {:#x}: {}", offset, err);
            }
        }
        self.sp = self.fp;
        self.fp = frame.caller_fp;
        if let Some(saved) = &frame.saved_window {
            self.stack[self.fp..self.sp].copy_from_slice(saved);
        }
        Some(frame)
    }

    /// Records an ALLOCA pointer for cleanup when the frame exits.
    pub(crate) fn track_alloca(&mut self, offset: u32) -> Result<(), TrapCode> {
        let frame = self.frames.last_mut().ok_or(TrapCode::StackUnderflow)?;
        let count = frame.alloca_count as usize;
        if count >= MAX_FRAME_ALLOCAS {
            return Err(TrapCode::InvalidOperand);
        }
        frame.allocas[count] = offset;
        frame.alloca_count += 1;
        Ok(())
    }

    /// Unwinds every frame down to `depth`, releasing all frame-tracked
    /// allocations. Called when a trap propagates out of a run.
    pub(crate) fn unwind_to(&mut self, instance: &Instance<'_>, depth: usize) {
        while self.frames.len() > depth {
            self.pop_frame(instance);
        }
    }
}

/// Classification result for an indirect-call target value.
pub(crate) enum IndirectTarget {
    /// A local function, called directly.
    Local(u32),
    /// A native entry point, dispatched through the FFI marshaller.
    Native(u64),
}

/// Classifies the target of `CALL_INDIRECT_PTR` and selects a call path.
///
/// In order: small values are local function indices; values inside the
/// host-address range of linear memory and tagged data-offset pointers are
/// reduced to a static-data offset and searched in the function-pointer
/// map; anything else is treated as a native entry point.
pub(crate) fn classify_indirect_target(
    instance: &Instance<'_>,
    raw: u64,
) -> Result<IndirectTarget, TrapCode> {
    let module = instance.module();
    if raw < module.num_local_funcs() as u64 {
        return Ok(IndirectTarget::Local(raw as u32));
    }

    let offset = if let Some(offset) = instance.memory().host_addr_to_offset(raw) {
        Some(offset)
    } else if raw <= u32::MAX as u64 {
        let raw32 = raw as u32;
        if raw32 & crate::module::FUNC_REF_CALLBACK_BIT != 0 {
            Some(raw32 & !crate::module::FUNC_REF_CALLBACK_BIT)
        } else if raw32 & crate::module::FUNC_REF_DATA_OFFSET_BIT != 0 {
            Some(raw32 & !crate::module::FUNC_REF_DATA_OFFSET_BIT)
        } else {
            // A raw offset into static data.
            Some(raw32)
        }
    } else {
        None
    };

    if let Some(offset) = offset {
        if let Some(func) = module.func_ptr_at_offset(offset) {
            return Ok(IndirectTarget::Local(func as u32));
        }
    }

    Ok(IndirectTarget::Native(raw))
}

/// Enters a local function from outside the interpreter loop: compiled
/// code, trampolines and the dispatcher all come through here.
///
/// Prefers a cached compiled body and falls back to interpretation.
/// `snapshot_caller` preserves the caller's window around the call, as
/// indirect calls from native code require.
pub(crate) fn call_local_entry(
    instance: &Instance<'_>,
    ctx: &mut ExecutionContext,
    local_idx: u32,
    args: &[Value],
    snapshot_caller: bool,
) -> Result<Option<Value>, Trap> {
    let Some(compiled) = instance.jit_cache().lookup(local_idx) else {
        return interpret(instance, ctx, local_idx, args);
    };
    let body = resolve_body(instance, local_idx)?;
    enter_frame(ctx, body, 0, u32::MAX, REG_NONE, snapshot_caller)?;
    for (i, arg) in args.iter().enumerate() {
        ctx.set_reg(i as u8, *arg).map_err(Trap::new)?;
    }
    let outcome = compiled.call(instance, ctx).and_then(|()| {
        let sig = instance
            .module()
            .func_signature(local_idx)
            .ok_or_else(|| Trap::new(TrapCode::InvalidFuncIndex(local_idx)))?;
        match sig.return_type() {
            Some(_) => ctx.reg(0).map(Some).map_err(Trap::new),
            None => Ok(None),
        }
    });
    ctx.pop_frame(instance);
    outcome
}

/// Runs the local function `local_idx` on `ctx` until its entry frame
/// returns.
///
/// Arguments land in `R0..` of the entry window. The caller provides a
/// global-index-space check; this path requires a local index.
pub(crate) fn interpret<'m>(
    instance: &Instance<'m>,
    ctx: &mut ExecutionContext,
    local_idx: u32,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let entry_depth = ctx.depth();

    let mut func = local_idx;
    let entry_body = resolve_body(instance, func)?;
    enter_frame(ctx, entry_body, 0, u32::MAX, REG_NONE, false)?;
    for (i, arg) in args.iter().enumerate() {
        ctx.set_reg(i as u8, *arg).map_err(Trap::new)?;
    }

    let mut reader = InstructionReader::new(instance.module().code_of(entry_body), 0);
    let mut scratch_args: Vec<u8> = Vec::new();

    macro_rules! trap {
        ($e:expr) => {
            $e.map_err(Trap::new)?
        };
    }

    loop {
        // Running off the end of the body behaves like END.
        let op = if reader.at_end() {
            Opcode::End
        } else {
            trap!(reader.read_opcode())
        };

        match op {
            Opcode::End | Opcode::RetVoid => {
                if let Some(result) =
                    leave_frame(instance, ctx, None, entry_depth, &mut func, &mut reader)?
                {
                    return Ok(result);
                }
            }
            Opcode::Ret => {
                let rs = trap!(reader.read_u8());
                let value = trap!(ctx.reg(rs));
                if let Some(result) =
                    leave_frame(instance, ctx, Some(value), entry_depth, &mut func, &mut reader)?
                {
                    return Ok(result);
                }
            }

            Opcode::Br => {
                let offset = trap!(reader.read_i32());
                trap!(reader.branch(offset));
            }
            Opcode::BrIf => {
                let rc = trap!(reader.read_u8());
                let offset = trap!(reader.read_i32());
                if trap!(ctx.reg(rc)).is_truthy() {
                    trap!(reader.branch(offset));
                }
            }
            Opcode::BrIfz => {
                let rc = trap!(reader.read_u8());
                let offset = trap!(reader.read_i32());
                if !trap!(ctx.reg(rc)).is_truthy() {
                    trap!(reader.branch(offset));
                }
            }

            Opcode::LdcI32 => {
                let rd = trap!(reader.read_u8());
                let imm = trap!(reader.read_i32());
                trap!(ctx.set_reg(rd, Value::I32(imm)));
            }
            Opcode::LdcI64 => {
                let rd = trap!(reader.read_u8());
                let imm = trap!(reader.read_i64());
                trap!(ctx.set_reg(rd, Value::I64(imm)));
            }
            Opcode::LdcF32 => {
                let rd = trap!(reader.read_u8());
                let bits = trap!(reader.read_u32());
                trap!(ctx.set_reg(rd, Value::from_bits(ValueType::F32, bits as u64)));
            }
            Opcode::LdcF64 => {
                let rd = trap!(reader.read_u8());
                let bits = trap!(reader.read_u64());
                trap!(ctx.set_reg(rd, Value::from_bits(ValueType::F64, bits)));
            }
            Opcode::LdcPtr => {
                let rd = trap!(reader.read_u8());
                let offset = trap!(reader.read_u32());
                trap!(ctx.set_reg(rd, Value::Ptr(offset as u64)));
            }
            Opcode::LdcFunc => {
                let rd = trap!(reader.read_u8());
                let idx = trap!(reader.read_u32());
                trap!(ctx.set_reg(rd, Value::FuncIdx(idx)));
            }

            Opcode::Mov => {
                let rd = trap!(reader.read_u8());
                let rs = trap!(reader.read_u8());
                let value = trap!(ctx.reg(rs));
                trap!(ctx.set_reg(rd, value));
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::Le
            | Opcode::Ge => {
                let rd = trap!(reader.read_u8());
                let ra = trap!(reader.read_u8());
                let rb = trap!(reader.read_u8());
                let a = trap!(ctx.reg(ra));
                let b = trap!(ctx.reg(rb));
                let result = trap!(eval_binop(op, a, b));
                trap!(ctx.set_reg(rd, result));
            }

            Opcode::Neg | Opcode::Eqz | Opcode::Not => {
                let rd = trap!(reader.read_u8());
                let rs = trap!(reader.read_u8());
                let value = trap!(ctx.reg(rs));
                let result = trap!(eval_unop(op, value));
                trap!(ctx.set_reg(rd, result));
            }

            Opcode::Conv => {
                let rd = trap!(reader.read_u8());
                let rs = trap!(reader.read_u8());
                let ty_byte = trap!(reader.read_u8());
                let ty = ValueType::try_from(ty_byte)
                    .map_err(|_| Trap::new(TrapCode::InvalidOperand))?;
                let value = trap!(ctx.reg(rs));
                let result = trap!(value.convert(ty));
                trap!(ctx.set_reg(rd, result));
            }

            Opcode::Load => {
                let rd = trap!(reader.read_u8());
                let ra = trap!(reader.read_u8());
                let ty_byte = trap!(reader.read_u8());
                let offset = trap!(reader.read_u32());
                let ty = ValueType::try_from(ty_byte)
                    .map_err(|_| Trap::new(TrapCode::InvalidOperand))?;
                let addr = trap!(effective_address(trap!(ctx.reg(ra)), offset));
                let value = trap!(instance.memory().load_value(addr, ty));
                trap!(ctx.set_reg(rd, value));
            }
            Opcode::Store => {
                let ra = trap!(reader.read_u8());
                let rs = trap!(reader.read_u8());
                let ty_byte = trap!(reader.read_u8());
                let offset = trap!(reader.read_u32());
                let ty = ValueType::try_from(ty_byte)
                    .map_err(|_| Trap::new(TrapCode::InvalidOperand))?;
                let addr = trap!(effective_address(trap!(ctx.reg(ra)), offset));
                let value = trap!(trap!(ctx.reg(rs)).convert(ty));
                trap!(instance.memory().store_value(addr, value));
            }

            Opcode::GlobalGet => {
                let rd = trap!(reader.read_u8());
                let index = trap!(reader.read_u16());
                let value = trap!(instance.global_get(index as u32));
                trap!(ctx.set_reg(rd, value));
            }
            Opcode::GlobalSet => {
                let index = trap!(reader.read_u16());
                let rs = trap!(reader.read_u8());
                let value = trap!(ctx.reg(rs));
                trap!(instance.global_set(index as u32, value));
            }

            Opcode::Call => {
                let rd = trap!(reader.read_u8());
                let callee = trap!(reader.read_u16()) as u32;
                let argc = trap!(reader.read_u8()) as usize;
                trap!(reader.read_args(argc, &mut scratch_args));
                let arg_regs = scratch_args.clone();
                call_local(
                    instance, ctx, callee, &arg_regs, rd, &mut func, &mut reader, false,
                )?;
            }

            Opcode::CallImport => {
                let rd = trap!(reader.read_u8());
                let import_idx = trap!(reader.read_u16());
                let argc = trap!(reader.read_u8()) as usize;
                trap!(reader.read_args(argc, &mut scratch_args));
                let mut args = Vec::with_capacity(argc);
                for &r in scratch_args.iter() {
                    args.push(trap!(ctx.reg(r)));
                }
                let ext_types = read_ext_types(&mut reader)?;
                let result =
                    ffi::call_import(instance, import_idx, &mut args, ext_types.as_deref())?;
                if rd != REG_NONE {
                    if let Some(value) = result {
                        trap!(ctx.set_reg(rd, value));
                    }
                }
            }

            Opcode::CallIndirect => {
                let rd = trap!(reader.read_u8());
                let type_idx = trap!(reader.read_u16());
                let rt = trap!(reader.read_u8());
                let argc = trap!(reader.read_u8()) as usize;
                trap!(reader.read_args(argc, &mut scratch_args));
                let arg_regs = scratch_args.clone();
                let slot = trap!(ctx.reg(rt)).to_bits() as u32;
                let table = instance.table().ok_or(Trap::new(TrapCode::TableAccessOutOfBounds))?;
                let global_idx = trap!(table.get(slot));
                let imported = instance.module().num_imported_funcs();
                if global_idx < imported {
                    // Imported function in the table: route through the FFI
                    // layer after the signature check.
                    trap!(check_import_signature(instance, global_idx as u16, type_idx));
                    let mut args = Vec::with_capacity(argc);
                    for &r in arg_regs.iter() {
                        args.push(trap!(ctx.reg(r)));
                    }
                    let result =
                        ffi::call_import(instance, global_idx as u16, &mut args, None)?;
                    if rd != REG_NONE {
                        if let Some(value) = result {
                            trap!(ctx.set_reg(rd, value));
                        }
                    }
                } else {
                    let local = global_idx - imported;
                    trap!(check_local_signature(instance, local, type_idx));
                    call_local(
                        instance, ctx, local, &arg_regs, rd, &mut func, &mut reader, true,
                    )?;
                }
            }

            Opcode::CallIndirectPtr => {
                let rd = trap!(reader.read_u8());
                let type_idx = trap!(reader.read_u16());
                let rp = trap!(reader.read_u8());
                let argc = trap!(reader.read_u8()) as usize;
                trap!(reader.read_args(argc, &mut scratch_args));
                let arg_regs = scratch_args.clone();
                let raw = trap!(ctx.reg(rp)).to_bits();
                match trap!(classify_indirect_target(instance, raw)) {
                    IndirectTarget::Local(local) => {
                        trap!(check_local_signature(instance, local, type_idx));
                        call_local(
                            instance, ctx, local, &arg_regs, rd, &mut func, &mut reader, true,
                        )?;
                    }
                    IndirectTarget::Native(ptr) => {
                        let mut args = Vec::with_capacity(argc);
                        for &r in arg_regs.iter() {
                            args.push(trap!(ctx.reg(r)));
                        }
                        let sig = instance
                            .module()
                            .signatures()
                            .get(type_idx as usize)
                            .ok_or(Trap::new(TrapCode::TypeMismatch))?;
                        let result = ffi::call_native_ptr(instance, ptr, sig, &mut args)?;
                        if rd != REG_NONE {
                            if let Some(value) = result {
                                trap!(ctx.set_reg(rd, value));
                            }
                        }
                    }
                }
            }

            Opcode::Alloca => {
                let rd = trap!(reader.read_u8());
                let rsize = trap!(reader.read_u8());
                let size = trap!(ctx.reg(rsize)).to_bits() as u32;
                let offset = instance
                    .heap()
                    .alloc(size, 8)
                    .map_err(|_| Trap::new(TrapCode::MemoryAccessOutOfBounds))?;
                trap!(ctx.track_alloca(offset));
                trap!(ctx.set_reg(rd, Value::Ptr(offset as u64)));
            }

            Opcode::MemSize => {
                let rd = trap!(reader.read_u8());
                trap!(ctx.set_reg(rd, Value::U32(instance.memory().size_pages())));
            }
            Opcode::MemGrow => {
                let rd = trap!(reader.read_u8());
                let rpages = trap!(reader.read_u8());
                let pages = trap!(ctx.reg(rpages)).to_bits() as u32;
                let result = match instance.memory_grow(pages) {
                    Ok(prev) => Value::I32(prev as i32),
                    Err(_) => Value::I32(-1),
                };
                trap!(ctx.set_reg(rd, result));
            }
        }
    }
}

/// Pushes the frame for a local call and repositions execution at its
/// entry; a compiled callee runs to completion in place instead.
#[allow(clippy::too_many_arguments)]
fn call_local<'m>(
    instance: &Instance<'m>,
    ctx: &mut ExecutionContext,
    callee: u32,
    arg_regs: &[u8],
    ret_reg: u8,
    func: &mut u32,
    reader: &mut InstructionReader<'m>,
    snapshot_caller: bool,
) -> Result<(), Trap> {
    let body = resolve_body(instance, callee)?;
    let mut args = Vec::with_capacity(arg_regs.len());
    for &r in arg_regs {
        args.push(ctx.reg(r).map_err(Trap::new)?);
    }

    // If the callee was compiled, run it natively right here: push the
    // window, enter the code, and read the result from R0.
    if let Some(compiled) = instance.jit_cache().lookup(callee) {
        enter_frame(ctx, body, 0, u32::MAX, REG_NONE, snapshot_caller)?;
        for (i, arg) in args.iter().enumerate() {
            ctx.set_reg(i as u8, *arg).map_err(Trap::new)?;
        }
        let outcome = compiled.call(instance, ctx);
        let result = outcome.and_then(|()| {
            let sig = instance
                .module()
                .func_signature(callee)
                .ok_or(Trap::new(TrapCode::InvalidFuncIndex(callee)))?;
            match sig.return_type() {
                Some(_) => ctx.reg(0).map(Some).map_err(Trap::new),
                None => Ok(None),
            }
        });
        ctx.pop_frame(instance);
        let result = result?;
        if ret_reg != REG_NONE {
            if let Some(value) = result {
                ctx.set_reg(ret_reg, value).map_err(Trap::new)?;
            }
        }
        // Execution resumes in the caller, where the reader already is.
        return Ok(());
    }

    enter_frame(ctx, body, reader.pc(), *func, ret_reg, snapshot_caller)?;
    for (i, arg) in args.iter().enumerate() {
        ctx.set_reg(i as u8, *arg).map_err(Trap::new)?;
    }
    *func = callee;
    *reader = InstructionReader::new(instance.module().code_of(body), 0);
    Ok(())
}

/// Validates and pushes a frame for `body`.
fn enter_frame(
    ctx: &mut ExecutionContext,
    body: &FuncBody,
    return_pc: usize,
    caller_func: u32,
    ret_reg: u8,
    snapshot_caller: bool,
) -> Result<(), Trap> {
    if body.code.is_empty() {
        return Err(Trap::new(TrapCode::InvalidOperand));
    }
    ctx.push_frame(body.num_regs, return_pc, caller_func, ret_reg, snapshot_caller)
        .map_err(Trap::new)?;
    Ok(())
}

/// Pops the current frame and propagates `value` into the caller's target
/// register.
///
/// Returns `Some(result)` when the entry frame returned and the run is
/// over; otherwise repositions `func`/`reader` at the caller's saved pc.
fn leave_frame<'m>(
    instance: &Instance<'m>,
    ctx: &mut ExecutionContext,
    value: Option<Value>,
    entry_depth: usize,
    func: &mut u32,
    reader: &mut InstructionReader<'m>,
) -> Result<Option<Option<Value>>, Trap> {
    let frame = ctx
        .pop_frame(instance)
        .ok_or(Trap::new(TrapCode::StackUnderflow))?;

    if ctx.depth() == entry_depth {
        return Ok(Some(value));
    }

    *func = frame.caller_func;
    let body = resolve_body(instance, frame.caller_func)?;
    *reader = InstructionReader::new(instance.module().code_of(body), frame.return_pc);
    if frame.ret_reg != REG_NONE {
        if let Some(value) = value {
            ctx.set_reg(frame.ret_reg, value).map_err(Trap::new)?;
        }
    }
    Ok(None)
}

fn resolve_body<'m>(instance: &Instance<'m>, local_idx: u32) -> Result<&'m FuncBody, Trap> {
    instance
        .module()
        .body(local_idx)
        .ok_or_else(|| Trap::new(TrapCode::InvalidFuncIndex(local_idx)))
}

pub(crate) fn check_local_signature(
    instance: &Instance<'_>,
    local_idx: u32,
    expected_type: u16,
) -> Result<(), TrapCode> {
    // Strict signature-index equality.
    let actual = instance
        .module()
        .func_sig_idx(local_idx)
        .ok_or(TrapCode::InvalidFuncIndex(local_idx))?;
    if actual != expected_type {
        return Err(TrapCode::TypeMismatch);
    }
    Ok(())
}

pub(crate) fn check_import_signature(
    instance: &Instance<'_>,
    import_idx: u16,
    expected_type: u16,
) -> Result<(), TrapCode> {
    match instance.module().imports().get(import_idx as usize) {
        Some(import) => match import.kind {
            crate::module::ImportKind::Func { sig_idx, .. } if sig_idx == expected_type => Ok(()),
            _ => Err(TrapCode::TypeMismatch),
        },
        None => Err(TrapCode::InvalidFuncIndex(import_idx as u32)),
    }
}

/// Reads the optional extended type blob following an import call.
pub(crate) fn read_ext_types(
    reader: &mut InstructionReader<'_>,
) -> Result<Option<Vec<ValueType>>, Trap> {
    if reader.peek_u8() != Some(EXT_TYPE_SENTINEL) {
        return Ok(None);
    }
    reader.read_u8().map_err(Trap::new)?;
    let total = reader.read_u8().map_err(Trap::new)? as usize;
    let mut types = Vec::with_capacity(total);
    for _ in 0..total {
        let byte = reader.read_u8().map_err(Trap::new)?;
        let ty = ValueType::try_from(byte).map_err(|_| Trap::new(TrapCode::InvalidOperand))?;
        types.push(ty);
    }
    Ok(Some(types))
}

/// Effective address of a memory access: base register plus immediate.
pub(crate) fn effective_address(base: Value, offset: u32) -> Result<u32, TrapCode> {
    let base = match base {
        Value::Ptr(v) => v,
        Value::I32(v) => v as u32 as u64,
        Value::U32(v) => v as u64,
        _ => return Err(TrapCode::TypeMismatch),
    };
    let addr = base
        .checked_add(offset as u64)
        .ok_or(TrapCode::MemoryAccessOutOfBounds)?;
    u32::try_from(addr).map_err(|_| TrapCode::MemoryAccessOutOfBounds)
}

/// Shared binary-operator evaluation; the interpreter and the baseline code
/// generator both call this, which is what keeps the two tiers bit-equal.
pub(crate) fn eval_binop(op: Opcode, a: Value, b: Value) -> Result<Value, TrapCode> {
    match op {
        Opcode::Add => a.add(b),
        Opcode::Sub => a.sub(b),
        Opcode::Mul => a.mul(b),
        Opcode::Div => a.div(b),
        Opcode::Rem => a.rem(b),
        Opcode::And => a.bitand(b),
        Opcode::Or => a.bitor(b),
        Opcode::Xor => a.bitxor(b),
        Opcode::Shl => a.shl(b),
        Opcode::Shr => a.shr(b),
        Opcode::Eq => a.val_eq(b),
        Opcode::Ne => a.val_ne(b),
        Opcode::Lt => a.lt(b),
        Opcode::Gt => a.gt(b),
        Opcode::Le => a.le(b),
        Opcode::Ge => a.ge(b),
        _ => Err(TrapCode::InvalidOperand),
    }
}

/// Shared unary-operator evaluation.
pub(crate) fn eval_unop(op: Opcode, value: Value) -> Result<Value, TrapCode> {
    match op {
        Opcode::Neg => value.neg(),
        Opcode::Eqz => value.eqz(),
        Opcode::Not => value.not(),
        _ => Err(TrapCode::InvalidOperand),
    }
}
