//! The baseline code generator: ahead-of-time decoding.
//!
//! Lowers a function body into a flat vector of pre-decoded operations
//! with branch targets resolved to op indices, removing all fetch/decode
//! work from the hot path. Semantically it is the interpreter with the
//! decoder hoisted out: both tiers evaluate operators through the same
//! helpers, which is what the differential tests lean on.
//!
//! The generator refuses `ALLOCA` bodies: frame-tracked heap allocation is
//! left to the interpreter tier.

use super::{CodeGenerator, CompiledCode, CompiledFunc};
use crate::ffi;
use crate::instance::Instance;
use crate::isa::{InstructionReader, Opcode};
use crate::module::Module;
use crate::runner::{self, ExecutionContext, REG_NONE};
use crate::value::Value;
use crate::{Error, Trap, TrapCode, ValueType};
use std::collections::BTreeMap;

/// The in-tree [`CodeGenerator`].
#[derive(Debug, Default)]
pub struct BaselineGenerator;

impl BaselineGenerator {
    /// Creates the generator.
    pub fn new() -> BaselineGenerator {
        BaselineGenerator
    }
}

#[derive(Debug, Clone)]
enum Op {
    Ldc { rd: u8, value: Value },
    Mov { rd: u8, rs: u8 },
    Binop { op: Opcode, rd: u8, ra: u8, rb: u8 },
    Unop { op: Opcode, rd: u8, rs: u8 },
    Conv { rd: u8, rs: u8, ty: ValueType },
    Br { target: usize },
    BrIf { rc: u8, target: usize },
    BrIfz { rc: u8, target: usize },
    Ret { rs: u8 },
    RetVoid,
    Load { rd: u8, ra: u8, ty: ValueType, offset: u32 },
    Store { ra: u8, rs: u8, ty: ValueType, offset: u32 },
    GlobalGet { rd: u8, index: u16 },
    GlobalSet { index: u16, rs: u8 },
    Call { rd: u8, callee: u32, args: Box<[u8]> },
    CallImport { rd: u8, import: u16, args: Box<[u8]>, ext: Option<Box<[ValueType]>> },
    CallIndirect { rd: u8, type_idx: u16, rt: u8, args: Box<[u8]> },
    CallIndirectPtr { rd: u8, type_idx: u16, rp: u8, args: Box<[u8]> },
    MemSize { rd: u8 },
    MemGrow { rd: u8, rpages: u8 },
}

struct PredecodedBody {
    ops: Vec<Op>,
    code_size: usize,
}

impl CodeGenerator for BaselineGenerator {
    fn compile(&self, module: &Module<'_>, local_idx: u32) -> Result<CompiledFunc, Error> {
        let body = module
            .body(local_idx)
            .ok_or_else(|| Error::Jit(format!("no body for local function {}", local_idx)))?;
        let code = module.code_of(body);
        if code.is_empty() {
            return Err(Error::Jit("zero-size body".into()));
        }

        let mut reader = InstructionReader::new(code, 0);
        let mut ops = Vec::new();
        let mut pc_to_op = BTreeMap::new();
        // Branches are recorded with byte targets and patched to op
        // indices once the whole body is decoded.
        let mut patches: Vec<(usize, usize)> = Vec::new();

        let invalid = |code: TrapCode| Error::Jit(format!("undecodable body: {:?}", code));

        while !reader.at_end() {
            pc_to_op.insert(reader.pc(), ops.len());
            let op = reader.read_opcode().map_err(invalid)?;
            let lowered = match op {
                Opcode::End | Opcode::RetVoid => Op::RetVoid,
                Opcode::Ret => Op::Ret {
                    rs: reader.read_u8().map_err(invalid)?,
                },
                Opcode::Br => {
                    let offset = reader.read_i32().map_err(invalid)?;
                    let target = byte_target(&reader, offset)?;
                    patches.push((ops.len(), target));
                    Op::Br { target: 0 }
                }
                Opcode::BrIf | Opcode::BrIfz => {
                    let rc = reader.read_u8().map_err(invalid)?;
                    let offset = reader.read_i32().map_err(invalid)?;
                    let target = byte_target(&reader, offset)?;
                    patches.push((ops.len(), target));
                    if op == Opcode::BrIf {
                        Op::BrIf { rc, target: 0 }
                    } else {
                        Op::BrIfz { rc, target: 0 }
                    }
                }
                Opcode::LdcI32 => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::I32(reader.read_i32().map_err(invalid)?),
                },
                Opcode::LdcI64 => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::I64(reader.read_i64().map_err(invalid)?),
                },
                Opcode::LdcF32 => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::from_bits(
                        ValueType::F32,
                        reader.read_u32().map_err(invalid)? as u64,
                    ),
                },
                Opcode::LdcF64 => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::from_bits(ValueType::F64, reader.read_u64().map_err(invalid)?),
                },
                Opcode::LdcPtr => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::Ptr(reader.read_u32().map_err(invalid)? as u64),
                },
                Opcode::LdcFunc => Op::Ldc {
                    rd: reader.read_u8().map_err(invalid)?,
                    value: Value::FuncIdx(reader.read_u32().map_err(invalid)?),
                },
                Opcode::Mov => Op::Mov {
                    rd: reader.read_u8().map_err(invalid)?,
                    rs: reader.read_u8().map_err(invalid)?,
                },
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
                | Opcode::Ge => Op::Binop {
                    op,
                    rd: reader.read_u8().map_err(invalid)?,
                    ra: reader.read_u8().map_err(invalid)?,
                    rb: reader.read_u8().map_err(invalid)?,
                },
                Opcode::Neg | Opcode::Eqz | Opcode::Not => Op::Unop {
                    op,
                    rd: reader.read_u8().map_err(invalid)?,
                    rs: reader.read_u8().map_err(invalid)?,
                },
                Opcode::Conv => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let rs = reader.read_u8().map_err(invalid)?;
                    let ty = ValueType::try_from(reader.read_u8().map_err(invalid)?)
                        .map_err(|_| Error::Jit("invalid conversion type".into()))?;
                    Op::Conv { rd, rs, ty }
                }
                Opcode::Load => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let ra = reader.read_u8().map_err(invalid)?;
                    let ty = ValueType::try_from(reader.read_u8().map_err(invalid)?)
                        .map_err(|_| Error::Jit("invalid access type".into()))?;
                    let offset = reader.read_u32().map_err(invalid)?;
                    Op::Load { rd, ra, ty, offset }
                }
                Opcode::Store => {
                    let ra = reader.read_u8().map_err(invalid)?;
                    let rs = reader.read_u8().map_err(invalid)?;
                    let ty = ValueType::try_from(reader.read_u8().map_err(invalid)?)
                        .map_err(|_| Error::Jit("invalid access type".into()))?;
                    let offset = reader.read_u32().map_err(invalid)?;
                    Op::Store { ra, rs, ty, offset }
                }
                Opcode::GlobalGet => Op::GlobalGet {
                    rd: reader.read_u8().map_err(invalid)?,
                    index: reader.read_u16().map_err(invalid)?,
                },
                Opcode::GlobalSet => Op::GlobalSet {
                    index: reader.read_u16().map_err(invalid)?,
                    rs: reader.read_u8().map_err(invalid)?,
                },
                Opcode::Call => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let callee = reader.read_u16().map_err(invalid)? as u32;
                    let args = read_arg_regs(&mut reader).map_err(invalid)?;
                    Op::Call { rd, callee, args }
                }
                Opcode::CallImport => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let import = reader.read_u16().map_err(invalid)?;
                    let args = read_arg_regs(&mut reader).map_err(invalid)?;
                    let ext = runner::read_ext_types(&mut reader)
                        .map_err(|t| invalid(t.into_code()))?
                        .map(|v| v.into_boxed_slice());
                    Op::CallImport {
                        rd,
                        import,
                        args,
                        ext,
                    }
                }
                Opcode::CallIndirect => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let type_idx = reader.read_u16().map_err(invalid)?;
                    let rt = reader.read_u8().map_err(invalid)?;
                    let args = read_arg_regs(&mut reader).map_err(invalid)?;
                    Op::CallIndirect {
                        rd,
                        type_idx,
                        rt,
                        args,
                    }
                }
                Opcode::CallIndirectPtr => {
                    let rd = reader.read_u8().map_err(invalid)?;
                    let type_idx = reader.read_u16().map_err(invalid)?;
                    let rp = reader.read_u8().map_err(invalid)?;
                    let args = read_arg_regs(&mut reader).map_err(invalid)?;
                    Op::CallIndirectPtr {
                        rd,
                        type_idx,
                        rp,
                        args,
                    }
                }
                Opcode::MemSize => Op::MemSize {
                    rd: reader.read_u8().map_err(invalid)?,
                },
                Opcode::MemGrow => Op::MemGrow {
                    rd: reader.read_u8().map_err(invalid)?,
                    rpages: reader.read_u8().map_err(invalid)?,
                },
                Opcode::Alloca => {
                    return Err(Error::Jit(
                        "ALLOCA is not supported by the baseline generator".into(),
                    ))
                }
            };
            ops.push(lowered);
        }
        // Falling off the end behaves like END.
        pc_to_op.insert(reader.pc(), ops.len());
        ops.push(Op::RetVoid);

        for (op_idx, byte_target) in patches {
            let target = *pc_to_op.get(&byte_target).ok_or_else(|| {
                Error::Jit(format!(
                    "branch lands inside an instruction at byte {}",
                    byte_target
                ))
            })?;
            match &mut ops[op_idx] {
                Op::Br { target: t } | Op::BrIf { target: t, .. } | Op::BrIfz { target: t, .. } => {
                    *t = target
                }
                _ => unreachable!("patch list only holds branches"),
            }
        }

        Ok(CompiledFunc::new(Box::new(PredecodedBody {
            ops,
            code_size: code.len(),
        })))
    }
}

fn byte_target(reader: &InstructionReader<'_>, offset: i32) -> Result<usize, Error> {
    let target = reader.pc() as i64 + offset as i64;
    if target < 0 {
        return Err(Error::Jit("branch before the body".into()));
    }
    Ok(target as usize)
}

fn read_arg_regs(reader: &mut InstructionReader<'_>) -> Result<Box<[u8]>, TrapCode> {
    let argc = reader.read_u8()? as usize;
    let mut regs = Vec::with_capacity(argc);
    for _ in 0..argc {
        regs.push(reader.read_u8()?);
    }
    Ok(regs.into_boxed_slice())
}

impl PredecodedBody {
    fn collect_args(
        &self,
        ctx: &ExecutionContext,
        regs: &[u8],
    ) -> Result<Vec<Value>, Trap> {
        let mut args = Vec::with_capacity(regs.len());
        for &r in regs {
            args.push(ctx.reg(r).map_err(Trap::new)?);
        }
        Ok(args)
    }
}

impl CompiledCode for PredecodedBody {
    fn enter(&self, instance: &Instance<'_>, ctx: &mut ExecutionContext) -> Result<(), Trap> {
        let mut idx = 0usize;
        loop {
            let op = self
                .ops
                .get(idx)
                .ok_or_else(|| Trap::new(TrapCode::InvalidOperand))?;
            idx += 1;
            match op {
                Op::Ldc { rd, value } => ctx.set_reg(*rd, *value).map_err(Trap::new)?,
                Op::Mov { rd, rs } => {
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    ctx.set_reg(*rd, value).map_err(Trap::new)?;
                }
                Op::Binop { op, rd, ra, rb } => {
                    let a = ctx.reg(*ra).map_err(Trap::new)?;
                    let b = ctx.reg(*rb).map_err(Trap::new)?;
                    let result = runner::eval_binop(*op, a, b).map_err(Trap::new)?;
                    ctx.set_reg(*rd, result).map_err(Trap::new)?;
                }
                Op::Unop { op, rd, rs } => {
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    let result = runner::eval_unop(*op, value).map_err(Trap::new)?;
                    ctx.set_reg(*rd, result).map_err(Trap::new)?;
                }
                Op::Conv { rd, rs, ty } => {
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    let result = value.convert(*ty).map_err(Trap::new)?;
                    ctx.set_reg(*rd, result).map_err(Trap::new)?;
                }
                Op::Br { target } => idx = *target,
                Op::BrIf { rc, target } => {
                    if ctx.reg(*rc).map_err(Trap::new)?.is_truthy() {
                        idx = *target;
                    }
                }
                Op::BrIfz { rc, target } => {
                    if !ctx.reg(*rc).map_err(Trap::new)?.is_truthy() {
                        idx = *target;
                    }
                }
                Op::Ret { rs } => {
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    ctx.set_reg(0, value).map_err(Trap::new)?;
                    return Ok(());
                }
                Op::RetVoid => return Ok(()),
                Op::Load {
                    rd,
                    ra,
                    ty,
                    offset,
                } => {
                    let base = ctx.reg(*ra).map_err(Trap::new)?;
                    let addr = runner::effective_address(base, *offset).map_err(Trap::new)?;
                    let value = instance.memory().load_value(addr, *ty).map_err(Trap::new)?;
                    ctx.set_reg(*rd, value).map_err(Trap::new)?;
                }
                Op::Store {
                    ra,
                    rs,
                    ty,
                    offset,
                } => {
                    let base = ctx.reg(*ra).map_err(Trap::new)?;
                    let addr = runner::effective_address(base, *offset).map_err(Trap::new)?;
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    let value = value.convert(*ty).map_err(Trap::new)?;
                    instance.memory().store_value(addr, value).map_err(Trap::new)?;
                }
                Op::GlobalGet { rd, index } => {
                    let value = instance.global_get(*index as u32).map_err(Trap::new)?;
                    ctx.set_reg(*rd, value).map_err(Trap::new)?;
                }
                Op::GlobalSet { index, rs } => {
                    let value = ctx.reg(*rs).map_err(Trap::new)?;
                    instance.global_set(*index as u32, value).map_err(Trap::new)?;
                }
                Op::Call { rd, callee, args } => {
                    let args = self.collect_args(ctx, args)?;
                    let result = runner::call_local_entry(instance, ctx, *callee, &args, false)?;
                    write_result(ctx, *rd, result)?;
                }
                Op::CallImport {
                    rd,
                    import,
                    args,
                    ext,
                } => {
                    let mut args = self.collect_args(ctx, args)?;
                    let result =
                        ffi::call_import(instance, *import, &mut args, ext.as_deref())?;
                    write_result(ctx, *rd, result)?;
                }
                Op::CallIndirect {
                    rd,
                    type_idx,
                    rt,
                    args,
                } => {
                    let slot = ctx.reg(*rt).map_err(Trap::new)?.to_bits() as u32;
                    let table = instance
                        .table()
                        .ok_or_else(|| Trap::new(TrapCode::TableAccessOutOfBounds))?;
                    let global_idx = table.get(slot).map_err(Trap::new)?;
                    let imported = instance.module().num_imported_funcs();
                    let result = if global_idx < imported {
                        runner::check_import_signature(instance, global_idx as u16, *type_idx)
                            .map_err(Trap::new)?;
                        let mut args = self.collect_args(ctx, args)?;
                        ffi::call_import(instance, global_idx as u16, &mut args, None)?
                    } else {
                        let local = global_idx - imported;
                        runner::check_local_signature(instance, local, *type_idx)
                            .map_err(Trap::new)?;
                        let args = self.collect_args(ctx, args)?;
                        // Indirect call from compiled code: the caller's
                        // window is snapshotted around the callee.
                        runner::call_local_entry(instance, ctx, local, &args, true)?
                    };
                    write_result(ctx, *rd, result)?;
                }
                Op::CallIndirectPtr {
                    rd,
                    type_idx,
                    rp,
                    args,
                } => {
                    let raw = ctx.reg(*rp).map_err(Trap::new)?.to_bits();
                    let result = match runner::classify_indirect_target(instance, raw)
                        .map_err(Trap::new)?
                    {
                        runner::IndirectTarget::Local(local) => {
                            runner::check_local_signature(instance, local, *type_idx)
                                .map_err(Trap::new)?;
                            let args = self.collect_args(ctx, args)?;
                            runner::call_local_entry(instance, ctx, local, &args, true)?
                        }
                        runner::IndirectTarget::Native(ptr) => {
                            let mut args = self.collect_args(ctx, args)?;
                            let sig = instance
                                .module()
                                .signatures()
                                .get(*type_idx as usize)
                                .ok_or_else(|| Trap::new(TrapCode::TypeMismatch))?;
                            ffi::call_native_ptr(instance, ptr, sig, &mut args)?
                        }
                    };
                    write_result(ctx, *rd, result)?;
                }
                Op::MemSize { rd } => {
                    let pages = Value::U32(instance.memory().size_pages());
                    ctx.set_reg(*rd, pages).map_err(Trap::new)?;
                }
                Op::MemGrow { rd, rpages } => {
                    let pages = ctx.reg(*rpages).map_err(Trap::new)?.to_bits() as u32;
                    let result = match instance.memory_grow(pages) {
                        Ok(prev) => Value::I32(prev as i32),
                        Err(_) => Value::I32(-1),
                    };
                    ctx.set_reg(*rd, result).map_err(Trap::new)?;
                }
            }
        }
    }

    fn code_size(&self) -> usize {
        self.code_size
    }
}

fn write_result(ctx: &mut ExecutionContext, rd: u8, result: Option<Value>) -> Result<(), Trap> {
    if rd != REG_NONE {
        if let Some(value) = result {
            ctx.set_reg(rd, value).map_err(Trap::new)?;
        }
    }
    Ok(())
}
