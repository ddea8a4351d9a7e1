//! Test support: an ESPB image writer and a bytecode assembler.
//!
//! There is no text format for ESPB modules, so the integration suite
//! assembles binary images directly. `ImageBuilder` lays out the header,
//! section directory and section bodies; `Asm` emits instruction bytes
//! with label-resolved branch offsets.

#![allow(dead_code)]

use espb::isa::Opcode;
use espb::ValueType;
use std::collections::HashMap;

pub const MAGIC: u32 = 0x4250_5345;
pub const VERSION: u32 = 0x0000_0106;

const SEC_TYPES: u8 = 1;
const SEC_IMPORTS: u8 = 2;
const SEC_FUNCTIONS: u8 = 3;
const SEC_GLOBALS: u8 = 4;
const SEC_EXPORTS: u8 = 5;
const SEC_CODE: u8 = 6;
const SEC_DATA: u8 = 8;
const SEC_RELOCATIONS: u8 = 9;
const SEC_CBMETA: u8 = 10;
const SEC_TABLES: u8 = 11;
const SEC_ELEMENTS: u8 = 12;
const SEC_MEMORY: u8 = 14;
const SEC_START: u8 = 15;
const SEC_IMMETA: u8 = 17;
const SEC_FPMAP: u8 = 18;

const ELEM_FUNCREF: u8 = 0x70;

/// Register operand meaning "discard the result" in call encodings.
pub const REG_NONE: u8 = 0xFF;

#[derive(Default)]
struct ImportSpec {
    module: String,
    name: String,
    payload: Vec<u8>,
}

/// Assembles a complete ESPB image.
#[derive(Default)]
pub struct ImageBuilder {
    signatures: Vec<(Vec<ValueType>, Vec<ValueType>)>,
    imports: Vec<ImportSpec>,
    func_sigs: Vec<u16>,
    bodies: Vec<Vec<u8>>,
    globals: Vec<Vec<u8>>,
    memory: Option<(u32, Option<u32>)>,
    table: Option<(u32, Option<u32>)>,
    exports: Vec<(String, u8, u32)>,
    data: Vec<Vec<u8>>,
    elements: Vec<Vec<u8>>,
    relocations: Option<Vec<u8>>,
    cbmeta: Vec<(u16, Vec<(u8, u8, u16)>)>,
    immeta: Vec<(u16, Vec<[u8; 5]>)>,
    fpmap: Vec<(u32, u16)>,
    start: Option<u32>,
    imported_funcs: u32,
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder::default()
    }

    /// Declares a signature, returning its index.
    pub fn signature(&mut self, params: &[ValueType], returns: &[ValueType]) -> u16 {
        self.signatures.push((params.to_vec(), returns.to_vec()));
        (self.signatures.len() - 1) as u16
    }

    /// Declares a named function import, returning the import index.
    pub fn import_func(&mut self, module: &str, name: &str, sig: u16, flags: u8) -> u16 {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&sig.to_le_bytes());
        payload.push(flags);
        self.imports.push(ImportSpec {
            module: module.to_string(),
            name: name.to_string(),
            payload,
        });
        self.imported_funcs += 1;
        (self.imports.len() - 1) as u16
    }

    /// Declares a local function, returning its global function index.
    pub fn func(&mut self, sig: u16, num_regs: u16, hot: bool, code: Vec<u8>) -> u32 {
        self.func_sigs.push(sig);
        let mut body = Vec::new();
        body.extend_from_slice(&((code.len() as u32 + 2).to_le_bytes()));
        let regs = num_regs | if hot { 0x8000 } else { 0 };
        body.extend_from_slice(&regs.to_le_bytes());
        body.extend_from_slice(&code);
        self.bodies.push(body);
        self.imported_funcs + (self.func_sigs.len() - 1) as u32
    }

    /// Declares a mutable zero-initialized global.
    pub fn global_zero(&mut self, ty: ValueType) -> u32 {
        self.globals.push(vec![ty as u8, 1, 0, 0]);
        (self.globals.len() - 1) as u32
    }

    /// Declares an immutable I32 constant global.
    pub fn global_const_i32(&mut self, value: i32) -> u32 {
        let mut bytes = vec![ValueType::I32 as u8, 0, 0, 1];
        bytes.extend_from_slice(&value.to_le_bytes());
        self.globals.push(bytes);
        (self.globals.len() - 1) as u32
    }

    pub fn memory(&mut self, initial: u32, maximum: Option<u32>) -> &mut Self {
        self.memory = Some((initial, maximum));
        self
    }

    pub fn table(&mut self, initial: u32, maximum: Option<u32>) -> &mut Self {
        self.table = Some((initial, maximum));
        self
    }

    pub fn export_func(&mut self, name: &str, func: u32) -> &mut Self {
        self.exports.push((name.to_string(), 0, func));
        self
    }

    /// Adds an active data segment placed by a constant offset expression.
    pub fn active_data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        let mut seg = vec![0u8, 0u8, 0x01];
        seg.extend_from_slice(&offset.to_le_bytes());
        seg.push(0x0F);
        seg.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        seg.extend_from_slice(bytes);
        self.data.push(seg);
        self
    }

    /// Adds a passive data segment.
    pub fn passive_data(&mut self, bytes: &[u8]) -> &mut Self {
        let mut seg = vec![1u8];
        seg.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        seg.extend_from_slice(bytes);
        self.data.push(seg);
        self
    }

    /// Adds an active element segment against table 0.
    pub fn element(&mut self, offset: i32, members: &[u32]) -> &mut Self {
        let mut seg = Vec::new();
        seg.extend_from_slice(&0u32.to_le_bytes());
        seg.push(0x01);
        seg.extend_from_slice(&offset.to_le_bytes());
        seg.push(0x0F);
        seg.push(ELEM_FUNCREF);
        seg.extend_from_slice(&(members.len() as u32).to_le_bytes());
        for member in members {
            seg.extend_from_slice(&member.to_le_bytes());
        }
        self.elements.push(seg);
        self
    }

    /// Sets the relocation section: one target plus raw entries.
    pub fn relocations(&mut self, target: u8, entries: &[(u8, u32, u32, i32)]) -> &mut Self {
        let mut body = vec![target];
        body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for (ty, offset, symbol, addend) in entries {
            body.push(*ty);
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&symbol.to_le_bytes());
            body.extend_from_slice(&addend.to_le_bytes());
        }
        self.relocations = Some(body);
        self
    }

    /// Adds callback metadata for one import: `(param_idx, user_data_idx,
    /// target_local_func)` entries; `user_data_idx` 0xF means none.
    pub fn cbmeta(&mut self, import: u16, entries: &[(u8, u8, u16)]) -> &mut Self {
        self.cbmeta.push((import, entries.to_vec()));
        self
    }

    /// Adds marshalling metadata for one import:
    /// `(arg_index, direction, size_kind, size_value, handler)` per entry.
    pub fn immeta(&mut self, import: u16, entries: &[[u8; 5]]) -> &mut Self {
        self.immeta.push((import, entries.to_vec()));
        self
    }

    pub fn fpmap_entry(&mut self, data_offset: u32, func: u16) -> &mut Self {
        self.fpmap.push((data_offset, func));
        self
    }

    pub fn start(&mut self, func: u32) -> &mut Self {
        self.start = Some(func);
        self
    }

    /// Serializes the image.
    pub fn build(&self) -> Vec<u8> {
        let mut sections: Vec<(u8, Vec<u8>)> = Vec::new();

        if !self.signatures.is_empty() {
            let mut body = (self.signatures.len() as u32).to_le_bytes().to_vec();
            for (params, returns) in &self.signatures {
                body.push(params.len() as u8);
                body.extend(params.iter().map(|t| *t as u8));
                body.push(returns.len() as u8);
                body.extend(returns.iter().map(|t| *t as u8));
            }
            sections.push((SEC_TYPES, body));
        }

        if !self.imports.is_empty() {
            let mut body = (self.imports.len() as u32).to_le_bytes().to_vec();
            for import in &self.imports {
                body.extend_from_slice(&(import.module.len() as u16).to_le_bytes());
                body.extend_from_slice(import.module.as_bytes());
                body.extend_from_slice(&(import.name.len() as u16).to_le_bytes());
                body.extend_from_slice(import.name.as_bytes());
                body.extend_from_slice(&import.payload);
            }
            sections.push((SEC_IMPORTS, body));
        }

        if !self.func_sigs.is_empty() {
            let mut body = (self.func_sigs.len() as u32).to_le_bytes().to_vec();
            for sig in &self.func_sigs {
                body.extend_from_slice(&sig.to_le_bytes());
            }
            sections.push((SEC_FUNCTIONS, body));
        }

        if !self.globals.is_empty() {
            let mut body = (self.globals.len() as u32).to_le_bytes().to_vec();
            for global in &self.globals {
                body.extend_from_slice(global);
            }
            sections.push((SEC_GLOBALS, body));
        }

        if let Some((initial, maximum)) = self.memory {
            sections.push((SEC_MEMORY, limits(initial, maximum)));
        }

        if let Some((initial, maximum)) = self.table {
            let mut body = vec![ELEM_FUNCREF];
            body.extend_from_slice(&limits(initial, maximum));
            sections.push((SEC_TABLES, body));
        }

        if !self.exports.is_empty() {
            let mut body = (self.exports.len() as u32).to_le_bytes().to_vec();
            for (name, kind, index) in &self.exports {
                body.extend_from_slice(&(name.len() as u16).to_le_bytes());
                body.extend_from_slice(name.as_bytes());
                body.push(*kind);
                body.extend_from_slice(&index.to_le_bytes());
            }
            sections.push((SEC_EXPORTS, body));
        }

        if !self.bodies.is_empty() {
            let mut body = (self.bodies.len() as u32).to_le_bytes().to_vec();
            for func_body in &self.bodies {
                body.extend_from_slice(func_body);
            }
            sections.push((SEC_CODE, body));
        }

        if !self.data.is_empty() {
            let mut body = (self.data.len() as u32).to_le_bytes().to_vec();
            for seg in &self.data {
                body.extend_from_slice(seg);
            }
            sections.push((SEC_DATA, body));
        }

        if !self.elements.is_empty() {
            let mut body = (self.elements.len() as u32).to_le_bytes().to_vec();
            for seg in &self.elements {
                body.extend_from_slice(seg);
            }
            sections.push((SEC_ELEMENTS, body));
        }

        if let Some(relocs) = &self.relocations {
            sections.push((SEC_RELOCATIONS, relocs.clone()));
        }

        if !self.cbmeta.is_empty() {
            let mut body = vec![0u8];
            body.extend_from_slice(&(self.cbmeta.len() as u16).to_le_bytes());
            for (import, entries) in &self.cbmeta {
                body.extend_from_slice(&import.to_le_bytes());
                body.push(entries.len() as u8);
                for (param, user, target) in entries {
                    body.push(param | (user << 4));
                    body.extend_from_slice(&target.to_le_bytes());
                }
            }
            sections.push((SEC_CBMETA, body));
        }

        if !self.immeta.is_empty() {
            let mut body = (self.immeta.len() as u16).to_le_bytes().to_vec();
            for (import, entries) in &self.immeta {
                body.extend_from_slice(&import.to_le_bytes());
                body.push(entries.len() as u8);
                for entry in entries {
                    body.extend_from_slice(entry);
                }
            }
            sections.push((SEC_IMMETA, body));
        }

        if !self.fpmap.is_empty() {
            let mut body = (self.fpmap.len() as u32).to_le_bytes().to_vec();
            for (offset, func) in &self.fpmap {
                body.extend_from_slice(&offset.to_le_bytes());
                body.extend_from_slice(&func.to_le_bytes());
            }
            sections.push((SEC_FPMAP, body));
        }

        if let Some(start) = self.start {
            sections.push((SEC_START, start.to_le_bytes().to_vec()));
        }

        serialize(sections)
    }
}

fn limits(initial: u32, maximum: Option<u32>) -> Vec<u8> {
    let mut bytes = vec![if maximum.is_some() { 0x01 } else { 0x00 }];
    bytes.extend_from_slice(&initial.to_le_bytes());
    if let Some(maximum) = maximum {
        bytes.extend_from_slice(&maximum.to_le_bytes());
    }
    bytes
}

/// Lays out header, directory and bodies.
pub fn serialize(sections: Vec<(u8, Vec<u8>)>) -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(&MAGIC.to_le_bytes());
    image.extend_from_slice(&VERSION.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&(sections.len() as u16).to_le_bytes());

    let mut offset = image.len() + sections.len() * 12;
    for (id, body) in &sections {
        image.push(*id);
        image.push(0);
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&(offset as u32).to_le_bytes());
        image.extend_from_slice(&(body.len() as u32).to_le_bytes());
        offset += body.len();
    }
    for (_, body) in &sections {
        image.extend_from_slice(body);
    }
    image
}

/// Instruction assembler with label-resolved branches.
#[derive(Default)]
pub struct Asm {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    patches: Vec<(usize, &'static str)>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm::default()
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.bytes.push(op as u8);
        self
    }

    pub fn ldc_i32(&mut self, rd: u8, value: i32) -> &mut Self {
        self.op(Opcode::LdcI32);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_i64(&mut self, rd: u8, value: i64) -> &mut Self {
        self.op(Opcode::LdcI64);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_f64(&mut self, rd: u8, value: f64) -> &mut Self {
        self.op(Opcode::LdcF64);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    pub fn ldc_ptr(&mut self, rd: u8, offset: u32) -> &mut Self {
        self.op(Opcode::LdcPtr);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self
    }

    pub fn ldc_func(&mut self, rd: u8, func: u32) -> &mut Self {
        self.op(Opcode::LdcFunc);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&func.to_le_bytes());
        self
    }

    pub fn mov(&mut self, rd: u8, rs: u8) -> &mut Self {
        self.op(Opcode::Mov);
        self.bytes.push(rd);
        self.bytes.push(rs);
        self
    }

    pub fn binop(&mut self, op: Opcode, rd: u8, ra: u8, rb: u8) -> &mut Self {
        self.op(op);
        self.bytes.push(rd);
        self.bytes.push(ra);
        self.bytes.push(rb);
        self
    }

    pub fn unop(&mut self, op: Opcode, rd: u8, rs: u8) -> &mut Self {
        self.op(op);
        self.bytes.push(rd);
        self.bytes.push(rs);
        self
    }

    pub fn conv(&mut self, rd: u8, rs: u8, ty: ValueType) -> &mut Self {
        self.op(Opcode::Conv);
        self.bytes.push(rd);
        self.bytes.push(rs);
        self.bytes.push(ty as u8);
        self
    }

    pub fn load(&mut self, rd: u8, ra: u8, ty: ValueType, offset: u32) -> &mut Self {
        self.op(Opcode::Load);
        self.bytes.push(rd);
        self.bytes.push(ra);
        self.bytes.push(ty as u8);
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self
    }

    pub fn store(&mut self, ra: u8, rs: u8, ty: ValueType, offset: u32) -> &mut Self {
        self.op(Opcode::Store);
        self.bytes.push(ra);
        self.bytes.push(rs);
        self.bytes.push(ty as u8);
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self
    }

    pub fn global_get(&mut self, rd: u8, index: u16) -> &mut Self {
        self.op(Opcode::GlobalGet);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn global_set(&mut self, index: u16, rs: u8) -> &mut Self {
        self.op(Opcode::GlobalSet);
        self.bytes.extend_from_slice(&index.to_le_bytes());
        self.bytes.push(rs);
        self
    }

    /// Binds `name` to the current position.
    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.bytes.len());
        self
    }

    pub fn br(&mut self, target: &'static str) -> &mut Self {
        self.op(Opcode::Br);
        self.patches.push((self.bytes.len(), target));
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    pub fn br_if(&mut self, rc: u8, target: &'static str) -> &mut Self {
        self.op(Opcode::BrIf);
        self.bytes.push(rc);
        self.patches.push((self.bytes.len(), target));
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    pub fn br_ifz(&mut self, rc: u8, target: &'static str) -> &mut Self {
        self.op(Opcode::BrIfz);
        self.bytes.push(rc);
        self.patches.push((self.bytes.len(), target));
        self.bytes.extend_from_slice(&0i32.to_le_bytes());
        self
    }

    pub fn ret(&mut self, rs: u8) -> &mut Self {
        self.op(Opcode::Ret);
        self.bytes.push(rs);
        self
    }

    pub fn ret_void(&mut self) -> &mut Self {
        self.op(Opcode::RetVoid);
        self
    }

    pub fn call(&mut self, rd: u8, func: u16, args: &[u8]) -> &mut Self {
        self.op(Opcode::Call);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&func.to_le_bytes());
        self.bytes.push(args.len() as u8);
        self.bytes.extend_from_slice(args);
        self
    }

    pub fn call_import(&mut self, rd: u8, import: u16, args: &[u8]) -> &mut Self {
        self.op(Opcode::CallImport);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&import.to_le_bytes());
        self.bytes.push(args.len() as u8);
        self.bytes.extend_from_slice(args);
        self
    }

    /// Appends the extended type blob after an import call.
    pub fn ext_types(&mut self, types: &[ValueType]) -> &mut Self {
        self.bytes.push(0xAA);
        self.bytes.push(types.len() as u8);
        self.bytes.extend(types.iter().map(|t| *t as u8));
        self
    }

    pub fn call_indirect(&mut self, rd: u8, type_idx: u16, rt: u8, args: &[u8]) -> &mut Self {
        self.op(Opcode::CallIndirect);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&type_idx.to_le_bytes());
        self.bytes.push(rt);
        self.bytes.push(args.len() as u8);
        self.bytes.extend_from_slice(args);
        self
    }

    pub fn call_indirect_ptr(&mut self, rd: u8, type_idx: u16, rp: u8, args: &[u8]) -> &mut Self {
        self.op(Opcode::CallIndirectPtr);
        self.bytes.push(rd);
        self.bytes.extend_from_slice(&type_idx.to_le_bytes());
        self.bytes.push(rp);
        self.bytes.push(args.len() as u8);
        self.bytes.extend_from_slice(args);
        self
    }

    pub fn alloca(&mut self, rd: u8, rsize: u8) -> &mut Self {
        self.op(Opcode::Alloca);
        self.bytes.push(rd);
        self.bytes.push(rsize);
        self
    }

    pub fn mem_size(&mut self, rd: u8) -> &mut Self {
        self.op(Opcode::MemSize);
        self.bytes.push(rd);
        self
    }

    pub fn mem_grow(&mut self, rd: u8, rpages: u8) -> &mut Self {
        self.op(Opcode::MemGrow);
        self.bytes.push(rd);
        self.bytes.push(rpages);
        self
    }

    /// Resolves labels and returns the code bytes.
    pub fn finish(&mut self) -> Vec<u8> {
        for (pos, label) in &self.patches {
            let target = *self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("undefined label {}", label));
            // Branch offsets are relative to the end of the offset field.
            let rel = target as i64 - (*pos as i64 + 4);
            self.bytes[*pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        std::mem::take(&mut self.bytes)
    }
}
