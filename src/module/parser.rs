//! Decoder for the section-structured ESPB image format.
//!
//! The image starts with a fixed header, followed by a directory of 12-byte
//! section entries, followed by the section bodies the directory points at.
//! Every section body is decoded into the typed structures of
//! [`super::Module`]; slices of code and data are kept as ranges into the
//! input buffer.
//!
//! Decoding is strict about cross-references (an out-of-range signature or
//! function index fails the parse) but lenient about the directory itself:
//! an entry whose offset lies outside the buffer is dropped, an entry whose
//! size overruns the buffer is clamped, matching what encoders in the field
//! produce.

use super::{
    skip_init_expr, CallbackMeta, DataSegment, ElementSegment, Export, ExportKind, Features,
    FuncBody, FuncPtrEntry, GlobalEntry, Import, ImportCallbacks, ImportFlags, ImportKind,
    ImportMarshalling, InitKind, MarshalArg, MarshalDirection, MarshalHandler, MarshalSize,
    Module, RelocEntry, RelocSection, SectionEntry, SectionId, SegmentMode, MAGIC,
    SUPPORTED_VERSIONS,
};
use crate::types::{GlobalDescriptor, Limits, MemoryDescriptor, Signature, TableDescriptor};
use crate::{Error, Value, ValueType};

/// Size of the fixed image header.
const HEADER_SIZE: usize = 18;
/// Size of one section directory entry.
const DIR_ENTRY_SIZE: usize = 12;

/// On-wire element type of a funcref table.
const ELEM_TYPE_FUNCREF: u8 = 0x70;

/// Register-count bit marking a function body as HOT.
const BODY_FLAG_HOT: u16 = 0x8000;

const LIMITS_HAS_MAX: u8 = 0x01;
const LIMITS_SHARED: u8 = 0x02;

struct Reader<'buf> {
    buf: &'buf [u8],
    pos: usize,
}

impl<'buf> Reader<'buf> {
    fn new(buf: &'buf [u8], pos: usize) -> Reader<'buf> {
        Reader { buf, pos }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn truncated(what: &str) -> Error {
        Error::Format(format!("truncated {}", what))
    }

    fn read_u8(&mut self, what: &str) -> Result<u8, Error> {
        let b = *self.buf.get(self.pos).ok_or_else(|| Self::truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self, what: &str) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array::<2>(what)?))
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array::<4>(what)?))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32, Error> {
        Ok(i32::from_le_bytes(self.read_array::<4>(what)?))
    }

    fn read_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], Error> {
        let end = self
            .pos
            .checked_add(N)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| Self::truncated(what))?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'buf [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| Self::truncated(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Length-prefixed (u16) UTF-8 name.
    fn read_name(&mut self, what: &str) -> Result<&'buf str, Error> {
        let len = self.read_u16(what)? as usize;
        let bytes = self.read_bytes(len, what)?;
        core::str::from_utf8(bytes)
            .map_err(|_| Error::Format(format!("{} name is not valid UTF-8", what)))
    }

    fn read_value_type(&mut self, what: &str) -> Result<ValueType, Error> {
        let byte = self.read_u8(what)?;
        ValueType::try_from(byte)
            .map_err(|_| Error::Format(format!("invalid value type {:#04x} in {}", byte, what)))
    }

    fn read_limits(&mut self, what: &str) -> Result<Limits, Error> {
        let flags = self.read_u8(what)?;
        let initial = self.read_u32(what)?;
        let maximum = if flags & LIMITS_HAS_MAX != 0 {
            Some(self.read_u32(what)?)
        } else {
            None
        };
        Ok(Limits::new(initial, maximum, flags & LIMITS_SHARED != 0))
    }
}

pub(crate) fn parse(buf: &[u8]) -> Result<Module<'_>, Error> {
    let mut header = Reader::new(buf, 0);
    if buf.len() < HEADER_SIZE {
        return Err(Error::Format("image shorter than header".into()));
    }
    let magic = header.read_u32("header")?;
    if magic != MAGIC {
        return Err(Error::Format(format!("invalid magic {:#010x}", magic)));
    }
    let version = header.read_u32("header")?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(Error::Format(format!("unsupported version {:#010x}", version)));
    }
    let _flags = header.read_u32("header")?;
    let features = Features::from_bits_retain(header.read_u32("header")?);
    let section_count = header.read_u16("header")? as usize;

    let sections = parse_directory(buf, section_count)?;

    let mut module = Module {
        buf,
        version,
        features,
        sections,
        signatures: Vec::new(),
        func_sigs: Vec::new(),
        bodies: Vec::new(),
        memory: None,
        memory_import: None,
        table: None,
        globals: Vec::new(),
        data_segments: Vec::new(),
        element_segments: Vec::new(),
        imports: Vec::new(),
        imported_funcs: 0,
        imported_globals: 0,
        exports: Vec::new(),
        relocations: None,
        cbmeta: Vec::new(),
        immeta: Vec::new(),
        fpmap: Vec::new(),
        start_func: None,
    };

    // Sections are decoded in dependency order, not directory order: types
    // before anything that names a signature, functions before code.
    for id in [
        SectionId::Types,
        SectionId::Imports,
        SectionId::Functions,
        SectionId::Globals,
        SectionId::Memory,
        SectionId::Tables,
        SectionId::Exports,
        SectionId::Code,
        SectionId::Data,
        SectionId::Elements,
        SectionId::Relocations,
        SectionId::CallbackMeta,
        SectionId::MarshalMeta,
        SectionId::FuncPtrMap,
        SectionId::Start,
    ] {
        if let Some(entry) = module.sections.iter().find(|s| s.id == id as u8).copied() {
            let start = entry.offset as usize;
            let end = start + entry.size as usize;
            parse_section(&mut module, id, start, end)?;
        }
    }

    validate(&module)?;
    Ok(module)
}

fn parse_directory(buf: &[u8], count: usize) -> Result<Vec<SectionEntry>, Error> {
    let mut reader = Reader::new(buf, HEADER_SIZE);
    let mut sections = Vec::with_capacity(count);
    for _ in 0..count {
        let id = reader.read_u8("section directory")?;
        let _reserved8 = reader.read_u8("section directory")?;
        let _reserved16 = reader.read_u16("section directory")?;
        let offset = reader.read_u32("section directory")?;
        let mut size = reader.read_u32("section directory")?;

        // An out-of-range offset drops the section; an overlong size is
        // clamped to the buffer.
        if offset as usize > buf.len() {
            log::warn!("dropping section {} with offset {:#x} past the image", id, offset);
            continue;
        }
        if offset as u64 + size as u64 > buf.len() as u64 {
            size = (buf.len() - offset as usize) as u32;
        }
        sections.push(SectionEntry { id, offset, size });
    }

    // Retained entries must not overlap one another (or the directory).
    let dir_end = HEADER_SIZE + count * DIR_ENTRY_SIZE;
    let mut spans: Vec<(u32, u32, u8)> = sections
        .iter()
        .filter(|s| s.size > 0)
        .map(|s| (s.offset, s.offset + s.size, s.id))
        .collect();
    spans.sort_unstable();
    for window in spans.windows(2) {
        if window[0].1 > window[1].0 {
            return Err(Error::Format(format!(
                "sections {} and {} overlap",
                window[0].2, window[1].2
            )));
        }
    }
    if let Some(&(start, _, id)) = spans.first() {
        if (start as usize) < dir_end {
            return Err(Error::Format(format!(
                "section {} overlaps the section directory",
                id
            )));
        }
    }

    Ok(sections)
}

fn parse_section<'buf>(
    module: &mut Module<'buf>,
    id: SectionId,
    start: usize,
    end: usize,
) -> Result<(), Error> {
    let buf: &'buf [u8] = module.buf;
    let mut reader = Reader::new(&buf[..end], start);
    match id {
        SectionId::Types => parse_types(module, &mut reader),
        SectionId::Imports => parse_imports(module, &mut reader),
        SectionId::Functions => parse_functions(module, &mut reader),
        SectionId::Globals => parse_globals(module, &mut reader),
        SectionId::Memory => {
            let limits = reader.read_limits("memory section")?;
            module.memory = Some(MemoryDescriptor::new(limits));
            Ok(())
        }
        SectionId::Tables => {
            let elem_type = reader.read_u8("table section")?;
            if elem_type != ELEM_TYPE_FUNCREF {
                return Err(Error::Format(format!(
                    "unsupported table element type {:#04x}",
                    elem_type
                )));
            }
            let limits = reader.read_limits("table section")?;
            module.table = Some(TableDescriptor::new(limits));
            Ok(())
        }
        SectionId::Exports => parse_exports(module, &mut reader),
        SectionId::Code => parse_code(module, &mut reader),
        SectionId::Data => parse_data(module, &mut reader),
        SectionId::Elements => parse_elements(module, &mut reader),
        SectionId::Relocations => parse_relocations(module, &mut reader),
        SectionId::CallbackMeta => parse_cbmeta(module, &mut reader),
        SectionId::MarshalMeta => parse_immeta(module, &mut reader),
        SectionId::FuncPtrMap => parse_fpmap(module, &mut reader),
        SectionId::Start => {
            module.start_func = Some(reader.read_u32("start section")?);
            Ok(())
        }
    }
}

fn parse_types(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("type section")?;
    for _ in 0..count {
        let param_count = reader.read_u8("signature")? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let ty = reader.read_value_type("signature param")?;
            if ty == ValueType::Void {
                return Err(Error::Format("VOID is not a legal parameter type".into()));
            }
            params.push(ty);
        }
        let return_count = reader.read_u8("signature")? as usize;
        let mut returns = Vec::with_capacity(return_count);
        for _ in 0..return_count {
            let ty = reader.read_value_type("signature return")?;
            if ty == ValueType::Void {
                return Err(Error::Format("VOID is not a legal return type".into()));
            }
            returns.push(ty);
        }
        module.signatures.push(Signature::new(params, returns));
    }
    Ok(())
}

fn parse_imports<'buf>(module: &mut Module<'buf>, reader: &mut Reader<'buf>) -> Result<(), Error> {
    let count = reader.read_u32("import section")?;
    for i in 0..count {
        let module_name = reader.read_name("import module")?;
        let entity_name = reader.read_name("import entity")?;
        let kind_byte = reader.read_u8("import kind")?;
        let kind = match kind_byte {
            0 => {
                let sig_idx = reader.read_u16("import signature")?;
                if sig_idx as usize >= module.signatures.len() {
                    return Err(Error::Link(format!(
                        "import {} references signature {} of {}",
                        i,
                        sig_idx,
                        module.signatures.len()
                    )));
                }
                let flags = ImportFlags::from_bits_retain(reader.read_u8("import flags")?);
                module.imported_funcs += 1;
                ImportKind::Func { sig_idx, flags }
            }
            1 => ImportKind::Table(TableDescriptor::new(reader.read_limits("table import")?)),
            2 => {
                let desc = MemoryDescriptor::new(reader.read_limits("memory import")?);
                module.memory_import = Some(module.imports.len());
                ImportKind::Memory(desc)
            }
            3 => {
                let value_type = reader.read_value_type("global import")?;
                let mutable = reader.read_u8("global import")? != 0;
                let shared = reader.read_u8("global import")? != 0;
                module.imported_globals += 1;
                ImportKind::Global(GlobalDescriptor::new(value_type, mutable, shared))
            }
            other => {
                return Err(Error::Format(format!("invalid import kind {:#04x}", other)))
            }
        };
        module.imports.push(Import {
            module: module_name,
            name: entity_name,
            kind,
        });
    }
    Ok(())
}

fn parse_functions(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("function section")?;
    for i in 0..count {
        let sig_idx = reader.read_u16("function signature index")?;
        if sig_idx as usize >= module.signatures.len() {
            return Err(Error::Link(format!(
                "function {} references signature {} of {}",
                i,
                sig_idx,
                module.signatures.len()
            )));
        }
        module.func_sigs.push(sig_idx);
    }
    Ok(())
}

fn parse_globals(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("global section")?;
    for _ in 0..count {
        let value_type = reader.read_value_type("global")?;
        let mutable = reader.read_u8("global")? != 0;
        let shared = reader.read_u8("global")? != 0;
        let init = match reader.read_u8("global init kind")? {
            0 => InitKind::Zero,
            1 => {
                let bytes = reader.read_bytes(value_type.size(), "global const payload")?;
                InitKind::Const(Value::from_le_slice(value_type, bytes))
            }
            2 => InitKind::DataOffset(reader.read_u32("global data offset")?),
            other => {
                return Err(Error::Format(format!("invalid global init kind {}", other)))
            }
        };
        module.globals.push(GlobalEntry {
            value_type,
            mutable,
            shared,
            init,
        });
    }
    Ok(())
}

fn parse_exports<'buf>(module: &mut Module<'buf>, reader: &mut Reader<'buf>) -> Result<(), Error> {
    let count = reader.read_u32("export section")?;
    for _ in 0..count {
        let name = reader.read_name("export")?;
        let kind_byte = reader.read_u8("export kind")?;
        let index = reader.read_u32("export index")?;
        let kind = match kind_byte {
            0 => ExportKind::Func(index),
            1 => ExportKind::Table(index),
            2 => ExportKind::Memory(index),
            3 => ExportKind::Global(index),
            other => {
                return Err(Error::Format(format!("invalid export kind {:#04x}", other)))
            }
        };
        module.exports.push(Export { name, kind });
    }
    Ok(())
}

fn parse_code(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("code section")?;
    if count as usize != module.func_sigs.len() {
        return Err(Error::Format(format!(
            "code section has {} bodies for {} functions",
            count,
            module.func_sigs.len()
        )));
    }
    for _ in 0..count {
        let total_size = reader.read_u32("function body")? as usize;
        if total_size < 2 {
            return Err(Error::Format("function body shorter than its header".into()));
        }
        let raw_regs = reader.read_u16("register count")?;
        let hot = raw_regs & BODY_FLAG_HOT != 0;
        let num_regs = raw_regs & !BODY_FLAG_HOT;
        let code_len = total_size - 2;
        let code_start = reader.pos();
        reader.read_bytes(code_len, "function body")?;
        module.bodies.push(FuncBody {
            num_regs,
            code: code_start..code_start + code_len,
            hot,
        });
    }
    Ok(())
}

fn parse_data(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("data section")?;
    for i in 0..count {
        let seg_type = reader.read_u8("data segment type")?;
        let mode = match seg_type {
            0 => {
                let memory_index = reader.read_u8("data segment memory index")?;
                if memory_index != 0 {
                    return Err(Error::Link(format!(
                        "data segment {} targets memory {}; only memory 0 exists",
                        i, memory_index
                    )));
                }
                let expr = skip_init_expr(reader.buf, reader.pos())?;
                reader.pos = expr.end;
                SegmentMode::Active {
                    memory_index,
                    offset_expr: expr,
                }
            }
            1 => SegmentMode::Passive,
            other => {
                return Err(Error::Format(format!("invalid data segment type {}", other)))
            }
        };
        let len = reader.read_u32("data segment length")? as usize;
        let data_start = reader.pos();
        reader.read_bytes(len, "data segment payload")?;
        module.data_segments.push(DataSegment {
            mode,
            data: data_start..data_start + len,
        });
    }
    Ok(())
}

fn parse_elements(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("element section")?;
    for i in 0..count {
        let flags = reader.read_u32("element segment flags")?;
        let (table_index, has_expr) = match flags {
            0 => (Some(0), true),
            1 => (None, false),
            2 => {
                let idx = reader.read_u32("element segment table index")?;
                if idx != 0 {
                    return Err(Error::Link(format!(
                        "element segment {} targets table {}; only table 0 exists",
                        i, idx
                    )));
                }
                (Some(idx), true)
            }
            other => {
                return Err(Error::Format(format!(
                    "invalid element segment flags {:#x}",
                    other
                )))
            }
        };
        let offset_expr = if has_expr {
            let expr = skip_init_expr(reader.buf, reader.pos())?;
            reader.pos = expr.end;
            Some(expr)
        } else {
            None
        };
        let elem_type = reader.read_u8("element type")?;
        if elem_type != ELEM_TYPE_FUNCREF {
            return Err(Error::Format(format!(
                "unsupported element type {:#04x}",
                elem_type
            )));
        }
        let member_count = reader.read_u32("element member count")? as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            members.push(reader.read_u32("element member")?);
        }
        module.element_segments.push(ElementSegment {
            table_index,
            offset_expr,
            members,
        });
    }
    Ok(())
}

fn parse_relocations(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let target_section = reader.read_u8("relocation target")?;
    let count = reader.read_u32("relocation count")?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ty = reader.read_u8("relocation type")?;
        let offset = reader.read_u32("relocation offset")?;
        let symbol = reader.read_u32("relocation symbol")?;
        let addend = reader.read_i32("relocation addend")?;
        entries.push(RelocEntry {
            ty,
            offset,
            symbol,
            addend,
        });
    }
    module.relocations = Some(RelocSection {
        target_section,
        entries,
    });
    Ok(())
}

fn parse_cbmeta(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    // A leading signature count is reserved in the format; encoders emit 0.
    let sig_count = reader.read_u8("cbmeta signature count")?;
    if sig_count != 0 {
        log::warn!("cbmeta carries {} inline signatures; ignored", sig_count);
    }
    let import_count = reader.read_u16("cbmeta import count")?;
    for _ in 0..import_count {
        let import_idx = reader.read_u16("cbmeta import index")?;
        let cb_count = reader.read_u8("cbmeta callback count")? as usize;
        let mut entries = Vec::with_capacity(cb_count);
        for _ in 0..cb_count {
            let slots = reader.read_u8("cbmeta entry")?;
            let param_idx = slots & 0x0F;
            let user_nibble = slots >> 4;
            let target = reader.read_u16("cbmeta target")? & 0x3FFF;
            entries.push(CallbackMeta {
                param_idx,
                user_data_idx: (user_nibble != 0x0F).then_some(user_nibble),
                target_func: target,
            });
        }
        module.cbmeta.push(ImportCallbacks {
            import_idx,
            entries,
        });
    }
    Ok(())
}

fn parse_immeta(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let import_count = reader.read_u16("immeta import count")?;
    for _ in 0..import_count {
        let import_idx = reader.read_u16("immeta import index")?;
        let arg_count = reader.read_u8("immeta arg count")? as usize;
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            let arg_index = reader.read_u8("immeta arg index")?;
            let direction = match reader.read_u8("immeta direction")? {
                1 => MarshalDirection::In,
                2 => MarshalDirection::Out,
                3 => MarshalDirection::InOut,
                other => {
                    return Err(Error::Format(format!(
                        "invalid marshalling direction {}",
                        other
                    )))
                }
            };
            let size_kind = reader.read_u8("immeta size kind")?;
            let size_value = reader.read_u8("immeta size value")?;
            let size = match size_kind {
                0 => MarshalSize::Const(size_value),
                1 => MarshalSize::FromArg(size_value),
                other => {
                    return Err(Error::Format(format!(
                        "invalid marshalling size kind {}",
                        other
                    )))
                }
            };
            let handler = match reader.read_u8("immeta handler")? {
                0 => MarshalHandler::Standard,
                1 => MarshalHandler::Async,
                other => {
                    return Err(Error::Format(format!(
                        "invalid marshalling handler {}",
                        other
                    )))
                }
            };
            args.push(MarshalArg {
                arg_index,
                direction,
                size,
                handler,
            });
        }
        module.immeta.push(ImportMarshalling { import_idx, args });
    }
    Ok(())
}

fn parse_fpmap(module: &mut Module<'_>, reader: &mut Reader<'_>) -> Result<(), Error> {
    let count = reader.read_u32("function-pointer map count")?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let data_offset = reader.read_u32("function-pointer map offset")?;
        let func_idx = reader.read_u16("function-pointer map index")?;
        entries.push(FuncPtrEntry {
            data_offset,
            func_idx,
        });
    }
    // Sorted for binary search; duplicate offsets would make lookups
    // ambiguous.
    entries.sort_by_key(|e| e.data_offset);
    for window in entries.windows(2) {
        if window[0].data_offset == window[1].data_offset {
            return Err(Error::Format(format!(
                "function-pointer map has duplicate offset {:#x}",
                window[0].data_offset
            )));
        }
    }
    module.fpmap = entries;
    Ok(())
}

fn validate(module: &Module<'_>) -> Result<(), Error> {
    let total_funcs = module.imported_funcs + module.num_local_funcs();
    let total_globals = module.imported_globals + module.globals.len() as u32;

    if !module.func_sigs.is_empty() && module.bodies.len() != module.func_sigs.len() {
        return Err(Error::Format(format!(
            "{} functions but {} bodies",
            module.func_sigs.len(),
            module.bodies.len()
        )));
    }

    for export in &module.exports {
        let (index, limit, what) = match export.kind {
            ExportKind::Func(i) => (i, total_funcs, "function"),
            ExportKind::Global(i) => (i, total_globals, "global"),
            ExportKind::Memory(i) => (i, 1, "memory"),
            ExportKind::Table(i) => (i, 1, "table"),
        };
        if index >= limit {
            return Err(Error::Link(format!(
                "export {} references {} {} of {}",
                export.name, what, index, limit
            )));
        }
    }

    for segment in &module.element_segments {
        for &member in &segment.members {
            if member >= total_funcs {
                return Err(Error::Link(format!(
                    "element segment references function {} of {}",
                    member, total_funcs
                )));
            }
        }
    }

    for entry in &module.fpmap {
        if entry.func_idx as u32 >= module.num_local_funcs() {
            return Err(Error::Link(format!(
                "function-pointer map references local function {} of {}",
                entry.func_idx,
                module.num_local_funcs()
            )));
        }
    }

    for cb in &module.cbmeta {
        if cb.import_idx as usize >= module.imports.len() {
            return Err(Error::Link(format!(
                "cbmeta references import {} of {}",
                cb.import_idx,
                module.imports.len()
            )));
        }
        for entry in &cb.entries {
            if entry.target_func as u32 >= module.num_local_funcs() {
                return Err(Error::Link(format!(
                    "cbmeta references local function {} of {}",
                    entry.target_func,
                    module.num_local_funcs()
                )));
            }
        }
    }

    for im in &module.immeta {
        if im.import_idx as usize >= module.imports.len() {
            return Err(Error::Link(format!(
                "immeta references import {} of {}",
                im.import_idx,
                module.imports.len()
            )));
        }
    }

    if let Some(start) = module.start_func {
        if start >= total_funcs {
            return Err(Error::Link(format!(
                "start function {} of {}",
                start, total_funcs
            )));
        }
    }

    Ok(())
}
