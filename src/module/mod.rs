//! Parsed, immutable representation of an ESPB module.
//!
//! A [`Module`] borrows the image it was parsed from; every code and data
//! slice is kept as an `(offset, length)` range into that buffer. Parsing
//! validates all cross-references, so instantiation and execution index into
//! the tables below without re-checking.

use crate::types::{GlobalDescriptor, Limits, MemoryDescriptor, Signature, TableDescriptor};
use crate::{Error, Value, ValueType};
use core::ops::Range;

mod init_expr;
mod parser;

pub(crate) use init_expr::{eval_init_expr, skip_init_expr};

/// Magic at offset 0 of every image: ASCII `ESPB`, little-endian.
pub const MAGIC: u32 = 0x4250_5345;

/// Image versions this runtime accepts.
pub const SUPPORTED_VERSIONS: [u32; 2] = [0x0000_0106, 0x0000_0107];

bitflags::bitflags! {
    /// Feature bits from the image header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Functions may declare more than one return value.
        const MULTI_RETURN = 0x01;
        /// Atomic memory operators.
        const ATOMICS = 0x02;
        /// Exception handling.
        const EH = 0x04;
        /// Platform SIMD.
        const SIMD_PLATFORM = 0x08;
        /// Bulk memory operators.
        const BULK = 0x10;
        /// 128-bit vectors.
        const SIMD_V128 = 0x20;
        /// Shared linear memory.
        const SHARED_MEM = 0x40;
        /// Data-symbol relocations.
        const DATA_SYMBOLS = 0x80;
        /// Automatic callback wiring from `cbmeta`.
        const CALLBACK_AUTO = 0x100;
        /// Pointer marshalling from `immeta`.
        const MARSHALLING_META = 0x200;
    }
}

bitflags::bitflags! {
    /// Resolution flags of a function import.
    ///
    /// The low nibble carries the symbol index for the fast indexed tables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImportFlags: u8 {
        /// Resolve through an indexed table rather than by name.
        const INDEXED = 0x10;
        /// Use the host-registered custom fast table.
        const FAST_CUSTOM = 0x20;
        /// Use the platform (IDF) fast table.
        const FAST_IDF = 0x40;

        const _ = !0;
    }
}

impl ImportFlags {
    /// Symbol index into a fast table, from the low nibble.
    pub fn symbol_index(self) -> usize {
        (self.bits() & 0x0F) as usize
    }
}

/// Tag bit of a 32-bit function reference marking an external host function.
pub const FUNC_REF_CALLBACK_BIT: u32 = 0x8000_0000;
/// Tag bit of a 32-bit function reference marking a data-offset function
/// pointer.
pub const FUNC_REF_DATA_OFFSET_BIT: u32 = 0x4000_0000;

/// Identifiers of the known sections.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[allow(missing_docs)]
pub enum SectionId {
    Types = 1,
    Imports = 2,
    Functions = 3,
    Globals = 4,
    Exports = 5,
    Code = 6,
    Data = 8,
    Relocations = 9,
    CallbackMeta = 10,
    Tables = 11,
    Elements = 12,
    Memory = 14,
    Start = 15,
    MarshalMeta = 17,
    FuncPtrMap = 18,
}

/// One entry of the section directory.
#[derive(Debug, Clone, Copy)]
pub struct SectionEntry {
    /// Section identifier; unknown ids are preserved and ignored.
    pub id: u8,
    /// Byte offset of the section body within the image.
    pub offset: u32,
    /// Byte size of the section body, clamped to the image.
    pub size: u32,
}

/// A function body: a code slice plus its register-window requirement.
#[derive(Debug, Clone)]
pub struct FuncBody {
    /// Number of virtual registers the frame window must provide.
    pub num_regs: u16,
    /// Range of the code bytes within the image.
    pub code: Range<usize>,
    /// Producer marked this function as worth compiling natively.
    pub hot: bool,
}

/// How a global variable receives its initial value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitKind {
    /// Zero-filled.
    Zero,
    /// An inline constant, sized by the global's type.
    Const(Value),
    /// The address of an offset into the module's static data.
    DataOffset(u32),
}

/// A global variable declaration.
#[derive(Debug, Clone)]
pub struct GlobalEntry {
    /// Value type of the global.
    pub value_type: ValueType,
    /// Whether module code may write it.
    pub mutable: bool,
    /// Whether it is marked shared.
    pub shared: bool,
    /// Initializer.
    pub init: InitKind,
}

/// Placement of a data segment.
#[derive(Debug, Clone)]
pub enum SegmentMode {
    /// Copied into linear memory at instantiation.
    Active {
        /// Target memory index; only memory 0 is supported.
        memory_index: u8,
        /// Initializer expression yielding the target offset.
        offset_expr: Range<usize>,
    },
    /// Not placed; available to module-driven initialization. The first
    /// passive segment is copied to offset 0 by convention.
    Passive,
}

/// A data segment.
#[derive(Debug, Clone)]
pub struct DataSegment {
    /// Placement.
    pub mode: SegmentMode,
    /// Range of the payload bytes within the image.
    pub data: Range<usize>,
}

/// An element segment populating the funcref table.
#[derive(Debug, Clone)]
pub struct ElementSegment {
    /// Target table index, `None` for a passive segment.
    pub table_index: Option<u32>,
    /// Initializer expression yielding the starting slot; absent for
    /// passive segments.
    pub offset_expr: Option<Range<usize>>,
    /// Function indices to place.
    pub members: Vec<u32>,
}

/// Kind-specific payload of an import.
#[derive(Debug, Clone)]
pub enum ImportKind {
    /// An imported function.
    Func {
        /// Signature index the callee must satisfy.
        sig_idx: u16,
        /// Resolution scheme.
        flags: ImportFlags,
    },
    /// An imported table.
    Table(TableDescriptor),
    /// An imported linear memory.
    Memory(MemoryDescriptor),
    /// An imported global.
    Global(GlobalDescriptor),
}

/// A single import record.
#[derive(Debug, Clone)]
pub struct Import<'buf> {
    /// Import module name.
    pub module: &'buf str,
    /// Entity name within the module.
    pub name: &'buf str,
    /// Kind-specific descriptor.
    pub kind: ImportKind,
}

/// What an export refers to.
#[derive(Debug, Clone, Copy)]
pub enum ExportKind {
    /// A function, by global function index.
    Func(u32),
    /// A global, by index.
    Global(u32),
    /// The linear memory.
    Memory(u32),
    /// The funcref table.
    Table(u32),
}

/// A single export record.
#[derive(Debug, Clone)]
pub struct Export<'buf> {
    /// Exported name.
    pub name: &'buf str,
    /// Referent.
    pub kind: ExportKind,
}

/// Relocation entry kinds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::TryFromPrimitive)]
pub enum RelocType {
    /// 32-bit absolute address of a data symbol.
    DataAbs32 = 0,
    /// 32-bit absolute address of a global.
    GlobalAbs32 = 1,
    /// 32-bit function address; currently unsupported and skipped.
    FuncAbs32 = 2,
}

/// One relocation directive.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    /// Entry kind; unknown kinds are skipped with a warning.
    pub ty: u8,
    /// Byte offset within the target section.
    pub offset: u32,
    /// Symbol index, interpreted per kind.
    pub symbol: u32,
    /// Constant added to the symbol value.
    pub addend: i32,
}

/// The relocation section: one shared target plus its entries.
#[derive(Debug, Clone)]
pub struct RelocSection {
    /// Target section id shared by all entries: 7 for linear memory,
    /// 4 for globals, 6 for code (unsupported).
    pub target_section: u8,
    /// The directives.
    pub entries: Vec<RelocEntry>,
}

/// One callback-wiring rule of an import (`cbmeta`).
#[derive(Debug, Clone, Copy)]
pub struct CallbackMeta {
    /// Argument slot of the host call that receives the trampoline pointer.
    pub param_idx: u8,
    /// Argument slot carrying the opaque user-data pointer, if any.
    pub user_data_idx: Option<u8>,
    /// Module-local index of the callback target function.
    pub target_func: u16,
}

/// Callback metadata attached to one import.
#[derive(Debug, Clone)]
pub struct ImportCallbacks {
    /// Import index the entries apply to.
    pub import_idx: u16,
    /// The wiring rules.
    pub entries: Vec<CallbackMeta>,
}

/// Direction of a marshalled pointer argument (`immeta`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalDirection {
    /// Host reads: copy module memory into a host buffer before the call.
    In,
    /// Host writes: copy a host buffer back into module memory after the
    /// call.
    Out,
    /// Both.
    InOut,
}

/// How the byte size of a marshalled argument is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalSize {
    /// A constant number of bytes.
    Const(u8),
    /// The value of another argument, by index.
    FromArg(u8),
}

/// Which wrapper services a marshalled argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalHandler {
    /// Copy-in/copy-out around the synchronous call.
    Standard,
    /// OUT data is copied when the wrapped host function completes.
    Async,
}

/// One marshalled argument of an import.
#[derive(Debug, Clone, Copy)]
pub struct MarshalArg {
    /// Argument slot the rule applies to.
    pub arg_index: u8,
    /// Copy direction.
    pub direction: MarshalDirection,
    /// Size rule.
    pub size: MarshalSize,
    /// Servicing wrapper.
    pub handler: MarshalHandler,
}

/// Marshalling metadata attached to one import.
#[derive(Debug, Clone)]
pub struct ImportMarshalling {
    /// Import index the rules apply to.
    pub import_idx: u16,
    /// Per-argument rules.
    pub args: Vec<MarshalArg>,
}

/// One entry of the function-pointer map: a static-data offset that holds
/// the address of a function.
#[derive(Debug, Clone, Copy)]
pub struct FuncPtrEntry {
    /// Offset into static data.
    pub data_offset: u32,
    /// Module-local function index stored there.
    pub func_idx: u16,
}

/// Deserialized module prepared for instantiation.
///
/// The module borrows the image buffer; code and data slices are ranges into
/// it. A `Module` is immutable after parsing and may back any number of
/// instances.
pub struct Module<'buf> {
    pub(crate) buf: &'buf [u8],
    pub(crate) version: u32,
    pub(crate) features: Features,
    pub(crate) sections: Vec<SectionEntry>,
    pub(crate) signatures: Vec<Signature>,
    pub(crate) func_sigs: Vec<u16>,
    pub(crate) bodies: Vec<FuncBody>,
    pub(crate) memory: Option<MemoryDescriptor>,
    pub(crate) memory_import: Option<usize>,
    pub(crate) table: Option<TableDescriptor>,
    pub(crate) globals: Vec<GlobalEntry>,
    pub(crate) data_segments: Vec<DataSegment>,
    pub(crate) element_segments: Vec<ElementSegment>,
    pub(crate) imports: Vec<Import<'buf>>,
    pub(crate) imported_funcs: u32,
    pub(crate) imported_globals: u32,
    pub(crate) exports: Vec<Export<'buf>>,
    pub(crate) relocations: Option<RelocSection>,
    pub(crate) cbmeta: Vec<ImportCallbacks>,
    pub(crate) immeta: Vec<ImportMarshalling>,
    pub(crate) fpmap: Vec<FuncPtrEntry>,
    pub(crate) start_func: Option<u32>,
}

impl<'buf> Module<'buf> {
    /// Parses an ESPB image.
    ///
    /// Pure decode plus validation: the returned module borrows `buf`, and
    /// every signature, function, global, table and segment cross-reference
    /// is checked to be resolvable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] when the image is malformed and
    /// [`Error::Link`] when an index is out of range.
    pub fn parse(buf: &'buf [u8]) -> Result<Module<'buf>, Error> {
        parser::parse(buf)
    }

    /// Image version accepted at parse time.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Feature bits of the image.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Declared function signatures.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Signature of the local function with the given local index.
    pub(crate) fn func_signature(&self, local_idx: u32) -> Option<&Signature> {
        let sig_idx = *self.func_sigs.get(local_idx as usize)?;
        self.signatures.get(sig_idx as usize)
    }

    /// Signature index of the local function with the given local index.
    pub(crate) fn func_sig_idx(&self, local_idx: u32) -> Option<u16> {
        self.func_sigs.get(local_idx as usize).copied()
    }

    /// Number of local (non-imported) functions.
    pub fn num_local_funcs(&self) -> u32 {
        self.func_sigs.len() as u32
    }

    /// Number of imported functions. Global function indices below this
    /// value refer to imports.
    pub fn num_imported_funcs(&self) -> u32 {
        self.imported_funcs
    }

    /// The import records, in declaration order.
    pub fn imports(&self) -> &[Import<'buf>] {
        &self.imports
    }

    /// The export records.
    pub fn exports(&self) -> &[Export<'buf>] {
        &self.exports
    }

    /// Finds an export by name.
    pub fn export_by_name(&self, name: &str) -> Option<&Export<'buf>> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Body of the local function with the given local index.
    pub(crate) fn body(&self, local_idx: u32) -> Option<&FuncBody> {
        self.bodies.get(local_idx as usize)
    }

    /// Code bytes of a body.
    pub(crate) fn code_of(&self, body: &FuncBody) -> &'buf [u8] {
        &self.buf[body.code.clone()]
    }

    /// Raw bytes of a range of the image.
    pub(crate) fn bytes(&self, range: Range<usize>) -> &'buf [u8] {
        &self.buf[range]
    }

    /// Start function, as a global function index.
    pub fn start_func(&self) -> Option<u32> {
        self.start_func
    }

    /// Looks up a static-data offset in the function-pointer map.
    ///
    /// The map is sorted by offset at parse time; this is a binary search
    /// and returns a match only on exact equality.
    pub fn func_ptr_at_offset(&self, data_offset: u32) -> Option<u16> {
        self.fpmap
            .binary_search_by_key(&data_offset, |e| e.data_offset)
            .ok()
            .map(|i| self.fpmap[i].func_idx)
    }

    /// Callback metadata of an import, if any.
    pub(crate) fn callbacks_of_import(&self, import_idx: u16) -> Option<&ImportCallbacks> {
        self.cbmeta.iter().find(|c| c.import_idx == import_idx)
    }

    /// Marshalling metadata of an import, if any.
    pub(crate) fn marshalling_of_import(&self, import_idx: u16) -> Option<&ImportMarshalling> {
        self.immeta.iter().find(|m| m.import_idx == import_idx)
    }
}

impl core::fmt::Debug for Module<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("version", &format_args!("{:#x}", self.version))
            .field("features", &self.features)
            .field("signatures", &self.signatures.len())
            .field("funcs", &self.func_sigs.len())
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .field("data_segments", &self.data_segments.len())
            .finish()
    }
}
