//! Host symbol registry: how imports find native functions, globals and the
//! optional host-provided memory.
//!
//! Two resolution paths exist, selected per import by its flags byte:
//!
//! - **Named tables**, one per module number, searched linearly by entity
//!   name. Registration is idempotent; the last table registered for a
//!   module number wins.
//! - **Fast indexed tables**: two flat arrays (`idf_fast` and
//!   `custom_fast`) indexed by the symbol index the import flags carry. A
//!   `None` slot is a disabled symbol; out-of-range resolves to `None`.
//!
//! Resolution is synchronous and side-effect-free.

use crate::module::{Import, ImportFlags, ImportKind};
use spin::Mutex;
use std::collections::BTreeMap;

/// Number of slots in each fast indexed table. The symbol index travels in
/// the low nibble of the import flags byte, so 16 is the addressable range.
pub const FAST_TABLE_SLOTS: usize = 16;

/// Address of a host function, as registered by the embedder.
pub type HostFnPtr = *const ();

/// A host entity an import can bind to.
#[derive(Debug, Clone, Copy)]
pub enum HostSymbol {
    /// A native function entry point.
    Func(HostFnPtr),
    /// The host address of a global variable.
    Global(*mut u8),
    /// A host-provided linear memory region.
    Memory {
        /// Base of the region.
        ptr: *mut u8,
        /// Length in bytes.
        len: usize,
    },
}

/// A named symbol table for one module number.
#[derive(Debug, Default)]
pub struct SymbolTable {
    module_name: Option<String>,
    entries: Vec<(String, HostSymbol)>,
}

impl SymbolTable {
    /// Creates an empty table matching any import module name.
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Creates an empty table that only serves imports naming `module`.
    pub fn for_module(module: &str) -> SymbolTable {
        SymbolTable {
            module_name: Some(module.to_string()),
            entries: Vec::new(),
        }
    }

    /// Adds or replaces a named symbol.
    pub fn define(mut self, name: &str, symbol: HostSymbol) -> SymbolTable {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = symbol;
        } else {
            self.entries.push((name.to_string(), symbol));
        }
        self
    }

    fn lookup(&self, module: &str, name: &str) -> Option<HostSymbol> {
        if let Some(expected) = &self.module_name {
            if expected != module {
                return None;
            }
        }
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

/// The registry the instantiator resolves imports against.
pub struct SymbolRegistry {
    named: Mutex<BTreeMap<u16, SymbolTable>>,
    idf_fast: Mutex<[Option<HostFnPtr>; FAST_TABLE_SLOTS]>,
    custom_fast: Mutex<[Option<HostFnPtr>; FAST_TABLE_SLOTS]>,
}

// Registered symbols are code and data addresses the host guarantees stay
// valid; the registry itself serializes all access through its mutexes.
unsafe impl Send for SymbolRegistry {}
unsafe impl Sync for SymbolRegistry {}

impl SymbolRegistry {
    /// Creates an empty registry.
    pub fn new() -> SymbolRegistry {
        SymbolRegistry {
            named: Mutex::new(BTreeMap::new()),
            idf_fast: Mutex::new([None; FAST_TABLE_SLOTS]),
            custom_fast: Mutex::new([None; FAST_TABLE_SLOTS]),
        }
    }

    /// Registers the named table for `module_num`, replacing any previous
    /// registration for that number.
    pub fn register_table(&self, module_num: u16, table: SymbolTable) {
        self.named.lock().insert(module_num, table);
    }

    /// Enables a slot of the platform fast table. Out-of-range indices are
    /// ignored.
    pub fn register_fast_idf(&self, index: usize, func: HostFnPtr) {
        if let Some(slot) = self.idf_fast.lock().get_mut(index) {
            *slot = Some(func);
        }
    }

    /// Enables a slot of the custom fast table. Out-of-range indices are
    /// ignored.
    pub fn register_fast_custom(&self, index: usize, func: HostFnPtr) {
        if let Some(slot) = self.custom_fast.lock().get_mut(index) {
            *slot = Some(func);
        }
    }

    /// Resolves one import to a host symbol.
    ///
    /// Function imports flagged INDEXED go through a fast table selected by
    /// the FAST_CUSTOM/FAST_IDF flag; everything else is looked up by name
    /// across the named tables in module-number order.
    pub fn resolve(&self, import: &Import<'_>) -> Option<HostSymbol> {
        if let ImportKind::Func { flags, .. } = import.kind {
            if flags.contains(ImportFlags::INDEXED) {
                return self.resolve_indexed(flags).map(HostSymbol::Func);
            }
        }
        self.named
            .lock()
            .values()
            .find_map(|table| table.lookup(import.module, import.name))
    }

    fn resolve_indexed(&self, flags: ImportFlags) -> Option<HostFnPtr> {
        let index = flags.symbol_index();
        if flags.contains(ImportFlags::FAST_CUSTOM) {
            *self.custom_fast.lock().get(index)?
        } else if flags.contains(ImportFlags::FAST_IDF) {
            *self.idf_fast.lock().get(index)?
        } else {
            None
        }
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
