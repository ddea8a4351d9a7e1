//! Instantiation: turning a parsed [`Module`] into a runnable [`Instance`].
//!
//! The steps run in a fixed order — linear memory, globals, table, import
//! resolution, relocations, data segments, heap registration, element
//! segments, start function — and failure at any step drops the partially
//! built instance, releasing everything acquired so far.

use crate::ffi::async_wrap::WrapperRegistry;
use crate::ffi::callback::CallbackRegistry;
use crate::global::GlobalsInstance;
use crate::heap::SandboxHeap;
use crate::jit::predecode::BaselineGenerator;
use crate::jit::{CodeGenerator, JitCache};
use crate::memory::MemoryInstance;
use crate::memory_units::Pages;
use crate::module::{
    eval_init_expr, ExportKind, ImportKind, Module, RelocType, SegmentMode,
};
use crate::registry::{HostFnPtr, HostSymbol, SymbolRegistry};
use crate::runner::{self, ExecutionContext};
use crate::table::TableInstance;
use crate::types::GlobalDescriptor;
use crate::value::Value;
use crate::{Config, Error, TrapCode, ValueType};
use spin::Mutex;

/// Relocation target: linear memory.
const RELOC_TARGET_MEMORY: u8 = 7;
/// Relocation target: the globals buffer.
const RELOC_TARGET_GLOBALS: u8 = 4;
/// Relocation target: code. Unsupported; entries are skipped with a
/// warning.
const RELOC_TARGET_CODE: u8 = 6;

/// Mutable runtime image of a [`Module`].
///
/// Owns linear memory, globals, the table, resolved imports, the sandbox
/// heap, the JIT cache and the callback/async-wrapper registries. Teardown
/// releases everything in reverse dependency order: the declaration order
/// of the fields below is what the drop glue follows, callbacks first,
/// memory last.
///
/// Once a callback trampoline has been created the instance address is
/// captured in its closure record; keep the instance in place (boxed or
/// otherwise unmoved) from the first host call onwards.
pub struct Instance<'m> {
    // Dropped first: records referencing the instance and host-visible
    // scratch.
    callbacks: CallbackRegistry,
    async_wrappers: WrapperRegistry,
    jit_cache: JitCache,
    code_gen: Box<dyn CodeGenerator>,
    heap: SandboxHeap,
    table: Option<TableInstance>,
    globals: GlobalsInstance,
    memory: MemoryInstance,
    resolved_funcs: Vec<Option<HostFnPtr>>,
    resolved_globals: Vec<Option<*mut u8>>,
    imported_global_meta: Vec<(usize, GlobalDescriptor)>,
    static_data_end: u32,
    first_passive_size: u32,
    grow_lock: Mutex<()>,
    config: Config,
    module: &'m Module<'m>,
}

impl<'m> Instance<'m> {
    /// Instantiates `module`, resolving imports against `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Link`] for unresolved function or global imports,
    /// [`Error::Instantiation`] for allocation failures, invalid segment
    /// offsets and start-function traps.
    pub fn instantiate(
        module: &'m Module<'m>,
        registry: &SymbolRegistry,
        config: Config,
    ) -> Result<Instance<'m>, Error> {
        // Step 1: linear memory, host-provided when imported.
        let memory = Self::build_memory(module, registry, &config)?;

        // Step 2: globals buffer and offset table.
        let globals = GlobalsInstance::alloc(&module.globals)?;

        // Step 3: the funcref table.
        let table = match &module.table {
            Some(desc) => Some(TableInstance::alloc(desc.initial(), desc.maximum())?),
            None => None,
        };

        // Step 4: import resolution. Unresolved functions and globals are
        // fatal.
        let mut resolved_funcs = vec![None; module.imports().len()];
        let mut resolved_globals = vec![None; module.imports().len()];
        let mut imported_global_meta = Vec::new();
        for (i, import) in module.imports().iter().enumerate() {
            match &import.kind {
                ImportKind::Func { .. } => match registry.resolve(import) {
                    Some(HostSymbol::Func(ptr)) => resolved_funcs[i] = Some(ptr),
                    Some(_) => {
                        return Err(Error::Link(format!(
                            "import {}.{} resolved to a non-function symbol",
                            import.module, import.name
                        )))
                    }
                    None => {
                        return Err(Error::Link(format!(
                            "unresolved function import {}.{}",
                            import.module, import.name
                        )))
                    }
                },
                ImportKind::Global(desc) => match registry.resolve(import) {
                    Some(HostSymbol::Global(ptr)) => {
                        resolved_globals[i] = Some(ptr);
                        imported_global_meta.push((i, *desc));
                    }
                    Some(_) => {
                        return Err(Error::Link(format!(
                            "import {}.{} resolved to a non-global symbol",
                            import.module, import.name
                        )))
                    }
                    None => {
                        return Err(Error::Link(format!(
                            "unresolved global import {}.{}",
                            import.module, import.name
                        )))
                    }
                },
                ImportKind::Memory(_) => {
                    // Consumed by step 1.
                }
                ImportKind::Table(_) => {
                    return Err(Error::Link(format!(
                        "table import {}.{} is not supported",
                        import.module, import.name
                    )))
                }
            }
        }

        let mut instance = Instance {
            callbacks: CallbackRegistry::new(),
            async_wrappers: WrapperRegistry::new(),
            jit_cache: JitCache::new(),
            code_gen: Box::new(BaselineGenerator::new()),
            heap: SandboxHeap::new(),
            table,
            globals,
            memory,
            resolved_funcs,
            resolved_globals,
            imported_global_meta,
            static_data_end: 0,
            first_passive_size: 0,
            grow_lock: Mutex::new(()),
            config,
            module,
        };

        // Step 5: relocations.
        instance.apply_relocations()?;

        // Step 6: active data segments, plus the first passive segment at
        // offset 0 (the convention data-offset globals rely on).
        instance.initialize_data_segments()?;

        // Step 7: the sandbox heap claims the tail of linear memory above
        // the static data image.
        let heap_start = (instance.static_data_end + 7) & !7;
        let memory_size = instance.memory.size_bytes() as u32;
        if heap_start < memory_size {
            instance.heap.add_region(heap_start, memory_size)?;
        }

        // Step 8: element segments.
        instance.initialize_element_segments()?;

        // Step 9: the start function.
        if let Some(start) = module.start_func() {
            let mut ctx = ExecutionContext::new(&instance.config);
            let mut result = None;
            instance
                .execute(&mut ctx, start, &[], &mut result)
                .map_err(|e| Error::Instantiation(format!("start function failed: {}", e)))?;
        }

        Ok(instance)
    }

    fn build_memory(
        module: &Module<'_>,
        registry: &SymbolRegistry,
        config: &Config,
    ) -> Result<MemoryInstance, Error> {
        if let Some(import_idx) = module.memory_import {
            let import = &module.imports()[import_idx];
            return match registry.resolve(import) {
                Some(HostSymbol::Memory { ptr, len }) => {
                    Ok(unsafe { MemoryInstance::from_host(ptr, len) })
                }
                Some(_) => Err(Error::Link(format!(
                    "import {}.{} resolved to a non-memory symbol",
                    import.module, import.name
                ))),
                None => Err(Error::Link(format!(
                    "unresolved memory import {}.{}",
                    import.module, import.name
                ))),
            };
        }

        let declared = module.memory.map(|m| m.initial()).unwrap_or(0);
        let effective = declared
            .max(config.min_memory_pages)
            .min(config.max_memory_pages);
        let maximum = module
            .memory
            .and_then(|m| m.maximum())
            .unwrap_or(config.max_memory_pages)
            .min(config.max_memory_pages);
        MemoryInstance::alloc(
            Pages(effective as usize),
            Some(Pages(maximum.max(effective) as usize)),
        )
    }

    fn apply_relocations(&mut self) -> Result<(), Error> {
        let Some(relocs) = &self.module.relocations else {
            return Ok(());
        };
        match relocs.target_section {
            RELOC_TARGET_MEMORY | RELOC_TARGET_GLOBALS => {}
            RELOC_TARGET_CODE => {
                log::warn!("relocations against the code section are unsupported; skipped");
                return Ok(());
            }
            other => {
                log::warn!("relocations against unknown section {}; skipped", other);
                return Ok(());
            }
        }

        let imported_globals = self.module.imported_globals;
        for entry in &relocs.entries {
            let value = match RelocType::try_from(entry.ty) {
                Ok(RelocType::DataAbs32) => {
                    if entry.symbol != 0 {
                        log::warn!("data relocation symbol {} is unsupported; skipped", entry.symbol);
                        continue;
                    }
                    // Data symbol 0 is the memory base, offset zero.
                    0u32
                }
                Ok(RelocType::GlobalAbs32) => {
                    if entry.symbol < imported_globals {
                        let ordinal = entry.symbol as usize;
                        let (import_idx, _) = self.imported_global_meta[ordinal];
                        match self.resolved_globals[import_idx] {
                            Some(ptr) => ptr as u32,
                            None => {
                                return Err(Error::Link(format!(
                                    "relocation references unresolved global {}",
                                    entry.symbol
                                )))
                            }
                        }
                    } else {
                        self.globals
                            .offset_of(entry.symbol - imported_globals)
                            .ok_or_else(|| {
                                Error::Link(format!(
                                    "relocation references global {} of {}",
                                    entry.symbol,
                                    imported_globals as usize + self.globals.len()
                                ))
                            })?
                    }
                }
                Ok(RelocType::FuncAbs32) => {
                    log::warn!("function relocation at {:#x} is unsupported; skipped", entry.offset);
                    continue;
                }
                Err(_) => {
                    log::warn!("unknown relocation type {}; skipped", entry.ty);
                    continue;
                }
            };

            let word = (value as i64).wrapping_add(entry.addend as i64) as u32;
            match relocs.target_section {
                RELOC_TARGET_MEMORY => self
                    .memory
                    .set(entry.offset, &word.to_le_bytes())
                    .map_err(|_| {
                        Error::Instantiation(format!(
                            "relocation offset {:#x} outside linear memory",
                            entry.offset
                        ))
                    })?,
                RELOC_TARGET_GLOBALS => self.globals.patch_u32(entry.offset, word)?,
                _ => unreachable!("filtered above"),
            }
        }
        Ok(())
    }

    fn initialize_data_segments(&mut self) -> Result<(), Error> {
        let module = self.module;
        let mut static_end = 0u32;
        let mut saw_passive = false;
        for (i, segment) in module.data_segments.iter().enumerate() {
            let bytes = module.bytes(segment.data.clone());
            let offset = match &segment.mode {
                SegmentMode::Active { offset_expr, .. } => {
                    let expr = module.bytes(offset_expr.clone());
                    eval_init_expr(expr, &|idx| self.global_value_for_init(idx))?
                }
                SegmentMode::Passive => {
                    if saw_passive {
                        continue;
                    }
                    saw_passive = true;
                    self.first_passive_size = bytes.len() as u32;
                    0
                }
            };
            if bytes.is_empty() {
                continue;
            }
            self.memory.set(offset, bytes).map_err(|_| {
                Error::Instantiation(format!(
                    "data segment {} of {} bytes does not fit at offset {:#x}",
                    i,
                    bytes.len(),
                    offset
                ))
            })?;
            static_end = static_end.max(offset + bytes.len() as u32);
        }
        self.static_data_end = self.static_data_end.max(static_end);
        Ok(())
    }

    fn initialize_element_segments(&mut self) -> Result<(), Error> {
        let module = self.module;
        for (i, segment) in module.element_segments.iter().enumerate() {
            let Some(offset_expr) = &segment.offset_expr else {
                continue;
            };
            let table = self.table.as_ref().ok_or_else(|| {
                Error::Instantiation(format!("element segment {} without a table", i))
            })?;
            let expr = module.bytes(offset_expr.clone());
            let offset = eval_init_expr(expr, &|idx| self.global_value_for_init(idx))?;
            for (j, &member) in segment.members.iter().enumerate() {
                table
                    .set(offset + j as u32, Some(member))
                    .map_err(|_| {
                        Error::Instantiation(format!("element segment {} does not fit", i))
                    })?;
            }
        }
        Ok(())
    }

    /// Global value resolver for initializer expressions.
    fn global_value_for_init(&self, index: u32) -> Option<Value> {
        self.global_get(index).ok()
    }

    /// The module backing this instance.
    pub fn module(&self) -> &'m Module<'m> {
        self.module
    }

    /// The runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Linear memory.
    pub fn memory(&self) -> &MemoryInstance {
        &self.memory
    }

    /// The sandbox heap over the memory tail.
    pub fn heap(&self) -> &SandboxHeap {
        &self.heap
    }

    /// The funcref table, if the module declares one.
    pub fn table(&self) -> Option<&TableInstance> {
        self.table.as_ref()
    }

    /// The compiled-code cache.
    pub fn jit_cache(&self) -> &JitCache {
        &self.jit_cache
    }

    /// End of the static data image in linear memory.
    pub fn static_data_end(&self) -> u32 {
        self.static_data_end
    }

    /// Size of the first passive data segment, recorded at instantiation.
    pub fn first_passive_size(&self) -> u32 {
        self.first_passive_size
    }

    pub(crate) fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub(crate) fn async_wrappers(&self) -> &WrapperRegistry {
        &self.async_wrappers
    }

    /// Resolved host address of a function import.
    pub(crate) fn resolved_func_ptr(&self, import_idx: u16) -> Option<HostFnPtr> {
        self.resolved_funcs.get(import_idx as usize).copied().flatten()
    }

    /// Reads a global in the combined index space: imports first, then the
    /// module's own globals.
    pub(crate) fn global_get(&self, index: u32) -> Result<Value, TrapCode> {
        let imported = self.module.imported_globals;
        if index < imported {
            return self.read_imported_global(index);
        }
        self.globals.get(index - imported)
    }

    /// Writes a global in the combined index space.
    pub(crate) fn global_set(&self, index: u32, value: Value) -> Result<(), TrapCode> {
        let imported = self.module.imported_globals;
        if index < imported {
            return self.write_imported_global(index, value);
        }
        self.globals.set(index - imported, value)
    }

    fn read_imported_global(&self, ordinal: u32) -> Result<Value, TrapCode> {
        let (import_idx, desc) = *self
            .imported_global_meta
            .get(ordinal as usize)
            .ok_or(TrapCode::InvalidOperand)?;
        let ptr = self.resolved_globals[import_idx].ok_or(TrapCode::InvalidOperand)?;
        let ty = desc.value_type();
        let mut bytes = [0u8; 16];
        // The resolver guaranteed the address; size comes from the import
        // descriptor.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), ty.size());
        }
        Ok(Value::from_le_slice(ty, &bytes[..ty.size()]))
    }

    fn write_imported_global(&self, ordinal: u32, value: Value) -> Result<(), TrapCode> {
        let (import_idx, desc) = *self
            .imported_global_meta
            .get(ordinal as usize)
            .ok_or(TrapCode::InvalidOperand)?;
        if !desc.is_mutable() {
            return Err(TrapCode::InvalidOperand);
        }
        if value.value_type() != desc.value_type() {
            return Err(TrapCode::TypeMismatch);
        }
        let ptr = self.resolved_globals[import_idx].ok_or(TrapCode::InvalidOperand)?;
        let ty = desc.value_type();
        let mut bytes = [0u8; 16];
        value.write_le(&mut bytes[..ty.size()]);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, ty.size());
        }
        Ok(())
    }

    /// Grows linear memory by `pages`, serialized by the instance mutex,
    /// and hands the new span to the sandbox heap.
    ///
    /// Returns the previous size in pages.
    pub fn memory_grow(&self, pages: u32) -> Result<u32, Error> {
        let _guard = self.grow_lock.lock();
        let old_bytes = self.memory.size_bytes() as u32;
        let prev = self.memory.grow(Pages(pages as usize))?;
        let new_bytes = self.memory.size_bytes() as u32;
        if new_bytes > old_bytes {
            self.heap.add_region(old_bytes, new_bytes)?;
        }
        Ok(prev.0 as u32)
    }

    /// Services a module `malloc`: an aligned allocation from the sandbox
    /// heap. The returned offset always lies within linear memory.
    pub fn heap_alloc(&self, size: u32, align: u32) -> Result<u32, Error> {
        self.heap.alloc(size, align)
    }

    /// Services a module `free`.
    pub fn heap_free(&self, offset: u32) -> Result<(), Error> {
        self.heap.free(offset)
    }

    /// Services a module `realloc`, copying the old contents when the
    /// allocation moves.
    pub fn heap_realloc(&self, offset: u32, new_size: u32) -> Result<u32, Error> {
        let (new_offset, copy) = self.heap.realloc(offset, new_size)?;
        if new_offset != offset && copy > 0 {
            let bytes = self
                .memory
                .get(offset, copy as usize)
                .map_err(|_| Error::Memory("realloc source out of bounds".into()))?;
            self.memory
                .set(new_offset, &bytes)
                .map_err(|_| Error::Memory("realloc target out of bounds".into()))?;
        }
        Ok(new_offset)
    }

    /// Executes the function with global index `func_idx` on `ctx`.
    ///
    /// The tiered dispatch: a cached compiled body is entered directly; a
    /// HOT body is compiled on first entry and the result installed in the
    /// cache; everything else (and every compile failure) goes to the
    /// interpreter. Imported functions are rejected — this entry point is
    /// for module code only.
    ///
    /// A trap unwinds every frame the call chain pushed before it
    /// surfaces.
    pub fn execute(
        &self,
        ctx: &mut ExecutionContext,
        func_idx: u32,
        args: &[Value],
        result: &mut Option<Value>,
    ) -> Result<(), Error> {
        let entry_depth = ctx.depth();
        match self.dispatch(ctx, func_idx, args, false) {
            Ok(value) => {
                *result = value;
                Ok(())
            }
            Err(err) => {
                ctx.unwind_to(self, entry_depth);
                Err(err)
            }
        }
    }

    /// JIT-only variant of [`execute`](Self::execute): a compilation
    /// failure is returned instead of falling back to the interpreter.
    /// Used from inside native code, where re-entering the interpreter is
    /// not allowed.
    pub fn execute_jit_only(
        &self,
        ctx: &mut ExecutionContext,
        func_idx: u32,
        args: &[Value],
        result: &mut Option<Value>,
    ) -> Result<(), Error> {
        let entry_depth = ctx.depth();
        match self.dispatch(ctx, func_idx, args, true) {
            Ok(value) => {
                *result = value;
                Ok(())
            }
            Err(err) => {
                ctx.unwind_to(self, entry_depth);
                Err(err)
            }
        }
    }

    fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        func_idx: u32,
        args: &[Value],
        jit_only: bool,
    ) -> Result<Option<Value>, Error> {
        let imported = self.module.num_imported_funcs();
        if func_idx < imported {
            return Err(TrapCode::InvalidFuncIndex(func_idx).into());
        }
        let local = func_idx - imported;
        let body = self
            .module
            .body(local)
            .ok_or(TrapCode::InvalidFuncIndex(func_idx))?;

        if self.jit_cache.lookup(local).is_none() && body.hot {
            match self.code_gen.compile(self.module, local) {
                Ok(compiled) => self.jit_cache.insert(local, compiled),
                Err(err) if jit_only => return Err(err),
                Err(err) => {
                    log::debug!(
                        "native compile of function {} failed ({}); interpreting",
                        local,
                        err
                    );
                }
            }
        } else if jit_only && self.jit_cache.lookup(local).is_none() {
            return Err(Error::Jit(format!(
                "function {} is neither compiled nor HOT",
                local
            )));
        }

        runner::call_local_entry(self, ctx, local, args, false).map_err(Error::from)
    }

    /// Invokes an exported function by name.
    ///
    /// Arguments are type-checked against the export's signature; the
    /// results buffer must hold at least as many slots as the signature
    /// declares returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Function`] when there is no such export, it is not
    /// a function, or the arguments do not match; execution traps surface
    /// as [`Error::Trap`].
    pub fn invoke_export(
        &self,
        name: &str,
        args: &[Value],
        results: &mut [Value],
    ) -> Result<(), Error> {
        let export = self
            .module
            .export_by_name(name)
            .ok_or_else(|| Error::Function(format!("module has no export {}", name)))?;
        let ExportKind::Func(func_idx) = export.kind else {
            return Err(Error::Function(format!("export {} is not a function", name)));
        };

        let imported = self.module.num_imported_funcs();
        if func_idx < imported {
            return Err(Error::Function(format!(
                "export {} re-exports an import and cannot be entered",
                name
            )));
        }
        let sig = self
            .module
            .func_signature(func_idx - imported)
            .ok_or_else(|| Error::Function(format!("export {} has no signature", name)))?;
        check_function_args(sig.params(), args)
            .map_err(|msg| Error::Function(format!("export {}: {}", name, msg)))?;
        if results.len() < sig.returns().len() {
            return Err(Error::Function(format!(
                "export {} returns {} values, buffer holds {}",
                name,
                sig.returns().len(),
                results.len()
            )));
        }

        let mut ctx = ExecutionContext::new(&self.config);
        let mut result = None;
        self.execute(&mut ctx, func_idx, args, &mut result)?;
        if let (Some(value), Some(slot)) = (result, results.first_mut()) {
            *slot = value;
        }
        Ok(())
    }
}

impl core::fmt::Debug for Instance<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module)
            .field("memory_bytes", &self.memory.size_bytes())
            .field("static_data_end", &self.static_data_end)
            .field("jit_entries", &self.jit_cache.len())
            .field("live_callbacks", &self.callbacks.len())
            .field("live_wrappers", &self.async_wrappers.len())
            .finish()
    }
}

fn check_function_args(params: &[ValueType], args: &[Value]) -> Result<(), String> {
    if params.len() != args.len() {
        return Err(format!(
            "expected {} arguments, got {}",
            params.len(),
            args.len()
        ));
    }
    for (i, (param, arg)) in params.iter().zip(args).enumerate() {
        if arg.value_type() != *param {
            return Err(format!(
                "argument {} has type {:?}, expected {:?}",
                i,
                arg.value_type(),
                param
            ));
        }
    }
    Ok(())
}
