//! The engine and module compilation pipeline.
//!
//! `Module::compile` runs decode → lower → per-function native compile,
//! places everything into one code segment (unwind stub, host-call shims,
//! entry trampolines, function bodies with their trampoline islands),
//! resolves the call-site relocations, and flips the segment executable.
//! Compiled code is only valid while the owning engine value lives.

use super::signal;
use super::trap::{Trap, TrapKind};
use crate::config::EngineConfig;
use crate::ir::{lower_function, LoweredFunction};
use crate::jit::memory::CodeSegment;
use crate::jit::{self, CompileEnv, CompileError};
use crate::module::{decode_module, DecodeError, FuncType, Module};
use crate::runtime::context::{EXIT_CANCELED_BIT, EXIT_SET_BIT, SIGNAL_SITE_BIT};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// The engine: configuration, the type-ID interner shared by every
/// module compiled through it, the exit cell guest code polls at call
/// boundaries, and ownership of the executable segments. Compilation and
/// invocation both take the engine by reference; there are no
/// process-wide singletons beyond the OS fault handler.
pub struct Engine {
    config: EngineConfig,
    /// Structural signature → id. Equal signatures share an id across
    /// modules, which is what call_indirect compares.
    types: Mutex<Vec<FuncType>>,
    /// 0 = unset, otherwise `EXIT_SET_BIT | code`.
    exit_cell: Arc<AtomicU64>,
    /// Segments adopted from every module compiled through this engine.
    segments: Mutex<Vec<Arc<CodeSegment>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        signal::install_handler();
        Engine {
            config,
            types: Mutex::new(Vec::new()),
            exit_cell: Arc::new(AtomicU64::new(0)),
            segments: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Instantiation consumes the configured pre-opens.
    pub(crate) fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// Intern a signature, returning its engine-wide id.
    pub(crate) fn intern_type(&self, ty: &FuncType) -> u64 {
        let mut types = self.types.lock().unwrap();
        match types.iter().position(|t| t == ty) {
            Some(i) => i as u64,
            None => {
                types.push(ty.clone());
                (types.len() - 1) as u64
            }
        }
    }

    /// Take shared ownership of a freshly compiled segment.
    pub(crate) fn adopt_segment(&self, segment: Arc<CodeSegment>) {
        self.segments.lock().unwrap().push(segment);
    }

    pub(crate) fn exit_cell(&self) -> &Arc<AtomicU64> {
        &self.exit_cell
    }

    /// Cooperative cancellation: every instance of this engine unwinds
    /// with a canceled exit at its next call boundary.
    pub fn cancel(&self) {
        self.exit_cell
            .store(EXIT_SET_BIT | EXIT_CANCELED_BIT, Ordering::Release);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

/// A module compiled to native code, ready to instantiate.
pub struct CompiledModule {
    pub(crate) module: Module,
    pub(crate) segment: Arc<CodeSegment>,
    /// Segment offset of each function's entry (host shims for imports).
    pub(crate) func_offsets: Vec<usize>,
    /// Per-signature entry trampolines, keyed by type index.
    pub(crate) entry_stubs: HashMap<u32, usize>,
    pub(crate) exit_stub_offset: usize,
    /// Module type index → interned type id.
    pub(crate) type_ids: Vec<u64>,
    /// Global index → slot in the globals array.
    pub(crate) global_slots: Vec<u32>,
    pub(crate) globals_len: u32,
    /// Trap site id → source byte offset.
    pub(crate) trap_positions: Vec<u64>,
    /// Sorted (segment code offset, source offset) for faultable accesses.
    pub(crate) pc_map: Vec<(usize, u64)>,
}

fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

impl CompiledModule {
    /// Compile a binary module for this engine.
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<CompiledModule, ModuleError> {
        let module = decode_module(bytes)?;

        // Type identity comes from the engine's interner, so structurally
        // equal signatures share an id across every module it compiles.
        let type_ids: Vec<u64> = module
            .types
            .iter()
            .map(|ty| engine.intern_type(ty))
            .collect();

        let mut global_slots = Vec::with_capacity(module.globals.len());
        let mut globals_len = 0u32;
        for g in &module.globals {
            global_slots.push(globals_len);
            globals_len += g.ty.val.slot_count();
        }

        // Lower and compile every local function.
        let mut lowered: Vec<LoweredFunction> = Vec::with_capacity(module.funcs.len());
        for i in 0..module.funcs.len() {
            let func_idx = module.num_imported_funcs() + i as u32;
            lowered.push(lower_function(&module, func_idx)?);
        }

        let mut compiled = Vec::with_capacity(lowered.len());
        let mut trap_positions: Vec<u64> = Vec::new();
        for lf in &lowered {
            let env = CompileEnv {
                module: &module,
                type_ids: &type_ids,
                global_slots: &global_slots,
                site_base: trap_positions.len() as u32,
            };
            let cf = jit::compile_function(&env, lf)?;
            trap_positions.extend_from_slice(&cf.trap_positions);
            compiled.push(cf);
        }

        // Shared stubs.
        let exit_stub = jit::emit_segment_exit_stub();
        let shims: Vec<Vec<u8>> = module
            .imported_funcs
            .iter()
            .enumerate()
            .map(|(i, imp)| {
                let sig = &module.types[imp.type_idx as usize];
                jit::emit_host_shim(sig, i as u32)
            })
            .collect();

        let mut stub_types: HashSet<u32> = HashSet::new();
        for export in &module.exports {
            if export.kind == crate::module::ExternalKind::Func {
                stub_types.insert(module.func_type_idx(export.index));
            }
        }
        if let Some(start) = module.start {
            stub_types.insert(module.func_type_idx(start));
        }
        let mut stub_types: Vec<u32> = stub_types.into_iter().collect();
        stub_types.sort_unstable();
        let entry_codes: Vec<(u32, Vec<u8>)> = stub_types
            .iter()
            .map(|ti| {
                (
                    *ti,
                    jit::emit_entry_trampoline(&module.types[*ti as usize]),
                )
            })
            .collect();

        // Lay everything out.
        let island = if cfg!(target_arch = "aarch64") {
            crate::jit::reloc::A64_TRAMPOLINE_SIZE
        } else {
            0
        };
        let mut off = 0usize;
        let exit_stub_offset = off;
        off += align_up(exit_stub.len(), 16);

        let mut shim_offsets = Vec::with_capacity(shims.len());
        for shim in &shims {
            shim_offsets.push(off);
            off += align_up(shim.len(), 16);
        }
        let mut entry_stubs = HashMap::new();
        let mut entry_offsets = Vec::with_capacity(entry_codes.len());
        for (ti, code) in &entry_codes {
            entry_stubs.insert(*ti, off);
            entry_offsets.push(off);
            off += align_up(code.len(), 16);
        }
        let mut body_offsets = Vec::with_capacity(compiled.len());
        let mut island_offsets = Vec::with_capacity(compiled.len());
        for cf in &compiled {
            body_offsets.push(off);
            off += align_up(cf.code.len(), 4);
            island_offsets.push(off);
            off += cf.num_call_sites * island;
            off = align_up(off, 16);
        }

        let mut segment = CodeSegment::new(off.max(16)).map_err(CompileError::from)?;
        segment.write(exit_stub_offset, &exit_stub).map_err(CompileError::from)?;
        for (shim, at) in shims.iter().zip(&shim_offsets) {
            segment.write(*at, shim).map_err(CompileError::from)?;
        }
        for ((_, code), at) in entry_codes.iter().zip(&entry_offsets) {
            segment.write(*at, code).map_err(CompileError::from)?;
        }
        for (cf, at) in compiled.iter().zip(&body_offsets) {
            segment.write(*at, &cf.code).map_err(CompileError::from)?;
        }

        // Function entries: imports point at their shims, local functions
        // at their bodies.
        let mut func_offsets = shim_offsets.clone();
        func_offsets.extend_from_slice(&body_offsets);

        // Relocation sites, rebased to segment offsets, each with its own
        // reserved trampoline slot.
        let mut sites = Vec::new();
        let mut pc_map = Vec::new();
        for (i, cf) in compiled.iter().enumerate() {
            let base = body_offsets[i];
            for (k, reloc) in cf.relocs.iter().enumerate() {
                let slot = if island > 0 {
                    island_offsets[i] + k * island
                } else {
                    usize::MAX
                };
                sites.push((base + reloc.site, reloc.callee, slot));
            }
            for (code_off, pos) in &cf.pc_traps {
                pc_map.push((base + code_off, *pos));
            }
        }
        pc_map.sort_unstable_by_key(|(off, _)| *off);

        crate::jit::reloc::resolve_relocations(&mut segment, &sites, &func_offsets)
            .map_err(CompileError::from)?;
        segment.mark_relocated();
        segment.make_executable().map_err(CompileError::from)?;
        signal::register_segment(segment.as_ptr() as usize, segment.size());

        let segment = Arc::new(segment);
        engine.adopt_segment(segment.clone());

        debug!(
            functions = compiled.len(),
            segment_bytes = segment.size(),
            relocations = sites.len(),
            "compiled module"
        );

        Ok(CompiledModule {
            module,
            segment,
            func_offsets,
            entry_stubs,
            exit_stub_offset,
            type_ids,
            global_slots,
            globals_len,
            trap_positions,
            pc_map,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Absolute entry address of a function.
    pub(crate) fn func_entry(&self, func_idx: u32) -> u64 {
        self.segment.as_ptr() as u64 + self.func_offsets[func_idx as usize] as u64
    }

    pub(crate) fn exit_stub_addr(&self) -> u64 {
        self.segment.as_ptr() as u64 + self.exit_stub_offset as u64
    }

    /// Translate a recorded trap site (or signal-reported code offset)
    /// into a trap with its source offset.
    pub(crate) fn resolve_trap(&self, kind: u64, site: u64) -> Trap {
        let kind = TrapKind::from_u64(kind);
        let source_offset = if site == u64::MAX {
            0
        } else if site & SIGNAL_SITE_BIT != 0 {
            let code_off = (site & !SIGNAL_SITE_BIT) as usize;
            match self
                .pc_map
                .binary_search_by_key(&code_off, |(off, _)| *off)
            {
                Ok(i) => self.pc_map[i].1,
                // The reported PC is the faulting instruction itself, so
                // an exact hit is expected; fall back to the nearest site
                // at or before it.
                Err(0) => 0,
                Err(i) => self.pc_map[i - 1].1,
            }
        } else {
            self.trap_positions
                .get(site as usize)
                .copied()
                .unwrap_or(0)
        };
        Trap {
            kind,
            source_offset,
        }
    }
}

impl Drop for CompiledModule {
    fn drop(&mut self) {
        signal::unregister_segment(self.segment.as_ptr() as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leb(mut v: u32) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    fn section(id: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(leb(body.len() as u32));
        out.extend_from_slice(body);
        out
    }

    /// (func (export "add") (param i32 i32) (result i32) local.get 0,
    /// local.get 1, i32.add)
    fn add_module() -> Vec<u8> {
        let mut m = b"\0asm".to_vec();
        m.extend(1u32.to_le_bytes());
        m.extend(section(1, &[0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F]));
        m.extend(section(3, &[0x01, 0x00]));
        m.extend(section(7, &[0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00]));
        m.extend(section(
            10,
            &[0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B],
        ));
        m
    }

    #[test]
    fn test_compile_produces_executable_segment() {
        let engine = Engine::default();
        let compiled = CompiledModule::compile(&engine, &add_module()).unwrap();
        assert_eq!(
            compiled.segment.state(),
            crate::jit::memory::SegmentState::Executable
        );
        assert_eq!(compiled.func_offsets.len(), 1);
        assert!(compiled.entry_stubs.contains_key(&0));
    }

    #[test]
    fn test_engine_adopts_segments() {
        let engine = Engine::default();
        let _a = CompiledModule::compile(&engine, &add_module()).unwrap();
        let _b = CompiledModule::compile(&engine, &add_module()).unwrap();
        assert_eq!(engine.segments.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_type_ids_shared_across_modules() {
        let engine = Engine::default();
        let a = CompiledModule::compile(&engine, &add_module()).unwrap();
        let b = CompiledModule::compile(&engine, &add_module()).unwrap();
        // Structurally equal signatures intern to one engine-wide id.
        assert_eq!(a.type_ids[0], b.type_ids[0]);
    }

    #[test]
    fn test_type_interning_shares_ids() {
        let mut m = b"\0asm".to_vec();
        m.extend(1u32.to_le_bytes());
        // Two structurally identical types and one distinct.
        m.extend(section(
            1,
            &[
                0x03, 0x60, 0x00, 0x01, 0x7F, 0x60, 0x00, 0x01, 0x7F, 0x60, 0x00, 0x01, 0x7E,
            ],
        ));
        let engine = Engine::default();
        let compiled = CompiledModule::compile(&engine, &m).unwrap();
        assert_eq!(compiled.type_ids[0], compiled.type_ids[1]);
        assert_ne!(compiled.type_ids[0], compiled.type_ids[2]);
    }

    #[test]
    fn test_trap_resolution_from_site() {
        let engine = Engine::default();
        let compiled = CompiledModule::compile(&engine, &add_module()).unwrap();
        // Site ids map straight into the collected positions table.
        if !compiled.trap_positions.is_empty() {
            let t = compiled.resolve_trap(TrapKind::CallStackExhausted as u64, 0);
            assert_eq!(t.kind, TrapKind::CallStackExhausted);
        }
    }
}
