//! Instances: materialized memories, tables, and globals around a
//! compiled module, plus the invocation path into compiled code.

use super::context::{
    TableRepr, VmContext, EXIT_CANCELED_BIT, EXIT_SET_BIT, STATUS_EXIT, STATUS_OK, STATUS_TRAP,
};
use super::engine::{CompiledModule, Engine};
use super::helpers::build_helper_table;
use super::linear::{LinearMemory, LinearMemoryError};
use super::signal;
use super::trap::{Trap, TrapKind};
use crate::module::{ConstExpr, DataMode, ElemMode, ExternalKind, ValType};
use crate::sys::FsContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A guest value at the embedding boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
        }
    }

    pub fn i32(self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn i64(self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    fn matches(&self, ty: ValType) -> bool {
        match ty {
            ValType::FuncRef | ValType::ExternRef => matches!(self, Value::I64(_)),
            other => self.ty() == other,
        }
    }

    fn write_slots(&self, out: &mut [u64]) {
        match self {
            Value::I32(v) => out[0] = *v as u32 as u64,
            Value::I64(v) => out[0] = *v as u64,
            Value::F32(v) => out[0] = v.to_bits() as u64,
            Value::F64(v) => out[0] = v.to_bits(),
            Value::V128(v) => {
                out[0] = *v as u64;
                out[1] = (*v >> 64) as u64;
            }
        }
    }

    fn read_slots(ty: ValType, slots: &[u64]) -> Value {
        match ty {
            ValType::I32 => Value::I32(slots[0] as u32 as i32),
            ValType::I64 | ValType::FuncRef | ValType::ExternRef => Value::I64(slots[0] as i64),
            ValType::F32 => Value::F32(f32::from_bits(slots[0] as u32)),
            ValType::F64 => Value::F64(f64::from_bits(slots[0])),
            ValType::V128 => Value::V128(slots[0] as u128 | ((slots[1] as u128) << 64)),
        }
    }
}

/// The outcome of a host function call.
#[derive(Debug, Clone, Copy)]
pub enum HostOutcome {
    Ok,
    /// The host function set the exit cell; unwind the guest.
    Exit,
    Trap(TrapKind),
}

/// A host function bound to an import: raw slot in, raw slots out.
pub type HostFn =
    fn(&mut VmContext, &mut InstanceState, &[u64], &mut [u64]) -> HostOutcome;

pub struct HostFuncEntry {
    pub func: HostFn,
    pub param_slots: u32,
    pub result_slots: u32,
}

/// Instance internals reachable from runtime helpers and host functions.
pub struct InstanceState {
    pub tables: Vec<Vec<u64>>,
    pub table_reprs: Vec<TableRepr>,
    pub table_limits: Vec<u32>,
    /// Passive data segments; dropped ones become None.
    pub datas: Vec<Option<Vec<u8>>>,
    /// Passive element segments (encoded as func_index+1, 0 = null).
    pub elems: Vec<Option<Vec<u64>>>,
    pub host_funcs: Vec<HostFuncEntry>,
    pub memory: Option<LinearMemory>,
    pub fs: FsContext,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl InstanceState {
    /// Rebuild the compiled-code view of one table after growth moved
    /// its storage.
    pub fn refresh_table_repr(&mut self, t: usize) {
        self.table_reprs[t] = TableRepr {
            ptr: self.tables[t].as_mut_ptr(),
            len: self.tables[t].len() as u64,
        };
    }
}

#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("unknown import {module}.{name}")]
    UnknownImport { module: String, name: String },
    #[error(transparent)]
    Memory(#[from] LinearMemoryError),
    #[error("active data segment does not fit in memory")]
    DataSegmentOutOfBounds,
    #[error("active element segment does not fit in table")]
    ElementSegmentOutOfBounds,
    #[error("start function failed: {0}")]
    Start(Box<InvokeError>),
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("unknown export {0:?}")]
    UnknownExport(String),
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("guest exited with code {0}")]
    Exit(u32),
    #[error("invocation canceled")]
    Canceled,
}

type EntryFn = unsafe extern "C" fn(*mut VmContext, *const u8, *mut u64);

/// An instantiated module.
pub struct Instance {
    compiled: Arc<CompiledModule>,
    state: Box<InstanceState>,
    ctx: Box<VmContext>,
    /// The owning engine's exit cell; guest code polls it through the
    /// context.
    exit_cell: Arc<AtomicU64>,
    stack: Vec<u64>,
    globals: Vec<u64>,
    func_entries: Vec<u64>,
    func_type_ids: Vec<u64>,
    helper_table: Vec<u64>,
}

impl Instance {
    /// Materialize an instance: memories, tables, globals, the FS
    /// context, and the per-invocation context; then run the start
    /// function.
    pub fn new(
        engine: &mut Engine,
        compiled: Arc<CompiledModule>,
    ) -> Result<Instance, InstantiateError> {
        let module = &compiled.module;
        let exit_cell = engine.exit_cell().clone();
        let config = engine.config_mut();

        // Host functions for every import.
        let mut host_funcs = Vec::with_capacity(module.imported_funcs.len());
        for imp in &module.imported_funcs {
            let sig = &module.types[imp.type_idx as usize];
            let func = crate::wasi::resolve(&imp.module, &imp.name).ok_or_else(|| {
                InstantiateError::UnknownImport {
                    module: imp.module.clone(),
                    name: imp.name.clone(),
                }
            })?;
            host_funcs.push(HostFuncEntry {
                func,
                param_slots: sig.param_slots(),
                result_slots: sig.result_slots(),
            });
        }

        // Tables, initially null-filled.
        let mut tables = Vec::with_capacity(module.tables.len());
        let mut table_limits = Vec::with_capacity(module.tables.len());
        for t in &module.tables {
            tables.push(vec![0u64; t.limits.min as usize]);
            table_limits.push(t.limits.max.unwrap_or(u32::MAX));
        }

        let memory = match module.memories.first() {
            Some(ty) => Some(LinearMemory::new(ty)?),
            None => None,
        };

        // Globals.
        let mut globals = vec![0u64; compiled.globals_len as usize];
        for (i, g) in module.globals.iter().enumerate() {
            let slot = compiled.global_slots[i] as usize;
            match g.init {
                ConstExpr::V128(v) => {
                    globals[slot] = v as u64;
                    globals[slot + 1] = (v >> 64) as u64;
                }
                other => globals[slot] = other.to_bits(),
            }
        }

        // Segments: active ones are applied now and dropped; passive ones
        // stay available for memory.init / table.init.
        let mut datas = Vec::with_capacity(module.datas.len());
        let mut state_memory = memory;
        for seg in &module.datas {
            match &seg.mode {
                DataMode::Active { offset } => {
                    let mem = state_memory
                        .as_mut()
                        .ok_or(InstantiateError::DataSegmentOutOfBounds)?;
                    let at = offset.to_bits() as u32 as usize;
                    let end = at
                        .checked_add(seg.data.len())
                        .ok_or(InstantiateError::DataSegmentOutOfBounds)?;
                    if end > mem.byte_len() {
                        return Err(InstantiateError::DataSegmentOutOfBounds);
                    }
                    unsafe {
                        mem.slice_mut()[at..end].copy_from_slice(&seg.data);
                    }
                    datas.push(None);
                }
                DataMode::Passive => datas.push(Some(seg.data.clone())),
            }
        }

        let mut elems = Vec::with_capacity(module.elems.len());
        for seg in &module.elems {
            let encoded: Vec<u64> = seg
                .funcs
                .iter()
                .map(|f| f.map(|idx| idx as u64 + 1).unwrap_or(0))
                .collect();
            match &seg.mode {
                ElemMode::Active {
                    table_index,
                    offset,
                } => {
                    let table = &mut tables[*table_index as usize];
                    let at = offset.to_bits() as u32 as usize;
                    let end = at
                        .checked_add(encoded.len())
                        .ok_or(InstantiateError::ElementSegmentOutOfBounds)?;
                    if end > table.len() {
                        return Err(InstantiateError::ElementSegmentOutOfBounds);
                    }
                    table[at..end].copy_from_slice(&encoded);
                    elems.push(None);
                }
                ElemMode::Passive => elems.push(Some(encoded)),
                ElemMode::Declared => elems.push(None),
            }
        }

        let fs = FsContext::new(
            std::mem::take(&mut config.preopen_dirs),
            std::mem::take(&mut config.preopen_listeners),
        );

        let mut state = Box::new(InstanceState {
            table_reprs: Vec::new(),
            tables,
            table_limits,
            datas,
            elems,
            host_funcs,
            memory: state_memory,
            fs,
            args: config.args.clone(),
            envs: config.envs.clone(),
        });
        state.table_reprs = (0..state.tables.len())
            .map(|t| TableRepr {
                ptr: state.tables[t].as_mut_ptr(),
                len: state.tables[t].len() as u64,
            })
            .collect();

        // Function entry/type tables indexed by function index.
        let func_entries: Vec<u64> = (0..module.num_funcs())
            .map(|i| compiled.func_entry(i))
            .collect();
        let func_type_ids: Vec<u64> = (0..module.num_funcs())
            .map(|i| compiled.type_ids[module.func_type_idx(i) as usize])
            .collect();

        let mut stack = vec![0u64; config.stack_slots];
        let helper_table = build_helper_table();

        let stack_len = stack.len();
        let ctx = Box::new(VmContext {
            memory_base: state
                .memory
                .as_ref()
                .map(|m| m.base_ptr())
                .unwrap_or(std::ptr::null_mut()),
            memory_pages: state.memory.as_ref().map(|m| m.pages()).unwrap_or(0) as u64,
            stack_base: stack.as_mut_ptr(),
            stack_limit: unsafe { stack.as_mut_ptr().add(stack_len) },
            host_sp: 0,
            status: STATUS_OK,
            trap_kind: 0,
            trap_site: 0,
            exit_code: Arc::as_ptr(&exit_cell),
            call_depth: 0,
            call_depth_limit: config.max_call_depth,
            func_entries: func_entries.as_ptr(),
            func_types: func_type_ids.as_ptr(),
            tables: state.table_reprs.as_ptr(),
            globals: globals.as_mut_ptr(),
            helpers: helper_table.as_ptr(),
            instance: state.as_mut() as *mut InstanceState as *mut core::ffi::c_void,
            exit_stub: compiled.exit_stub_addr(),
        });

        let mut instance = Instance {
            compiled,
            state,
            ctx,
            exit_cell,
            stack,
            globals,
            func_entries,
            func_type_ids,
            helper_table,
        };
        debug!(
            funcs = instance.func_entries.len(),
            tables = instance.state.tables.len(),
            "instantiated module"
        );

        if let Some(start) = instance.compiled.module.start {
            instance
                .invoke_index(start, &[])
                .map_err(|e| InstantiateError::Start(Box::new(e)))?;
        }
        Ok(instance)
    }

    pub fn module(&self) -> &crate::module::Module {
        &self.compiled.module
    }

    /// Invoke an exported function.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let func_idx = self
            .compiled
            .module
            .exported_func(name)
            .ok_or_else(|| InvokeError::UnknownExport(name.to_string()))?;
        self.invoke_index(func_idx, args)
    }

    fn invoke_index(&mut self, func_idx: u32, args: &[Value]) -> Result<Vec<Value>, InvokeError> {
        let type_idx = self.compiled.module.func_type_idx(func_idx);
        let sig = self.compiled.module.types[type_idx as usize].clone();
        if args.len() != sig.params.len() {
            return Err(InvokeError::ArgumentMismatch(format!(
                "expected {} arguments, got {}",
                sig.params.len(),
                args.len()
            )));
        }
        for (arg, ty) in args.iter().zip(&sig.params) {
            if !arg.matches(*ty) {
                return Err(InvokeError::ArgumentMismatch(format!(
                    "expected {ty:?}, got {:?}",
                    arg.ty()
                )));
            }
        }

        // A previously exited (or canceled) engine stays that way.
        let cell = self.exit_cell.load(Ordering::Acquire);
        if cell != 0 {
            return Err(decode_exit(cell));
        }

        // Arguments land in the outermost frame's local slots.
        let mut slot = 0usize;
        for (arg, ty) in args.iter().zip(&sig.params) {
            arg.write_slots(&mut self.stack[slot..slot + ty.slot_count() as usize]);
            slot += ty.slot_count() as usize;
        }

        self.ctx.status = STATUS_OK;
        self.ctx.trap_kind = 0;
        self.ctx.trap_site = 0;
        self.ctx.call_depth = 0;

        let stub_off = self.compiled.entry_stubs[&type_idx];
        let entry: EntryFn = unsafe {
            std::mem::transmute(self.compiled.segment.addr_of(stub_off))
        };
        let target = self.compiled.func_entry(func_idx) as *const u8;
        let ctx_ptr = self.ctx.as_mut() as *mut VmContext;
        let frame_ptr = self.stack.as_mut_ptr();

        signal::enter_guest(ctx_ptr);
        unsafe {
            entry(ctx_ptr, target, frame_ptr);
        }
        signal::leave_guest();

        match self.ctx.status {
            STATUS_TRAP => {
                let trap = self
                    .compiled
                    .resolve_trap(self.ctx.trap_kind, self.ctx.trap_site);
                Err(InvokeError::Trap(trap))
            }
            STATUS_EXIT => {
                let cell = self.exit_cell.load(Ordering::Acquire);
                Err(decode_exit(cell))
            }
            _ => {
                let mut results = Vec::with_capacity(sig.results.len());
                let mut slot = 0usize;
                for ty in &sig.results {
                    results.push(Value::read_slots(
                        *ty,
                        &self.stack[slot..slot + ty.slot_count() as usize],
                    ));
                    slot += ty.slot_count() as usize;
                }
                Ok(results)
            }
        }
    }

    /// Grow the linear memory; returns the previous page count.
    pub fn grow_memory(&mut self, delta_pages: u32) -> Option<u32> {
        let mem = self.state.memory.as_mut()?;
        let old = mem.grow(delta_pages)?;
        self.ctx.memory_pages = mem.pages() as u64;
        Some(old)
    }

    pub fn memory_pages(&self) -> u32 {
        self.state.memory.as_ref().map(|m| m.pages()).unwrap_or(0)
    }

    /// Copy out of linear memory.
    pub fn read_memory(&self, offset: usize, out: &mut [u8]) -> bool {
        let Some(mem) = self.state.memory.as_ref() else {
            return false;
        };
        let data = unsafe { mem.slice() };
        if offset.checked_add(out.len()).map_or(true, |e| e > data.len()) {
            return false;
        }
        out.copy_from_slice(&data[offset..offset + out.len()]);
        true
    }

    /// Copy into linear memory.
    pub fn write_memory(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(mem) = self.state.memory.as_mut() else {
            return false;
        };
        let dst = unsafe { mem.slice_mut() };
        if offset.checked_add(data.len()).map_or(true, |e| e > dst.len()) {
            return false;
        }
        dst[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    /// Read an exported global's current value.
    pub fn global(&self, name: &str) -> Option<Value> {
        let export = self
            .compiled
            .module
            .exports
            .iter()
            .find(|e| e.kind == ExternalKind::Global && e.name == name)?;
        let g = &self.compiled.module.globals[export.index as usize];
        let slot = self.compiled.global_slots[export.index as usize] as usize;
        Some(Value::read_slots(g.ty.val, &self.globals[slot..]))
    }

    /// Cooperative cancellation through the engine's exit cell: the next
    /// call boundary in the guest unwinds with a canceled exit.
    pub fn cancel(&self) {
        self.exit_cell
            .store(EXIT_SET_BIT | EXIT_CANCELED_BIT, Ordering::Release);
    }

    /// Tear the instance down. Dropping does the same; this spells it
    /// out at call sites.
    pub fn close(self) {}
}

fn decode_exit(cell: u64) -> InvokeError {
    if cell & EXIT_CANCELED_BIT != 0 {
        InvokeError::Canceled
    } else {
        InvokeError::Exit(cell as u32)
    }
}
