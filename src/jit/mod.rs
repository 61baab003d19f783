//! Native compilation: code buffers, executable segments, per-arch
//! assemblers and compilers, value-location tracking, and relocation.

pub mod aarch64;
pub mod codebuf;
pub mod compiler_aarch64;
pub mod compiler_x86_64;
pub mod memory;
pub mod reloc;
pub mod valstack;
pub mod x86_64;

use crate::ir::LoweredFunction;
use crate::module::{FuncType, Module};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("host architecture is not supported")]
    UnsupportedArch,
    #[error(transparent)]
    Memory(#[from] memory::MemoryError),
    #[error(transparent)]
    Reloc(#[from] reloc::RelocError),
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// Module-wide inputs shared by every per-function compilation.
pub struct CompileEnv<'a> {
    pub module: &'a Module,
    /// Module type index → engine-interned type id.
    pub type_ids: &'a [u64],
    /// Global index → slot offset in the globals array.
    pub global_slots: &'a [u32],
    /// First trap-site id assigned to this function.
    pub site_base: u32,
}

/// The output of compiling one function.
pub struct CompiledFunc {
    pub code: Vec<u8>,
    /// Call sites to patch, offsets relative to the function start.
    pub relocs: Vec<reloc::Reloc>,
    /// Source offsets, one per trap site allocated by this function.
    pub trap_positions: Vec<u64>,
    /// (code offset, source offset) for every faultable memory access.
    pub pc_traps: Vec<(usize, u64)>,
    /// Direct call sites (for trampoline island sizing on AArch64).
    pub num_call_sites: usize,
}

/// Compile a function for the host architecture.
pub fn compile_function(
    env: &CompileEnv,
    func: &LoweredFunction,
) -> Result<CompiledFunc, CompileError> {
    #[cfg(target_arch = "x86_64")]
    {
        compiler_x86_64::compile_function(env, func)
    }
    #[cfg(target_arch = "aarch64")]
    {
        compiler_aarch64::compile_function(env, func)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (env, func);
        Err(CompileError::UnsupportedArch)
    }
}

/// Entry trampoline for the host architecture.
pub fn emit_entry_trampoline(sig: &FuncType) -> Vec<u8> {
    #[cfg(target_arch = "x86_64")]
    {
        compiler_x86_64::emit_entry_trampoline(sig)
    }
    #[cfg(target_arch = "aarch64")]
    {
        compiler_aarch64::emit_entry_trampoline(sig)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = sig;
        Vec::new()
    }
}

/// Host-call shim for the host architecture.
pub fn emit_host_shim(sig: &FuncType, import_index: u32) -> Vec<u8> {
    #[cfg(target_arch = "x86_64")]
    {
        compiler_x86_64::emit_host_shim(sig, import_index)
    }
    #[cfg(target_arch = "aarch64")]
    {
        compiler_aarch64::emit_host_shim(sig, import_index)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (sig, import_index);
        Vec::new()
    }
}

/// Segment-level unwind stub for the host architecture.
pub fn emit_segment_exit_stub() -> Vec<u8> {
    #[cfg(target_arch = "x86_64")]
    {
        compiler_x86_64::emit_segment_exit_stub()
    }
    #[cfg(target_arch = "aarch64")]
    {
        compiler_aarch64::emit_segment_exit_stub()
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Vec::new()
    }
}
