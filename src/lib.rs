//! wasmica - a WebAssembly runtime that compiles modules to native code.
//!
//! The pipeline: decode a binary module, lower each function to a flat
//! typed IR, compile the IR to native code (x86-64 or AArch64), resolve
//! call-site relocations, and run the result behind a small embedding
//! surface with a WASI-style host module.

pub mod config;
pub mod ir;
pub mod jit;
pub mod module;
pub mod runtime;
pub mod sys;
pub mod wasi;

// Re-export the embedding surface.
pub use config::EngineConfig;
pub use runtime::{
    CompiledModule, Engine, Instance, InstantiateError, InvokeError, ModuleError, Trap, TrapKind,
    Value,
};
