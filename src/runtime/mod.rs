//! The runtime layer: engine, compiled modules, instances, traps, and
//! the fault-handling discipline.

pub mod context;
pub mod engine;
pub mod helpers;
pub mod instance;
pub mod linear;
pub mod signal;
pub mod trap;

pub use engine::{CompiledModule, Engine, ModuleError};
pub use instance::{
    HostFn, HostFuncEntry, HostOutcome, Instance, InstanceState, InstantiateError, InvokeError,
    Value,
};
pub use trap::{Trap, TrapKind};
