//! The mid-level IR: a flat, typed operation stream per function.

mod lower;
mod op;

pub use lower::{lower_function, LoweredFunction};
pub use op::{
    InclusiveRange, Label, LabelKind, MemArg, OpKind, Operation, RuntimeType, Shape, V128CmpKind,
    V128LoadKind,
};
