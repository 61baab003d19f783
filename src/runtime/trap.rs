//! Runtime trap taxonomy.

use std::fmt;

/// The non-recoverable guest failures, as surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TrapKind {
    Unreachable = 0,
    IntegerDivideByZero = 1,
    IntegerOverflow = 2,
    InvalidConversionToInteger = 3,
    OutOfBoundsMemoryAccess = 4,
    IndirectCallTypeMismatch = 5,
    UndefinedElement = 6,
    UninitializedElement = 7,
    CallStackExhausted = 8,
    OutOfBoundsTableAccess = 9,
}

impl TrapKind {
    pub fn from_u64(v: u64) -> TrapKind {
        match v {
            0 => TrapKind::Unreachable,
            1 => TrapKind::IntegerDivideByZero,
            2 => TrapKind::IntegerOverflow,
            3 => TrapKind::InvalidConversionToInteger,
            4 => TrapKind::OutOfBoundsMemoryAccess,
            5 => TrapKind::IndirectCallTypeMismatch,
            6 => TrapKind::UndefinedElement,
            7 => TrapKind::UninitializedElement,
            8 => TrapKind::CallStackExhausted,
            _ => TrapKind::OutOfBoundsTableAccess,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::IntegerDivideByZero => "integer divide by zero",
            TrapKind::IntegerOverflow => "integer overflow",
            TrapKind::InvalidConversionToInteger => "invalid conversion to integer",
            TrapKind::OutOfBoundsMemoryAccess => "out of bounds memory access",
            TrapKind::IndirectCallTypeMismatch => "indirect call type mismatch",
            TrapKind::UndefinedElement => "undefined element",
            TrapKind::UninitializedElement => "uninitialized element",
            TrapKind::CallStackExhausted => "call stack exhausted",
            TrapKind::OutOfBoundsTableAccess => "out of bounds table access",
        }
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// A trap as delivered to the embedder: the kind plus the byte offset of
/// the responsible instruction within the module binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub kind: TrapKind,
    pub source_offset: u64,
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wasm trap: {} (at offset {:#x})",
            self.kind.message(),
            self.source_offset
        )
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for v in 0..10 {
            assert_eq!(TrapKind::from_u64(v) as u64, v);
        }
    }

    #[test]
    fn test_display() {
        let trap = Trap {
            kind: TrapKind::IntegerDivideByZero,
            source_offset: 0x42,
        };
        assert_eq!(
            trap.to_string(),
            "wasm trap: integer divide by zero (at offset 0x42)"
        );
    }
}
