//! The flat IR operation model.
//!
//! Every operation is one [`Operation`] value: a kind discriminator, a
//! compact envelope of scalar fields (two bytes, one bool, two 64-bit
//! words), and two variable-length tails (64-bit words and inclusive
//! ranges). Structured control flow does not exist at this level; branches
//! name [`Label`]s and carry the value-stack ranges to discard on the way.

/// Runtime type of one 64-bit value-stack slot. A v128 value occupies a
/// Lo/Hi pair of adjacent slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
    V128Lo = 4,
    V128Hi = 5,
}

impl RuntimeType {
    pub fn is_float(self) -> bool {
        matches!(self, RuntimeType::F32 | RuntimeType::F64)
    }

    pub fn is_vec(self) -> bool {
        matches!(self, RuntimeType::V128Lo | RuntimeType::V128Hi)
    }

    pub fn from_u8(v: u8) -> RuntimeType {
        match v {
            0 => RuntimeType::I32,
            1 => RuntimeType::I64,
            2 => RuntimeType::F32,
            3 => RuntimeType::F64,
            4 => RuntimeType::V128Lo,
            _ => RuntimeType::V128Hi,
        }
    }
}

/// Label kinds within one lowered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LabelKind {
    /// Start of a loop body (or the then-arm of an if).
    Header = 0,
    /// Start of the else-arm of an if.
    Else = 1,
    /// The position right after a block/loop/if.
    Continuation = 2,
    /// The function epilogue.
    Return = 3,
}

/// A branch target identity: (frame id, kind), packed into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u64);

impl Label {
    pub fn new(frame_id: u32, kind: LabelKind) -> Self {
        Label(((frame_id as u64) << 2) | kind as u64)
    }

    pub fn frame_id(self) -> u32 {
        (self.0 >> 2) as u32
    }

    pub fn kind(self) -> LabelKind {
        match self.0 & 0b11 {
            0 => LabelKind::Header,
            1 => LabelKind::Else,
            2 => LabelKind::Continuation,
            _ => LabelKind::Return,
        }
    }
}

/// An inclusive range of value-stack slots counted down from the top
/// (depth 0 = top). `start > end` (canonically `NONE`) means nothing is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InclusiveRange {
    pub start: i32,
    pub end: i32,
}

impl InclusiveRange {
    pub const NONE: InclusiveRange = InclusiveRange { start: -1, end: -1 };

    pub fn new(start: u32, end: u32) -> Self {
        InclusiveRange {
            start: start as i32,
            end: end as i32,
        }
    }

    pub fn is_none(self) -> bool {
        self.start < 0
    }

    /// Number of slots dropped.
    pub fn len(self) -> u32 {
        if self.is_none() {
            0
        } else {
            (self.end - self.start + 1) as u32
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }
}

/// A memory operand: alignment exponent and constant byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align_exp: u8,
    pub offset: u32,
}

impl MemArg {
    /// Pack into one envelope word: offset in the low half, alignment
    /// exponent above it.
    pub fn pack(self) -> u64 {
        ((self.align_exp as u64) << 32) | self.offset as u64
    }

    pub fn unpack(word: u64) -> MemArg {
        MemArg {
            align_exp: (word >> 32) as u8,
            offset: word as u32,
        }
    }
}

/// SIMD lane shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shape {
    I8x16 = 0,
    I16x8 = 1,
    I32x4 = 2,
    I64x2 = 3,
    F32x4 = 4,
    F64x2 = 5,
}

impl Shape {
    pub fn from_u8(v: u8) -> Shape {
        match v {
            0 => Shape::I8x16,
            1 => Shape::I16x8,
            2 => Shape::I32x4,
            3 => Shape::I64x2,
            4 => Shape::F32x4,
            _ => Shape::F64x2,
        }
    }

    pub fn lanes(self) -> u8 {
        match self {
            Shape::I8x16 => 16,
            Shape::I16x8 => 8,
            Shape::I32x4 | Shape::F32x4 => 4,
            Shape::I64x2 | Shape::F64x2 => 2,
        }
    }

    pub fn lane_bytes(self) -> u8 {
        16 / self.lanes()
    }

    pub fn is_float(self) -> bool {
        matches!(self, Shape::F32x4 | Shape::F64x2)
    }
}

/// The wide-load flavors of `v128.load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V128LoadKind {
    Full = 0,
    /// 64-bit load extended laneswise: 8x8 / 16x4 / 32x2.
    Ext8x8 = 1,
    Ext16x4 = 2,
    Ext32x2 = 3,
    Splat8 = 4,
    Splat16 = 5,
    Splat32 = 6,
    Splat64 = 7,
    Zero32 = 8,
    Zero64 = 9,
}

impl V128LoadKind {
    pub fn from_u8(v: u8) -> V128LoadKind {
        match v {
            0 => V128LoadKind::Full,
            1 => V128LoadKind::Ext8x8,
            2 => V128LoadKind::Ext16x4,
            3 => V128LoadKind::Ext32x2,
            4 => V128LoadKind::Splat8,
            5 => V128LoadKind::Splat16,
            6 => V128LoadKind::Splat32,
            7 => V128LoadKind::Splat64,
            8 => V128LoadKind::Zero32,
            _ => V128LoadKind::Zero64,
        }
    }
}

/// Operation discriminator. The set mirrors the Wasm opcode space after
/// lowering: locals become Pick/Set, structured control flow becomes
/// Label/Br/BrIf/BrTable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Control.
    Unreachable,
    Label,
    Br,
    BrIf,
    BrTable,
    Call,
    CallIndirect,

    // Stack shuffling.
    Drop,
    Select,
    Pick,
    Set,

    // Globals and linear memory.
    GlobalGet,
    GlobalSet,
    Load,
    Load8,
    Load16,
    Load32,
    Store,
    Store8,
    Store16,
    Store32,
    MemorySize,
    MemoryGrow,
    MemoryInit,
    DataDrop,
    MemoryCopy,
    MemoryFill,

    // Tables and references.
    TableGet,
    TableSet,
    TableSize,
    TableGrow,
    TableFill,
    TableCopy,
    TableInit,
    ElemDrop,
    RefFunc,

    // Constants.
    I32Const,
    I64Const,
    F32Const,
    F64Const,
    V128Const,

    // Scalar arithmetic, logic, and comparison. The operand type rides in
    // `b1`; signedness (where it matters) in `b3`.
    Eqz,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Rotl,
    Rotr,
    Clz,
    Ctz,
    Popcnt,
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
    Min,
    Max,
    Copysign,

    // Conversions.
    I32WrapI64,
    ITruncF,
    FConvertI,
    F32DemoteF64,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
    I64ExtendI32,
    SignExtend32From8,
    SignExtend32From16,
    SignExtend64From8,
    SignExtend64From16,
    SignExtend64From32,

    // SIMD.
    V128Load,
    V128LoadLane,
    V128Store,
    V128StoreLane,
    V128Splat,
    V128ExtractLane,
    V128ReplaceLane,
    V128Shuffle,
    V128Swizzle,
    V128AnyTrue,
    V128AllTrue,
    V128Bitmask,
    V128And,
    V128AndNot,
    V128Or,
    V128Xor,
    V128Not,
    V128Bitselect,
    V128Shl,
    V128Shr,
    V128Cmp,
    V128Add,
    V128AddSat,
    V128Sub,
    V128SubSat,
    V128Mul,
    V128Div,
    V128Neg,
    V128Abs,
    V128Sqrt,
    V128Popcnt,
    V128Min,
    V128Max,
    V128AvgrU,
    V128Pmin,
    V128Pmax,
    V128Ceil,
    V128Floor,
    V128Trunc,
    V128Nearest,
    V128Extend,
    V128ExtMul,
    V128ExtAddPairwise,
    V128Q15mulrSatS,
    V128Dot,
    V128Narrow,
    V128FloatPromote,
    V128FloatDemote,
    V128FConvertI,
    V128ITruncSatF,
}

/// SIMD comparison selector (used with `V128Cmp`; signedness in `b3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum V128CmpKind {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Gt = 3,
    Le = 4,
    Ge = 5,
}

impl V128CmpKind {
    pub fn from_u8(v: u8) -> V128CmpKind {
        match v {
            0 => V128CmpKind::Eq,
            1 => V128CmpKind::Ne,
            2 => V128CmpKind::Lt,
            3 => V128CmpKind::Gt,
            4 => V128CmpKind::Le,
            _ => V128CmpKind::Ge,
        }
    }
}

/// One lowered operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub b1: u8,
    pub b2: u8,
    pub b3: bool,
    pub u1: u64,
    pub u2: u64,
    pub us: Vec<u64>,
    pub rs: Vec<InclusiveRange>,
    /// Byte offset of the originating instruction within the module.
    pub pos: u64,
}

impl Operation {
    /// A zeroed envelope for the given kind; lowering fills in fields.
    pub fn new(kind: OpKind, pos: u64) -> Self {
        Operation {
            kind,
            b1: 0,
            b2: 0,
            b3: false,
            u1: 0,
            u2: 0,
            us: Vec::new(),
            rs: Vec::new(),
            pos,
        }
    }

    pub fn label(label: Label, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Label, pos);
        op.u1 = label.0;
        op
    }

    pub fn br(target: Label, drop: InclusiveRange, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Br, pos);
        op.us.push(target.0);
        op.rs.push(drop);
        op
    }

    pub fn br_if(
        then_target: Label,
        then_drop: InclusiveRange,
        else_target: Label,
        else_drop: InclusiveRange,
        pos: u64,
    ) -> Self {
        let mut op = Operation::new(OpKind::BrIf, pos);
        op.us.push(then_target.0);
        op.us.push(else_target.0);
        op.rs.push(then_drop);
        op.rs.push(else_drop);
        op
    }

    /// `targets` are the table entries in order; the default target comes
    /// last in both tails.
    pub fn br_table(
        targets: Vec<(Label, InclusiveRange)>,
        default: (Label, InclusiveRange),
        pos: u64,
    ) -> Self {
        let mut op = Operation::new(OpKind::BrTable, pos);
        for (label, drop) in targets {
            op.us.push(label.0);
            op.rs.push(drop);
        }
        let (default_label, default_drop) = default;
        op.us.push(default_label.0);
        op.rs.push(default_drop);
        op
    }

    pub fn call(func_idx: u32, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Call, pos);
        op.u1 = func_idx as u64;
        op
    }

    pub fn call_indirect(type_idx: u32, table_idx: u32, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::CallIndirect, pos);
        op.u1 = type_idx as u64;
        op.u2 = table_idx as u64;
        op
    }

    pub fn drop_range(range: InclusiveRange, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Drop, pos);
        op.rs.push(range);
        op
    }

    pub fn pick(depth: u32, is_vector: bool, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Pick, pos);
        op.u1 = depth as u64;
        op.b3 = is_vector;
        op
    }

    pub fn set(depth: u32, is_vector: bool, pos: u64) -> Self {
        let mut op = Operation::new(OpKind::Set, pos);
        op.u1 = depth as u64;
        op.b3 = is_vector;
        op
    }

    /// The label this op defines (Label ops only).
    pub fn as_label(&self) -> Label {
        debug_assert_eq!(self.kind, OpKind::Label);
        Label(self.u1)
    }

    /// Branch target count for Br/BrIf/BrTable.
    pub fn target_count(&self) -> usize {
        self.us.len()
    }

    /// The i-th (label, drop) pair of a branch op.
    pub fn target(&self, i: usize) -> (Label, InclusiveRange) {
        (Label(self.us[i]), self.rs[i])
    }

    pub fn mem_arg(&self) -> MemArg {
        MemArg::unpack(self.u1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_packing() {
        let label = Label::new(123, LabelKind::Else);
        assert_eq!(label.frame_id(), 123);
        assert_eq!(label.kind(), LabelKind::Else);

        let ret = Label::new(0, LabelKind::Return);
        assert_eq!(ret.kind(), LabelKind::Return);
        assert_eq!(ret.frame_id(), 0);
    }

    #[test]
    fn test_mem_arg_roundtrip() {
        for (align, offset) in [(0u8, 0u32), (3, 65536), (4, u32::MAX)] {
            let arg = MemArg {
                align_exp: align,
                offset,
            };
            assert_eq!(MemArg::unpack(arg.pack()), arg);
        }
    }

    #[test]
    fn test_inclusive_range() {
        assert!(InclusiveRange::NONE.is_none());
        assert_eq!(InclusiveRange::NONE.len(), 0);
        let r = InclusiveRange::new(1, 3);
        assert_eq!(r.len(), 3);
        assert!(!r.is_none());
    }

    #[test]
    fn test_branch_targets() {
        let a = Label::new(1, LabelKind::Continuation);
        let b = Label::new(2, LabelKind::Header);
        let op = Operation::br_table(
            vec![(a, InclusiveRange::NONE)],
            (b, InclusiveRange::new(0, 1)),
            7,
        );
        assert_eq!(op.target_count(), 2);
        assert_eq!(op.target(0).0, a);
        assert_eq!(op.target(1).0, b);
        assert_eq!(op.target(1).1.len(), 2);
    }

    #[test]
    fn test_shape_lanes() {
        assert_eq!(Shape::I8x16.lanes(), 16);
        assert_eq!(Shape::F64x2.lane_bytes(), 8);
        assert!(Shape::F32x4.is_float());
    }
}
