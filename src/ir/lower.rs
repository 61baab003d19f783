//! Wasm bytecode → IR lowering.
//!
//! Walks a validated function body once, maintaining a control-frame stack
//! and an abstract value stack of slot types. Structured control flow is
//! flattened into labels and branches carrying value-stack drop ranges.
//! Locals are modeled as the bottom slots of the value stack, so
//! `local.get`/`local.set`/`local.tee` become Pick/Set with depths.
//!
//! The module is expected to be valid; a structural inconsistency found
//! here is reported as a [`DecodeError`] with the offending byte offset.

use super::op::*;
use crate::module::{DecodeError, FuncType, Module, Reader, ValType};
use std::collections::HashMap;
use tracing::trace;

/// The lowered form of one function.
#[derive(Debug)]
pub struct LoweredFunction {
    pub ops: Vec<Operation>,
    /// Label identity → index into `ops` of its Label operation.
    pub label_positions: HashMap<u64, usize>,
    /// Label identity → value-stack slot height at that label (locals
    /// included).
    pub label_heights: HashMap<u64, u32>,
    /// Highest slot height reached anywhere in the function.
    pub max_height: u32,
    /// Slots occupied by locals (parameters included).
    pub nlocals_slots: u32,
    /// Local index → first slot of that local.
    pub local_slots: Vec<u32>,
    pub type_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameKind {
    Body,
    Block,
    Loop,
    If,
}

struct ControlFrame {
    frame_id: u32,
    kind: FrameKind,
    /// Slot height when the frame was entered, params excluded.
    base_height: u32,
    params: Vec<ValType>,
    results: Vec<ValType>,
    unreachable: bool,
    else_seen: bool,
    /// Whether labels for this frame are emitted at all (false for frames
    /// opened inside unreachable code).
    emit_labels: bool,
}

impl ControlFrame {
    fn param_slots(&self) -> u32 {
        self.params.iter().map(|t| t.slot_count()).sum()
    }

    fn result_slots(&self) -> u32 {
        self.results.iter().map(|t| t.slot_count()).sum()
    }

    /// Branch arity: loops re-enter with their params, everything else
    /// exits with its results.
    fn branch_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }

    fn branch_label(&self) -> Label {
        match self.kind {
            FrameKind::Loop => Label::new(self.frame_id, LabelKind::Header),
            FrameKind::Body => Label::new(self.frame_id, LabelKind::Return),
            _ => Label::new(self.frame_id, LabelKind::Continuation),
        }
    }
}

struct Lowerer<'a> {
    module: &'a Module,
    stack: Vec<RuntimeType>,
    frames: Vec<ControlFrame>,
    next_frame_id: u32,
    local_types: Vec<ValType>,
    out: LoweredFunction,
}

/// Lower one locally defined function (by its global function index).
pub fn lower_function(module: &Module, func_idx: u32) -> Result<LoweredFunction, DecodeError> {
    let local_idx = (func_idx - module.num_imported_funcs()) as usize;
    let code = &module.codes[local_idx];
    let type_idx = module.funcs[local_idx];
    let sig = &module.types[type_idx as usize];

    let mut local_slots = Vec::new();
    let mut local_types = Vec::new();
    let mut stack = Vec::new();
    for ty in sig.params.iter().chain(code.locals.iter()) {
        local_slots.push(stack.len() as u32);
        local_types.push(*ty);
        push_val_type(&mut stack, *ty);
    }
    let nlocals_slots = stack.len() as u32;

    let mut lowerer = Lowerer {
        module,
        stack,
        local_types,
        frames: vec![ControlFrame {
            frame_id: 0,
            kind: FrameKind::Body,
            base_height: nlocals_slots,
            params: Vec::new(),
            results: sig.results.clone(),
            unreachable: false,
            else_seen: false,
            emit_labels: true,
        }],
        next_frame_id: 1,
        out: LoweredFunction {
            ops: Vec::new(),
            label_positions: HashMap::new(),
            label_heights: HashMap::new(),
            max_height: nlocals_slots,
            nlocals_slots,
            local_slots,
            type_idx,
        },
    };
    lowerer.run(&code.body, code.body_offset)?;
    trace!(
        func = func_idx,
        ops = lowerer.out.ops.len(),
        max_height = lowerer.out.max_height,
        "lowered function"
    );
    Ok(lowerer.out)
}

fn push_val_type(stack: &mut Vec<RuntimeType>, ty: ValType) {
    match ty {
        ValType::I32 => stack.push(RuntimeType::I32),
        ValType::I64 | ValType::FuncRef | ValType::ExternRef => stack.push(RuntimeType::I64),
        ValType::F32 => stack.push(RuntimeType::F32),
        ValType::F64 => stack.push(RuntimeType::F64),
        ValType::V128 => {
            stack.push(RuntimeType::V128Lo);
            stack.push(RuntimeType::V128Hi);
        }
    }
}

fn runtime_types_of(ty: ValType) -> &'static [RuntimeType] {
    match ty {
        ValType::I32 => &[RuntimeType::I32],
        ValType::I64 | ValType::FuncRef | ValType::ExternRef => &[RuntimeType::I64],
        ValType::F32 => &[RuntimeType::F32],
        ValType::F64 => &[RuntimeType::F64],
        ValType::V128 => &[RuntimeType::V128Lo, RuntimeType::V128Hi],
    }
}

impl Lowerer<'_> {
    fn height(&self) -> u32 {
        self.stack.len() as u32
    }

    fn reachable(&self) -> bool {
        !self.frames.last().map(|f| f.unreachable).unwrap_or(true)
    }

    fn floor(&self) -> u32 {
        self.frames.last().map(|f| f.base_height).unwrap_or(0)
    }

    fn emit(&mut self, op: Operation) {
        if self.reachable() {
            self.out.ops.push(op);
        }
    }

    /// Emit a label regardless of reachability and record its position and
    /// expected height.
    fn emit_label(&mut self, label: Label, height: u32, pos: u64) {
        self.out
            .label_positions
            .insert(label.0, self.out.ops.len());
        self.out.label_heights.insert(label.0, height);
        self.out.ops.push(Operation::label(label, pos));
    }

    fn push_rt(&mut self, ty: RuntimeType) {
        self.stack.push(ty);
        if self.stack.len() as u32 > self.out.max_height {
            self.out.max_height = self.stack.len() as u32;
        }
    }

    fn push_ty(&mut self, ty: ValType) {
        for rt in runtime_types_of(ty) {
            self.push_rt(*rt);
        }
    }

    /// Pop one slot of the expected runtime type. In unreachable code the
    /// stack may already be at the frame floor; that is tolerated.
    fn pop_rt(&mut self, expected: RuntimeType, pos: u64) -> Result<(), DecodeError> {
        if !self.reachable() && self.height() == self.floor() {
            return Ok(());
        }
        if self.height() == self.floor() {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "value stack underflow".to_string(),
            });
        }
        let actual = self.stack.pop().unwrap();
        if self.reachable() && actual != expected {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: format!("expected {expected:?} on the stack, found {actual:?}"),
            });
        }
        Ok(())
    }

    fn pop_ty(&mut self, ty: ValType, pos: u64) -> Result<(), DecodeError> {
        for rt in runtime_types_of(ty).iter().rev() {
            self.pop_rt(*rt, pos)?;
        }
        Ok(())
    }

    /// Pop any single value (drop/select); returns its runtime type, or
    /// None when popping from an unreachable floor.
    fn pop_any(&mut self, pos: u64) -> Result<Option<RuntimeType>, DecodeError> {
        if self.height() == self.floor() {
            if !self.reachable() {
                return Ok(None);
            }
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "value stack underflow".to_string(),
            });
        }
        Ok(self.stack.pop())
    }

    fn mark_unreachable(&mut self) {
        let floor = self.floor();
        self.stack.truncate(floor as usize);
        if let Some(f) = self.frames.last_mut() {
            f.unreachable = true;
        }
    }

    fn resolve_block_type(&self, encoded: i64, pos: u64) -> Result<FuncType, DecodeError> {
        match encoded {
            -0x40 => Ok(FuncType::default()),
            v if v < 0 => {
                let byte = (v & 0x7F) as u8;
                let ty = crate::module::val_type_from_byte(byte).ok_or(
                    DecodeError::InvalidValueType {
                        byte,
                        offset: pos as usize,
                    },
                )?;
                Ok(FuncType::new(Vec::new(), vec![ty]))
            }
            v => {
                let idx = v as usize;
                self.module.types.get(idx).cloned().ok_or({
                    DecodeError::IndexOutOfRange {
                        space: "type",
                        index: v as u32,
                        offset: pos as usize,
                    }
                })
            }
        }
    }

    fn frame_at_depth(&self, depth: u32, pos: u64) -> Result<usize, DecodeError> {
        let n = self.frames.len() as u32;
        if depth >= n {
            return Err(DecodeError::IndexOutOfRange {
                space: "label",
                index: depth,
                offset: pos as usize,
            });
        }
        Ok((n - 1 - depth) as usize)
    }

    /// Drop range for a branch from the current height to the given frame,
    /// keeping the branch arity on top.
    fn drop_range_for(&self, frame_idx: usize, pos: u64) -> Result<InclusiveRange, DecodeError> {
        let frame = &self.frames[frame_idx];
        let keep: u32 = frame
            .branch_types()
            .iter()
            .map(|t| t.slot_count())
            .sum();
        let h = self.height();
        let base = frame.base_height;
        if !self.reachable() {
            // Heights in unreachable code are nominal; nothing is dropped.
            return Ok(InclusiveRange::NONE);
        }
        if h < base + keep {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "branch target expects more values than the stack holds".to_string(),
            });
        }
        if h - keep == base {
            Ok(InclusiveRange::NONE)
        } else {
            Ok(InclusiveRange::new(keep, h - base - 1))
        }
    }

    /// Check (without popping) that the top of the stack matches the
    /// branch arity of the target frame.
    fn check_branch_types(&self, frame_idx: usize, pos: u64) -> Result<(), DecodeError> {
        if !self.reachable() {
            return Ok(());
        }
        let mut want = Vec::new();
        for ty in self.frames[frame_idx].branch_types() {
            want.extend_from_slice(runtime_types_of(*ty));
        }
        let h = self.stack.len();
        if h < want.len() {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "value stack underflow at branch".to_string(),
            });
        }
        let top = &self.stack[h - want.len()..];
        if top != want.as_slice() {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "branch operand types do not match the target".to_string(),
            });
        }
        Ok(())
    }

    fn fresh_frame_id(&mut self) -> u32 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }

    fn run(&mut self, body: &[u8], body_offset: usize) -> Result<(), DecodeError> {
        let mut r = Reader::new(body);
        while !self.frames.is_empty() {
            let pos = (body_offset + r.pos()) as u64;
            let opcode = r.read_u8().map_err(|_| DecodeError::UnexpectedEof {
                offset: body_offset + body.len(),
            })?;
            self.lower_op(opcode, &mut r, pos, body_offset)?;
        }
        if !r.is_empty() {
            return Err(DecodeError::section(
                body_offset + r.pos(),
                "trailing bytes after function end",
            ));
        }
        Ok(())
    }

    fn lower_op(
        &mut self,
        opcode: u8,
        r: &mut Reader,
        pos: u64,
        body_offset: usize,
    ) -> Result<(), DecodeError> {
        match opcode {
            0x00 => {
                self.emit(Operation::new(OpKind::Unreachable, pos));
                self.mark_unreachable();
            }
            0x01 => {} // nop

            0x02 | 0x03 => {
                // block / loop
                let bt = r.read_var_s33()?;
                let sig = self.resolve_block_type(bt, pos)?;
                self.enter_frame(
                    if opcode == 0x02 {
                        FrameKind::Block
                    } else {
                        FrameKind::Loop
                    },
                    sig,
                    pos,
                )?;
            }
            0x04 => {
                // if
                let bt = r.read_var_s33()?;
                let sig = self.resolve_block_type(bt, pos)?;
                self.pop_rt(RuntimeType::I32, pos)?;
                self.enter_frame(FrameKind::If, sig, pos)?;
            }
            0x05 => self.lower_else(pos)?,
            0x0B => self.lower_end(pos)?,

            0x0C => {
                // br
                let depth = r.read_var_u32()?;
                let idx = self.frame_at_depth(depth, pos)?;
                self.check_branch_types(idx, pos)?;
                let drop = self.drop_range_for(idx, pos)?;
                let target = self.frames[idx].branch_label();
                self.emit(Operation::br(target, drop, pos));
                self.mark_unreachable();
            }
            0x0D => {
                // br_if
                let depth = r.read_var_u32()?;
                self.pop_rt(RuntimeType::I32, pos)?;
                let idx = self.frame_at_depth(depth, pos)?;
                self.check_branch_types(idx, pos)?;
                let drop = self.drop_range_for(idx, pos)?;
                let target = self.frames[idx].branch_label();
                if self.reachable() {
                    let fall = Label::new(self.fresh_frame_id(), LabelKind::Header);
                    self.out.ops.push(Operation::br_if(
                        target,
                        drop,
                        fall,
                        InclusiveRange::NONE,
                        pos,
                    ));
                    let h = self.height();
                    self.emit_label(fall, h, pos);
                }
            }
            0x0E => {
                // br_table
                let count = r.read_var_u32()? as usize;
                let mut depths = Vec::with_capacity(count + 1);
                for _ in 0..count {
                    depths.push(r.read_var_u32()?);
                }
                depths.push(r.read_var_u32()?); // default
                self.pop_rt(RuntimeType::I32, pos)?;
                let default_idx = self.frame_at_depth(depths[count], pos)?;
                self.check_branch_types(default_idx, pos)?;
                if self.reachable() {
                    let mut targets = Vec::with_capacity(count);
                    for &d in &depths[..count] {
                        let idx = self.frame_at_depth(d, pos)?;
                        self.check_branch_types(idx, pos)?;
                        targets.push((
                            self.frames[idx].branch_label(),
                            self.drop_range_for(idx, pos)?,
                        ));
                    }
                    let default = (
                        self.frames[default_idx].branch_label(),
                        self.drop_range_for(default_idx, pos)?,
                    );
                    self.out.ops.push(Operation::br_table(targets, default, pos));
                }
                self.mark_unreachable();
            }
            0x0F => {
                // return
                let idx = 0;
                self.check_branch_types(idx, pos)?;
                let drop = self.drop_range_for(idx, pos)?;
                let target = self.frames[idx].branch_label();
                self.emit(Operation::br(target, drop, pos));
                self.mark_unreachable();
            }

            0x10 => {
                let func_idx = r.read_var_u32()?;
                if func_idx >= self.module.num_funcs() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "function",
                        index: func_idx,
                        offset: pos as usize,
                    });
                }
                let sig = self.module.func_type(func_idx).clone();
                for p in sig.params.iter().rev() {
                    self.pop_ty(*p, pos)?;
                }
                self.emit(Operation::call(func_idx, pos));
                for t in &sig.results {
                    self.push_ty(*t);
                }
            }
            0x11 => {
                let type_idx = r.read_var_u32()?;
                let table_idx = r.read_var_u32()?;
                if type_idx as usize >= self.module.types.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "type",
                        index: type_idx,
                        offset: pos as usize,
                    });
                }
                if table_idx as usize >= self.module.tables.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "table",
                        index: table_idx,
                        offset: pos as usize,
                    });
                }
                let sig = self.module.types[type_idx as usize].clone();
                self.pop_rt(RuntimeType::I32, pos)?;
                for p in sig.params.iter().rev() {
                    self.pop_ty(*p, pos)?;
                }
                self.emit(Operation::call_indirect(type_idx, table_idx, pos));
                for t in &sig.results {
                    self.push_ty(*t);
                }
            }

            0x1A => {
                // drop
                let ty = self.pop_any(pos)?;
                match ty {
                    Some(RuntimeType::V128Hi) => {
                        self.pop_any(pos)?;
                        self.emit(Operation::drop_range(InclusiveRange::new(0, 1), pos));
                    }
                    Some(_) => {
                        self.emit(Operation::drop_range(InclusiveRange::new(0, 0), pos));
                    }
                    None => {}
                }
            }
            0x1B | 0x1C => {
                // select / select t*
                if opcode == 0x1C {
                    let n = r.read_var_u32()?;
                    for _ in 0..n {
                        let _ = r.read_u8()?;
                    }
                }
                self.pop_rt(RuntimeType::I32, pos)?;
                let t2 = self.pop_any(pos)?;
                if t2 == Some(RuntimeType::V128Hi) {
                    self.pop_any(pos)?;
                    self.pop_rt(RuntimeType::V128Hi, pos)?;
                    self.pop_rt(RuntimeType::V128Lo, pos)?;
                    let mut op = Operation::new(OpKind::Select, pos);
                    op.b3 = true;
                    self.emit(op);
                    self.push_rt(RuntimeType::V128Lo);
                    self.push_rt(RuntimeType::V128Hi);
                } else {
                    if let Some(t) = t2 {
                        self.pop_rt(t, pos)?;
                        let mut op = Operation::new(OpKind::Select, pos);
                        op.b1 = t as u8;
                        self.emit(op);
                        self.push_rt(t);
                    }
                }
            }

            0x20..=0x22 => self.lower_local_op(opcode, r, pos)?,
            0x23 | 0x24 => {
                let idx = r.read_var_u32()?;
                let global = self.module.globals.get(idx as usize).ok_or({
                    DecodeError::IndexOutOfRange {
                        space: "global",
                        index: idx,
                        offset: pos as usize,
                    }
                })?;
                let ty = global.ty.val;
                if opcode == 0x23 {
                    let mut op = Operation::new(OpKind::GlobalGet, pos);
                    op.u1 = idx as u64;
                    self.emit(op);
                    self.push_ty(ty);
                } else {
                    if !global.ty.mutable {
                        return Err(DecodeError::TypeMismatch {
                            offset: pos as usize,
                            message: format!("global {idx} is immutable"),
                        });
                    }
                    self.pop_ty(ty, pos)?;
                    let mut op = Operation::new(OpKind::GlobalSet, pos);
                    op.u1 = idx as u64;
                    self.emit(op);
                }
            }

            0x25 | 0x26 => {
                // table.get / table.set
                let idx = r.read_var_u32()?;
                if idx as usize >= self.module.tables.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "table",
                        index: idx,
                        offset: pos as usize,
                    });
                }
                if opcode == 0x25 {
                    self.pop_rt(RuntimeType::I32, pos)?;
                    let mut op = Operation::new(OpKind::TableGet, pos);
                    op.u1 = idx as u64;
                    self.emit(op);
                    self.push_rt(RuntimeType::I64);
                } else {
                    self.pop_rt(RuntimeType::I64, pos)?;
                    self.pop_rt(RuntimeType::I32, pos)?;
                    let mut op = Operation::new(OpKind::TableSet, pos);
                    op.u1 = idx as u64;
                    self.emit(op);
                }
            }

            0x28..=0x3E => self.lower_memory_access(opcode, r, pos)?,

            0x3F | 0x40 => {
                let mem = r.read_u8()?;
                if mem != 0 || self.module.memories.is_empty() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "memory",
                        index: mem as u32,
                        offset: pos as usize,
                    });
                }
                if opcode == 0x3F {
                    self.emit(Operation::new(OpKind::MemorySize, pos));
                    self.push_rt(RuntimeType::I32);
                } else {
                    self.pop_rt(RuntimeType::I32, pos)?;
                    self.emit(Operation::new(OpKind::MemoryGrow, pos));
                    self.push_rt(RuntimeType::I32);
                }
            }

            0x41 => {
                let v = r.read_var_i32()?;
                let mut op = Operation::new(OpKind::I32Const, pos);
                op.u1 = v as u32 as u64;
                self.emit(op);
                self.push_rt(RuntimeType::I32);
            }
            0x42 => {
                let v = r.read_var_i64()?;
                let mut op = Operation::new(OpKind::I64Const, pos);
                op.u1 = v as u64;
                self.emit(op);
                self.push_rt(RuntimeType::I64);
            }
            0x43 => {
                let bits = r.read_f32_bits()?;
                let mut op = Operation::new(OpKind::F32Const, pos);
                op.u1 = bits as u64;
                self.emit(op);
                self.push_rt(RuntimeType::F32);
            }
            0x44 => {
                let bits = r.read_f64_bits()?;
                let mut op = Operation::new(OpKind::F64Const, pos);
                op.u1 = bits;
                self.emit(op);
                self.push_rt(RuntimeType::F64);
            }

            0x45..=0xC4 => self.lower_numeric(opcode, pos)?,

            0xD0 => {
                // ref.null
                let _ = r.read_u8()?;
                let mut op = Operation::new(OpKind::I64Const, pos);
                op.u1 = 0;
                self.emit(op);
                self.push_rt(RuntimeType::I64);
            }
            0xD1 => {
                // ref.is_null
                self.pop_rt(RuntimeType::I64, pos)?;
                let mut op = Operation::new(OpKind::Eqz, pos);
                op.b1 = RuntimeType::I64 as u8;
                self.emit(op);
                self.push_rt(RuntimeType::I32);
            }
            0xD2 => {
                let idx = r.read_var_u32()?;
                if idx >= self.module.num_funcs() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "function",
                        index: idx,
                        offset: pos as usize,
                    });
                }
                let mut op = Operation::new(OpKind::RefFunc, pos);
                op.u1 = idx as u64;
                self.emit(op);
                self.push_rt(RuntimeType::I64);
            }

            0xFC => self.lower_misc(r, pos)?,
            0xFD => self.lower_simd(r, pos)?,

            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: opcode as u32,
                    offset: pos as usize,
                })
            }
        }
        let _ = body_offset;
        Ok(())
    }

    fn enter_frame(
        &mut self,
        kind: FrameKind,
        sig: FuncType,
        pos: u64,
    ) -> Result<(), DecodeError> {
        let reachable = self.reachable();
        for p in sig.params.iter().rev() {
            self.pop_ty(*p, pos)?;
        }
        let base_height = self.height();
        let frame_id = self.fresh_frame_id();
        let frame = ControlFrame {
            frame_id,
            kind,
            base_height,
            params: sig.params,
            results: sig.results,
            unreachable: !reachable,
            else_seen: false,
            emit_labels: reachable,
        };
        let params = frame.params.clone();
        self.frames.push(frame);
        for p in &params {
            self.push_ty(*p);
        }

        if reachable {
            match kind {
                FrameKind::Loop => {
                    let header = Label::new(frame_id, LabelKind::Header);
                    let h = self.height();
                    self.emit_label(header, h, pos);
                }
                FrameKind::If => {
                    let then = Label::new(frame_id, LabelKind::Header);
                    let els = Label::new(frame_id, LabelKind::Else);
                    self.out.ops.push(Operation::br_if(
                        then,
                        InclusiveRange::NONE,
                        els,
                        InclusiveRange::NONE,
                        pos,
                    ));
                    let h = self.height();
                    self.emit_label(then, h, pos);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn lower_else(&mut self, pos: u64) -> Result<(), DecodeError> {
        let frame = self.frames.last().ok_or(DecodeError::TypeMismatch {
            offset: pos as usize,
            message: "else outside of if".to_string(),
        })?;
        if frame.kind != FrameKind::If || frame.else_seen {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: "else outside of if".to_string(),
            });
        }
        let emit_labels = frame.emit_labels;
        let base = frame.base_height;
        let frame_id = frame.frame_id;
        let results = frame.results.clone();
        let params = frame.params.clone();

        if emit_labels {
            // Validate the then-arm's fallthrough and jump over the else
            // body to the continuation.
            if self.reachable() {
                for t in results.iter().rev() {
                    self.pop_ty(*t, pos)?;
                }
                if self.height() != base {
                    return Err(DecodeError::TypeMismatch {
                        offset: pos as usize,
                        message: "surplus values at end of then-arm".to_string(),
                    });
                }
                for t in &results {
                    self.push_ty(*t);
                }
                self.out.ops.push(Operation::br(
                    Label::new(frame_id, LabelKind::Continuation),
                    InclusiveRange::NONE,
                    pos,
                ));
            }
            // The else arm starts fresh from the frame entry state.
            self.stack.truncate(base as usize);
            for p in &params {
                self.push_ty(*p);
            }
            let h = self.height();
            self.emit_label(Label::new(frame_id, LabelKind::Else), h, pos);
            let f = self.frames.last_mut().unwrap();
            f.unreachable = false;
            f.else_seen = true;
        } else {
            self.stack.truncate(base as usize);
            let f = self.frames.last_mut().unwrap();
            f.else_seen = true;
        }
        Ok(())
    }

    fn lower_end(&mut self, pos: u64) -> Result<(), DecodeError> {
        let frame = self.frames.last().ok_or(DecodeError::TypeMismatch {
            offset: pos as usize,
            message: "unbalanced end".to_string(),
        })?;
        let emit_labels = frame.emit_labels;
        let base = frame.base_height;
        let frame_id = frame.frame_id;
        let kind = frame.kind;
        let else_seen = frame.else_seen;
        let results = frame.results.clone();
        let params = frame.params.clone();

        if emit_labels && self.reachable() {
            for t in results.iter().rev() {
                self.pop_ty(*t, pos)?;
            }
            if self.height() != base {
                return Err(DecodeError::TypeMismatch {
                    offset: pos as usize,
                    message: "surplus values at end of block".to_string(),
                });
            }
        }

        self.frames.pop();

        if emit_labels {
            if kind == FrameKind::If && !else_seen {
                // No else arm: the false edge lands here with the params
                // still on the stack (params must equal results).
                let h = base + params.iter().map(|t| t.slot_count()).sum::<u32>();
                self.emit_label(Label::new(frame_id, LabelKind::Else), h, pos);
            }
            let result_slots: u32 = results.iter().map(|t| t.slot_count()).sum();
            let label = if kind == FrameKind::Body {
                Label::new(frame_id, LabelKind::Return)
            } else {
                Label::new(frame_id, LabelKind::Continuation)
            };
            self.emit_label(label, base + result_slots, pos);

            self.stack.truncate(base as usize);
            for t in &results {
                self.push_ty(*t);
            }
        }
        // Frames opened in unreachable code leave the stack untouched; the
        // parent frame is still unreachable.
        Ok(())
    }

    fn lower_local_op(&mut self, opcode: u8, r: &mut Reader, pos: u64) -> Result<(), DecodeError> {
        let idx = r.read_var_u32()? as usize;
        if idx >= self.out.local_slots.len() {
            return Err(DecodeError::IndexOutOfRange {
                space: "local",
                index: idx as u32,
                offset: pos as usize,
            });
        }
        let slot = self.out.local_slots[idx];
        let ty = self.local_type(idx);
        let is_vec = ty == ValType::V128;

        match opcode {
            0x20 => {
                // local.get: duplicate the local's slot(s) onto the top.
                let depth = self.height() - 1 - slot;
                self.emit(Operation::pick(depth, is_vec, pos));
                self.push_ty(ty);
            }
            0x21 => {
                // local.set
                let depth = self.height() - 1 - slot;
                self.pop_ty(ty, pos)?;
                self.emit(Operation::set(depth, is_vec, pos));
            }
            0x22 => {
                // local.tee: duplicate the top, then set the duplicate.
                if self.reachable() {
                    let dup_depth = if is_vec { 1 } else { 0 };
                    self.emit(Operation::pick(dup_depth, is_vec, pos));
                    self.push_ty(ty);
                    let depth = self.height() - 1 - slot;
                    self.pop_ty(ty, pos)?;
                    self.emit(Operation::set(depth, is_vec, pos));
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn local_type(&self, idx: usize) -> ValType {
        self.local_types[idx]
    }

    fn lower_memory_access(
        &mut self,
        opcode: u8,
        r: &mut Reader,
        pos: u64,
    ) -> Result<(), DecodeError> {
        if self.module.memories.is_empty() {
            return Err(DecodeError::IndexOutOfRange {
                space: "memory",
                index: 0,
                offset: pos as usize,
            });
        }
        let align_exp = r.read_var_u32()?;
        let offset = r.read_var_u32()?;

        // (kind, value type, natural alignment exponent, signed)
        let (kind, ty, natural, signed) = match opcode {
            0x28 => (OpKind::Load, RuntimeType::I32, 2, false),
            0x29 => (OpKind::Load, RuntimeType::I64, 3, false),
            0x2A => (OpKind::Load, RuntimeType::F32, 2, false),
            0x2B => (OpKind::Load, RuntimeType::F64, 3, false),
            0x2C => (OpKind::Load8, RuntimeType::I32, 0, true),
            0x2D => (OpKind::Load8, RuntimeType::I32, 0, false),
            0x2E => (OpKind::Load16, RuntimeType::I32, 1, true),
            0x2F => (OpKind::Load16, RuntimeType::I32, 1, false),
            0x30 => (OpKind::Load8, RuntimeType::I64, 0, true),
            0x31 => (OpKind::Load8, RuntimeType::I64, 0, false),
            0x32 => (OpKind::Load16, RuntimeType::I64, 1, true),
            0x33 => (OpKind::Load16, RuntimeType::I64, 1, false),
            0x34 => (OpKind::Load32, RuntimeType::I64, 2, true),
            0x35 => (OpKind::Load32, RuntimeType::I64, 2, false),
            0x36 => (OpKind::Store, RuntimeType::I32, 2, false),
            0x37 => (OpKind::Store, RuntimeType::I64, 3, false),
            0x38 => (OpKind::Store, RuntimeType::F32, 2, false),
            0x39 => (OpKind::Store, RuntimeType::F64, 3, false),
            0x3A => (OpKind::Store8, RuntimeType::I32, 0, false),
            0x3B => (OpKind::Store16, RuntimeType::I32, 1, false),
            0x3C => (OpKind::Store8, RuntimeType::I64, 0, false),
            0x3D => (OpKind::Store16, RuntimeType::I64, 1, false),
            0x3E => (OpKind::Store32, RuntimeType::I64, 2, false),
            _ => unreachable!(),
        };
        if align_exp > natural {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: format!("alignment 2^{align_exp} exceeds natural alignment"),
            });
        }

        let is_store = matches!(
            kind,
            OpKind::Store | OpKind::Store8 | OpKind::Store16 | OpKind::Store32
        );
        if is_store {
            self.pop_rt(ty, pos)?;
            self.pop_rt(RuntimeType::I32, pos)?;
        } else {
            self.pop_rt(RuntimeType::I32, pos)?;
        }

        let mut op = Operation::new(kind, pos);
        op.b1 = ty as u8;
        op.b2 = align_exp as u8;
        op.b3 = signed;
        op.u1 = MemArg {
            align_exp: align_exp as u8,
            offset,
        }
        .pack();
        self.emit(op);

        if !is_store {
            self.push_rt(ty);
        }
        Ok(())
    }

    fn lower_numeric(&mut self, opcode: u8, pos: u64) -> Result<(), DecodeError> {
        use RuntimeType::*;

        // (kind, operand type, result type, signed)
        struct N(OpKind, RuntimeType, RuntimeType, bool);
        let n = match opcode {
            0x45 => N(OpKind::Eqz, I32, I32, false),
            0x46 => N(OpKind::Eq, I32, I32, false),
            0x47 => N(OpKind::Ne, I32, I32, false),
            0x48 => N(OpKind::Lt, I32, I32, true),
            0x49 => N(OpKind::Lt, I32, I32, false),
            0x4A => N(OpKind::Gt, I32, I32, true),
            0x4B => N(OpKind::Gt, I32, I32, false),
            0x4C => N(OpKind::Le, I32, I32, true),
            0x4D => N(OpKind::Le, I32, I32, false),
            0x4E => N(OpKind::Ge, I32, I32, true),
            0x4F => N(OpKind::Ge, I32, I32, false),
            0x50 => N(OpKind::Eqz, I64, I32, false),
            0x51 => N(OpKind::Eq, I64, I32, false),
            0x52 => N(OpKind::Ne, I64, I32, false),
            0x53 => N(OpKind::Lt, I64, I32, true),
            0x54 => N(OpKind::Lt, I64, I32, false),
            0x55 => N(OpKind::Gt, I64, I32, true),
            0x56 => N(OpKind::Gt, I64, I32, false),
            0x57 => N(OpKind::Le, I64, I32, true),
            0x58 => N(OpKind::Le, I64, I32, false),
            0x59 => N(OpKind::Ge, I64, I32, true),
            0x5A => N(OpKind::Ge, I64, I32, false),
            0x5B => N(OpKind::Eq, F32, I32, false),
            0x5C => N(OpKind::Ne, F32, I32, false),
            0x5D => N(OpKind::Lt, F32, I32, false),
            0x5E => N(OpKind::Gt, F32, I32, false),
            0x5F => N(OpKind::Le, F32, I32, false),
            0x60 => N(OpKind::Ge, F32, I32, false),
            0x61 => N(OpKind::Eq, F64, I32, false),
            0x62 => N(OpKind::Ne, F64, I32, false),
            0x63 => N(OpKind::Lt, F64, I32, false),
            0x64 => N(OpKind::Gt, F64, I32, false),
            0x65 => N(OpKind::Le, F64, I32, false),
            0x66 => N(OpKind::Ge, F64, I32, false),

            0x67 => N(OpKind::Clz, I32, I32, false),
            0x68 => N(OpKind::Ctz, I32, I32, false),
            0x69 => N(OpKind::Popcnt, I32, I32, false),
            0x6A => N(OpKind::Add, I32, I32, false),
            0x6B => N(OpKind::Sub, I32, I32, false),
            0x6C => N(OpKind::Mul, I32, I32, false),
            0x6D => N(OpKind::Div, I32, I32, true),
            0x6E => N(OpKind::Div, I32, I32, false),
            0x6F => N(OpKind::Rem, I32, I32, true),
            0x70 => N(OpKind::Rem, I32, I32, false),
            0x71 => N(OpKind::And, I32, I32, false),
            0x72 => N(OpKind::Or, I32, I32, false),
            0x73 => N(OpKind::Xor, I32, I32, false),
            0x74 => N(OpKind::Shl, I32, I32, false),
            0x75 => N(OpKind::Shr, I32, I32, true),
            0x76 => N(OpKind::Shr, I32, I32, false),
            0x77 => N(OpKind::Rotl, I32, I32, false),
            0x78 => N(OpKind::Rotr, I32, I32, false),

            0x79 => N(OpKind::Clz, I64, I64, false),
            0x7A => N(OpKind::Ctz, I64, I64, false),
            0x7B => N(OpKind::Popcnt, I64, I64, false),
            0x7C => N(OpKind::Add, I64, I64, false),
            0x7D => N(OpKind::Sub, I64, I64, false),
            0x7E => N(OpKind::Mul, I64, I64, false),
            0x7F => N(OpKind::Div, I64, I64, true),
            0x80 => N(OpKind::Div, I64, I64, false),
            0x81 => N(OpKind::Rem, I64, I64, true),
            0x82 => N(OpKind::Rem, I64, I64, false),
            0x83 => N(OpKind::And, I64, I64, false),
            0x84 => N(OpKind::Or, I64, I64, false),
            0x85 => N(OpKind::Xor, I64, I64, false),
            0x86 => N(OpKind::Shl, I64, I64, false),
            0x87 => N(OpKind::Shr, I64, I64, true),
            0x88 => N(OpKind::Shr, I64, I64, false),
            0x89 => N(OpKind::Rotl, I64, I64, false),
            0x8A => N(OpKind::Rotr, I64, I64, false),

            0x8B => N(OpKind::Abs, F32, F32, false),
            0x8C => N(OpKind::Neg, F32, F32, false),
            0x8D => N(OpKind::Ceil, F32, F32, false),
            0x8E => N(OpKind::Floor, F32, F32, false),
            0x8F => N(OpKind::Trunc, F32, F32, false),
            0x90 => N(OpKind::Nearest, F32, F32, false),
            0x91 => N(OpKind::Sqrt, F32, F32, false),
            0x92 => N(OpKind::Add, F32, F32, false),
            0x93 => N(OpKind::Sub, F32, F32, false),
            0x94 => N(OpKind::Mul, F32, F32, false),
            0x95 => N(OpKind::Div, F32, F32, false),
            0x96 => N(OpKind::Min, F32, F32, false),
            0x97 => N(OpKind::Max, F32, F32, false),
            0x98 => N(OpKind::Copysign, F32, F32, false),

            0x99 => N(OpKind::Abs, F64, F64, false),
            0x9A => N(OpKind::Neg, F64, F64, false),
            0x9B => N(OpKind::Ceil, F64, F64, false),
            0x9C => N(OpKind::Floor, F64, F64, false),
            0x9D => N(OpKind::Trunc, F64, F64, false),
            0x9E => N(OpKind::Nearest, F64, F64, false),
            0x9F => N(OpKind::Sqrt, F64, F64, false),
            0xA0 => N(OpKind::Add, F64, F64, false),
            0xA1 => N(OpKind::Sub, F64, F64, false),
            0xA2 => N(OpKind::Mul, F64, F64, false),
            0xA3 => N(OpKind::Div, F64, F64, false),
            0xA4 => N(OpKind::Min, F64, F64, false),
            0xA5 => N(OpKind::Max, F64, F64, false),
            0xA6 => N(OpKind::Copysign, F64, F64, false),

            0xA7 => N(OpKind::I32WrapI64, I64, I32, false),
            0xA8 => N(OpKind::ITruncF, F32, I32, true),
            0xA9 => N(OpKind::ITruncF, F32, I32, false),
            0xAA => N(OpKind::ITruncF, F64, I32, true),
            0xAB => N(OpKind::ITruncF, F64, I32, false),
            0xAC => N(OpKind::I64ExtendI32, I32, I64, true),
            0xAD => N(OpKind::I64ExtendI32, I32, I64, false),
            0xAE => N(OpKind::ITruncF, F32, I64, true),
            0xAF => N(OpKind::ITruncF, F32, I64, false),
            0xB0 => N(OpKind::ITruncF, F64, I64, true),
            0xB1 => N(OpKind::ITruncF, F64, I64, false),
            0xB2 => N(OpKind::FConvertI, I32, F32, true),
            0xB3 => N(OpKind::FConvertI, I32, F32, false),
            0xB4 => N(OpKind::FConvertI, I64, F32, true),
            0xB5 => N(OpKind::FConvertI, I64, F32, false),
            0xB6 => N(OpKind::F32DemoteF64, F64, F32, false),
            0xB7 => N(OpKind::FConvertI, I32, F64, true),
            0xB8 => N(OpKind::FConvertI, I32, F64, false),
            0xB9 => N(OpKind::FConvertI, I64, F64, true),
            0xBA => N(OpKind::FConvertI, I64, F64, false),
            0xBB => N(OpKind::F64PromoteF32, F32, F64, false),
            0xBC => N(OpKind::I32ReinterpretF32, F32, I32, false),
            0xBD => N(OpKind::I64ReinterpretF64, F64, I64, false),
            0xBE => N(OpKind::F32ReinterpretI32, I32, F32, false),
            0xBF => N(OpKind::F64ReinterpretI64, I64, F64, false),
            0xC0 => N(OpKind::SignExtend32From8, I32, I32, false),
            0xC1 => N(OpKind::SignExtend32From16, I32, I32, false),
            0xC2 => N(OpKind::SignExtend64From8, I64, I64, false),
            0xC3 => N(OpKind::SignExtend64From16, I64, I64, false),
            0xC4 => N(OpKind::SignExtend64From32, I64, I64, false),

            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: opcode as u32,
                    offset: pos as usize,
                })
            }
        };
        let N(kind, operand, result, signed) = n;

        let is_binary = matches!(
            kind,
            OpKind::Eq
                | OpKind::Ne
                | OpKind::Lt
                | OpKind::Gt
                | OpKind::Le
                | OpKind::Ge
                | OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Rem
                | OpKind::And
                | OpKind::Or
                | OpKind::Xor
                | OpKind::Shl
                | OpKind::Shr
                | OpKind::Rotl
                | OpKind::Rotr
                | OpKind::Min
                | OpKind::Max
                | OpKind::Copysign
        );
        self.pop_rt(operand, pos)?;
        if is_binary {
            self.pop_rt(operand, pos)?;
        }

        let mut op = Operation::new(kind, pos);
        op.b1 = operand as u8;
        op.b2 = result as u8;
        op.b3 = signed;
        self.emit(op);
        self.push_rt(result);
        Ok(())
    }

    fn lower_misc(&mut self, r: &mut Reader, pos: u64) -> Result<(), DecodeError> {
        use RuntimeType::*;
        let sub = r.read_var_u32()?;
        match sub {
            // Saturating truncations share the ITruncF kind with u1 = 1.
            0..=7 => {
                let (from, to, signed) = match sub {
                    0 => (F32, I32, true),
                    1 => (F32, I32, false),
                    2 => (F64, I32, true),
                    3 => (F64, I32, false),
                    4 => (F32, I64, true),
                    5 => (F32, I64, false),
                    6 => (F64, I64, true),
                    _ => (F64, I64, false),
                };
                self.pop_rt(from, pos)?;
                let mut op = Operation::new(OpKind::ITruncF, pos);
                op.b1 = from as u8;
                op.b2 = to as u8;
                op.b3 = signed;
                op.u1 = 1;
                self.emit(op);
                self.push_rt(to);
            }
            8 => {
                // memory.init data_idx mem
                let data_idx = r.read_var_u32()?;
                let mem = r.read_u8()?;
                if mem != 0 || data_idx as usize >= self.module.datas.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "data segment",
                        index: data_idx,
                        offset: pos as usize,
                    });
                }
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::MemoryInit, pos);
                op.u1 = data_idx as u64;
                self.emit(op);
            }
            9 => {
                let data_idx = r.read_var_u32()?;
                if data_idx as usize >= self.module.datas.len() {
                    return Err(DecodeError::IndexOutOfRange {
                        space: "data segment",
                        index: data_idx,
                        offset: pos as usize,
                    });
                }
                let mut op = Operation::new(OpKind::DataDrop, pos);
                op.u1 = data_idx as u64;
                self.emit(op);
            }
            10 => {
                let _ = r.read_u8()?;
                let _ = r.read_u8()?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.emit(Operation::new(OpKind::MemoryCopy, pos));
            }
            11 => {
                let _ = r.read_u8()?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.emit(Operation::new(OpKind::MemoryFill, pos));
            }
            12 => {
                // table.init elem_idx table_idx
                let elem_idx = r.read_var_u32()?;
                let table_idx = r.read_var_u32()?;
                self.check_elem(elem_idx, pos)?;
                self.check_table(table_idx, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::TableInit, pos);
                op.u1 = elem_idx as u64;
                op.u2 = table_idx as u64;
                self.emit(op);
            }
            13 => {
                let elem_idx = r.read_var_u32()?;
                self.check_elem(elem_idx, pos)?;
                let mut op = Operation::new(OpKind::ElemDrop, pos);
                op.u1 = elem_idx as u64;
                self.emit(op);
            }
            14 => {
                let dst = r.read_var_u32()?;
                let src = r.read_var_u32()?;
                self.check_table(dst, pos)?;
                self.check_table(src, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::TableCopy, pos);
                op.u1 = dst as u64;
                op.u2 = src as u64;
                self.emit(op);
            }
            15 => {
                let table_idx = r.read_var_u32()?;
                self.check_table(table_idx, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I64, pos)?;
                let mut op = Operation::new(OpKind::TableGrow, pos);
                op.u1 = table_idx as u64;
                self.emit(op);
                self.push_rt(I32);
            }
            16 => {
                let table_idx = r.read_var_u32()?;
                self.check_table(table_idx, pos)?;
                let mut op = Operation::new(OpKind::TableSize, pos);
                op.u1 = table_idx as u64;
                self.emit(op);
                self.push_rt(I32);
            }
            17 => {
                let table_idx = r.read_var_u32()?;
                self.check_table(table_idx, pos)?;
                self.pop_rt(I32, pos)?;
                self.pop_rt(I64, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::TableFill, pos);
                op.u1 = table_idx as u64;
                self.emit(op);
            }
            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: 0xFC00 | sub,
                    offset: pos as usize,
                })
            }
        }
        Ok(())
    }

    fn check_table(&self, idx: u32, pos: u64) -> Result<(), DecodeError> {
        if idx as usize >= self.module.tables.len() {
            return Err(DecodeError::IndexOutOfRange {
                space: "table",
                index: idx,
                offset: pos as usize,
            });
        }
        Ok(())
    }

    fn check_elem(&self, idx: u32, pos: u64) -> Result<(), DecodeError> {
        if idx as usize >= self.module.elems.len() {
            return Err(DecodeError::IndexOutOfRange {
                space: "element segment",
                index: idx,
                offset: pos as usize,
            });
        }
        Ok(())
    }

    fn read_mem_arg(&mut self, r: &mut Reader, max_align: u32, pos: u64) -> Result<MemArg, DecodeError> {
        if self.module.memories.is_empty() {
            return Err(DecodeError::IndexOutOfRange {
                space: "memory",
                index: 0,
                offset: pos as usize,
            });
        }
        let align_exp = r.read_var_u32()?;
        let offset = r.read_var_u32()?;
        if align_exp > max_align {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: format!("alignment 2^{align_exp} exceeds natural alignment"),
            });
        }
        Ok(MemArg {
            align_exp: align_exp as u8,
            offset,
        })
    }

    fn simd_pop2_push1(&mut self, pos: u64) -> Result<(), DecodeError> {
        self.pop_rt(RuntimeType::V128Hi, pos)?;
        self.pop_rt(RuntimeType::V128Lo, pos)?;
        self.pop_rt(RuntimeType::V128Hi, pos)?;
        self.pop_rt(RuntimeType::V128Lo, pos)?;
        self.push_rt(RuntimeType::V128Lo);
        self.push_rt(RuntimeType::V128Hi);
        Ok(())
    }

    fn simd_pop1_push1(&mut self, pos: u64) -> Result<(), DecodeError> {
        self.pop_rt(RuntimeType::V128Hi, pos)?;
        self.pop_rt(RuntimeType::V128Lo, pos)?;
        self.push_rt(RuntimeType::V128Lo);
        self.push_rt(RuntimeType::V128Hi);
        Ok(())
    }

    fn lower_simd(&mut self, r: &mut Reader, pos: u64) -> Result<(), DecodeError> {
        use RuntimeType::{F32, F64, I32, I64, V128Hi, V128Lo};
        use Shape::*;
        let sub = r.read_var_u32()?;
        match sub {
            0 => {
                // v128.load
                let arg = self.read_mem_arg(r, 4, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::V128Load, pos);
                op.b1 = V128LoadKind::Full as u8;
                op.u1 = arg.pack();
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            1..=6 => {
                // extending 64-bit loads
                let arg = self.read_mem_arg(r, 3, pos)?;
                let (kind, signed) = match sub {
                    1 => (V128LoadKind::Ext8x8, true),
                    2 => (V128LoadKind::Ext8x8, false),
                    3 => (V128LoadKind::Ext16x4, true),
                    4 => (V128LoadKind::Ext16x4, false),
                    5 => (V128LoadKind::Ext32x2, true),
                    _ => (V128LoadKind::Ext32x2, false),
                };
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::V128Load, pos);
                op.b1 = kind as u8;
                op.b3 = signed;
                op.u1 = arg.pack();
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            7..=10 => {
                // splat loads
                let (kind, natural) = match sub {
                    7 => (V128LoadKind::Splat8, 0),
                    8 => (V128LoadKind::Splat16, 1),
                    9 => (V128LoadKind::Splat32, 2),
                    _ => (V128LoadKind::Splat64, 3),
                };
                let arg = self.read_mem_arg(r, natural, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::V128Load, pos);
                op.b1 = kind as u8;
                op.u1 = arg.pack();
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            92 | 93 => {
                // zero-extending loads
                let (kind, natural) = if sub == 92 {
                    (V128LoadKind::Zero32, 2)
                } else {
                    (V128LoadKind::Zero64, 3)
                };
                let arg = self.read_mem_arg(r, natural, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::V128Load, pos);
                op.b1 = kind as u8;
                op.u1 = arg.pack();
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            11 => {
                // v128.store
                let arg = self.read_mem_arg(r, 4, pos)?;
                self.pop_rt(V128Hi, pos)?;
                self.pop_rt(V128Lo, pos)?;
                self.pop_rt(I32, pos)?;
                let mut op = Operation::new(OpKind::V128Store, pos);
                op.u1 = arg.pack();
                self.emit(op);
            }
            84..=87 | 88..=91 => {
                // lane loads/stores
                let lane_log2 = (sub as u8 - if sub >= 88 { 88 } else { 84 }) as u8;
                let arg = self.read_mem_arg(r, lane_log2 as u32, pos)?;
                let lane = r.read_u8()?;
                let lanes = 16 >> lane_log2;
                if lane >= lanes {
                    return Err(DecodeError::TypeMismatch {
                        offset: pos as usize,
                        message: format!("lane {lane} out of range"),
                    });
                }
                self.pop_rt(V128Hi, pos)?;
                self.pop_rt(V128Lo, pos)?;
                self.pop_rt(I32, pos)?;
                let kind = if sub >= 88 {
                    OpKind::V128StoreLane
                } else {
                    OpKind::V128LoadLane
                };
                let mut op = Operation::new(kind, pos);
                op.b1 = lane_log2;
                op.u1 = arg.pack();
                op.u2 = lane as u64;
                self.emit(op);
                if sub < 88 {
                    self.push_rt(V128Lo);
                    self.push_rt(V128Hi);
                }
            }
            12 => {
                // v128.const
                let bytes = r.read_bytes(16)?;
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bytes);
                let v = u128::from_le_bytes(buf);
                let mut op = Operation::new(OpKind::V128Const, pos);
                op.u1 = v as u64;
                op.u2 = (v >> 64) as u64;
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            13 => {
                // i8x16.shuffle
                let bytes = r.read_bytes(16)?;
                for (i, b) in bytes.iter().enumerate() {
                    if *b >= 32 {
                        return Err(DecodeError::TypeMismatch {
                            offset: pos as usize,
                            message: format!("shuffle lane {i} selects {b}, max is 31"),
                        });
                    }
                }
                let mut lo = 0u64;
                let mut hi = 0u64;
                for i in 0..8 {
                    lo |= (bytes[i] as u64) << (8 * i);
                    hi |= (bytes[8 + i] as u64) << (8 * i);
                }
                self.simd_pop2_push1(pos)?;
                // simd_pop2_push1 already adjusted the stack; attach fields.
                let mut op = Operation::new(OpKind::V128Shuffle, pos);
                op.u1 = lo;
                op.u2 = hi;
                self.emit(op);
            }
            14 => {
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128Swizzle, pos));
            }
            15..=20 => {
                // splat from scalar
                let shape = Shape::from_u8((sub - 15) as u8);
                let scalar = match shape {
                    I8x16 | I16x8 | I32x4 => I32,
                    I64x2 => I64,
                    F32x4 => F32,
                    F64x2 => F64,
                };
                self.pop_rt(scalar, pos)?;
                let mut op = Operation::new(OpKind::V128Splat, pos);
                op.b1 = shape as u8;
                self.emit(op);
                self.push_rt(V128Lo);
                self.push_rt(V128Hi);
            }
            21..=34 => self.lower_simd_lane(sub, r, pos)?,
            35..=76 | 214..=219 => self.lower_simd_cmp(sub, pos)?,
            77 => {
                self.simd_pop1_push1(pos)?;
                self.emit(Operation::new(OpKind::V128Not, pos));
            }
            78 => {
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128And, pos));
            }
            79 => {
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128AndNot, pos));
            }
            80 => {
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128Or, pos));
            }
            81 => {
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128Xor, pos));
            }
            82 => {
                // bitselect: three operands
                self.pop_rt(V128Hi, pos)?;
                self.pop_rt(V128Lo, pos)?;
                self.simd_pop2_push1(pos)?;
                self.emit(Operation::new(OpKind::V128Bitselect, pos));
            }
            83 => {
                self.pop_rt(V128Hi, pos)?;
                self.pop_rt(V128Lo, pos)?;
                self.emit(Operation::new(OpKind::V128AnyTrue, pos));
                self.push_rt(I32);
            }
            94 => {
                self.simd_pop1_push1(pos)?;
                self.emit(Operation::new(OpKind::V128FloatDemote, pos));
            }
            95 => {
                self.simd_pop1_push1(pos)?;
                self.emit(Operation::new(OpKind::V128FloatPromote, pos));
            }
            _ => self.lower_simd_shaped(sub, pos)?,
        }
        Ok(())
    }

    fn lower_simd_lane(&mut self, sub: u32, r: &mut Reader, pos: u64) -> Result<(), DecodeError> {
        use RuntimeType::{F32, F64, I32, I64, V128Hi, V128Lo};
        // (shape, extract?, signed)
        let (shape, is_extract, signed) = match sub {
            21 => (Shape::I8x16, true, true),
            22 => (Shape::I8x16, true, false),
            23 => (Shape::I8x16, false, false),
            24 => (Shape::I16x8, true, true),
            25 => (Shape::I16x8, true, false),
            26 => (Shape::I16x8, false, false),
            27 => (Shape::I32x4, true, false),
            28 => (Shape::I32x4, false, false),
            29 => (Shape::I64x2, true, false),
            30 => (Shape::I64x2, false, false),
            31 => (Shape::F32x4, true, false),
            32 => (Shape::F32x4, false, false),
            33 => (Shape::F64x2, true, false),
            _ => (Shape::F64x2, false, false),
        };
        let lane = r.read_u8()?;
        if lane >= shape.lanes() {
            return Err(DecodeError::TypeMismatch {
                offset: pos as usize,
                message: format!("lane {lane} out of range"),
            });
        }
        let scalar = match shape {
            Shape::I8x16 | Shape::I16x8 | Shape::I32x4 => I32,
            Shape::I64x2 => I64,
            Shape::F32x4 => F32,
            Shape::F64x2 => F64,
        };
        if is_extract {
            self.pop_rt(V128Hi, pos)?;
            self.pop_rt(V128Lo, pos)?;
            let mut op = Operation::new(OpKind::V128ExtractLane, pos);
            op.b1 = shape as u8;
            op.b2 = lane;
            op.b3 = signed;
            self.emit(op);
            self.push_rt(scalar);
        } else {
            self.pop_rt(scalar, pos)?;
            self.pop_rt(V128Hi, pos)?;
            self.pop_rt(V128Lo, pos)?;
            let mut op = Operation::new(OpKind::V128ReplaceLane, pos);
            op.b1 = shape as u8;
            op.b2 = lane;
            self.emit(op);
            self.push_rt(V128Lo);
            self.push_rt(V128Hi);
        }
        Ok(())
    }

    fn lower_simd_cmp(&mut self, sub: u32, pos: u64) -> Result<(), DecodeError> {
        // Integer shapes get ten comparisons, float shapes six, i64x2 six
        // signed-only at 214.
        let (shape, idx) = match sub {
            35..=44 => (Shape::I8x16, sub - 35),
            45..=54 => (Shape::I16x8, sub - 45),
            55..=64 => (Shape::I32x4, sub - 55),
            65..=70 => (Shape::F32x4, sub - 65),
            71..=76 => (Shape::F64x2, sub - 71),
            214..=219 => (Shape::I64x2, sub - 214),
            _ => unreachable!(),
        };
        let (cmp, signed) = if shape.is_float() {
            let cmp = match idx {
                0 => V128CmpKind::Eq,
                1 => V128CmpKind::Ne,
                2 => V128CmpKind::Lt,
                3 => V128CmpKind::Gt,
                4 => V128CmpKind::Le,
                _ => V128CmpKind::Ge,
            };
            (cmp, false)
        } else if shape == Shape::I64x2 {
            let cmp = match idx {
                0 => V128CmpKind::Eq,
                1 => V128CmpKind::Ne,
                2 => V128CmpKind::Lt,
                3 => V128CmpKind::Gt,
                4 => V128CmpKind::Le,
                _ => V128CmpKind::Ge,
            };
            (cmp, true)
        } else {
            let (cmp, signed) = match idx {
                0 => (V128CmpKind::Eq, false),
                1 => (V128CmpKind::Ne, false),
                2 => (V128CmpKind::Lt, true),
                3 => (V128CmpKind::Lt, false),
                4 => (V128CmpKind::Gt, true),
                5 => (V128CmpKind::Gt, false),
                6 => (V128CmpKind::Le, true),
                7 => (V128CmpKind::Le, false),
                8 => (V128CmpKind::Ge, true),
                _ => (V128CmpKind::Ge, false),
            };
            (cmp, signed)
        };
        self.simd_pop2_push1(pos)?;
        let mut op = Operation::new(OpKind::V128Cmp, pos);
        op.b1 = shape as u8;
        op.b2 = cmp as u8;
        op.b3 = signed;
        self.emit(op);
        Ok(())
    }

    fn lower_simd_shaped(&mut self, sub: u32, pos: u64) -> Result<(), DecodeError> {
        use RuntimeType::{I32, V128Hi, V128Lo};
        use Shape::*;

        // Unary v128 → v128.
        macro_rules! unop {
            ($kind:expr, $shape:expr) => {{
                self.simd_pop1_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                self.emit(op);
            }};
            ($kind:expr, $shape:expr, $signed:expr) => {{
                self.simd_pop1_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                op.b3 = $signed;
                self.emit(op);
            }};
        }
        // Binary v128 × v128 → v128.
        macro_rules! binop {
            ($kind:expr, $shape:expr) => {{
                self.simd_pop2_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                self.emit(op);
            }};
            ($kind:expr, $shape:expr, $signed:expr) => {{
                self.simd_pop2_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                op.b3 = $signed;
                self.emit(op);
            }};
        }
        // v128 → i32 reductions.
        macro_rules! reduce {
            ($kind:expr, $shape:expr) => {{
                self.pop_rt(V128Hi, pos)?;
                self.pop_rt(V128Lo, pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                self.emit(op);
                self.push_rt(I32);
            }};
        }
        // Shifts take a scalar count.
        macro_rules! shift {
            ($kind:expr, $shape:expr, $signed:expr) => {{
                self.pop_rt(I32, pos)?;
                self.simd_pop1_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $shape as u8;
                op.b3 = $signed;
                self.emit(op);
            }};
        }
        // Extend / extmul carry low/high in b2 and signedness in b3; b1 is
        // the origin shape.
        macro_rules! extend {
            ($kind:expr, $origin:expr, $low:expr, $signed:expr) => {{
                self.simd_pop1_push1(pos)?;
                let mut op = Operation::new($kind, pos);
                op.b1 = $origin as u8;
                op.b2 = if $low { 1 } else { 0 };
                op.b3 = $signed;
                self.emit(op);
            }};
        }
        macro_rules! extmul {
            ($origin:expr, $low:expr, $signed:expr) => {{
                self.simd_pop2_push1(pos)?;
                let mut op = Operation::new(OpKind::V128ExtMul, pos);
                op.b1 = $origin as u8;
                op.b2 = if $low { 1 } else { 0 };
                op.b3 = $signed;
                self.emit(op);
            }};
        }

        match sub {
            96 => unop!(OpKind::V128Abs, I8x16),
            97 => unop!(OpKind::V128Neg, I8x16),
            98 => unop!(OpKind::V128Popcnt, I8x16),
            99 => reduce!(OpKind::V128AllTrue, I8x16),
            100 => reduce!(OpKind::V128Bitmask, I8x16),
            101 => binop!(OpKind::V128Narrow, I16x8, true),
            102 => binop!(OpKind::V128Narrow, I16x8, false),
            103 => unop!(OpKind::V128Ceil, F32x4),
            104 => unop!(OpKind::V128Floor, F32x4),
            105 => unop!(OpKind::V128Trunc, F32x4),
            106 => unop!(OpKind::V128Nearest, F32x4),
            107 => shift!(OpKind::V128Shl, I8x16, false),
            108 => shift!(OpKind::V128Shr, I8x16, true),
            109 => shift!(OpKind::V128Shr, I8x16, false),
            110 => binop!(OpKind::V128Add, I8x16),
            111 => binop!(OpKind::V128AddSat, I8x16, true),
            112 => binop!(OpKind::V128AddSat, I8x16, false),
            113 => binop!(OpKind::V128Sub, I8x16),
            114 => binop!(OpKind::V128SubSat, I8x16, true),
            115 => binop!(OpKind::V128SubSat, I8x16, false),
            116 => unop!(OpKind::V128Ceil, F64x2),
            117 => unop!(OpKind::V128Floor, F64x2),
            118 => binop!(OpKind::V128Min, I8x16, true),
            119 => binop!(OpKind::V128Min, I8x16, false),
            120 => binop!(OpKind::V128Max, I8x16, true),
            121 => binop!(OpKind::V128Max, I8x16, false),
            122 => unop!(OpKind::V128Trunc, F64x2),
            123 => binop!(OpKind::V128AvgrU, I8x16),
            124 => extend!(OpKind::V128ExtAddPairwise, I8x16, true, true),
            125 => extend!(OpKind::V128ExtAddPairwise, I8x16, true, false),
            126 => extend!(OpKind::V128ExtAddPairwise, I16x8, true, true),
            127 => extend!(OpKind::V128ExtAddPairwise, I16x8, true, false),
            128 => unop!(OpKind::V128Abs, I16x8),
            129 => unop!(OpKind::V128Neg, I16x8),
            130 => binop!(OpKind::V128Q15mulrSatS, I16x8),
            131 => reduce!(OpKind::V128AllTrue, I16x8),
            132 => reduce!(OpKind::V128Bitmask, I16x8),
            133 => binop!(OpKind::V128Narrow, I32x4, true),
            134 => binop!(OpKind::V128Narrow, I32x4, false),
            135 => extend!(OpKind::V128Extend, I8x16, true, true),
            136 => extend!(OpKind::V128Extend, I8x16, false, true),
            137 => extend!(OpKind::V128Extend, I8x16, true, false),
            138 => extend!(OpKind::V128Extend, I8x16, false, false),
            139 => shift!(OpKind::V128Shl, I16x8, false),
            140 => shift!(OpKind::V128Shr, I16x8, true),
            141 => shift!(OpKind::V128Shr, I16x8, false),
            142 => binop!(OpKind::V128Add, I16x8),
            143 => binop!(OpKind::V128AddSat, I16x8, true),
            144 => binop!(OpKind::V128AddSat, I16x8, false),
            145 => binop!(OpKind::V128Sub, I16x8),
            146 => binop!(OpKind::V128SubSat, I16x8, true),
            147 => binop!(OpKind::V128SubSat, I16x8, false),
            148 => unop!(OpKind::V128Nearest, F64x2),
            149 => binop!(OpKind::V128Mul, I16x8),
            150 => binop!(OpKind::V128Min, I16x8, true),
            151 => binop!(OpKind::V128Min, I16x8, false),
            152 => binop!(OpKind::V128Max, I16x8, true),
            153 => binop!(OpKind::V128Max, I16x8, false),
            155 => binop!(OpKind::V128AvgrU, I16x8),
            156 => extmul!(I8x16, true, true),
            157 => extmul!(I8x16, false, true),
            158 => extmul!(I8x16, true, false),
            159 => extmul!(I8x16, false, false),
            160 => unop!(OpKind::V128Abs, I32x4),
            161 => unop!(OpKind::V128Neg, I32x4),
            163 => reduce!(OpKind::V128AllTrue, I32x4),
            164 => reduce!(OpKind::V128Bitmask, I32x4),
            167 => extend!(OpKind::V128Extend, I16x8, true, true),
            168 => extend!(OpKind::V128Extend, I16x8, false, true),
            169 => extend!(OpKind::V128Extend, I16x8, true, false),
            170 => extend!(OpKind::V128Extend, I16x8, false, false),
            171 => shift!(OpKind::V128Shl, I32x4, false),
            172 => shift!(OpKind::V128Shr, I32x4, true),
            173 => shift!(OpKind::V128Shr, I32x4, false),
            174 => binop!(OpKind::V128Add, I32x4),
            177 => binop!(OpKind::V128Sub, I32x4),
            181 => binop!(OpKind::V128Mul, I32x4),
            182 => binop!(OpKind::V128Min, I32x4, true),
            183 => binop!(OpKind::V128Min, I32x4, false),
            184 => binop!(OpKind::V128Max, I32x4, true),
            185 => binop!(OpKind::V128Max, I32x4, false),
            186 => binop!(OpKind::V128Dot, I16x8),
            188 => extmul!(I16x8, true, true),
            189 => extmul!(I16x8, false, true),
            190 => extmul!(I16x8, true, false),
            191 => extmul!(I16x8, false, false),
            192 => unop!(OpKind::V128Abs, I64x2),
            193 => unop!(OpKind::V128Neg, I64x2),
            195 => reduce!(OpKind::V128AllTrue, I64x2),
            196 => reduce!(OpKind::V128Bitmask, I64x2),
            199 => extend!(OpKind::V128Extend, I32x4, true, true),
            200 => extend!(OpKind::V128Extend, I32x4, false, true),
            201 => extend!(OpKind::V128Extend, I32x4, true, false),
            202 => extend!(OpKind::V128Extend, I32x4, false, false),
            203 => shift!(OpKind::V128Shl, I64x2, false),
            204 => shift!(OpKind::V128Shr, I64x2, true),
            205 => shift!(OpKind::V128Shr, I64x2, false),
            206 => binop!(OpKind::V128Add, I64x2),
            209 => binop!(OpKind::V128Sub, I64x2),
            213 => binop!(OpKind::V128Mul, I64x2),
            220 => extmul!(I32x4, true, true),
            221 => extmul!(I32x4, false, true),
            222 => extmul!(I32x4, true, false),
            223 => extmul!(I32x4, false, false),
            224 => unop!(OpKind::V128Abs, F32x4),
            225 => unop!(OpKind::V128Neg, F32x4),
            227 => unop!(OpKind::V128Sqrt, F32x4),
            228 => binop!(OpKind::V128Add, F32x4),
            229 => binop!(OpKind::V128Sub, F32x4),
            230 => binop!(OpKind::V128Mul, F32x4),
            231 => binop!(OpKind::V128Div, F32x4),
            232 => binop!(OpKind::V128Min, F32x4),
            233 => binop!(OpKind::V128Max, F32x4),
            234 => binop!(OpKind::V128Pmin, F32x4),
            235 => binop!(OpKind::V128Pmax, F32x4),
            236 => unop!(OpKind::V128Abs, F64x2),
            237 => unop!(OpKind::V128Neg, F64x2),
            239 => unop!(OpKind::V128Sqrt, F64x2),
            240 => binop!(OpKind::V128Add, F64x2),
            241 => binop!(OpKind::V128Sub, F64x2),
            242 => binop!(OpKind::V128Mul, F64x2),
            243 => binop!(OpKind::V128Div, F64x2),
            244 => binop!(OpKind::V128Min, F64x2),
            245 => binop!(OpKind::V128Max, F64x2),
            246 => binop!(OpKind::V128Pmin, F64x2),
            247 => binop!(OpKind::V128Pmax, F64x2),
            248 => unop!(OpKind::V128ITruncSatF, F32x4, true),
            249 => unop!(OpKind::V128ITruncSatF, F32x4, false),
            250 => unop!(OpKind::V128FConvertI, F32x4, true),
            251 => unop!(OpKind::V128FConvertI, F32x4, false),
            252 => unop!(OpKind::V128ITruncSatF, F64x2, true),
            253 => unop!(OpKind::V128ITruncSatF, F64x2, false),
            254 => unop!(OpKind::V128FConvertI, F64x2, true),
            255 => unop!(OpKind::V128FConvertI, F64x2, false),
            _ => {
                return Err(DecodeError::UnknownOpcode {
                    opcode: 0xFD00 | sub,
                    offset: pos as usize,
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::decode_module;

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

    /// Build a one-function module: (param i32 i32) (result i32) with the
    /// given body expression.
    fn module_with_body(body: &[u8]) -> Vec<u8> {
        let mut m = b"\0asm".to_vec();
        m.extend(1u32.to_le_bytes());
        m.extend(section(1, &[0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F]));
        m.extend(section(3, &[0x01, 0x00]));
        let mut code = Vec::new();
        code.push(0x01);
        let mut func = vec![0x00]; // no locals
        func.extend_from_slice(body);
        code.extend(leb(func.len() as u32));
        code.extend(func);
        m.extend(section(10, &code));
        m
    }

    fn lower_first(binary: &[u8]) -> LoweredFunction {
        let module = decode_module(binary).unwrap();
        lower_function(&module, 0).unwrap()
    }

    #[test]
    fn test_add_function() {
        // local.get 0, local.get 1, i32.add, end
        let bin = module_with_body(&[0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B]);
        let f = lower_first(&bin);

        assert_eq!(f.nlocals_slots, 2);
        let kinds: Vec<OpKind> = f.ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OpKind::Pick, OpKind::Pick, OpKind::Add, OpKind::Label]
        );
        // First pick reaches past the second local.
        assert_eq!(f.ops[0].u1, 1);
        assert_eq!(f.ops[1].u1, 1);
        // The final label is the return label at height locals+1.
        let ret = Label::new(0, LabelKind::Return);
        assert_eq!(f.label_heights[&ret.0], 3);
        assert_eq!(f.max_height, 4);
    }

    #[test]
    fn test_lowering_is_deterministic() {
        let bin = module_with_body(&[0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B]);
        let module = decode_module(&bin).unwrap();
        let a = lower_function(&module, 0).unwrap();
        let b = lower_function(&module, 0).unwrap();
        assert_eq!(a.ops, b.ops);
        assert_eq!(a.label_positions, b.label_positions);
    }

    #[test]
    fn test_block_with_br() {
        // block (result i32): i32.const 1, br 0, end; end
        let bin = module_with_body(&[0x02, 0x7F, 0x41, 0x01, 0x0C, 0x00, 0x0B, 0x0B]);
        let f = lower_first(&bin);
        let kinds: Vec<OpKind> = f.ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OpKind::I32Const, OpKind::Br, OpKind::Label, OpKind::Label]
        );
        // Branch to the block continuation with nothing extra to drop.
        let (target, drop) = f.ops[1].target(0);
        assert_eq!(target.kind(), LabelKind::Continuation);
        assert!(drop.is_none());
    }

    #[test]
    fn test_br_with_drop_range() {
        // block (result i32): const 1, const 2, const 3, br 0, end; end
        // Two dead values below the branch operand must be dropped.
        let bin = module_with_body(&[
            0x02, 0x7F, 0x41, 0x01, 0x41, 0x02, 0x41, 0x03, 0x0C, 0x00, 0x0B, 0x0B,
        ]);
        let f = lower_first(&bin);
        let br = f.ops.iter().find(|op| op.kind == OpKind::Br).unwrap();
        let (_, drop) = br.target(0);
        assert_eq!(drop, InclusiveRange::new(1, 2));
    }

    #[test]
    fn test_loop_branch_targets_header() {
        // loop: br 0, end; end  -- infinite loop
        let bin = module_with_body(&[0x03, 0x40, 0x0C, 0x00, 0x0B, 0x0B]);
        let f = lower_first(&bin);
        let br = f.ops.iter().find(|op| op.kind == OpKind::Br).unwrap();
        let (target, _) = br.target(0);
        assert_eq!(target.kind(), LabelKind::Header);
        // The header label precedes the branch.
        assert!(f.label_positions[&target.0] < f.ops.iter().position(|o| o.kind == OpKind::Br).unwrap());
    }

    #[test]
    fn test_if_else_shape() {
        // local.get 0, if (result i32): const 1, else: const 2, end; end
        let bin = module_with_body(&[
            0x20, 0x00, 0x04, 0x7F, 0x41, 0x01, 0x05, 0x41, 0x02, 0x0B, 0x0B,
        ]);
        let f = lower_first(&bin);
        let kinds: Vec<OpKind> = f.ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::Pick,
                OpKind::BrIf,
                OpKind::Label, // then
                OpKind::I32Const,
                OpKind::Br, // skip else
                OpKind::Label, // else
                OpKind::I32Const,
                OpKind::Label, // continuation
                OpKind::Label, // return
            ]
        );
        let brif = &f.ops[1];
        assert_eq!(brif.target(0).0.kind(), LabelKind::Header);
        assert_eq!(brif.target(1).0.kind(), LabelKind::Else);
    }

    #[test]
    fn test_unreachable_code_is_skipped() {
        // const 1, return, const 2, drop, end
        let bin = module_with_body(&[0x41, 0x01, 0x0F, 0x41, 0x02, 0x1A, 0x0B]);
        let f = lower_first(&bin);
        let kinds: Vec<OpKind> = f.ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::I32Const, OpKind::Br, OpKind::Label]);
    }

    #[test]
    fn test_return_drops_down_to_results() {
        // const 1, const 2, return (drops the lower const, keeps top)
        let bin = module_with_body(&[0x41, 0x01, 0x41, 0x02, 0x0F, 0x0B]);
        let f = lower_first(&bin);
        let br = f.ops.iter().find(|op| op.kind == OpKind::Br).unwrap();
        let (target, drop) = br.target(0);
        assert_eq!(target.kind(), LabelKind::Return);
        // Heights: locals=2, stack=[c1, c2]; keep 1 result, drop slot
        // depth 1 (c1) down to the locals boundary.
        assert_eq!(drop, InclusiveRange::new(1, 1));
    }

    #[test]
    fn test_local_set_depth() {
        // const 7, local.set 1, local.get 1, end
        let bin = module_with_body(&[0x41, 0x07, 0x21, 0x01, 0x20, 0x01, 0x0B]);
        let f = lower_first(&bin);
        let set = f.ops.iter().find(|op| op.kind == OpKind::Set).unwrap();
        // Stack: [l0 l1 c]; target slot 1 is at depth 1 from the top.
        assert_eq!(set.u1, 1);
    }

    #[test]
    fn test_type_error_detected() {
        // f32.const on the stack, i32.add
        let bin = module_with_body(&[
            0x43, 0x00, 0x00, 0x80, 0x3F, 0x20, 0x00, 0x6A, 0x0B,
        ]);
        let module = decode_module(&bin).unwrap();
        assert!(lower_function(&module, 0).is_err());
    }

    #[test]
    fn test_br_table_targets() {
        // block, block: local.get 0, br_table [0, 1] default 1, end, end
        let bin = module_with_body(&[
            0x02, 0x40, 0x02, 0x40, 0x20, 0x00, 0x0E, 0x02, 0x00, 0x01, 0x01, 0x0B, 0x0B, 0x41,
            0x00, 0x0B,
        ]);
        let f = lower_first(&bin);
        let bt = f.ops.iter().find(|op| op.kind == OpKind::BrTable).unwrap();
        // Two explicit targets plus the default.
        assert_eq!(bt.target_count(), 3);
    }
}
