//! IR → AArch64 machine code.
//!
//! The same one-pass discipline as the x86-64 compiler: a value-location
//! stack with LRU spilling inside basic blocks, everything flushed at
//! labels and branches. Differences are the ISA's: explicit address
//! materialization for loads/stores, cset/csel instead of setcc/cmov,
//! msub for remainders, and directly encoded clz/rotate/rounding.

use super::aarch64::{A64Assembler, Cond, Reg};
use super::codebuf::CodeBuffer;
use super::reloc::Reloc;
use super::valstack::{ValueLoc, ValueStack};
use super::{CompileEnv, CompileError, CompiledFunc};
use crate::ir::{
    InclusiveRange, LabelKind, LoweredFunction, OpKind, Operation, RuntimeType, Shape,
    V128LoadKind,
};
use crate::module::{FuncType, ValType};
use crate::runtime::context::{self as ctx, HelperIndex};
use crate::runtime::trap::TrapKind;
use std::collections::HashMap;
use tracing::trace;

/// Register conventions for compiled guest code.
///
/// - x28: context pointer, x27: guest frame base, x26: linear memory base
/// - x16: general scratch, x17: trampoline scratch
/// - x0..x8: call/temporary registers outside the pool
pub mod regs {
    use super::Reg;

    pub const CTX: Reg = Reg::X28;
    pub const FRAME: Reg = Reg::X27;
    pub const MEM: Reg = Reg::X26;
    pub const SCRATCH: Reg = Reg::X16;
    pub const SCRATCH2: Reg = Reg::X17;

    /// Allocatable pool.
    pub const GP_POOL: [Reg; 7] = [
        Reg::X9,
        Reg::X10,
        Reg::X11,
        Reg::X12,
        Reg::X13,
        Reg::X14,
        Reg::X15,
    ];

    /// Guest integer argument registers.
    pub const GP_ARGS: [Reg; 6] = [Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5];

    /// Number of float argument registers (v0..).
    pub const FP_ARGS: u8 = 8;

    /// Allocatable float/vector registers.
    pub const FP_POOL: [u8; 8] = [16, 17, 18, 19, 20, 21, 22, 23];

    /// Float scratch register.
    pub const FP_SCRATCH: u8 = 30;
}

const EXIT_RESTORE_KEY: u64 = u64::MAX;

/// Where one argument (or mirrored result) travels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgLoc {
    Gp(Reg),
    Fp(u8),
    Stack,
}

/// Assign guest argument registers to a parameter (or result) list.
pub fn assign_arg_regs(types: &[ValType]) -> Vec<(u32, ValType, ArgLoc)> {
    let mut out = Vec::with_capacity(types.len());
    let mut slot = 0u32;
    let mut next_gp = 0usize;
    let mut next_fp = 0u8;
    for &ty in types {
        let loc = match ty {
            ValType::I32 | ValType::I64 | ValType::FuncRef | ValType::ExternRef => {
                if next_gp < regs::GP_ARGS.len() {
                    next_gp += 1;
                    ArgLoc::Gp(regs::GP_ARGS[next_gp - 1])
                } else {
                    ArgLoc::Stack
                }
            }
            ValType::F32 | ValType::F64 => {
                if next_fp < regs::FP_ARGS {
                    next_fp += 1;
                    ArgLoc::Fp(next_fp - 1)
                } else {
                    ArgLoc::Stack
                }
            }
            ValType::V128 => ArgLoc::Stack,
        };
        out.push((slot, ty, loc));
        slot += ty.slot_count();
    }
    out
}

struct Compiler<'a> {
    buf: CodeBuffer,
    env: &'a CompileEnv<'a>,
    func: &'a LoweredFunction,
    vs: ValueStack,
    labels: HashMap<u64, usize>,
    /// (B instruction offset, label id) pending 26-bit patches.
    label_refs: Vec<(usize, u64)>,
    relocs: Vec<Reloc>,
    trap_positions: Vec<u64>,
    pc_traps: Vec<(usize, u64)>,
    reachable: bool,
    num_call_sites: usize,
}

/// Compile one lowered function to AArch64 code.
pub fn compile_function(
    env: &CompileEnv,
    func: &LoweredFunction,
) -> Result<CompiledFunc, CompileError> {
    let mut c = Compiler {
        buf: CodeBuffer::with_capacity(func.ops.len() * 20 + 64),
        env,
        func,
        vs: ValueStack::new(func.nlocals_slots),
        labels: HashMap::new(),
        label_refs: Vec::new(),
        relocs: Vec::new(),
        trap_positions: Vec::new(),
        pc_traps: Vec::new(),
        reachable: true,
        num_call_sites: 0,
    };
    c.emit_prologue();
    for op in &func.ops {
        if !c.reachable && op.kind != OpKind::Label {
            continue;
        }
        c.emit_op(op)?;
    }
    c.emit_exit_restore();
    c.patch_label_refs()?;
    trace!(
        code_len = c.buf.len(),
        relocs = c.relocs.len(),
        "compiled function"
    );
    Ok(CompiledFunc {
        code: c.buf.into_code(),
        relocs: c.relocs,
        trap_positions: c.trap_positions,
        pc_traps: c.pc_traps,
        num_call_sites: c.num_call_sites,
    })
}

impl Compiler<'_> {
    fn asm(&mut self) -> A64Assembler {
        A64Assembler::new(&mut self.buf)
    }

    // ==================== addressing helpers ====================

    /// Load a u32 immediate with movz/movk.
    fn mov_u32(&mut self, rd: Reg, v: u32) {
        let mut a = self.asm();
        a.movz(rd, v as u16, 0, true);
        if v >> 16 != 0 {
            a.movk(rd, (v >> 16) as u16, 1, true);
        }
    }

    /// `dst = frame + byte_off`, clobbering only dst.
    fn slot_addr(&mut self, dst: Reg, slot: u32) {
        let off = slot as u64 * 8;
        if off < 4096 {
            self.asm().add_imm(dst, regs::FRAME, off as u16, true);
        } else {
            let mut a = self.asm();
            a.mov_imm64(dst, off);
            a.add(dst, regs::FRAME, dst, true);
        }
    }

    /// Load a 64-bit frame slot into a register.
    fn ldr_slot(&mut self, rt: Reg, slot: u32) {
        let off = slot * 8;
        if off / 8 < 4096 {
            self.asm().ldr64(rt, regs::FRAME, off);
        } else {
            self.slot_addr(rt, slot);
            self.asm().ldr64(rt, rt, 0);
        }
    }

    /// Store a register into a 64-bit frame slot.
    fn str_slot(&mut self, rt: Reg, slot: u32) {
        let off = slot * 8;
        if off / 8 < 4096 {
            self.asm().str64(rt, regs::FRAME, off);
        } else {
            self.slot_addr(regs::SCRATCH2, slot);
            self.asm().str64(rt, regs::SCRATCH2, 0);
        }
    }

    fn ldr_fp_slot(&mut self, vt: u8, slot: u32, double: bool) {
        let off = slot * 8;
        if double {
            if off / 8 < 4096 {
                self.asm().ldr_d(vt, regs::FRAME, off);
                return;
            }
        } else if off / 4 < 4096 {
            self.asm().ldr_s(vt, regs::FRAME, off);
            return;
        }
        self.slot_addr(regs::SCRATCH2, slot);
        let mut a = self.asm();
        if double {
            a.ldr_d(vt, regs::SCRATCH2, 0);
        } else {
            a.ldr_s(vt, regs::SCRATCH2, 0);
        }
    }

    fn str_fp_slot(&mut self, vt: u8, slot: u32, double: bool) {
        let off = slot * 8;
        if double {
            if off / 8 < 4096 {
                self.asm().str_d(vt, regs::FRAME, off);
                return;
            }
        } else if off / 4 < 4096 {
            self.asm().str_s(vt, regs::FRAME, off);
            return;
        }
        self.slot_addr(regs::SCRATCH2, slot);
        let mut a = self.asm();
        if double {
            a.str_d(vt, regs::SCRATCH2, 0);
        } else {
            a.str_s(vt, regs::SCRATCH2, 0);
        }
    }

    /// Vector slots are only 8-aligned, so q-register traffic always goes
    /// through a materialized address.
    fn ldr_vec_slot(&mut self, vt: u8, lo_slot: u32) {
        self.slot_addr(regs::SCRATCH2, lo_slot);
        self.asm().ldr_q(vt, regs::SCRATCH2, 0);
    }

    fn str_vec_slot(&mut self, vt: u8, lo_slot: u32) {
        self.slot_addr(regs::SCRATCH2, lo_slot);
        self.asm().str_q(vt, regs::SCRATCH2, 0);
    }

    fn ldr_ctx(&mut self, rt: Reg, field: i32) {
        self.asm().ldr64(rt, regs::CTX, field as u32);
    }

    fn str_ctx(&mut self, rt: Reg, field: i32) {
        self.asm().str64(rt, regs::CTX, field as u32);
    }

    // ==================== prologue / epilogue ====================

    fn emit_prologue(&mut self) {
        let sig = self.env.module.types[self.func.type_idx as usize].clone();
        let ceiling = self.func.max_height.max(self.func.nlocals_slots);
        let params = assign_arg_regs(&sig.params);
        let param_slots: u32 = sig.params.iter().map(|t| t.slot_count()).sum();
        let nlocals = self.func.nlocals_slots;

        self.asm().stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16);

        // Guest stack ceiling check.
        self.slot_addr(regs::SCRATCH, ceiling);
        self.ldr_ctx(regs::SCRATCH2, ctx::CTX_STACK_LIMIT);
        self.asm().cmp(regs::SCRATCH, regs::SCRATCH2, true);
        self.trap_if(Cond::Hi, TrapKind::CallStackExhausted, 0);

        // Call depth check.
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_CALL_DEPTH);
        self.asm().add_imm(regs::SCRATCH, regs::SCRATCH, 1, true);
        self.ldr_ctx(regs::SCRATCH2, ctx::CTX_CALL_DEPTH_LIMIT);
        self.asm().cmp(regs::SCRATCH, regs::SCRATCH2, true);
        self.trap_if(Cond::Hi, TrapKind::CallStackExhausted, 0);
        self.str_ctx(regs::SCRATCH, ctx::CTX_CALL_DEPTH);

        // Park register-class arguments in their local slots.
        for (slot, ty, loc) in &params {
            match loc {
                ArgLoc::Gp(r) => self.str_slot(*r, *slot),
                ArgLoc::Fp(x) => self.str_fp_slot(*x, *slot, *ty == ValType::F64),
                ArgLoc::Stack => {}
            }
        }

        // Zero the declared locals.
        let zero_from = param_slots;
        let zero_count = nlocals - param_slots;
        if zero_count > 0 {
            if zero_count <= 16 {
                for i in 0..zero_count {
                    self.str_slot(Reg::XZR, zero_from + i);
                }
            } else {
                self.slot_addr(regs::SCRATCH, zero_from);
                self.mov_u32(regs::SCRATCH2, zero_count);
                let loop_top = self.buf.offset();
                let mut a = self.asm();
                a.str64(Reg::XZR, regs::SCRATCH, 0);
                a.add_imm(regs::SCRATCH, regs::SCRATCH, 8, true);
                a.subs_imm(regs::SCRATCH2, regs::SCRATCH2, 1, true);
                let here = a.offset();
                a.b_cond(Cond::Ne, loop_top as i32 - here as i32);
            }
        }
    }

    fn emit_epilogue(&mut self) {
        let sig = self.env.module.types[self.func.type_idx as usize].clone();
        let results = assign_arg_regs(&sig.results);
        let result_slots: u32 = sig.results.iter().map(|t| t.slot_count()).sum();
        let nlocals = self.func.nlocals_slots;

        if nlocals > 0 {
            for i in 0..result_slots {
                self.ldr_slot(regs::SCRATCH, nlocals + i);
                self.str_slot(regs::SCRATCH, i);
            }
        }
        for (slot, ty, loc) in &results {
            match loc {
                ArgLoc::Gp(r) => self.ldr_slot(*r, *slot),
                ArgLoc::Fp(x) => self.ldr_fp_slot(*x, *slot, *ty == ValType::F64),
                ArgLoc::Stack => {}
            }
        }
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_CALL_DEPTH);
        self.asm().sub_imm(regs::SCRATCH, regs::SCRATCH, 1, true);
        self.str_ctx(regs::SCRATCH, ctx::CTX_CALL_DEPTH);
        let mut a = self.asm();
        a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
        a.ret();
    }

    fn emit_exit_restore(&mut self) {
        self.labels.insert(EXIT_RESTORE_KEY, self.buf.offset());
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_HOST_SP);
        let mut a = self.asm();
        a.mov_sp(Reg::Sp, regs::SCRATCH);
        a.ldp_post(Reg::X28, Reg::XZR, Reg::Sp, 16);
        a.ldp_post(Reg::X26, Reg::X27, Reg::Sp, 16);
        a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
        a.ret();
    }

    // ==================== labels & patches ====================

    fn jump_to(&mut self, label: u64) {
        let site = self.asm().b(0);
        self.label_refs.push((site, label));
    }

    /// Patch a pending B.cond/CBZ 19-bit displacement.
    fn bind_imm19(&mut self, site: usize) {
        let disp = (self.buf.offset() as i64 - site as i64) as i32;
        let word = self.buf.read_u32(site);
        let imm19 = ((disp / 4) as u32) & 0x7FFFF;
        self.buf.patch_u32(site, (word & !(0x7FFFF << 5)) | (imm19 << 5));
    }

    fn patch_label_refs(&mut self) -> Result<(), CompileError> {
        for (site, label) in std::mem::take(&mut self.label_refs) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| CompileError::Internal(format!("unbound label {label:#x}")))?;
            let disp = target as i64 - site as i64;
            let word = self.buf.read_u32(site);
            self.buf
                .patch_u32(site, super::reloc::a64_patch_branch26(word, disp));
        }
        Ok(())
    }

    // ==================== traps ====================

    fn new_trap_site(&mut self, pos: u64) -> u32 {
        let id = self.env.site_base + self.trap_positions.len() as u32;
        self.trap_positions.push(pos);
        id
    }

    fn trap_now(&mut self, kind: TrapKind, pos: u64) {
        let site = self.new_trap_site(pos);
        self.mov_u32(regs::SCRATCH, kind as u32);
        self.str_ctx(regs::SCRATCH, ctx::CTX_TRAP_KIND);
        self.mov_u32(regs::SCRATCH, site);
        self.str_ctx(regs::SCRATCH, ctx::CTX_TRAP_SITE);
        self.mov_u32(regs::SCRATCH, ctx::STATUS_TRAP as u32);
        self.str_ctx(regs::SCRATCH, ctx::CTX_STATUS);
        self.jump_to(EXIT_RESTORE_KEY);
    }

    fn trap_if(&mut self, cond: Cond, kind: TrapKind, pos: u64) {
        let skip = self.asm().b_cond(cond.invert(), 0);
        self.trap_now(kind, pos);
        self.bind_imm19(skip);
    }

    // ==================== register discipline ====================

    fn spill_entry(&mut self, idx: usize) {
        let entry = self.vs.get(idx).clone();
        let slot = self.vs.slot_of(idx);
        match entry.loc {
            ValueLoc::Reg(r) => {
                self.str_slot(Reg::from_code(r), slot);
            }
            ValueLoc::FReg(x) => match entry.ty {
                RuntimeType::F32 => self.str_fp_slot(x, slot, false),
                RuntimeType::V128Hi => self.str_vec_slot(x, slot - 1),
                _ => self.str_fp_slot(x, slot, true),
            },
            ValueLoc::Const(cv) => {
                if cv == 0 {
                    self.str_slot(Reg::XZR, slot);
                } else {
                    self.asm().mov_imm64(regs::SCRATCH, cv);
                    self.str_slot(regs::SCRATCH, slot);
                }
            }
            ValueLoc::CondFlag(cc) => {
                self.asm().cset(regs::SCRATCH, cond_from(cc), false);
                self.str_slot(regs::SCRATCH, slot);
            }
            ValueLoc::Stack | ValueLoc::VecLo => {}
        }
        let was_vec_reg =
            entry.ty == RuntimeType::V128Hi && matches!(entry.loc, ValueLoc::FReg(_));
        self.vs.set_loc(idx, ValueLoc::Stack);
        if was_vec_reg {
            self.vs.set_loc(idx - 1, ValueLoc::Stack);
        }
    }

    fn flush_all(&mut self) {
        for idx in self.vs.unflushed() {
            self.spill_entry(idx);
        }
    }

    fn alloc_gp(&mut self) -> Reg {
        let pool: Vec<u8> = regs::GP_POOL.iter().map(|r| *r as u8).collect();
        if let Some(r) = self.vs.free_reg(&pool) {
            return Reg::from_code(r);
        }
        let victim = self.vs.lru_reg_entry().expect("no spillable register");
        let ValueLoc::Reg(r) = self.vs.get(victim).loc else {
            unreachable!()
        };
        self.spill_entry(victim);
        Reg::from_code(r)
    }

    fn alloc_fp(&mut self) -> u8 {
        if let Some(x) = self.vs.free_freg(&regs::FP_POOL) {
            return x;
        }
        let victim = self.vs.lru_freg_entry().expect("no spillable register");
        let ValueLoc::FReg(x) = self.vs.get(victim).loc else {
            unreachable!()
        };
        self.spill_entry(victim);
        x
    }

    fn ensure_gp(&mut self, idx: usize) -> Reg {
        match self.vs.get(idx).loc {
            ValueLoc::Reg(r) => {
                self.vs.touch(idx);
                Reg::from_code(r)
            }
            ValueLoc::Const(cv) => {
                let r = self.alloc_gp();
                self.asm().mov_imm64(r, cv);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::Stack => {
                let r = self.alloc_gp();
                let slot = self.vs.slot_of(idx);
                self.ldr_slot(r, slot);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::FReg(x) => {
                let r = self.alloc_gp();
                self.asm().fmov_to_gpr(r, x, true);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::CondFlag(cc) => {
                let r = self.alloc_gp();
                self.asm().cset(r, cond_from(cc), false);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::VecLo => unreachable!("vector halves are handled pairwise"),
        }
    }

    fn ensure_fp(&mut self, idx: usize, double: bool) -> u8 {
        let new_ty = if double {
            RuntimeType::F64
        } else {
            RuntimeType::F32
        };
        match self.vs.get(idx).loc {
            ValueLoc::FReg(x) => {
                self.vs.touch(idx);
                x
            }
            ValueLoc::Stack => {
                let x = self.alloc_fp();
                let slot = self.vs.slot_of(idx);
                self.ldr_fp_slot(x, slot, double);
                self.vs.set_loc(idx, ValueLoc::FReg(x));
                self.vs.get_mut(idx).ty = new_ty;
                x
            }
            ValueLoc::Reg(r) => {
                let x = self.alloc_fp();
                self.asm().fmov_from_gpr(x, Reg::from_code(r), double);
                self.vs.set_loc(idx, ValueLoc::FReg(x));
                self.vs.get_mut(idx).ty = new_ty;
                x
            }
            ValueLoc::Const(cv) => {
                let x = self.alloc_fp();
                self.asm().mov_imm64(regs::SCRATCH, cv);
                self.asm().fmov_from_gpr(x, regs::SCRATCH, double);
                self.vs.set_loc(idx, ValueLoc::FReg(x));
                self.vs.get_mut(idx).ty = new_ty;
                x
            }
            ValueLoc::CondFlag(_) => {
                self.ensure_gp(idx);
                self.ensure_fp(idx, double)
            }
            ValueLoc::VecLo => unreachable!(),
        }
    }

    /// Materialize the top value into the scratch register.
    fn top_to_scratch(&mut self) {
        let idx = self.vs.len() - 1;
        let slot = self.vs.slot_of(idx);
        match self.vs.get(idx).loc {
            ValueLoc::Reg(r) => self.asm().mov(regs::SCRATCH, Reg::from_code(r), true),
            ValueLoc::Const(cv) => self.asm().mov_imm64(regs::SCRATCH, cv),
            ValueLoc::Stack => self.ldr_slot(regs::SCRATCH, slot),
            ValueLoc::FReg(x) => self.asm().fmov_to_gpr(regs::SCRATCH, x, true),
            ValueLoc::CondFlag(cc) => self.asm().cset(regs::SCRATCH, cond_from(cc), false),
            ValueLoc::VecLo => unreachable!(),
        }
    }

    /// Materialize every pending condition flag before an instruction
    /// that clobbers NZCV. A flag entry can sit below pushed constants,
    /// so the whole stack is scanned.
    fn protect_flags(&mut self) {
        for idx in 0..self.vs.len() {
            if matches!(self.vs.get(idx).loc, ValueLoc::CondFlag(_)) {
                self.ensure_gp(idx);
            }
        }
    }

    // ==================== drops & branches ====================

    fn emit_drop_moves(&mut self, range: InclusiveRange) {
        if range.is_none() {
            return;
        }
        let keep = range.start as u32;
        let h = self.vs.height();
        let dst_base = h - 1 - range.end as u32;
        let src_base = h - keep;
        for i in 0..keep {
            self.ldr_slot(regs::SCRATCH, src_base + i);
            self.str_slot(regs::SCRATCH, dst_base + i);
        }
        self.vs.drop_range(range.start as u32, range.end as u32);
    }

    fn emit_branch_edge(&mut self, label: u64, drop: InclusiveRange) {
        let saved_height = self.vs.height();
        self.emit_drop_moves(drop);
        self.jump_to(label);
        self.vs.reset_to_height(saved_height);
    }

    // ==================== helper calls ====================

    fn helper_args(&mut self, args: &[HelperArg]) {
        const PAYLOAD: [Reg; 4] = [Reg::X1, Reg::X2, Reg::X3, Reg::X4];
        for (i, arg) in args.iter().enumerate() {
            let dst = PAYLOAD[i];
            match arg {
                HelperArg::Slot(slot) => self.ldr_slot(dst, *slot),
                HelperArg::SlotAddr(slot) => self.slot_addr(dst, *slot),
                HelperArg::Imm(v) => self.asm().mov_imm64(dst, *v),
            }
        }
    }

    fn call_helper(&mut self, index: HelperIndex, args: &[HelperArg], pos: Option<u64>) {
        self.helper_args(args);
        self.asm().mov(Reg::X0, regs::CTX, true);
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_HELPERS);
        self.asm()
            .ldr64(regs::SCRATCH, regs::SCRATCH, index as u32 * 8);
        self.asm().blr(regs::SCRATCH);
        if let Some(pos) = pos {
            self.check_helper_status(pos);
        }
    }

    fn check_helper_status(&mut self, pos: u64) {
        let ok = self.asm().cbz(Reg::X0, 0, true);
        let mut a = self.asm();
        a.cmp_imm(Reg::X0, ctx::HELPER_EXIT as u16, true);
        let not_exit = a.b_cond(Cond::Ne, 0);
        drop(a);
        self.mov_u32(regs::SCRATCH, ctx::STATUS_EXIT as u32);
        self.str_ctx(regs::SCRATCH, ctx::CTX_STATUS);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_imm19(not_exit);
        let site = self.new_trap_site(pos);
        self.asm()
            .sub_imm(Reg::X0, Reg::X0, ctx::HELPER_TRAP_BASE as u16, true);
        self.str_ctx(Reg::X0, ctx::CTX_TRAP_KIND);
        self.mov_u32(regs::SCRATCH, site);
        self.str_ctx(regs::SCRATCH, ctx::CTX_TRAP_SITE);
        self.mov_u32(regs::SCRATCH, ctx::STATUS_TRAP as u32);
        self.str_ctx(regs::SCRATCH, ctx::CTX_STATUS);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_imm19(ok);
    }

    // ==================== operation dispatch ====================

    fn emit_op(&mut self, op: &Operation) -> Result<(), CompileError> {
        match op.kind {
            OpKind::Label => self.op_label(op),
            OpKind::Unreachable => {
                self.trap_now(TrapKind::Unreachable, op.pos);
                self.reachable = false;
            }
            OpKind::Br => {
                self.flush_all();
                let (label, drop) = op.target(0);
                self.emit_drop_moves(drop);
                self.jump_to(label.0);
                self.reachable = false;
            }
            OpKind::BrIf => self.op_br_if(op),
            OpKind::BrTable => self.op_br_table(op),
            OpKind::Call => {
                let func_idx = op.u1 as u32;
                let sig = self.env.module.func_type(func_idx).clone();
                self.flush_all();
                self.emit_call_sequence(&sig, CallTarget::Direct(func_idx));
            }
            OpKind::CallIndirect => self.op_call_indirect(op),
            OpKind::Drop => {
                self.protect_flags();
                self.op_drop(op.rs[0]);
            }
            OpKind::Select => self.op_select(op),
            OpKind::Pick => self.op_pick(op),
            OpKind::Set => self.op_set(op),
            OpKind::GlobalGet => self.op_global_get(op),
            OpKind::GlobalSet => self.op_global_set(op),
            OpKind::Load | OpKind::Load8 | OpKind::Load16 | OpKind::Load32 => self.op_load(op),
            OpKind::Store | OpKind::Store8 | OpKind::Store16 | OpKind::Store32 => {
                self.op_store(op)
            }
            OpKind::MemorySize => {
                self.protect_flags();
                let r = self.alloc_gp();
                self.ldr_ctx(r, ctx::CTX_MEMORY_PAGES);
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            OpKind::MemoryGrow => {
                self.flush_all();
                let delta = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(HelperIndex::MemoryGrow, &[HelperArg::Slot(delta)], None);
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            OpKind::MemoryInit | OpKind::MemoryCopy | OpKind::MemoryFill => {
                self.flush_all();
                let c = self.vs.slot_of(self.vs.len() - 1);
                let b = self.vs.slot_of(self.vs.len() - 2);
                let a = self.vs.slot_of(self.vs.len() - 3);
                self.vs.pop();
                self.vs.pop();
                self.vs.pop();
                let helper = match op.kind {
                    OpKind::MemoryInit => HelperIndex::MemoryInit,
                    OpKind::MemoryCopy => HelperIndex::MemoryCopy,
                    _ => HelperIndex::MemoryFill,
                };
                self.call_helper(
                    helper,
                    &[
                        HelperArg::Slot(a),
                        HelperArg::Slot(b),
                        HelperArg::Slot(c),
                        HelperArg::Imm(op.u1),
                    ],
                    Some(op.pos),
                );
            }
            OpKind::DataDrop => {
                self.flush_all();
                self.call_helper(HelperIndex::DataDrop, &[HelperArg::Imm(op.u1)], None);
            }
            OpKind::ElemDrop => {
                self.flush_all();
                self.call_helper(HelperIndex::ElemDrop, &[HelperArg::Imm(op.u1)], None);
            }
            OpKind::TableGet => {
                self.flush_all();
                let idx = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(
                    HelperIndex::TableGet,
                    &[HelperArg::Slot(idx), HelperArg::Imm(op.u1)],
                    Some(op.pos),
                );
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(RuntimeType::I64, ValueLoc::Reg(r as u8));
            }
            OpKind::TableSet => {
                self.flush_all();
                let val = self.vs.slot_of(self.vs.len() - 1);
                let idx = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                self.call_helper(
                    HelperIndex::TableSet,
                    &[
                        HelperArg::Slot(idx),
                        HelperArg::Slot(val),
                        HelperArg::Imm(op.u1),
                    ],
                    Some(op.pos),
                );
            }
            OpKind::TableSize => {
                self.protect_flags();
                let r = self.alloc_gp();
                self.ldr_ctx(regs::SCRATCH, ctx::CTX_TABLES);
                self.asm()
                    .ldr64(r, regs::SCRATCH, op.u1 as u32 * 16 + 8);
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            OpKind::TableGrow => {
                self.flush_all();
                let delta = self.vs.slot_of(self.vs.len() - 1);
                let init = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                self.call_helper(
                    HelperIndex::TableGrow,
                    &[
                        HelperArg::Slot(delta),
                        HelperArg::Slot(init),
                        HelperArg::Imm(op.u1),
                    ],
                    None,
                );
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            OpKind::TableFill | OpKind::TableCopy | OpKind::TableInit => {
                self.flush_all();
                let c = self.vs.slot_of(self.vs.len() - 1);
                let b = self.vs.slot_of(self.vs.len() - 2);
                let a = self.vs.slot_of(self.vs.len() - 3);
                self.vs.pop();
                self.vs.pop();
                self.vs.pop();
                let helper = match op.kind {
                    OpKind::TableFill => HelperIndex::TableFill,
                    OpKind::TableCopy => HelperIndex::TableCopy,
                    _ => HelperIndex::TableInit,
                };
                self.call_helper(
                    helper,
                    &[
                        HelperArg::Slot(a),
                        HelperArg::Slot(b),
                        HelperArg::Slot(c),
                        HelperArg::Imm(op.u1 | (op.u2 << 32)),
                    ],
                    Some(op.pos),
                );
            }
            OpKind::RefFunc => {
                self.vs.push(RuntimeType::I64, ValueLoc::Const(op.u1 + 1));
            }
            OpKind::I32Const => {
                self.vs.push(RuntimeType::I32, ValueLoc::Const(op.u1));
            }
            OpKind::I64Const => {
                self.vs.push(RuntimeType::I64, ValueLoc::Const(op.u1));
            }
            OpKind::F32Const => {
                self.vs.push(RuntimeType::F32, ValueLoc::Const(op.u1));
            }
            OpKind::F64Const => {
                self.vs.push(RuntimeType::F64, ValueLoc::Const(op.u1));
            }
            OpKind::V128Const => {
                self.vs.push(RuntimeType::V128Lo, ValueLoc::Const(op.u1));
                self.vs.push(RuntimeType::V128Hi, ValueLoc::Const(op.u2));
            }
            OpKind::Eqz => self.op_eqz(op),
            OpKind::Eq | OpKind::Ne | OpKind::Lt | OpKind::Gt | OpKind::Le | OpKind::Ge => {
                self.op_compare(op)
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::And | OpKind::Or | OpKind::Xor => {
                self.op_binary_alu(op)
            }
            OpKind::Div | OpKind::Rem => self.op_div_rem(op),
            OpKind::Shl | OpKind::Shr | OpKind::Rotl | OpKind::Rotr => self.op_shift(op),
            OpKind::Clz => {
                self.protect_flags();
                let w = RuntimeType::from_u8(op.b1) == RuntimeType::I64;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().clz(r, r, w);
            }
            OpKind::Ctz => {
                self.protect_flags();
                let w = RuntimeType::from_u8(op.b1) == RuntimeType::I64;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                let mut a = self.asm();
                a.rbit(r, r, w);
                a.clz(r, r, w);
            }
            OpKind::Popcnt => {
                let ty = RuntimeType::from_u8(op.b1);
                let w64 = ty == RuntimeType::I64;
                self.flush_all();
                let slot = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(
                    HelperIndex::IBitcnt,
                    &[
                        HelperArg::Slot(slot),
                        HelperArg::Imm(2 | ((w64 as u64) << 2)),
                    ],
                    None,
                );
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(ty, ValueLoc::Reg(r as u8));
            }
            OpKind::Abs | OpKind::Neg => {
                self.protect_flags();
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, double);
                if op.kind == OpKind::Abs {
                    self.asm().fabs(x, x, double);
                } else {
                    self.asm().fneg(x, x, double);
                }
            }
            OpKind::Sqrt => {
                self.protect_flags();
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, double);
                self.asm().fsqrt(x, x, double);
            }
            OpKind::Ceil | OpKind::Floor | OpKind::Trunc | OpKind::Nearest => {
                self.protect_flags();
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, double);
                let mut a = self.asm();
                match op.kind {
                    OpKind::Ceil => a.frintp(x, x, double),
                    OpKind::Floor => a.frintm(x, x, double),
                    OpKind::Trunc => a.frintz(x, x, double),
                    _ => a.frintn(x, x, double),
                }
            }
            OpKind::Min | OpKind::Max => {
                self.protect_flags();
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let b_idx = self.vs.len() - 1;
                let xb = self.ensure_fp(b_idx, double);
                self.vs.touch(b_idx);
                let a_idx = self.vs.len() - 2;
                let xa = self.ensure_fp(a_idx, double);
                if op.kind == OpKind::Min {
                    self.asm().fmin(xa, xa, xb, double);
                } else {
                    self.asm().fmax(xa, xa, xb, double);
                }
                self.vs.pop();
                let entry = self.vs.pop();
                self.vs.push(entry.ty, ValueLoc::FReg(xa));
            }
            OpKind::Copysign => {
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                self.flush_all();
                let b = self.vs.slot_of(self.vs.len() - 1);
                let a = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                self.call_helper(
                    HelperIndex::FCopysign,
                    &[
                        HelperArg::Slot(a),
                        HelperArg::Slot(b),
                        HelperArg::Imm(double as u64),
                    ],
                    None,
                );
                let x = self.alloc_fp();
                self.asm().fmov_from_gpr(x, Reg::X1, true);
                self.vs.push(
                    if double {
                        RuntimeType::F64
                    } else {
                        RuntimeType::F32
                    },
                    ValueLoc::FReg(x),
                );
            }
            OpKind::I32WrapI64 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                if let ValueLoc::Const(cv) = self.vs.get(idx).loc {
                    let e = self.vs.get_mut(idx);
                    e.loc = ValueLoc::Const(cv as u32 as u64);
                    e.ty = RuntimeType::I32;
                } else {
                    let r = self.ensure_gp(idx);
                    self.asm().mov32(r, r);
                    self.vs.get_mut(idx).ty = RuntimeType::I32;
                }
            }
            OpKind::I64ExtendI32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                if op.b3 {
                    self.asm().sxtw(r, r);
                } else {
                    self.asm().mov32(r, r);
                }
                self.vs.get_mut(idx).ty = RuntimeType::I64;
            }
            OpKind::SignExtend32From8 | OpKind::SignExtend64From8 => {
                self.protect_flags();
                let w = op.kind == OpKind::SignExtend64From8;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().sxtb(r, r, w);
            }
            OpKind::SignExtend32From16 | OpKind::SignExtend64From16 => {
                self.protect_flags();
                let w = op.kind == OpKind::SignExtend64From16;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().sxth(r, r, w);
            }
            OpKind::SignExtend64From32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().sxtw(r, r);
            }
            OpKind::ITruncF => {
                let to64 = RuntimeType::from_u8(op.b2) == RuntimeType::I64;
                let from_double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let sat = op.u1 != 0;
                let pack = (from_double as u64)
                    | ((to64 as u64) << 1)
                    | ((op.b3 as u64) << 2)
                    | ((sat as u64) << 3);
                self.flush_all();
                let slot = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(
                    HelperIndex::ITrunc,
                    &[HelperArg::Slot(slot), HelperArg::Imm(pack)],
                    Some(op.pos),
                );
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(
                    if to64 {
                        RuntimeType::I64
                    } else {
                        RuntimeType::I32
                    },
                    ValueLoc::Reg(r as u8),
                );
            }
            OpKind::FConvertI => {
                self.protect_flags();
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                let from64 = RuntimeType::from_u8(op.b2) == RuntimeType::I64;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.vs.touch(idx);
                let x = self.alloc_fp();
                if op.b3 {
                    self.asm().scvtf(x, r, double, from64);
                } else {
                    self.asm().ucvtf(x, r, double, from64);
                }
                self.vs.pop();
                self.vs.push(
                    if double {
                        RuntimeType::F64
                    } else {
                        RuntimeType::F32
                    },
                    ValueLoc::FReg(x),
                );
            }
            OpKind::F32DemoteF64 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, true);
                self.asm().fcvt_d_to_s(x, x);
                self.vs.get_mut(idx).ty = RuntimeType::F32;
            }
            OpKind::F64PromoteF32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, false);
                self.asm().fcvt_s_to_d(x, x);
                self.vs.get_mut(idx).ty = RuntimeType::F64;
            }
            OpKind::I32ReinterpretF32 | OpKind::I64ReinterpretF64 => {
                self.protect_flags();
                let to64 = op.kind == OpKind::I64ReinterpretF64;
                let idx = self.vs.len() - 1;
                // The 32-bit result must come out zero-extended; float
                // homes may carry stale upper bits.
                match self.vs.get(idx).loc {
                    ValueLoc::FReg(x) => {
                        let r = self.alloc_gp();
                        self.asm().fmov_to_gpr(r, x, to64);
                        self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                    }
                    ValueLoc::Reg(r) if !to64 => {
                        let r = Reg::from_code(r);
                        self.asm().mov32(r, r);
                    }
                    ValueLoc::Stack if !to64 => {
                        let r = self.alloc_gp();
                        let slot = self.vs.slot_of(idx);
                        let off = slot * 8;
                        if off / 4 < 4096 {
                            self.asm().ldr32(r, regs::FRAME, off);
                        } else {
                            self.ldr_slot(r, slot);
                            self.asm().mov32(r, r);
                        }
                        self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                    }
                    ValueLoc::Const(cv) if !to64 => {
                        self.vs.set_loc(idx, ValueLoc::Const(cv as u32 as u64));
                    }
                    _ => {}
                }
                self.vs.get_mut(idx).ty = if to64 {
                    RuntimeType::I64
                } else {
                    RuntimeType::I32
                };
            }
            OpKind::F32ReinterpretI32 | OpKind::F64ReinterpretI64 => {
                self.protect_flags();
                let to64 = op.kind == OpKind::F64ReinterpretI64;
                let idx = self.vs.len() - 1;
                if let ValueLoc::Reg(r) = self.vs.get(idx).loc {
                    let x = self.alloc_fp();
                    self.asm().fmov_from_gpr(x, Reg::from_code(r), to64);
                    self.vs.set_loc(idx, ValueLoc::FReg(x));
                }
                self.vs.get_mut(idx).ty = if to64 {
                    RuntimeType::F64
                } else {
                    RuntimeType::F32
                };
            }
            _ => self.op_v128(op)?,
        }
        Ok(())
    }

    fn op_label(&mut self, op: &Operation) {
        let label = op.as_label();
        if self.reachable {
            self.flush_all();
        }
        self.labels.insert(label.0, self.buf.offset());
        let height = self.func.label_heights[&label.0];
        self.vs.reset_to_height(height);
        self.reachable = true;
        if label.kind() == LabelKind::Return {
            self.emit_epilogue();
            self.reachable = false;
        }
    }

    fn op_br_if(&mut self, op: &Operation) {
        let (then_l, then_d) = op.target(0);
        let (else_l, else_d) = op.target(1);

        let cond_idx = self.vs.len() - 1;
        match self.vs.get(cond_idx).loc {
            ValueLoc::Const(cv) => {
                self.vs.pop();
                self.flush_all();
                if cv != 0 {
                    self.emit_branch_edge(then_l.0, then_d);
                } else {
                    self.emit_branch_edge(else_l.0, else_d);
                }
            }
            ValueLoc::CondFlag(cc) => {
                self.vs.pop();
                self.flush_all();
                let site = self.asm().b_cond(cond_from(cc), 0);
                self.emit_branch_edge(else_l.0, else_d);
                self.bind_imm19(site);
                self.emit_branch_edge(then_l.0, then_d);
            }
            _ => {
                let r = self.ensure_gp(cond_idx);
                self.vs.pop();
                self.flush_all();
                let site = self.asm().cbnz(r, 0, false);
                self.emit_branch_edge(else_l.0, else_d);
                self.bind_imm19(site);
                self.emit_branch_edge(then_l.0, then_d);
            }
        }
        self.reachable = false;
    }

    fn op_br_table(&mut self, op: &Operation) {
        let n = op.target_count() - 1;
        let idx_entry = self.vs.len() - 1;
        if let ValueLoc::Const(cv) = self.vs.get(idx_entry).loc {
            self.vs.pop();
            self.flush_all();
            let pick = (cv as usize).min(n);
            let (label, drop) = op.target(pick);
            self.emit_branch_edge(label.0, drop);
            self.reachable = false;
            return;
        }
        let r = self.ensure_gp(idx_entry);
        self.vs.pop();
        self.flush_all();

        let mut sites = Vec::with_capacity(n);
        for i in 0..n {
            if i < 4096 {
                self.asm().cmp_imm(r, i as u16, false);
            } else {
                self.mov_u32(regs::SCRATCH, i as u32);
                self.asm().cmp(r, regs::SCRATCH, false);
            }
            let site = self.asm().b_cond(Cond::Eq, 0);
            sites.push(site);
        }
        let (dl, dd) = op.target(n);
        self.emit_branch_edge(dl.0, dd);
        for (i, site) in sites.into_iter().enumerate() {
            self.bind_imm19(site);
            let (label, drop) = op.target(i);
            self.emit_branch_edge(label.0, drop);
        }
        self.reachable = false;
    }

    fn op_call_indirect(&mut self, op: &Operation) {
        let type_idx = op.u1 as usize;
        let table_idx = op.u2 as u32;
        let sig = self.env.module.types[type_idx].clone();
        let type_id = self.env.type_ids[type_idx];

        let idx_entry = self.vs.len() - 1;
        let ri = self.ensure_gp(idx_entry);
        self.vs.pop();
        self.flush_all();

        // Bounds check against the table length.
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_TABLES);
        self.asm()
            .ldr64(regs::SCRATCH2, regs::SCRATCH, table_idx * 16 + 8);
        self.asm().cmp(ri, regs::SCRATCH2, true);
        self.trap_if(Cond::Cs, TrapKind::UndefinedElement, op.pos);

        // Fetch the reference and null-check it.
        self.asm()
            .ldr64(regs::SCRATCH, regs::SCRATCH, table_idx * 16);
        self.mov_u32(regs::SCRATCH2, 3);
        let mut a = self.asm();
        // x7 = index*8; keep it for the later table lookups.
        a.lslv(Reg::X7, ri, regs::SCRATCH2, true);
        a.add(regs::SCRATCH, regs::SCRATCH, Reg::X7, true);
        a.ldr64(regs::SCRATCH, regs::SCRATCH, 0);
        a.cmp_imm(regs::SCRATCH, 0, true);
        drop(a);
        self.trap_if(Cond::Eq, TrapKind::UninitializedElement, op.pos);

        // func index = ref - 1; check the interned type id.
        self.asm().sub_imm(regs::SCRATCH, regs::SCRATCH, 1, true);
        self.mov_u32(regs::SCRATCH2, 3);
        let mut a = self.asm();
        a.lslv(Reg::X7, regs::SCRATCH, regs::SCRATCH2, true);
        drop(a);
        self.ldr_ctx(regs::SCRATCH2, ctx::CTX_FUNC_TYPES);
        let mut a = self.asm();
        a.add(regs::SCRATCH2, regs::SCRATCH2, Reg::X7, true);
        a.ldr64(regs::SCRATCH2, regs::SCRATCH2, 0);
        drop(a);
        self.mov_u32(Reg::X6, type_id as u32);
        self.asm().cmp(regs::SCRATCH2, Reg::X6, true);
        self.trap_if(Cond::Ne, TrapKind::IndirectCallTypeMismatch, op.pos);

        // Entry address.
        self.ldr_ctx(regs::SCRATCH2, ctx::CTX_FUNC_ENTRIES);
        let mut a = self.asm();
        a.add(regs::SCRATCH2, regs::SCRATCH2, Reg::X7, true);
        a.ldr64(regs::SCRATCH, regs::SCRATCH2, 0);
        drop(a);
        self.emit_call_sequence(&sig, CallTarget::Register(regs::SCRATCH));
    }

    fn emit_call_sequence(&mut self, sig: &FuncType, target: CallTarget) {
        let nargs: u32 = sig.params.iter().map(|t| t.slot_count()).sum();
        let h = self.vs.height();
        let callee_base = h - nargs;

        for (slot, ty, loc) in assign_arg_regs(&sig.params) {
            match loc {
                ArgLoc::Gp(r) => self.ldr_slot(r, callee_base + slot),
                ArgLoc::Fp(x) => self.ldr_fp_slot(x, callee_base + slot, ty == ValType::F64),
                ArgLoc::Stack => {}
            }
        }

        // Advance the frame base for the callee.
        let advance = callee_base as u64 * 8;
        if advance < 4096 {
            self.asm()
                .add_imm(regs::FRAME, regs::FRAME, advance as u16, true);
        } else {
            self.asm().mov_imm64(regs::SCRATCH2, advance);
            self.asm()
                .add(regs::FRAME, regs::FRAME, regs::SCRATCH2, true);
        }
        match target {
            CallTarget::Direct(func_idx) => {
                let site = self.asm().bl(0);
                self.relocs.push(Reloc {
                    site,
                    callee: func_idx,
                });
                self.num_call_sites += 1;
            }
            CallTarget::Register(r) => {
                self.asm().blr(r);
            }
        }
        if advance < 4096 {
            self.asm()
                .sub_imm(regs::FRAME, regs::FRAME, advance as u16, true);
        } else {
            self.asm().mov_imm64(regs::SCRATCH2, advance);
            self.asm()
                .sub(regs::FRAME, regs::FRAME, regs::SCRATCH2, true);
        }

        // Cooperative cancellation: unwind when the engine's exit cell is
        // set.
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_EXIT_CODE);
        self.asm().ldr64(regs::SCRATCH, regs::SCRATCH, 0);
        let skip = self.asm().cbz(regs::SCRATCH, 0, true);
        self.mov_u32(regs::SCRATCH, ctx::STATUS_EXIT as u32);
        self.str_ctx(regs::SCRATCH, ctx::CTX_STATUS);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_imm19(skip);

        for _ in 0..nargs {
            self.vs.pop();
        }
        for (_, ty, loc) in assign_arg_regs(&sig.results) {
            match (ty, loc) {
                (ValType::V128, _) => {
                    self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
                    self.vs.push(RuntimeType::V128Hi, ValueLoc::Stack);
                }
                (ty, _) => {
                    // Results also sit in the frame slots; treat them as
                    // memory-resident to keep x0..x5 free.
                    let rt = match ty {
                        ValType::I32 => RuntimeType::I32,
                        ValType::F32 => RuntimeType::F32,
                        ValType::F64 => RuntimeType::F64,
                        _ => RuntimeType::I64,
                    };
                    self.vs.push(rt, ValueLoc::Stack);
                }
            }
        }
    }

    fn op_drop(&mut self, range: InclusiveRange) {
        if range.is_none() {
            return;
        }
        let keep = range.start as u32;
        if keep == 0 {
            self.vs.drop_range(range.start as u32, range.end as u32);
            return;
        }
        let h = self.vs.height();
        let dst_base = h - 1 - range.end as u32;
        let src_base = h - keep;
        let n = self.vs.len();
        let kept_memory: Vec<u32> = (0..keep)
            .filter(|i| {
                let idx = n - keep as usize + *i as usize;
                matches!(self.vs.get(idx).loc, ValueLoc::Stack | ValueLoc::VecLo)
            })
            .collect();
        for i in kept_memory {
            self.ldr_slot(regs::SCRATCH, src_base + i);
            self.str_slot(regs::SCRATCH, dst_base + i);
        }
        self.vs.drop_range(range.start as u32, range.end as u32);
    }

    fn op_select(&mut self, op: &Operation) {
        self.protect_flags();
        if op.b3 {
            self.flush_all();
            let cond_slot = self.vs.slot_of(self.vs.len() - 1);
            let v2_lo = self.vs.slot_of(self.vs.len() - 3);
            let v1_lo = self.vs.slot_of(self.vs.len() - 5);
            self.ldr_slot(regs::SCRATCH, cond_slot);
            let keep = self.asm().cbnz(regs::SCRATCH, 0, false);
            self.ldr_vec_slot(regs::FP_SCRATCH, v2_lo);
            self.str_vec_slot(regs::FP_SCRATCH, v1_lo);
            self.bind_imm19(keep);
            for _ in 0..5 {
                self.vs.pop();
            }
            self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
            self.vs.push(RuntimeType::V128Hi, ValueLoc::Stack);
            return;
        }
        let cond_idx = self.vs.len() - 1;
        let rc = self.ensure_gp(cond_idx);
        self.vs.touch(cond_idx);
        let v2_idx = self.vs.len() - 2;
        let r2 = self.ensure_gp(v2_idx);
        self.vs.touch(v2_idx);
        let v1_idx = self.vs.len() - 3;
        let r1 = self.ensure_gp(v1_idx);
        let mut a = self.asm();
        a.cmp_imm(rc, 0, false);
        a.csel(r1, r1, r2, Cond::Ne, true);
        drop(a);
        self.vs.pop();
        self.vs.pop();
        let popped = self.vs.pop();
        self.vs.push(popped.ty, ValueLoc::Reg(r1 as u8));
    }

    fn op_pick(&mut self, op: &Operation) {
        self.protect_flags();
        let depth = op.u1 as u32;
        let h = self.vs.height();
        let src_slot = h - 1 - depth;

        if op.b3 {
            let x = self.alloc_fp();
            let from_reg = self
                .vs
                .entry_of_slot(src_slot + 1)
                .filter(|i| *i < self.vs.len())
                .and_then(|i| match self.vs.get(i).loc {
                    ValueLoc::FReg(sx) => Some(sx),
                    _ => None,
                });
            if let Some(sx) = from_reg {
                self.asm().v_orr(x, sx, sx);
            } else {
                self.ldr_vec_slot(x, src_slot);
            }
            self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
            self.vs.push(RuntimeType::V128Hi, ValueLoc::FReg(x));
            return;
        }

        let src_idx = self
            .vs
            .entry_of_slot(src_slot)
            .filter(|i| *i < self.vs.len());
        match src_idx {
            Some(src_idx) => {
                let src = self.vs.get(src_idx).clone();
                match src.loc {
                    ValueLoc::Const(cv) => {
                        self.vs.push(src.ty, ValueLoc::Const(cv));
                    }
                    ValueLoc::Reg(sr) => {
                        self.vs.touch(src_idx);
                        let r = self.alloc_gp();
                        self.asm().mov(r, Reg::from_code(sr), true);
                        self.vs.push(src.ty, ValueLoc::Reg(r as u8));
                    }
                    ValueLoc::FReg(sx) => {
                        self.vs.touch(src_idx);
                        let x = self.alloc_fp();
                        self.asm().fmov(x, sx, true);
                        self.vs.push(src.ty, ValueLoc::FReg(x));
                    }
                    ValueLoc::Stack => {
                        let r = self.alloc_gp();
                        self.ldr_slot(r, src_slot);
                        self.vs.push(src.ty, ValueLoc::Reg(r as u8));
                    }
                    ValueLoc::CondFlag(_) => {
                        self.ensure_gp(src_idx);
                        self.op_pick(op);
                    }
                    ValueLoc::VecLo => unreachable!("scalar pick of a vector half"),
                }
            }
            None => {
                let r = self.alloc_gp();
                self.ldr_slot(r, src_slot);
                self.vs.push(RuntimeType::I64, ValueLoc::Reg(r as u8));
            }
        }
    }

    fn op_set(&mut self, op: &Operation) {
        self.protect_flags();
        let depth = op.u1 as u32;
        let h = self.vs.height();
        let target = h - 1 - depth;

        if op.b3 {
            let hi_idx = self.vs.len() - 1;
            if let ValueLoc::FReg(x) = self.vs.get(hi_idx).loc {
                self.str_vec_slot(x, target);
            } else {
                self.flush_entry_pair(hi_idx);
                let src_lo = self.vs.slot_of(hi_idx) - 1;
                self.ldr_vec_slot(regs::FP_SCRATCH, src_lo);
                self.str_vec_slot(regs::FP_SCRATCH, target);
            }
            self.vs.pop();
            self.vs.pop();
            self.invalidate_slot(target);
            self.invalidate_slot(target + 1);
            return;
        }

        let val_idx = self.vs.len() - 1;
        let val = self.vs.get(val_idx).clone();
        match val.loc {
            ValueLoc::Reg(r) => self.str_slot(Reg::from_code(r), target),
            ValueLoc::FReg(x) => {
                let double = val.ty != RuntimeType::F32;
                // Store the full 64-bit image so the slot stays clean.
                let _ = double;
                self.str_fp_slot(x, target, true);
            }
            _ => {
                self.top_to_scratch();
                self.str_slot(regs::SCRATCH, target);
            }
        }
        self.vs.pop();
        self.invalidate_slot(target);
    }

    fn invalidate_slot(&mut self, slot: u32) {
        if let Some(idx) = self.vs.entry_of_slot(slot) {
            if idx < self.vs.len() {
                self.vs.set_loc(idx, ValueLoc::Stack);
            }
        }
    }

    fn flush_entry_pair(&mut self, hi_idx: usize) {
        if !matches!(self.vs.get(hi_idx).loc, ValueLoc::Stack | ValueLoc::VecLo) {
            self.spill_entry(hi_idx);
        }
        if !matches!(
            self.vs.get(hi_idx - 1).loc,
            ValueLoc::Stack | ValueLoc::VecLo
        ) {
            self.spill_entry(hi_idx - 1);
        }
    }

    fn op_global_get(&mut self, op: &Operation) {
        self.protect_flags();
        let global = &self.env.module.globals[op.u1 as usize];
        let off = self.env.global_slots[op.u1 as usize] * 8;
        self.ldr_ctx(regs::SCRATCH, ctx::CTX_GLOBALS);
        match global.ty.val {
            ValType::F32 | ValType::F64 => {
                let double = global.ty.val == ValType::F64;
                let x = self.alloc_fp();
                let mut a = self.asm();
                if double {
                    a.ldr_d(x, regs::SCRATCH, off);
                } else {
                    a.ldr_s(x, regs::SCRATCH, off);
                }
                drop(a);
                self.vs.push(
                    if double {
                        RuntimeType::F64
                    } else {
                        RuntimeType::F32
                    },
                    ValueLoc::FReg(x),
                );
            }
            ValType::V128 => {
                let x = self.alloc_fp();
                if off % 16 == 0 {
                    self.asm().ldr_q(x, regs::SCRATCH, off);
                } else {
                    let mut a = self.asm();
                    a.add_imm(regs::SCRATCH, regs::SCRATCH, off as u16, true);
                    a.ldr_q(x, regs::SCRATCH, 0);
                }
                self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
                self.vs.push(RuntimeType::V128Hi, ValueLoc::FReg(x));
            }
            ty => {
                let r = self.alloc_gp();
                if ty == ValType::I32 {
                    self.asm().ldr32(r, regs::SCRATCH, off);
                } else {
                    self.asm().ldr64(r, regs::SCRATCH, off);
                }
                self.vs.push(
                    if ty == ValType::I32 {
                        RuntimeType::I32
                    } else {
                        RuntimeType::I64
                    },
                    ValueLoc::Reg(r as u8),
                );
            }
        }
    }

    fn op_global_set(&mut self, op: &Operation) {
        self.protect_flags();
        let global = &self.env.module.globals[op.u1 as usize];
        let off = self.env.global_slots[op.u1 as usize] * 8;
        match global.ty.val {
            ValType::V128 => {
                let hi_idx = self.vs.len() - 1;
                let x = self.ensure_vec(hi_idx);
                self.ldr_ctx(regs::SCRATCH, ctx::CTX_GLOBALS);
                if off % 16 == 0 {
                    self.asm().str_q(x, regs::SCRATCH, off);
                } else {
                    let mut a = self.asm();
                    a.add_imm(regs::SCRATCH, regs::SCRATCH, off as u16, true);
                    a.str_q(x, regs::SCRATCH, 0);
                }
                self.vs.pop();
                self.vs.pop();
            }
            _ => {
                self.top_to_scratch();
                self.ldr_ctx(regs::SCRATCH2, ctx::CTX_GLOBALS);
                self.asm().str64(regs::SCRATCH, regs::SCRATCH2, off);
                self.vs.pop();
            }
        }
    }

    /// Materialize the effective address `mem_base + index + offset` into
    /// the scratch register.
    fn mem_addr(&mut self, ri: Reg, offset: u32) {
        self.asm().add_uxtw(regs::SCRATCH, regs::MEM, ri);
        if offset != 0 {
            if offset < 4096 {
                self.asm()
                    .add_imm(regs::SCRATCH, regs::SCRATCH, offset as u16, true);
            } else {
                self.mov_u32(regs::SCRATCH2, offset);
                self.asm()
                    .add(regs::SCRATCH, regs::SCRATCH, regs::SCRATCH2, true);
            }
        }
    }

    fn op_load(&mut self, op: &Operation) {
        self.protect_flags();
        let arg = op.mem_arg();
        let ty = RuntimeType::from_u8(op.b1);
        let idx = self.vs.len() - 1;
        let ri = self.ensure_gp(idx);
        self.vs.touch(idx);

        let float = ty.is_float();
        let result = if float { None } else { Some(self.alloc_gp()) };
        let fresult = if float { Some(self.alloc_fp()) } else { None };

        self.mem_addr(ri, arg.offset);
        self.pc_traps.push((self.buf.offset(), op.pos));
        let mut a = self.asm();
        match (op.kind, ty, op.b3) {
            (OpKind::Load, RuntimeType::I32, _) => a.ldr32(result.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load, RuntimeType::I64, _) => a.ldr64(result.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load, RuntimeType::F32, _) => a.ldr_s(fresult.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load, RuntimeType::F64, _) => a.ldr_d(fresult.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load8, _, true) => {
                a.ldrsb(result.unwrap(), regs::SCRATCH, 0, ty == RuntimeType::I64)
            }
            (OpKind::Load8, _, false) => a.ldrb(result.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load16, _, true) => {
                a.ldrsh(result.unwrap(), regs::SCRATCH, 0, ty == RuntimeType::I64)
            }
            (OpKind::Load16, _, false) => a.ldrh(result.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load32, _, true) => a.ldrsw(result.unwrap(), regs::SCRATCH, 0),
            (OpKind::Load32, _, false) => a.ldr32(result.unwrap(), regs::SCRATCH, 0),
            _ => unreachable!(),
        }
        drop(a);

        self.vs.pop();
        if let Some(r) = result {
            self.vs.push(ty, ValueLoc::Reg(r as u8));
        } else {
            self.vs.push(ty, ValueLoc::FReg(fresult.unwrap()));
        }
    }

    fn op_store(&mut self, op: &Operation) {
        self.protect_flags();
        let arg = op.mem_arg();
        let ty = RuntimeType::from_u8(op.b1);

        let val_idx = self.vs.len() - 1;
        let idx_idx = self.vs.len() - 2;
        let ri = self.ensure_gp(idx_idx);
        self.vs.touch(idx_idx);

        let float = ty.is_float() && op.kind == OpKind::Store;
        let (vr, vx) = if float {
            (None, Some(self.ensure_fp(val_idx, ty == RuntimeType::F64)))
        } else {
            (Some(self.ensure_gp(val_idx)), None)
        };
        self.vs.touch(val_idx);

        self.mem_addr(ri, arg.offset);
        self.pc_traps.push((self.buf.offset(), op.pos));
        let mut a = self.asm();
        match (op.kind, ty) {
            (OpKind::Store, RuntimeType::I32) => a.str32(vr.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store, RuntimeType::I64) => a.str64(vr.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store, RuntimeType::F32) => a.str_s(vx.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store, RuntimeType::F64) => a.str_d(vx.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store8, _) => a.strb(vr.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store16, _) => a.strh(vr.unwrap(), regs::SCRATCH, 0),
            (OpKind::Store32, _) => a.str32(vr.unwrap(), regs::SCRATCH, 0),
            _ => unreachable!(),
        }
        drop(a);
        self.vs.pop();
        self.vs.pop();
    }

    fn op_eqz(&mut self, op: &Operation) {
        let w = RuntimeType::from_u8(op.b1) == RuntimeType::I64;
        let idx = self.vs.len() - 1;
        if let ValueLoc::CondFlag(cc) = self.vs.get(idx).loc {
            let inv = cond_from(cc).invert() as u8;
            self.vs.pop();
            self.vs.push(RuntimeType::I32, ValueLoc::CondFlag(inv));
            return;
        }
        self.protect_flags();
        let r = self.ensure_gp(idx);
        self.asm().cmp_imm(r, 0, w);
        self.vs.pop();
        self.vs
            .push(RuntimeType::I32, ValueLoc::CondFlag(Cond::Eq as u8));
    }

    fn op_compare(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        self.protect_flags();
        let b_idx = self.vs.len() - 1;

        if ty.is_float() {
            let double = ty == RuntimeType::F64;
            let xb = self.ensure_fp(b_idx, double);
            self.vs.touch(b_idx);
            let a_idx = self.vs.len() - 2;
            let xa = self.ensure_fp(a_idx, double);
            self.asm().fcmp(xa, xb, double);
            // These condition choices all reject unordered inputs, and NE
            // accepts them, matching Wasm NaN semantics.
            let cc = match op.kind {
                OpKind::Eq => Cond::Eq,
                OpKind::Ne => Cond::Ne,
                OpKind::Lt => Cond::Mi,
                OpKind::Le => Cond::Ls,
                OpKind::Gt => Cond::Gt,
                _ => Cond::Ge,
            };
            self.vs.pop();
            self.vs.pop();
            self.vs.push(RuntimeType::I32, ValueLoc::CondFlag(cc as u8));
            return;
        }

        let w = ty == RuntimeType::I64;
        let signed = op.b3;
        let rb = self.ensure_gp(b_idx);
        self.vs.touch(b_idx);
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);
        self.asm().cmp(ra, rb, w);
        let cc = match (op.kind, signed) {
            (OpKind::Eq, _) => Cond::Eq,
            (OpKind::Ne, _) => Cond::Ne,
            (OpKind::Lt, true) => Cond::Lt,
            (OpKind::Lt, false) => Cond::Cc,
            (OpKind::Gt, true) => Cond::Gt,
            (OpKind::Gt, false) => Cond::Hi,
            (OpKind::Le, true) => Cond::Le,
            (OpKind::Le, false) => Cond::Ls,
            (OpKind::Ge, true) => Cond::Ge,
            _ => Cond::Cs,
        };
        self.vs.pop();
        self.vs.pop();
        self.vs.push(RuntimeType::I32, ValueLoc::CondFlag(cc as u8));
    }

    fn op_binary_alu(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        self.protect_flags();

        if ty.is_float() {
            let double = ty == RuntimeType::F64;
            let b_idx = self.vs.len() - 1;
            let xb = self.ensure_fp(b_idx, double);
            self.vs.touch(b_idx);
            let a_idx = self.vs.len() - 2;
            let xa = self.ensure_fp(a_idx, double);
            let mut a = self.asm();
            match op.kind {
                OpKind::Add => a.fadd(xa, xa, xb, double),
                OpKind::Sub => a.fsub(xa, xa, xb, double),
                OpKind::Mul => a.fmul(xa, xa, xb, double),
                _ => unreachable!("float bitwise ops do not exist"),
            }
            drop(a);
            self.vs.pop();
            let entry = self.vs.pop();
            self.vs.push(entry.ty, ValueLoc::FReg(xa));
            return;
        }

        let w = ty == RuntimeType::I64;
        let b_idx = self.vs.len() - 1;
        let rb = self.ensure_gp(b_idx);
        self.vs.touch(b_idx);
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);

        let mut a = self.asm();
        match op.kind {
            OpKind::Add => a.add(ra, ra, rb, w),
            OpKind::Sub => a.sub(ra, ra, rb, w),
            OpKind::Mul => a.mul(ra, ra, rb, w),
            OpKind::And => a.and(ra, ra, rb, w),
            OpKind::Or => a.orr(ra, ra, rb, w),
            OpKind::Xor => a.eor(ra, ra, rb, w),
            _ => unreachable!(),
        }
        drop(a);
        self.vs.pop();
        let entry = self.vs.pop();
        self.vs.push(entry.ty, ValueLoc::Reg(ra as u8));
    }

    fn op_div_rem(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        self.protect_flags();

        if ty.is_float() {
            let double = ty == RuntimeType::F64;
            let b_idx = self.vs.len() - 1;
            let xb = self.ensure_fp(b_idx, double);
            self.vs.touch(b_idx);
            let a_idx = self.vs.len() - 2;
            let xa = self.ensure_fp(a_idx, double);
            self.asm().fdiv(xa, xa, xb, double);
            self.vs.pop();
            let entry = self.vs.pop();
            self.vs.push(entry.ty, ValueLoc::FReg(xa));
            return;
        }

        let w = ty == RuntimeType::I64;
        let signed = op.b3;
        let is_rem = op.kind == OpKind::Rem;

        let b_idx = self.vs.len() - 1;
        let rb = self.ensure_gp(b_idx);
        self.vs.touch(b_idx);
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);
        self.vs.touch(a_idx);

        self.asm().cmp_imm(rb, 0, w);
        self.trap_if(Cond::Eq, TrapKind::IntegerDivideByZero, op.pos);

        if signed && !is_rem {
            // INT_MIN / -1 overflows.
            self.asm().cmn_imm(rb, 1, w);
            let not_minus_one = self.asm().b_cond(Cond::Ne, 0);
            if w {
                self.asm().mov_imm64(regs::SCRATCH, i64::MIN as u64);
            } else {
                self.asm().movz(regs::SCRATCH, 0x8000, 1, false);
            }
            self.asm().cmp(ra, regs::SCRATCH, w);
            let no_overflow = self.asm().b_cond(Cond::Ne, 0);
            self.trap_now(TrapKind::IntegerOverflow, op.pos);
            self.bind_imm19(not_minus_one);
            self.bind_imm19(no_overflow);
        }

        self.vs.pop();
        self.vs.pop();
        let r = self.alloc_gp();
        let mut a = self.asm();
        if signed {
            a.sdiv(regs::SCRATCH, ra, rb, w);
        } else {
            a.udiv(regs::SCRATCH, ra, rb, w);
        }
        if is_rem {
            // rem = a - quotient*b; INT_MIN % -1 falls out as 0.
            a.msub(r, regs::SCRATCH, rb, ra, w);
        } else {
            a.mov(r, regs::SCRATCH, w);
        }
        if !w {
            a.mov32(r, r);
        }
        drop(a);
        self.vs.push(ty, ValueLoc::Reg(r as u8));
    }

    fn op_shift(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        let w = ty == RuntimeType::I64;
        self.protect_flags();

        let b_idx = self.vs.len() - 1;
        let rb = self.ensure_gp(b_idx);
        self.vs.touch(b_idx);
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);

        // The shift-variable forms take the count modulo the datasize,
        // which is exactly Wasm's semantics.
        let mut a = self.asm();
        match (op.kind, op.b3) {
            (OpKind::Shl, _) => a.lslv(ra, ra, rb, w),
            (OpKind::Shr, true) => a.asrv(ra, ra, rb, w),
            (OpKind::Shr, false) => a.lsrv(ra, ra, rb, w),
            (OpKind::Rotr, _) => a.rorv(ra, ra, rb, w),
            (OpKind::Rotl, _) => {
                // rotl(a, n) = rotr(a, -n)
                a.sub(regs::SCRATCH, Reg::XZR, rb, w);
                a.rorv(ra, ra, regs::SCRATCH, w);
            }
            _ => unreachable!(),
        }
        if !w {
            a.mov32(ra, ra);
        }
        drop(a);
        self.vs.pop();
        let entry = self.vs.pop();
        self.vs.push(entry.ty, ValueLoc::Reg(ra as u8));
    }

    // ==================== SIMD ====================

    fn op_v128(&mut self, op: &Operation) -> Result<(), CompileError> {
        use OpKind::*;
        match op.kind {
            V128And | V128Or | V128Xor | V128AndNot => {
                self.protect_flags();
                let b_hi = self.vs.len() - 1;
                let xb = self.ensure_vec(b_hi);
                self.vs.touch(b_hi);
                let a_hi = self.vs.len() - 3;
                let xa = self.ensure_vec(a_hi);
                let mut a = self.asm();
                match op.kind {
                    V128And => a.v_and(xa, xa, xb),
                    V128Or => a.v_orr(xa, xa, xb),
                    V128Xor => a.v_eor(xa, xa, xb),
                    _ => a.v_bic(xa, xa, xb),
                }
                drop(a);
                self.pop_vec();
                self.pop_vec();
                self.push_vec_reg(xa);
            }
            V128Not => {
                self.protect_flags();
                let hi = self.vs.len() - 1;
                let x = self.ensure_vec(hi);
                // The operand's slots are dead after the pop; reuse them
                // to materialize the all-ones vector.
                let lo_slot = self.vs.slot_of(hi) - 1;
                self.asm().mov_imm64(regs::SCRATCH, u64::MAX);
                self.str_slot(regs::SCRATCH, lo_slot);
                self.str_slot(regs::SCRATCH, lo_slot + 1);
                self.ldr_vec_slot(regs::FP_SCRATCH, lo_slot);
                self.asm().v_eor(x, x, regs::FP_SCRATCH);
                self.pop_vec();
                self.push_vec_reg(x);
            }
            V128Add | V128Sub if !Shape::from_u8(op.b1).is_float() => {
                self.protect_flags();
                let shape = Shape::from_u8(op.b1);
                let b_hi = self.vs.len() - 1;
                let xb = self.ensure_vec(b_hi);
                self.vs.touch(b_hi);
                let a_hi = self.vs.len() - 3;
                let xa = self.ensure_vec(a_hi);
                let lane = shape.lane_bytes().trailing_zeros() as u8;
                if op.kind == V128Add {
                    self.asm().v_add(xa, xa, xb, lane);
                } else {
                    self.asm().v_sub(xa, xa, xb, lane);
                }
                self.pop_vec();
                self.pop_vec();
                self.push_vec_reg(xa);
            }
            V128Load if V128LoadKind::from_u8(op.b1) == V128LoadKind::Full => {
                self.protect_flags();
                let arg = op.mem_arg();
                let idx = self.vs.len() - 1;
                let ri = self.ensure_gp(idx);
                self.vs.touch(idx);
                let x = self.alloc_fp();
                self.mem_addr(ri, arg.offset);
                self.pc_traps.push((self.buf.offset(), op.pos));
                self.asm().ldr_q(x, regs::SCRATCH, 0);
                self.vs.pop();
                self.push_vec_reg(x);
            }
            V128Load => {
                self.flush_all();
                let arg = op.mem_arg();
                let idx_slot = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                let pack =
                    (arg.offset as u64) | ((op.b1 as u64) << 32) | ((op.b3 as u64) << 40);
                self.call_helper(
                    HelperIndex::V128Load,
                    &[
                        HelperArg::SlotAddr(idx_slot),
                        HelperArg::Slot(idx_slot),
                        HelperArg::Imm(pack),
                    ],
                    Some(op.pos),
                );
                self.push_vec_stack();
            }
            V128Store => {
                self.protect_flags();
                let arg = op.mem_arg();
                let hi = self.vs.len() - 1;
                let x = self.ensure_vec(hi);
                let idx_idx = self.vs.len() - 3;
                let ri = self.ensure_gp(idx_idx);
                self.vs.touch(idx_idx);
                self.mem_addr(ri, arg.offset);
                self.pc_traps.push((self.buf.offset(), op.pos));
                self.asm().str_q(x, regs::SCRATCH, 0);
                self.pop_vec();
                self.vs.pop();
            }
            V128LoadLane | V128StoreLane => {
                self.flush_all();
                let v_lo = self.vs.slot_of(self.vs.len() - 2);
                let idx_slot = self.vs.slot_of(self.vs.len() - 3);
                let arg = op.mem_arg();
                let pack = (arg.offset as u64) | ((op.b1 as u64) << 32) | (op.u2 << 40);
                let helper = if op.kind == V128LoadLane {
                    HelperIndex::V128LoadLane
                } else {
                    HelperIndex::V128StoreLane
                };
                self.vs.pop();
                self.vs.pop();
                self.vs.pop();
                self.call_helper(
                    helper,
                    &[
                        HelperArg::SlotAddr(idx_slot),
                        HelperArg::SlotAddr(v_lo),
                        HelperArg::Slot(idx_slot),
                        HelperArg::Imm(pack),
                    ],
                    Some(op.pos),
                );
                if op.kind == V128LoadLane {
                    self.push_vec_stack();
                }
            }
            V128Splat => {
                self.flush_all();
                let v_slot = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(
                    HelperIndex::V128Splat,
                    &[
                        HelperArg::SlotAddr(v_slot),
                        HelperArg::Slot(v_slot),
                        HelperArg::Imm(op.b1 as u64),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            V128ExtractLane => {
                self.flush_all();
                let lo_slot = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                let pack = (op.b1 as u64) | ((op.b2 as u64) << 8) | ((op.b3 as u64) << 16);
                self.call_helper(
                    HelperIndex::V128Extract,
                    &[HelperArg::SlotAddr(lo_slot), HelperArg::Imm(pack)],
                    None,
                );
                let shape = Shape::from_u8(op.b1);
                let rt = match shape {
                    Shape::F32x4 => RuntimeType::F32,
                    Shape::F64x2 => RuntimeType::F64,
                    Shape::I64x2 => RuntimeType::I64,
                    _ => RuntimeType::I32,
                };
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(rt, ValueLoc::Reg(r as u8));
            }
            V128ReplaceLane => {
                self.flush_all();
                let v_slot = self.vs.slot_of(self.vs.len() - 1);
                let lo_slot = self.vs.slot_of(self.vs.len() - 3);
                self.vs.pop();
                self.vs.pop();
                self.vs.pop();
                let pack = (op.b1 as u64) | ((op.b2 as u64) << 8);
                self.call_helper(
                    HelperIndex::V128Replace,
                    &[
                        HelperArg::SlotAddr(lo_slot),
                        HelperArg::Slot(v_slot),
                        HelperArg::Imm(pack),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            V128Shuffle => {
                self.flush_all();
                let b_lo = self.vs.slot_of(self.vs.len() - 2);
                let a_lo = self.vs.slot_of(self.vs.len() - 4);
                for _ in 0..4 {
                    self.vs.pop();
                }
                self.call_helper(
                    HelperIndex::V128Shuffle,
                    &[
                        HelperArg::SlotAddr(a_lo),
                        HelperArg::SlotAddr(b_lo),
                        HelperArg::Imm(op.u1),
                        HelperArg::Imm(op.u2),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            V128Swizzle => {
                self.flush_all();
                let b_lo = self.vs.slot_of(self.vs.len() - 2);
                let a_lo = self.vs.slot_of(self.vs.len() - 4);
                for _ in 0..4 {
                    self.vs.pop();
                }
                self.call_helper(
                    HelperIndex::V128Swizzle,
                    &[HelperArg::SlotAddr(a_lo), HelperArg::SlotAddr(b_lo)],
                    None,
                );
                self.push_vec_stack();
            }
            V128Bitselect => {
                self.flush_all();
                let c_lo = self.vs.slot_of(self.vs.len() - 2);
                let b_lo = self.vs.slot_of(self.vs.len() - 4);
                let a_lo = self.vs.slot_of(self.vs.len() - 6);
                for _ in 0..6 {
                    self.vs.pop();
                }
                self.call_helper(
                    HelperIndex::V128Bitselect,
                    &[
                        HelperArg::SlotAddr(a_lo),
                        HelperArg::SlotAddr(b_lo),
                        HelperArg::SlotAddr(c_lo),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            V128AnyTrue | V128AllTrue | V128Bitmask => {
                self.flush_all();
                let lo = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                let kind = match op.kind {
                    V128AnyTrue => 0u64,
                    V128AllTrue => 1,
                    _ => 2,
                };
                self.call_helper(
                    HelperIndex::V128Reduce,
                    &[
                        HelperArg::SlotAddr(lo),
                        HelperArg::Imm(kind | ((op.b1 as u64) << 8)),
                    ],
                    None,
                );
                let r = self.alloc_gp();
                self.asm().mov(r, Reg::X1, true);
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            V128Shl | V128Shr => {
                self.flush_all();
                let count = self.vs.slot_of(self.vs.len() - 1);
                let lo = self.vs.slot_of(self.vs.len() - 3);
                self.vs.pop();
                self.vs.pop();
                self.vs.pop();
                let pack = (op.b1 as u64)
                    | ((op.b3 as u64) << 8)
                    | (((op.kind == V128Shl) as u64) << 9);
                self.call_helper(
                    HelperIndex::V128Shift,
                    &[
                        HelperArg::SlotAddr(lo),
                        HelperArg::Slot(count),
                        HelperArg::Imm(pack),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            V128Neg | V128Abs | V128Sqrt | V128Popcnt | V128Ceil | V128Floor | V128Trunc
            | V128Nearest | V128Extend | V128ExtAddPairwise | V128FloatPromote
            | V128FloatDemote | V128FConvertI | V128ITruncSatF => {
                self.flush_all();
                let lo = self.vs.slot_of(self.vs.len() - 2);
                self.vs.pop();
                self.vs.pop();
                let pack = super::compiler_x86_64::v128_unop_code(op.kind)
                    | ((op.b1 as u64) << 8)
                    | ((op.b2 as u64) << 16)
                    | ((op.b3 as u64) << 24);
                self.call_helper(
                    HelperIndex::V128Unop,
                    &[HelperArg::SlotAddr(lo), HelperArg::Imm(pack)],
                    None,
                );
                self.push_vec_stack();
            }
            V128Add | V128Sub | V128Mul | V128Div | V128AddSat | V128SubSat | V128Min
            | V128Max | V128AvgrU | V128Pmin | V128Pmax | V128Cmp | V128ExtMul
            | V128Q15mulrSatS | V128Dot | V128Narrow => {
                self.flush_all();
                let b_lo = self.vs.slot_of(self.vs.len() - 2);
                let a_lo = self.vs.slot_of(self.vs.len() - 4);
                for _ in 0..4 {
                    self.vs.pop();
                }
                let pack = super::compiler_x86_64::v128_binop_code(op.kind)
                    | ((op.b1 as u64) << 8)
                    | ((op.b2 as u64) << 16)
                    | ((op.b3 as u64) << 24);
                self.call_helper(
                    HelperIndex::V128Binop,
                    &[
                        HelperArg::SlotAddr(a_lo),
                        HelperArg::SlotAddr(b_lo),
                        HelperArg::Imm(pack),
                    ],
                    None,
                );
                self.push_vec_stack();
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "unhandled operation {other:?}"
                )))
            }
        }
        Ok(())
    }

    fn ensure_vec(&mut self, hi_idx: usize) -> u8 {
        match self.vs.get(hi_idx).loc {
            ValueLoc::FReg(x) => {
                self.vs.touch(hi_idx);
                x
            }
            _ => {
                self.flush_entry_pair(hi_idx);
                let lo_slot = self.vs.slot_of(hi_idx) - 1;
                let x = self.alloc_fp();
                self.ldr_vec_slot(x, lo_slot);
                self.vs.set_loc(hi_idx, ValueLoc::FReg(x));
                self.vs.get_mut(hi_idx).ty = RuntimeType::V128Hi;
                self.vs.set_loc(hi_idx - 1, ValueLoc::VecLo);
                x
            }
        }
    }

    fn pop_vec(&mut self) {
        self.vs.pop();
        self.vs.pop();
    }

    fn push_vec_reg(&mut self, x: u8) {
        self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
        self.vs.push(RuntimeType::V128Hi, ValueLoc::FReg(x));
    }

    fn push_vec_stack(&mut self) {
        self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
        self.vs.push(RuntimeType::V128Hi, ValueLoc::Stack);
    }
}

enum CallTarget {
    Direct(u32),
    Register(Reg),
}

#[derive(Debug, Clone, Copy)]
enum HelperArg {
    Slot(u32),
    SlotAddr(u32),
    Imm(u64),
}

fn cond_from(cc: u8) -> Cond {
    match cc & 0xF {
        0b0000 => Cond::Eq,
        0b0001 => Cond::Ne,
        0b0010 => Cond::Cs,
        0b0011 => Cond::Cc,
        0b0100 => Cond::Mi,
        0b0101 => Cond::Pl,
        0b0110 => Cond::Vs,
        0b0111 => Cond::Vc,
        0b1000 => Cond::Hi,
        0b1001 => Cond::Ls,
        0b1010 => Cond::Ge,
        0b1011 => Cond::Lt,
        0b1100 => Cond::Gt,
        0b1101 => Cond::Le,
        _ => Cond::Al,
    }
}

// ==================== entry trampolines & shims ====================

/// Compile the per-signature entry trampoline:
/// `extern "C" fn(ctx, entry, frame)`.
pub fn emit_entry_trampoline(sig: &FuncType) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = A64Assembler::new(&mut buf);
    a.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16);
    a.stp_pre(Reg::X26, Reg::X27, Reg::Sp, -16);
    a.stp_pre(Reg::X28, Reg::XZR, Reg::Sp, -16);

    a.mov(regs::CTX, Reg::X0, true);
    a.mov(regs::FRAME, Reg::X2, true);
    a.mov_sp(regs::SCRATCH, Reg::Sp);
    a.str64(regs::SCRATCH, regs::CTX, ctx::CTX_HOST_SP as u32);
    a.ldr64(regs::MEM, regs::CTX, ctx::CTX_MEMORY_BASE as u32);
    a.mov(regs::SCRATCH2, Reg::X1, true);
    drop(a);

    for (slot, ty, loc) in assign_arg_regs(&sig.params) {
        let mut a = A64Assembler::new(&mut buf);
        match loc {
            ArgLoc::Gp(r) => a.ldr64(r, regs::FRAME, slot * 8),
            ArgLoc::Fp(x) => {
                if ty == ValType::F64 {
                    a.ldr_d(x, regs::FRAME, slot * 8)
                } else {
                    a.ldr_s(x, regs::FRAME, slot * 8)
                }
            }
            ArgLoc::Stack => {}
        }
    }

    let mut a = A64Assembler::new(&mut buf);
    a.blr(regs::SCRATCH2);
    a.ldp_post(Reg::X28, Reg::XZR, Reg::Sp, 16);
    a.ldp_post(Reg::X26, Reg::X27, Reg::Sp, 16);
    a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
    a.ret();
    buf.into_code()
}

/// Compile the host-call shim for one imported function.
pub fn emit_host_shim(sig: &FuncType, import_index: u32) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = A64Assembler::new(&mut buf);
    a.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16);
    drop(a);

    for (slot, ty, loc) in assign_arg_regs(&sig.params) {
        let mut a = A64Assembler::new(&mut buf);
        match loc {
            ArgLoc::Gp(r) => a.str64(r, regs::FRAME, slot * 8),
            ArgLoc::Fp(x) => {
                if ty == ValType::F64 {
                    a.str_d(x, regs::FRAME, slot * 8)
                } else {
                    a.str_s(x, regs::FRAME, slot * 8)
                }
            }
            ArgLoc::Stack => {}
        }
    }

    let mut a = A64Assembler::new(&mut buf);
    a.mov(Reg::X0, regs::CTX, true);
    a.movz(Reg::X1, import_index as u16, 0, true);
    if import_index >> 16 != 0 {
        a.movk(Reg::X1, (import_index >> 16) as u16, 1, true);
    }
    a.mov(Reg::X2, regs::FRAME, true);
    a.ldr64(regs::SCRATCH, regs::CTX, ctx::CTX_HELPERS as u32);
    a.ldr64(regs::SCRATCH, regs::SCRATCH, HelperIndex::HostCall as u32 * 8);
    a.blr(regs::SCRATCH);

    let ok = a.cbz(Reg::X0, 0, true);
    a.cmp_imm(Reg::X0, ctx::HELPER_EXIT as u16, true);
    let not_exit = a.b_cond(Cond::Ne, 0);
    a.movz(regs::SCRATCH, ctx::STATUS_EXIT as u16, 0, true);
    a.str64(regs::SCRATCH, regs::CTX, ctx::CTX_STATUS as u32);
    let to_unwind = a.b(0);
    let not_exit_target = a.offset();
    a.sub_imm(Reg::X0, Reg::X0, ctx::HELPER_TRAP_BASE as u16, true);
    a.str64(Reg::X0, regs::CTX, ctx::CTX_TRAP_KIND as u32);
    a.movz(regs::SCRATCH, 0, 0, true);
    a.sub_imm(regs::SCRATCH, regs::SCRATCH, 1, true);
    a.str64(regs::SCRATCH, regs::CTX, ctx::CTX_TRAP_SITE as u32);
    a.movz(regs::SCRATCH, ctx::STATUS_TRAP as u16, 0, true);
    a.str64(regs::SCRATCH, regs::CTX, ctx::CTX_STATUS as u32);
    let unwind_target = a.offset();
    a.ldr64(regs::SCRATCH, regs::CTX, ctx::CTX_HOST_SP as u32);
    a.mov_sp(Reg::Sp, regs::SCRATCH);
    a.ldp_post(Reg::X28, Reg::XZR, Reg::Sp, 16);
    a.ldp_post(Reg::X26, Reg::X27, Reg::Sp, 16);
    a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
    a.ret();

    let ok_target = a.offset();
    drop(a);
    for (slot, ty, loc) in assign_arg_regs(&sig.results) {
        let mut a = A64Assembler::new(&mut buf);
        match loc {
            ArgLoc::Gp(r) => a.ldr64(r, regs::FRAME, slot * 8),
            ArgLoc::Fp(x) => {
                if ty == ValType::F64 {
                    a.ldr_d(x, regs::FRAME, slot * 8)
                } else {
                    a.ldr_s(x, regs::FRAME, slot * 8)
                }
            }
            ArgLoc::Stack => {}
        }
    }
    let mut a = A64Assembler::new(&mut buf);
    a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
    a.ret();
    drop(a);

    // Patch the imm19/imm26 forward references.
    let patch19 = |buf: &mut CodeBuffer, site: usize, target: usize| {
        let disp = (target as i64 - site as i64) as i32;
        let word = buf.read_u32(site);
        let imm19 = ((disp / 4) as u32) & 0x7FFFF;
        buf.patch_u32(site, (word & !(0x7FFFF << 5)) | (imm19 << 5));
    };
    patch19(&mut buf, ok, ok_target);
    patch19(&mut buf, not_exit, not_exit_target);
    let word = buf.read_u32(to_unwind);
    let disp = unwind_target as i64 - to_unwind as i64;
    buf.patch_u32(to_unwind, super::reloc::a64_patch_branch26(word, disp));
    buf.into_code()
}

/// The segment-level unwind stub used by the signal path.
pub fn emit_segment_exit_stub() -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = A64Assembler::new(&mut buf);
    a.ldr64(regs::SCRATCH, regs::CTX, ctx::CTX_HOST_SP as u32);
    a.mov_sp(Reg::Sp, regs::SCRATCH);
    a.ldp_post(Reg::X28, Reg::XZR, Reg::Sp, 16);
    a.ldp_post(Reg::X26, Reg::X27, Reg::Sp, 16);
    a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
    a.ret();
    buf.into_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_arg_regs() {
        let args = assign_arg_regs(&[ValType::I32, ValType::F64, ValType::V128, ValType::I64]);
        assert_eq!(args[0], (0, ValType::I32, ArgLoc::Gp(Reg::X0)));
        assert_eq!(args[1], (1, ValType::F64, ArgLoc::Fp(0)));
        assert_eq!(args[2], (2, ValType::V128, ArgLoc::Stack));
        assert_eq!(args[3], (4, ValType::I64, ArgLoc::Gp(Reg::X1)));
    }

    #[test]
    fn test_entry_trampoline_shape() {
        let sig = FuncType::new(vec![ValType::I32], vec![ValType::I32]);
        let code = emit_entry_trampoline(&sig);
        assert_eq!(code.len() % 4, 0);
        // Ends with RET.
        let last = u32::from_le_bytes([
            code[code.len() - 4],
            code[code.len() - 3],
            code[code.len() - 2],
            code[code.len() - 1],
        ]);
        assert_eq!(last, 0xD65F03C0);
    }

    #[test]
    fn test_exit_stub_is_position_independent() {
        let code = emit_segment_exit_stub();
        assert_eq!(code.len() % 4, 0);
        // No PC-relative branches besides the final RET.
        let last = u32::from_le_bytes([
            code[code.len() - 4],
            code[code.len() - 3],
            code[code.len() - 2],
            code[code.len() - 1],
        ]);
        assert_eq!(last, 0xD65F03C0);
    }
}
