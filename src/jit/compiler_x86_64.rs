//! IR → x86-64 machine code.
//!
//! One pass per function. Operand values are tracked on a value-location
//! stack: register, constant, condition flag, or their canonical guest
//! stack slot. Registers come from a fixed pool with least-recently-used
//! spilling; at every label and before every branch all live values are
//! flushed to their slots, so no register state crosses a control-flow
//! edge.

use super::codebuf::CodeBuffer;
use super::reloc::Reloc;
use super::valstack::{ValueLoc, ValueStack};
use super::x86_64::{Cond, Mem, Reg, X64Assembler};
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
/// - R14: context pointer (callee-saved)
/// - R13: guest frame base (callee-saved)
/// - R12: linear memory base (callee-saved)
/// - RAX/RCX/RDX/R11: fixed temporaries outside the pool
pub mod regs {
    use super::Reg;

    pub const CTX: Reg = Reg::R14;
    pub const FRAME: Reg = Reg::R13;
    pub const MEM: Reg = Reg::R12;
    pub const SCRATCH: Reg = Reg::R11;

    /// Allocatable pool.
    pub const GP_POOL: [Reg; 7] = [
        Reg::Rbx,
        Reg::R15,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
    ];

    /// Guest integer argument registers, in order.
    pub const GP_ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

    /// Number of float argument registers (xmm0..).
    pub const FP_ARGS: u8 = 8;

    /// Allocatable float/vector registers xmm0..xmm7.
    pub const FP_POOL: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

    /// Float scratch register.
    pub const FP_SCRATCH: u8 = 8;
}

/// Key of the synthetic function-local unwind label.
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
    /// Label id → bound code offset.
    labels: HashMap<u64, usize>,
    /// (rel32 field offset, label id) pending patches.
    label_refs: Vec<(usize, u64)>,
    relocs: Vec<Reloc>,
    trap_positions: Vec<u64>,
    pc_traps: Vec<(usize, u64)>,
    reachable: bool,
    num_call_sites: usize,
}

/// Compile one lowered function to x86-64 code.
pub fn compile_function(
    env: &CompileEnv,
    func: &LoweredFunction,
) -> Result<CompiledFunc, CompileError> {
    let mut c = Compiler {
        buf: CodeBuffer::with_capacity(func.ops.len() * 16 + 64),
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
    fn asm(&mut self) -> X64Assembler {
        X64Assembler::new(&mut self.buf)
    }

    fn slot_mem(slot: u32) -> Mem {
        Mem::base(regs::FRAME, slot as i32 * 8)
    }

    fn ctx_mem(off: i32) -> Mem {
        Mem::base(regs::CTX, off)
    }

    // ==================== prologue / epilogue ====================

    fn emit_prologue(&mut self) {
        let sig = self.env.module.types[self.func.type_idx as usize].clone();
        let ceiling = self.func.max_height.max(self.func.nlocals_slots);
        let params = assign_arg_regs(&sig.params);
        let param_slots: u32 = sig.params.iter().map(|t| t.slot_count()).sum();
        let nlocals = self.func.nlocals_slots;

        let mut a = self.asm();
        a.push(Reg::Rbp);
        // Guest stack ceiling check.
        a.lea(Reg::Rax, Mem::base(regs::FRAME, ceiling as i32 * 8));
        a.cmp_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_STACK_LIMIT));
        drop(a);
        self.trap_if(Cond::A, TrapKind::CallStackExhausted, 0);

        // Call depth check.
        let mut a = self.asm();
        a.mov_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_CALL_DEPTH));
        a.add_ri(Reg::Rax, 1, true);
        a.cmp_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_CALL_DEPTH_LIMIT));
        drop(a);
        self.trap_if(Cond::A, TrapKind::CallStackExhausted, 0);
        let mut a = self.asm();
        a.mov_mr(Self::ctx_mem(ctx::CTX_CALL_DEPTH), Reg::Rax);

        // Park register-class arguments in their local slots.
        for (slot, ty, loc) in &params {
            match loc {
                ArgLoc::Gp(r) => a.mov_mr(Self::slot_mem(*slot), *r),
                ArgLoc::Fp(x) => a.movs_mx(Self::slot_mem(*slot), *x, *ty == ValType::F64),
                ArgLoc::Stack => {}
            }
        }

        // Zero the declared locals.
        let zero_from = param_slots;
        let zero_count = nlocals - param_slots;
        if zero_count > 0 {
            a.xor_rr(Reg::Rax, Reg::Rax, true);
            if zero_count <= 16 {
                for i in 0..zero_count {
                    a.mov_mr(Self::slot_mem(zero_from + i), Reg::Rax);
                }
            } else {
                a.lea(regs::SCRATCH, Self::slot_mem(zero_from));
                a.mov_r32_i32(Reg::Rcx, zero_count);
                let loop_top = a.offset();
                a.mov_mr(Mem::base(regs::SCRATCH, 0), Reg::Rax);
                a.add_ri(regs::SCRATCH, 8, true);
                a.sub_ri(Reg::Rcx, 1, false);
                let site = a.jcc_rel32(Cond::Ne, 0);
                drop(a);
                let disp = loop_top as i64 - (site as i64 + 4);
                self.buf.patch_u32(site, disp as u32);
            }
        }
    }

    /// The function epilogue at the Return label: results move to the
    /// frame base, register-class results are mirror-loaded, and the
    /// call depth is released.
    fn emit_epilogue(&mut self) {
        let sig = self.env.module.types[self.func.type_idx as usize].clone();
        let results = assign_arg_regs(&sig.results);
        let result_slots: u32 = sig.results.iter().map(|t| t.slot_count()).sum();
        let nlocals = self.func.nlocals_slots;

        let mut a = self.asm();
        if nlocals > 0 {
            for i in 0..result_slots {
                a.mov_rm(Reg::Rax, Self::slot_mem(nlocals + i));
                a.mov_mr(Self::slot_mem(i), Reg::Rax);
            }
        }
        for (slot, ty, loc) in &results {
            match loc {
                ArgLoc::Gp(r) => a.mov_rm(*r, Self::slot_mem(*slot)),
                ArgLoc::Fp(x) => a.movs_xm(*x, Self::slot_mem(*slot), *ty == ValType::F64),
                ArgLoc::Stack => {}
            }
        }
        a.mov_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_CALL_DEPTH));
        a.add_ri(Reg::Rax, -1, true);
        a.mov_mr(Self::ctx_mem(ctx::CTX_CALL_DEPTH), Reg::Rax);
        a.pop(Reg::Rbp);
        a.ret();
    }

    /// The unwind path shared by every trap and exit site in this
    /// function: restore the host stack and return to the invoker.
    fn emit_exit_restore(&mut self) {
        let at = self.buf.offset();
        self.labels.insert(EXIT_RESTORE_KEY, at);
        let mut a = self.asm();
        a.mov_rm(Reg::Rsp, Self::ctx_mem(ctx::CTX_HOST_SP));
        a.add_ri(Reg::Rsp, 8, true);
        a.pop(Reg::R15);
        a.pop(Reg::R14);
        a.pop(Reg::R13);
        a.pop(Reg::R12);
        a.pop(Reg::Rbp);
        a.pop(Reg::Rbx);
        a.ret();
    }

    // ==================== labels & patches ====================

    fn jump_to(&mut self, label: u64) {
        let site = self.asm().jmp_rel32(0);
        self.label_refs.push((site, label));
    }

    fn bind_forward(&mut self, site: usize) {
        let target = self.buf.offset();
        let disp = target as i64 - (site as i64 + 4);
        self.buf.patch_u32(site, disp as u32);
    }

    fn patch_label_refs(&mut self) -> Result<(), CompileError> {
        for (site, label) in std::mem::take(&mut self.label_refs) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| CompileError::Internal(format!("unbound label {label:#x}")))?;
            let disp = target as i64 - (site as i64 + 4);
            self.buf.patch_u32(site, disp as u32);
        }
        Ok(())
    }

    // ==================== traps ====================

    fn new_trap_site(&mut self, pos: u64) -> u32 {
        let id = self.env.site_base + self.trap_positions.len() as u32;
        self.trap_positions.push(pos);
        id
    }

    /// Unconditional trap: record the site, set the context fields, and
    /// unwind.
    fn trap_now(&mut self, kind: TrapKind, pos: u64) {
        let site = self.new_trap_site(pos);
        let mut a = self.asm();
        a.mov_mi64(Self::ctx_mem(ctx::CTX_TRAP_KIND), kind as i32);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_TRAP_SITE), site as i32);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_STATUS), ctx::STATUS_TRAP as i32);
        drop(a);
        self.jump_to(EXIT_RESTORE_KEY);
    }

    /// Trap when `cond` holds, continuing otherwise.
    fn trap_if(&mut self, cond: Cond, kind: TrapKind, pos: u64) {
        let skip = self.asm().jcc_rel32(cond.invert(), 0);
        self.trap_now(kind, pos);
        self.bind_forward(skip);
    }

    // ==================== register discipline ====================

    /// Spill one entry to its canonical slot.
    fn spill_entry(&mut self, idx: usize) {
        let entry = self.vs.get(idx).clone();
        let slot = self.vs.slot_of(idx);
        match entry.loc {
            ValueLoc::Reg(r) => {
                let r = Reg::from_code(r);
                self.asm().mov_mr(Self::slot_mem(slot), r);
            }
            ValueLoc::FReg(x) => match entry.ty {
                RuntimeType::F32 => self.asm().movs_mx(Self::slot_mem(slot), x, false),
                RuntimeType::V128Hi => {
                    let lo = slot - 1;
                    self.asm().movups_mx(Self::slot_mem(lo), x);
                }
                _ => self.asm().movs_mx(Self::slot_mem(slot), x, true),
            },
            ValueLoc::Const(cv) => {
                let mut a = self.asm();
                if cv <= i32::MAX as u64 {
                    a.mov_mi64(Self::slot_mem(slot), cv as i32);
                } else {
                    a.mov_ri(Reg::Rax, cv);
                    a.mov_mr(Self::slot_mem(slot), Reg::Rax);
                }
            }
            ValueLoc::CondFlag(cc) => {
                let mut a = self.asm();
                a.setcc(cond_from(cc), Reg::Rax);
                a.movzx_rr8(Reg::Rax, Reg::Rax);
                a.mov_mr(Self::slot_mem(slot), Reg::Rax);
            }
            ValueLoc::Stack | ValueLoc::VecLo => {}
        }
        let was_vec_reg =
            entry.ty == RuntimeType::V128Hi && matches!(entry.loc, ValueLoc::FReg(_));
        self.vs.set_loc(idx, ValueLoc::Stack);
        if was_vec_reg {
            // The Lo mate below becomes memory-resident too.
            self.vs.set_loc(idx - 1, ValueLoc::Stack);
        }
    }

    /// Flush every live value to the guest stack.
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

    /// Make sure entry `idx` lives in a pool GP register and return it.
    fn ensure_gp(&mut self, idx: usize) -> Reg {
        match self.vs.get(idx).loc {
            ValueLoc::Reg(r) => {
                self.vs.touch(idx);
                Reg::from_code(r)
            }
            ValueLoc::Const(cv) => {
                let r = self.alloc_gp();
                self.asm().mov_ri(r, cv);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::Stack => {
                let r = self.alloc_gp();
                let slot = self.vs.slot_of(idx);
                self.asm().mov_rm(r, Self::slot_mem(slot));
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::FReg(x) => {
                let r = self.alloc_gp();
                self.asm().movq_rx(r, x);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::CondFlag(cc) => {
                let r = self.alloc_gp();
                let mut a = self.asm();
                a.setcc(cond_from(cc), r);
                a.movzx_rr8(r, r);
                drop(a);
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
                r
            }
            ValueLoc::VecLo => unreachable!("vector halves are handled pairwise"),
        }
    }

    /// Make sure entry `idx` lives in a float register.
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
                self.asm().movs_xm(x, Self::slot_mem(slot), double);
                self.vs.set_loc(idx, ValueLoc::FReg(x));
                self.vs.get_mut(idx).ty = new_ty;
                x
            }
            ValueLoc::Reg(r) => {
                let x = self.alloc_fp();
                self.asm().movq_xr(x, Reg::from_code(r));
                self.vs.set_loc(idx, ValueLoc::FReg(x));
                self.vs.get_mut(idx).ty = new_ty;
                x
            }
            ValueLoc::Const(cv) => {
                let x = self.alloc_fp();
                let mut a = self.asm();
                a.mov_ri(Reg::Rax, cv);
                a.movq_xr(x, Reg::Rax);
                drop(a);
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

    /// Materialize the top-of-stack value into RAX without allocating a
    /// pool register (for one-shot uses like stores).
    fn top_to_rax(&mut self) {
        let idx = self.vs.len() - 1;
        let slot = self.vs.slot_of(idx);
        match self.vs.get(idx).loc {
            ValueLoc::Reg(r) => self.asm().mov_rr(Reg::Rax, Reg::from_code(r)),
            ValueLoc::Const(cv) => self.asm().mov_ri(Reg::Rax, cv),
            ValueLoc::Stack => self.asm().mov_rm(Reg::Rax, Self::slot_mem(slot)),
            ValueLoc::FReg(x) => self.asm().movq_rx(Reg::Rax, x),
            ValueLoc::CondFlag(cc) => {
                let mut a = self.asm();
                a.setcc(cond_from(cc), Reg::Rax);
                a.movzx_rr8(Reg::Rax, Reg::Rax);
            }
            ValueLoc::VecLo => unreachable!(),
        }
    }

    /// Materialize every pending condition flag before an instruction
    /// that clobbers the flags. A flag entry can sit below pushed
    /// constants, so the whole stack is scanned.
    fn protect_flags(&mut self) {
        for idx in 0..self.vs.len() {
            if matches!(self.vs.get(idx).loc, ValueLoc::CondFlag(_)) {
                self.ensure_gp(idx);
            }
        }
    }

    // ==================== drops & branches ====================

    /// Emit the runtime slot moves for a drop range and update the
    /// tracked stack. All affected entries must be memory-resident.
    fn emit_drop_moves(&mut self, range: InclusiveRange) {
        if range.is_none() {
            return;
        }
        let keep = range.start as u32;
        let h = self.vs.height();
        let dst_base = h - 1 - range.end as u32;
        let src_base = h - keep;
        for i in 0..keep {
            let mut a = self.asm();
            a.mov_rm(Reg::Rax, Self::slot_mem(src_base + i));
            a.mov_mr(Self::slot_mem(dst_base + i), Reg::Rax);
        }
        self.vs.drop_range(range.start as u32, range.end as u32);
    }

    /// Emit the taken-edge code for one branch target: drops, then the
    /// jump. The tracked stack is rewound afterwards so sibling edges see
    /// the pre-branch state.
    fn emit_branch_edge(&mut self, label: u64, drop: InclusiveRange) {
        let saved_height = self.vs.height();
        self.emit_drop_moves(drop);
        self.jump_to(label);
        self.vs.reset_to_height(saved_height);
    }

    // ==================== helper calls ====================

    /// Load helper payload arguments. Sources must be memory slots or
    /// immediates; the stack must be flushed first.
    fn helper_args(&mut self, args: &[HelperArg]) {
        const PAYLOAD: [Reg; 4] = [Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8];
        for (i, arg) in args.iter().enumerate() {
            let dst = PAYLOAD[i];
            match arg {
                HelperArg::Slot(slot) => self.asm().mov_rm(dst, Self::slot_mem(*slot)),
                HelperArg::SlotAddr(slot) => self.asm().lea(dst, Self::slot_mem(*slot)),
                HelperArg::Imm(v) => self.asm().mov_ri(dst, *v),
            }
        }
    }

    /// Call a runtime helper. The value stack must already be flushed.
    /// If `pos` is Some the helper is fallible and its status word is
    /// checked.
    fn call_helper(&mut self, index: HelperIndex, args: &[HelperArg], pos: Option<u64>) {
        self.helper_args(args);
        let mut a = self.asm();
        a.mov_rr(Reg::Rdi, regs::CTX);
        a.mov_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_HELPERS));
        a.call_m(Mem::base(Reg::Rax, index as i32 * 8));
        drop(a);
        if let Some(pos) = pos {
            self.check_helper_status(pos);
        }
    }

    /// Branch on the helper status word in RAX: 0 continues, 1 exits,
    /// anything else is a trap kind + 2.
    fn check_helper_status(&mut self, pos: u64) {
        let mut a = self.asm();
        a.test_rr(Reg::Rax, Reg::Rax, true);
        let ok = a.jcc_rel32(Cond::E, 0);
        a.cmp_ri(Reg::Rax, ctx::HELPER_EXIT as i32, true);
        let not_exit = a.jcc_rel32(Cond::Ne, 0);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_STATUS), ctx::STATUS_EXIT as i32);
        drop(a);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_forward(not_exit);
        let site = self.new_trap_site(pos);
        let mut a = self.asm();
        a.add_ri(Reg::Rax, -(ctx::HELPER_TRAP_BASE as i32), true);
        a.mov_mr(Self::ctx_mem(ctx::CTX_TRAP_KIND), Reg::Rax);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_TRAP_SITE), site as i32);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_STATUS), ctx::STATUS_TRAP as i32);
        drop(a);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_forward(ok);
    }

    // ==================== operation dispatch ====================

    fn emit_op(&mut self, op: &Operation) -> Result<(), CompileError> {
        match op.kind {
            OpKind::Label => self.op_label(op),
            OpKind::Unreachable => {
                self.trap_now(TrapKind::Unreachable, op.pos);
                self.reachable = false;
            }
            OpKind::Br => self.op_br(op),
            OpKind::BrIf => self.op_br_if(op),
            OpKind::BrTable => self.op_br_table(op),
            OpKind::Call => self.op_call(op),
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
                self.asm().mov_rm32(r, Self::ctx_mem(ctx::CTX_MEMORY_PAGES));
                self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
            }
            OpKind::MemoryGrow => {
                self.flush_all();
                let delta = self.vs.slot_of(self.vs.len() - 1);
                self.vs.pop();
                self.call_helper(HelperIndex::MemoryGrow, &[HelperArg::Slot(delta)], None);
                let r = self.alloc_gp();
                self.asm().mov_rr(r, Reg::Rdx);
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
                self.asm().mov_rr(r, Reg::Rdx);
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
                let table_off = op.u1 as i32 * 16 + 8;
                let mut a = self.asm();
                a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_TABLES));
                a.mov_rm(r, Mem::base(regs::SCRATCH, table_off));
                drop(a);
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
                self.asm().mov_rr(r, Reg::Rdx);
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
            OpKind::Clz | OpKind::Ctz | OpKind::Popcnt => self.op_bitcount(op),
            OpKind::Abs | OpKind::Neg => self.op_float_sign(op),
            OpKind::Sqrt => {
                let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, double);
                self.asm().sqrts(x, x, double);
            }
            OpKind::Ceil | OpKind::Floor | OpKind::Trunc | OpKind::Nearest => {
                self.op_float_round(op)
            }
            OpKind::Min | OpKind::Max => self.op_float_min_max(op),
            OpKind::Copysign => self.op_float_copysign(op),
            OpKind::I32WrapI64 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                if let ValueLoc::Const(cv) = self.vs.get(idx).loc {
                    let e = self.vs.get_mut(idx);
                    e.loc = ValueLoc::Const(cv as u32 as u64);
                    e.ty = RuntimeType::I32;
                } else {
                    let r = self.ensure_gp(idx);
                    self.asm().mov_rr32(r, r);
                    self.vs.get_mut(idx).ty = RuntimeType::I32;
                }
            }
            OpKind::I64ExtendI32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                if op.b3 {
                    self.asm().movsxd(r, r);
                } else {
                    self.asm().mov_rr32(r, r);
                }
                self.vs.get_mut(idx).ty = RuntimeType::I64;
            }
            OpKind::SignExtend32From8 | OpKind::SignExtend64From8 => {
                self.protect_flags();
                let w = op.kind == OpKind::SignExtend64From8;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().movsx_rr8(r, r, w);
            }
            OpKind::SignExtend32From16 | OpKind::SignExtend64From16 => {
                self.protect_flags();
                let w = op.kind == OpKind::SignExtend64From16;
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().movsx_rr16(r, r, w);
            }
            OpKind::SignExtend64From32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let r = self.ensure_gp(idx);
                self.asm().movsxd(r, r);
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
                self.asm().mov_rr(r, Reg::Rdx);
                self.vs.push(
                    if to64 {
                        RuntimeType::I64
                    } else {
                        RuntimeType::I32
                    },
                    ValueLoc::Reg(r as u8),
                );
            }
            OpKind::FConvertI => self.op_convert_int(op),
            OpKind::F32DemoteF64 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, true);
                self.asm().cvtsd2ss(x, x);
                self.vs.get_mut(idx).ty = RuntimeType::F32;
            }
            OpKind::F64PromoteF32 => {
                self.protect_flags();
                let idx = self.vs.len() - 1;
                let x = self.ensure_fp(idx, false);
                self.asm().cvtss2sd(x, x);
                self.vs.get_mut(idx).ty = RuntimeType::F64;
            }
            OpKind::I32ReinterpretF32 | OpKind::I64ReinterpretF64 => {
                self.op_reinterpret_to_int(op)
            }
            OpKind::F32ReinterpretI32 | OpKind::F64ReinterpretI64 => {
                self.op_reinterpret_to_float(op)
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

    fn op_br(&mut self, op: &Operation) {
        self.flush_all();
        let (label, drop) = op.target(0);
        self.emit_drop_moves(drop);
        self.jump_to(label.0);
        self.reachable = false;
    }

    fn op_br_if(&mut self, op: &Operation) {
        let (then_l, then_d) = op.target(0);
        let (else_l, else_d) = op.target(1);

        // The condition comes off first; the drop ranges were computed by
        // the lowering with it already popped.
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
                let site = self.asm().jcc_rel32(cond_from(cc), 0);
                self.emit_branch_edge(else_l.0, else_d);
                self.bind_forward(site);
                self.emit_branch_edge(then_l.0, then_d);
            }
            _ => {
                let r = self.ensure_gp(cond_idx);
                self.vs.pop();
                self.flush_all();
                self.asm().test_rr(r, r, false);
                let site = self.asm().jcc_rel32(Cond::Ne, 0);
                self.emit_branch_edge(else_l.0, else_d);
                self.bind_forward(site);
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
            self.asm().cmp_ri(r, i as i32, false);
            let site = self.asm().jcc_rel32(Cond::E, 0);
            sites.push(site);
        }
        // Fallthrough: the default target.
        let (dl, dd) = op.target(n);
        self.emit_branch_edge(dl.0, dd);
        for (i, site) in sites.into_iter().enumerate() {
            self.bind_forward(site);
            let (label, drop) = op.target(i);
            self.emit_branch_edge(label.0, drop);
        }
        self.reachable = false;
    }

    fn op_call(&mut self, op: &Operation) {
        let func_idx = op.u1 as u32;
        let sig = self.env.module.func_type(func_idx).clone();
        self.flush_all();
        self.emit_call_sequence(&sig, CallTarget::Direct(func_idx));
    }

    fn op_call_indirect(&mut self, op: &Operation) {
        let type_idx = op.u1 as usize;
        let table_idx = op.u2 as i32;
        let sig = self.env.module.types[type_idx].clone();
        let type_id = self.env.type_ids[type_idx];

        let idx_entry = self.vs.len() - 1;
        let ri = self.ensure_gp(idx_entry);
        self.vs.pop();
        self.flush_all();

        // Bounds check against the table length.
        let mut a = self.asm();
        a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_TABLES));
        a.mov_rm(Reg::Rax, Mem::base(regs::SCRATCH, table_idx * 16 + 8));
        a.cmp_rr(ri, Reg::Rax, true);
        drop(a);
        self.trap_if(Cond::Ae, TrapKind::UndefinedElement, op.pos);

        // Fetch the reference and null-check it.
        let mut a = self.asm();
        a.mov_rm(Reg::Rax, Mem::base(regs::SCRATCH, table_idx * 16));
        a.mov_rm(Reg::Rax, Mem::index(Reg::Rax, ri, 3, 0));
        a.test_rr(Reg::Rax, Reg::Rax, true);
        drop(a);
        self.trap_if(Cond::E, TrapKind::UninitializedElement, op.pos);

        // Type-id equality against the interned expectation.
        let mut a = self.asm();
        a.add_ri(Reg::Rax, -1, true);
        a.mov_rm(Reg::Rcx, Self::ctx_mem(ctx::CTX_FUNC_TYPES));
        a.mov_rm(Reg::Rcx, Mem::index(Reg::Rcx, Reg::Rax, 3, 0));
        a.cmp_ri(Reg::Rcx, type_id as i32, true);
        drop(a);
        self.trap_if(Cond::Ne, TrapKind::IndirectCallTypeMismatch, op.pos);

        let mut a = self.asm();
        a.mov_rm(Reg::Rcx, Self::ctx_mem(ctx::CTX_FUNC_ENTRIES));
        a.mov_rm(regs::SCRATCH, Mem::index(Reg::Rcx, Reg::Rax, 3, 0));
        drop(a);
        self.emit_call_sequence(&sig, CallTarget::Register(regs::SCRATCH));
    }

    /// Argument setup, the call itself, the post-call exit check, and
    /// result placement. Expects the stack flushed with the arguments on
    /// top.
    fn emit_call_sequence(&mut self, sig: &FuncType, target: CallTarget) {
        let nargs: u32 = sig.params.iter().map(|t| t.slot_count()).sum();
        let h = self.vs.height();
        let callee_base = h - nargs;

        for (slot, ty, loc) in assign_arg_regs(&sig.params) {
            match loc {
                ArgLoc::Gp(r) => self.asm().mov_rm(r, Self::slot_mem(callee_base + slot)),
                ArgLoc::Fp(x) => {
                    self.asm()
                        .movs_xm(x, Self::slot_mem(callee_base + slot), ty == ValType::F64)
                }
                ArgLoc::Stack => {}
            }
        }

        let mut a = self.asm();
        a.add_ri(regs::FRAME, callee_base as i32 * 8, true);
        match target {
            CallTarget::Direct(func_idx) => {
                let site = a.call_rel32(0);
                drop(a);
                self.relocs.push(Reloc {
                    site,
                    callee: func_idx,
                });
                self.num_call_sites += 1;
            }
            CallTarget::Register(r) => {
                a.call_r(r);
                drop(a);
            }
        }
        let mut a = self.asm();
        a.sub_ri(regs::FRAME, callee_base as i32 * 8, true);

        // Cooperative cancellation: unwind when the engine's exit cell is
        // set.
        a.mov_rm(Reg::Rax, Self::ctx_mem(ctx::CTX_EXIT_CODE));
        a.cmp_mi8(Mem::base(Reg::Rax, 0), 0);
        let skip = a.jcc_rel32(Cond::E, 0);
        a.mov_mi64(Self::ctx_mem(ctx::CTX_STATUS), ctx::STATUS_EXIT as i32);
        drop(a);
        self.jump_to(EXIT_RESTORE_KEY);
        self.bind_forward(skip);

        // Pop arguments, push results. Register-class results arrive in
        // the mirror registers and are also parked in the frame slots by
        // the callee's epilogue.
        for _ in 0..nargs {
            self.vs.pop();
        }
        for (_, ty, loc) in assign_arg_regs(&sig.results) {
            match (ty, loc) {
                (ValType::V128, _) => {
                    self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
                    self.vs.push(RuntimeType::V128Hi, ValueLoc::Stack);
                }
                (_, ArgLoc::Gp(r)) if regs::GP_POOL.contains(&r) => {
                    let rt = match ty {
                        ValType::I32 => RuntimeType::I32,
                        _ => RuntimeType::I64,
                    };
                    self.vs.push(rt, ValueLoc::Reg(r as u8));
                }
                (ValType::F32, ArgLoc::Fp(x)) => {
                    self.vs.push(RuntimeType::F32, ValueLoc::FReg(x));
                }
                (ValType::F64, ArgLoc::Fp(x)) => {
                    self.vs.push(RuntimeType::F64, ValueLoc::FReg(x));
                }
                (ty, _) => {
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
            // Nothing kept above: purely compile-time.
            self.vs.drop_range(range.start as u32, range.end as u32);
            return;
        }
        // Kept entries that are register- or constant-resident move for
        // free; memory-resident ones need slot copies.
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
            let mut a = self.asm();
            a.mov_rm(Reg::Rax, Self::slot_mem(src_base + i));
            a.mov_mr(Self::slot_mem(dst_base + i), Reg::Rax);
        }
        self.vs.drop_range(range.start as u32, range.end as u32);
    }

    fn op_select(&mut self, op: &Operation) {
        self.protect_flags();
        if op.b3 {
            // Vector select goes through memory.
            self.flush_all();
            let cond_slot = self.vs.slot_of(self.vs.len() - 1);
            let v2_lo = self.vs.slot_of(self.vs.len() - 3);
            let v1_lo = self.vs.slot_of(self.vs.len() - 5);
            let mut a = self.asm();
            a.mov_rm32(Reg::Rax, Self::slot_mem(cond_slot));
            a.test_rr(Reg::Rax, Reg::Rax, false);
            let keep = a.jcc_rel32(Cond::Ne, 0);
            a.movups_xm(regs::FP_SCRATCH, Self::slot_mem(v2_lo));
            a.movups_mx(Self::slot_mem(v1_lo), regs::FP_SCRATCH);
            drop(a);
            self.bind_forward(keep);
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
        a.test_rr(rc, rc, false);
        a.cmovcc(Cond::E, r1, r2, true);
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
            // Vector pick: src_slot addresses the Lo half.
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
                self.asm().movaps_rr(x, sx);
            } else {
                self.asm().movups_xm(x, Self::slot_mem(src_slot));
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
                        self.asm().mov_rr(r, Reg::from_code(sr));
                        self.vs.push(src.ty, ValueLoc::Reg(r as u8));
                    }
                    ValueLoc::FReg(sx) => {
                        self.vs.touch(src_idx);
                        let x = self.alloc_fp();
                        self.asm().movaps_rr(x, sx);
                        self.vs.push(src.ty, ValueLoc::FReg(x));
                    }
                    ValueLoc::Stack => {
                        let r = self.alloc_gp();
                        self.asm().mov_rm(r, Self::slot_mem(src_slot));
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
                // A local: always memory-resident.
                let r = self.alloc_gp();
                self.asm().mov_rm(r, Self::slot_mem(src_slot));
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
            // Vector set: target addresses the Lo half of the destination.
            let hi_idx = self.vs.len() - 1;
            if let ValueLoc::FReg(x) = self.vs.get(hi_idx).loc {
                self.asm().movups_mx(Self::slot_mem(target), x);
            } else {
                self.flush_entry_pair(hi_idx);
                let src_lo = self.vs.slot_of(hi_idx) - 1;
                let mut a = self.asm();
                a.movups_xm(regs::FP_SCRATCH, Self::slot_mem(src_lo));
                a.movups_mx(Self::slot_mem(target), regs::FP_SCRATCH);
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
            ValueLoc::Reg(r) => {
                self.asm().mov_mr(Self::slot_mem(target), Reg::from_code(r));
            }
            ValueLoc::FReg(x) => {
                let double = val.ty != RuntimeType::F32;
                self.asm().movs_mx(Self::slot_mem(target), x, double);
            }
            _ => {
                self.top_to_rax();
                self.asm().mov_mr(Self::slot_mem(target), Reg::Rax);
            }
        }
        self.vs.pop();
        self.invalidate_slot(target);
    }

    /// After writing a slot directly, any operand entry still claiming it
    /// must fall back to memory residency.
    fn invalidate_slot(&mut self, slot: u32) {
        if let Some(idx) = self.vs.entry_of_slot(slot) {
            if idx < self.vs.len() {
                self.vs.set_loc(idx, ValueLoc::Stack);
            }
        }
    }

    /// Flush just one vector pair (by its Hi entry index).
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
        let off = self.env.global_slots[op.u1 as usize] as i32 * 8;
        match global.ty.val {
            ValType::F32 | ValType::F64 => {
                let x = self.alloc_fp();
                let double = global.ty.val == ValType::F64;
                let mut a = self.asm();
                a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                a.movs_xm(x, Mem::base(regs::SCRATCH, off), double);
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
                let mut a = self.asm();
                a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                a.movups_xm(x, Mem::base(regs::SCRATCH, off));
                drop(a);
                self.vs.push(RuntimeType::V128Lo, ValueLoc::VecLo);
                self.vs.push(RuntimeType::V128Hi, ValueLoc::FReg(x));
            }
            ty => {
                let r = self.alloc_gp();
                let mut a = self.asm();
                a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                if ty == ValType::I32 {
                    a.mov_rm32(r, Mem::base(regs::SCRATCH, off));
                } else {
                    a.mov_rm(r, Mem::base(regs::SCRATCH, off));
                }
                drop(a);
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
        let off = self.env.global_slots[op.u1 as usize] as i32 * 8;
        match global.ty.val {
            ValType::V128 => {
                let hi_idx = self.vs.len() - 1;
                if let ValueLoc::FReg(x) = self.vs.get(hi_idx).loc {
                    let mut a = self.asm();
                    a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                    a.movups_mx(Mem::base(regs::SCRATCH, off), x);
                } else {
                    self.flush_entry_pair(hi_idx);
                    let lo = self.vs.slot_of(hi_idx) - 1;
                    let mut a = self.asm();
                    a.movups_xm(regs::FP_SCRATCH, Self::slot_mem(lo));
                    a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                    a.movups_mx(Mem::base(regs::SCRATCH, off), regs::FP_SCRATCH);
                }
                self.vs.pop();
                self.vs.pop();
            }
            _ => {
                self.top_to_rax();
                let mut a = self.asm();
                a.mov_rm(regs::SCRATCH, Self::ctx_mem(ctx::CTX_GLOBALS));
                a.mov_mr(Mem::base(regs::SCRATCH, off), Reg::Rax);
                drop(a);
                self.vs.pop();
            }
        }
    }

    /// Effective-address operand for a memory access with the index value
    /// in `ri`.
    fn mem_operand(&mut self, ri: Reg, offset: u32) -> Mem {
        if offset <= i32::MAX as u32 {
            Mem::index(regs::MEM, ri, 0, offset as i32)
        } else {
            let mut a = self.asm();
            a.mov_r32_i32(regs::SCRATCH, offset);
            a.add_rr(regs::SCRATCH, ri, true);
            drop(a);
            Mem::index(regs::MEM, regs::SCRATCH, 0, 0)
        }
    }

    fn op_load(&mut self, op: &Operation) {
        self.protect_flags();
        let arg = op.mem_arg();
        let ty = RuntimeType::from_u8(op.b1);
        let idx = self.vs.len() - 1;
        let ri = self.ensure_gp(idx);
        self.vs.touch(idx);
        let mem = self.mem_operand(ri, arg.offset);

        let float = ty.is_float();
        let result = if float { None } else { Some(self.alloc_gp()) };
        let fresult = if float { Some(self.alloc_fp()) } else { None };

        self.pc_traps.push((self.buf.offset(), op.pos));
        let mut a = self.asm();
        match (op.kind, ty, op.b3) {
            (OpKind::Load, RuntimeType::I32, _) => a.mov_rm32(result.unwrap(), mem),
            (OpKind::Load, RuntimeType::I64, _) => a.mov_rm(result.unwrap(), mem),
            (OpKind::Load, RuntimeType::F32, _) => a.movs_xm(fresult.unwrap(), mem, false),
            (OpKind::Load, RuntimeType::F64, _) => a.movs_xm(fresult.unwrap(), mem, true),
            (OpKind::Load8, _, true) => a.movsx_rm8(result.unwrap(), mem, ty == RuntimeType::I64),
            (OpKind::Load8, _, false) => a.movzx_rm8(result.unwrap(), mem),
            (OpKind::Load16, _, true) => {
                a.movsx_rm16(result.unwrap(), mem, ty == RuntimeType::I64)
            }
            (OpKind::Load16, _, false) => a.movzx_rm16(result.unwrap(), mem),
            (OpKind::Load32, _, true) => a.movsxd_rm(result.unwrap(), mem),
            (OpKind::Load32, _, false) => a.mov_rm32(result.unwrap(), mem),
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

        // Value on top, index below it.
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
        let mem = self.mem_operand(ri, arg.offset);

        self.pc_traps.push((self.buf.offset(), op.pos));
        let mut a = self.asm();
        match (op.kind, ty) {
            (OpKind::Store, RuntimeType::I32) => a.mov_mr32(mem, vr.unwrap()),
            (OpKind::Store, RuntimeType::I64) => a.mov_mr(mem, vr.unwrap()),
            (OpKind::Store, RuntimeType::F32) => a.movs_mx(mem, vx.unwrap(), false),
            (OpKind::Store, RuntimeType::F64) => a.movs_mx(mem, vx.unwrap(), true),
            (OpKind::Store8, _) => a.mov_mr8(mem, vr.unwrap()),
            (OpKind::Store16, _) => a.mov_mr16(mem, vr.unwrap()),
            (OpKind::Store32, _) => a.mov_mr32(mem, vr.unwrap()),
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
            // eqz of a pending comparison is just the inverted condition.
            let inv = cond_from(cc).invert() as u8;
            self.vs.pop();
            self.vs.push(RuntimeType::I32, ValueLoc::CondFlag(inv));
            return;
        }
        self.protect_flags();
        let r = self.ensure_gp(idx);
        self.asm().test_rr(r, r, w);
        self.vs.pop();
        self.vs
            .push(RuntimeType::I32, ValueLoc::CondFlag(Cond::E as u8));
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
            match op.kind {
                OpKind::Eq | OpKind::Ne => {
                    // ZF alone cannot express unordered; combine with PF.
                    let mut a = self.asm();
                    a.ucomis(xa, xb, double);
                    if op.kind == OpKind::Eq {
                        a.setcc(Cond::E, Reg::Rax);
                        a.setcc(Cond::Np, Reg::Rcx);
                        a.and_rr8(Reg::Rax, Reg::Rcx);
                    } else {
                        a.setcc(Cond::Ne, Reg::Rax);
                        a.setcc(Cond::P, Reg::Rcx);
                        a.or_rr8(Reg::Rax, Reg::Rcx);
                    }
                    a.movzx_rr8(Reg::Rax, Reg::Rax);
                    drop(a);
                    self.vs.pop();
                    self.vs.pop();
                    let r = self.alloc_gp();
                    self.asm().mov_rr(r, Reg::Rax);
                    self.vs.push(RuntimeType::I32, ValueLoc::Reg(r as u8));
                }
                _ => {
                    // Operand order makes A/AE reject unordered inputs.
                    let (x, y, cc) = match op.kind {
                        OpKind::Lt => (xb, xa, Cond::A),
                        OpKind::Le => (xb, xa, Cond::Ae),
                        OpKind::Gt => (xa, xb, Cond::A),
                        _ => (xa, xb, Cond::Ae),
                    };
                    self.asm().ucomis(x, y, double);
                    self.vs.pop();
                    self.vs.pop();
                    self.vs.push(RuntimeType::I32, ValueLoc::CondFlag(cc as u8));
                }
            }
            return;
        }

        let w = ty == RuntimeType::I64;
        let signed = op.b3;
        let rb = self.ensure_gp(b_idx);
        self.vs.touch(b_idx);
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);
        self.asm().cmp_rr(ra, rb, w);
        let cc = match (op.kind, signed) {
            (OpKind::Eq, _) => Cond::E,
            (OpKind::Ne, _) => Cond::Ne,
            (OpKind::Lt, true) => Cond::L,
            (OpKind::Lt, false) => Cond::B,
            (OpKind::Gt, true) => Cond::G,
            (OpKind::Gt, false) => Cond::A,
            (OpKind::Le, true) => Cond::Le,
            (OpKind::Le, false) => Cond::Be,
            (OpKind::Ge, true) => Cond::Ge,
            _ => Cond::Ae,
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
                OpKind::Add => a.adds(xa, xb, double),
                OpKind::Sub => a.subs(xa, xb, double),
                OpKind::Mul => a.muls(xa, xb, double),
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

        // Absorb small immediates into the instruction.
        let b_imm = match self.vs.get(b_idx).loc {
            ValueLoc::Const(cv) if op.kind != OpKind::Mul && const_fits_i32(cv, w) => {
                Some(cv as i32)
            }
            _ => None,
        };
        let rb = if b_imm.is_none() {
            let r = self.ensure_gp(b_idx);
            self.vs.touch(b_idx);
            Some(r)
        } else {
            None
        };
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);

        let mut a = self.asm();
        match (op.kind, b_imm) {
            (OpKind::Add, Some(i)) => a.add_ri(ra, i, w),
            (OpKind::Add, None) => a.add_rr(ra, rb.unwrap(), w),
            (OpKind::Sub, Some(i)) => a.sub_ri(ra, i, w),
            (OpKind::Sub, None) => a.sub_rr(ra, rb.unwrap(), w),
            (OpKind::And, Some(i)) => a.and_ri(ra, i, w),
            (OpKind::And, None) => a.and_rr(ra, rb.unwrap(), w),
            (OpKind::Or, Some(i)) => a.or_ri(ra, i, w),
            (OpKind::Or, None) => a.or_rr(ra, rb.unwrap(), w),
            (OpKind::Xor, Some(i)) => a.xor_ri(ra, i, w),
            (OpKind::Xor, None) => a.xor_rr(ra, rb.unwrap(), w),
            (OpKind::Mul, _) => a.imul_rr(ra, rb.unwrap(), w),
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
            // Only float division reaches here.
            let double = ty == RuntimeType::F64;
            let b_idx = self.vs.len() - 1;
            let xb = self.ensure_fp(b_idx, double);
            self.vs.touch(b_idx);
            let a_idx = self.vs.len() - 2;
            let xa = self.ensure_fp(a_idx, double);
            self.asm().divs(xa, xb, double);
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

        // Dividend into RAX.
        match self.vs.get(a_idx).loc {
            ValueLoc::Reg(r) => self.asm().mov_rr(Reg::Rax, Reg::from_code(r)),
            ValueLoc::Const(cv) => self.asm().mov_ri(Reg::Rax, cv),
            ValueLoc::Stack => {
                let slot = self.vs.slot_of(a_idx);
                self.asm().mov_rm(Reg::Rax, Self::slot_mem(slot));
            }
            _ => {
                let r = self.ensure_gp(a_idx);
                self.asm().mov_rr(Reg::Rax, r);
            }
        }

        self.asm().test_rr(rb, rb, w);
        self.trap_if(Cond::E, TrapKind::IntegerDivideByZero, op.pos);

        let mut done_sites = Vec::new();
        if signed {
            // INT_MIN / -1 overflows; INT_MIN % -1 is 0.
            let mut a = self.asm();
            a.cmp_ri(rb, -1, w);
            let not_minus_one = a.jcc_rel32(Cond::Ne, 0);
            if w {
                a.mov_ri64(regs::SCRATCH, i64::MIN);
                a.cmp_rr(Reg::Rax, regs::SCRATCH, true);
            } else {
                a.cmp_ri(Reg::Rax, i32::MIN, false);
            }
            let no_overflow = a.jcc_rel32(Cond::Ne, 0);
            drop(a);
            if is_rem {
                let mut a = self.asm();
                a.xor_rr(Reg::Rdx, Reg::Rdx, true);
                let done = a.jmp_rel32(0);
                drop(a);
                done_sites.push(done);
            } else {
                self.trap_now(TrapKind::IntegerOverflow, op.pos);
            }
            self.bind_forward(not_minus_one);
            self.bind_forward(no_overflow);
            self.asm().cqo(w);
            self.asm().idiv(rb, w);
        } else {
            let mut a = self.asm();
            a.xor_rr(Reg::Rdx, Reg::Rdx, true);
            a.div(rb, w);
        }
        for site in done_sites {
            self.bind_forward(site);
        }

        self.vs.pop();
        self.vs.pop();
        let r = self.alloc_gp();
        let src = if is_rem { Reg::Rdx } else { Reg::Rax };
        if w {
            self.asm().mov_rr(r, src);
        } else {
            self.asm().mov_rr32(r, src);
        }
        self.vs.push(ty, ValueLoc::Reg(r as u8));
    }

    fn op_shift(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        let w = ty == RuntimeType::I64;
        self.protect_flags();

        let b_idx = self.vs.len() - 1;

        // Count into CL; the hardware masks it mod 32/64, matching Wasm.
        match self.vs.get(b_idx).loc {
            ValueLoc::Const(cv) => self.asm().mov_r32_i32(Reg::Rcx, cv as u32),
            ValueLoc::Reg(r) => self.asm().mov_rr32(Reg::Rcx, Reg::from_code(r)),
            ValueLoc::Stack => {
                let slot = self.vs.slot_of(b_idx);
                self.asm().mov_rm32(Reg::Rcx, Self::slot_mem(slot));
            }
            _ => {
                let r = self.ensure_gp(b_idx);
                self.asm().mov_rr32(Reg::Rcx, r);
            }
        }
        let a_idx = self.vs.len() - 2;
        let ra = self.ensure_gp(a_idx);

        let mut a = self.asm();
        match (op.kind, op.b3) {
            (OpKind::Shl, _) => a.shl_cl(ra, w),
            (OpKind::Shr, true) => a.sar_cl(ra, w),
            (OpKind::Shr, false) => a.shr_cl(ra, w),
            (OpKind::Rotl, _) => a.rol_cl(ra, w),
            (OpKind::Rotr, _) => a.ror_cl(ra, w),
            _ => unreachable!(),
        }
        drop(a);
        self.vs.pop();
        let entry = self.vs.pop();
        self.vs.push(entry.ty, ValueLoc::Reg(ra as u8));
    }

    fn op_bitcount(&mut self, op: &Operation) {
        let ty = RuntimeType::from_u8(op.b1);
        let w64 = ty == RuntimeType::I64;
        let kind = match op.kind {
            OpKind::Clz => 0u64,
            OpKind::Ctz => 1,
            _ => 2,
        };
        self.flush_all();
        let slot = self.vs.slot_of(self.vs.len() - 1);
        self.vs.pop();
        self.call_helper(
            HelperIndex::IBitcnt,
            &[
                HelperArg::Slot(slot),
                HelperArg::Imm(kind | ((w64 as u64) << 2)),
            ],
            None,
        );
        let r = self.alloc_gp();
        self.asm().mov_rr(r, Reg::Rdx);
        self.vs.push(ty, ValueLoc::Reg(r as u8));
    }

    fn op_float_sign(&mut self, op: &Operation) {
        let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
        self.protect_flags();
        let idx = self.vs.len() - 1;
        let x = self.ensure_fp(idx, double);
        let mut a = self.asm();
        if op.kind == OpKind::Neg {
            // Flip the sign bit.
            if double {
                a.mov_ri64(Reg::Rax, i64::MIN);
                a.movq_xr(regs::FP_SCRATCH, Reg::Rax);
            } else {
                a.mov_r32_i32(Reg::Rax, 0x8000_0000);
                a.movd_xr(regs::FP_SCRATCH, Reg::Rax);
            }
            a.xorp(x, regs::FP_SCRATCH, double);
        } else {
            // Clear the sign bit.
            if double {
                a.mov_ri64(Reg::Rax, 0x7FFF_FFFF_FFFF_FFFF);
                a.movq_xr(regs::FP_SCRATCH, Reg::Rax);
            } else {
                a.mov_r32_i32(Reg::Rax, 0x7FFF_FFFF);
                a.movd_xr(regs::FP_SCRATCH, Reg::Rax);
            }
            a.andp(x, regs::FP_SCRATCH, double);
        }
    }

    fn op_float_round(&mut self, op: &Operation) {
        let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
        let mode = match op.kind {
            OpKind::Ceil => 0u64,
            OpKind::Floor => 1,
            OpKind::Trunc => 2,
            _ => 3,
        };
        self.flush_all();
        let slot = self.vs.slot_of(self.vs.len() - 1);
        self.vs.pop();
        self.call_helper(
            HelperIndex::FRound,
            &[
                HelperArg::Slot(slot),
                HelperArg::Imm(mode | ((double as u64) << 2)),
            ],
            None,
        );
        let x = self.alloc_fp();
        self.asm().movq_xr(x, Reg::Rdx);
        self.vs.push(
            if double {
                RuntimeType::F64
            } else {
                RuntimeType::F32
            },
            ValueLoc::FReg(x),
        );
    }

    fn op_float_min_max(&mut self, op: &Operation) {
        let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
        let is_max = op.kind == OpKind::Max;
        self.flush_all();
        let b = self.vs.slot_of(self.vs.len() - 1);
        let a = self.vs.slot_of(self.vs.len() - 2);
        self.vs.pop();
        self.vs.pop();
        self.call_helper(
            HelperIndex::FMinMax,
            &[
                HelperArg::Slot(a),
                HelperArg::Slot(b),
                HelperArg::Imm((is_max as u64) | ((double as u64) << 1)),
            ],
            None,
        );
        let x = self.alloc_fp();
        self.asm().movq_xr(x, Reg::Rdx);
        self.vs.push(
            if double {
                RuntimeType::F64
            } else {
                RuntimeType::F32
            },
            ValueLoc::FReg(x),
        );
    }

    fn op_float_copysign(&mut self, op: &Operation) {
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
        self.asm().movq_xr(x, Reg::Rdx);
        self.vs.push(
            if double {
                RuntimeType::F64
            } else {
                RuntimeType::F32
            },
            ValueLoc::FReg(x),
        );
    }

    fn op_convert_int(&mut self, op: &Operation) {
        let double = RuntimeType::from_u8(op.b1) == RuntimeType::F64;
        let from64 = RuntimeType::from_u8(op.b2) == RuntimeType::I64;
        let signed = op.b3;
        self.protect_flags();

        if from64 && !signed {
            // u64 → float needs rounding care beyond cvtsi2s.
            self.flush_all();
            let slot = self.vs.slot_of(self.vs.len() - 1);
            self.vs.pop();
            self.call_helper(
                HelperIndex::U64ToF,
                &[HelperArg::Slot(slot), HelperArg::Imm(double as u64)],
                None,
            );
            let x = self.alloc_fp();
            self.asm().movq_xr(x, Reg::Rdx);
            self.vs.push(
                if double {
                    RuntimeType::F64
                } else {
                    RuntimeType::F32
                },
                ValueLoc::FReg(x),
            );
            return;
        }

        let idx = self.vs.len() - 1;
        let r = self.ensure_gp(idx);
        self.vs.touch(idx);
        let x = self.alloc_fp();
        // i32 unsigned converts exactly via the 64-bit signed form on the
        // zero-extended register.
        let w = from64 || !signed;
        self.asm().cvtsi2s(x, r, double, w);
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

    fn op_reinterpret_to_int(&mut self, op: &Operation) {
        self.protect_flags();
        let to64 = op.kind == OpKind::I64ReinterpretF64;
        let idx = self.vs.len() - 1;
        // The 32-bit result must come out zero-extended; float homes may
        // carry stale upper bits.
        match self.vs.get(idx).loc {
            ValueLoc::FReg(x) => {
                let r = self.alloc_gp();
                if to64 {
                    self.asm().movq_rx(r, x);
                } else {
                    self.asm().movd_rx(r, x);
                }
                self.vs.set_loc(idx, ValueLoc::Reg(r as u8));
            }
            ValueLoc::Reg(r) if !to64 => {
                let r = Reg::from_code(r);
                self.asm().mov_rr32(r, r);
            }
            ValueLoc::Stack if !to64 => {
                let r = self.alloc_gp();
                let slot = self.vs.slot_of(idx);
                self.asm().mov_rm32(r, Self::slot_mem(slot));
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

    fn op_reinterpret_to_float(&mut self, op: &Operation) {
        self.protect_flags();
        let to64 = op.kind == OpKind::F64ReinterpretI64;
        let idx = self.vs.len() - 1;
        if let ValueLoc::Reg(r) = self.vs.get(idx).loc {
            let x = self.alloc_fp();
            if to64 {
                self.asm().movq_xr(x, Reg::from_code(r));
            } else {
                self.asm().movd_xr(x, Reg::from_code(r));
            }
            self.vs.set_loc(idx, ValueLoc::FReg(x));
        }
        self.vs.get_mut(idx).ty = if to64 {
            RuntimeType::F64
        } else {
            RuntimeType::F32
        };
    }

    // ==================== SIMD ====================

    /// v128 moves, bitwise ops, and whole-register loads/stores are
    /// encoded directly; shape-dispatched arithmetic funnels through the
    /// helper table with pointers into the operand slots.
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
                    V128And => a.pand(xa, xb),
                    V128Or => a.por(xa, xb),
                    V128Xor => a.pxor(xa, xb),
                    // andnot(a, b) = a & !b; pandn computes !dst & src, so
                    // compute into b's register and take it as the result.
                    _ => {
                        a.pandn(xb, xa);
                        a.movaps_rr(xa, xb);
                    }
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
                let mut a = self.asm();
                a.mov_ri64(Reg::Rax, -1);
                a.mov_mr(Self::slot_mem(lo_slot), Reg::Rax);
                a.mov_mr(Self::slot_mem(lo_slot + 1), Reg::Rax);
                a.movups_xm(regs::FP_SCRATCH, Self::slot_mem(lo_slot));
                a.pxor(x, regs::FP_SCRATCH);
                drop(a);
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
                    self.asm().padd(xa, xb, lane);
                } else {
                    self.asm().psub(xa, xb, lane);
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
                let mem = self.mem_operand(ri, arg.offset);
                let x = self.alloc_fp();
                self.pc_traps.push((self.buf.offset(), op.pos));
                self.asm().movups_xm(x, mem);
                self.vs.pop();
                self.push_vec_reg(x);
            }
            V128Load => {
                // Extending / splat / zero loads via helper.
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
                let mem = self.mem_operand(ri, arg.offset);
                self.pc_traps.push((self.buf.offset(), op.pos));
                self.asm().movups_mx(mem, x);
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
                self.asm().mov_rr(r, Reg::Rdx);
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
                // The mask travels in the two immediate words.
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
                self.asm().mov_rr(r, Reg::Rdx);
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
                let pack = v128_unop_code(op.kind)
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
                let pack = v128_binop_code(op.kind)
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
                self.asm().movups_xm(x, Self::slot_mem(lo_slot));
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
    /// Load the 64-bit value at a frame slot.
    Slot(u32),
    /// Pass the address of a frame slot.
    SlotAddr(u32),
    Imm(u64),
}

fn cond_from(cc: u8) -> Cond {
    // Condition codes are stored as their x86 encodings.
    match cc & 0xF {
        0x0 => Cond::O,
        0x1 => Cond::No,
        0x2 => Cond::B,
        0x3 => Cond::Ae,
        0x4 => Cond::E,
        0x5 => Cond::Ne,
        0x6 => Cond::Be,
        0x7 => Cond::A,
        0x8 => Cond::S,
        0x9 => Cond::Ns,
        0xA => Cond::P,
        0xB => Cond::Np,
        0xC => Cond::L,
        0xD => Cond::Ge,
        0xE => Cond::Le,
        _ => Cond::G,
    }
}

/// Whether a constant can ride as a sign-extended 32-bit immediate.
fn const_fits_i32(v: u64, w: bool) -> bool {
    if w {
        (v as i64) >= i32::MIN as i64 && (v as i64) <= i32::MAX as i64
    } else {
        // 32-bit operations take any 32-bit immediate as-is.
        v <= u32::MAX as u64
    }
}

/// Shared opcode numbering for the v128 binary helper dispatcher.
pub fn v128_binop_code(kind: OpKind) -> u64 {
    match kind {
        OpKind::V128Add => 0,
        OpKind::V128Sub => 1,
        OpKind::V128Mul => 2,
        OpKind::V128Div => 3,
        OpKind::V128AddSat => 4,
        OpKind::V128SubSat => 5,
        OpKind::V128Min => 6,
        OpKind::V128Max => 7,
        OpKind::V128AvgrU => 8,
        OpKind::V128Pmin => 9,
        OpKind::V128Pmax => 10,
        OpKind::V128Cmp => 11,
        OpKind::V128ExtMul => 12,
        OpKind::V128Q15mulrSatS => 13,
        OpKind::V128Dot => 14,
        OpKind::V128Narrow => 15,
        _ => unreachable!(),
    }
}

/// Shared opcode numbering for the v128 unary helper dispatcher.
pub fn v128_unop_code(kind: OpKind) -> u64 {
    match kind {
        OpKind::V128Neg => 0,
        OpKind::V128Abs => 1,
        OpKind::V128Sqrt => 2,
        OpKind::V128Popcnt => 3,
        OpKind::V128Ceil => 4,
        OpKind::V128Floor => 5,
        OpKind::V128Trunc => 6,
        OpKind::V128Nearest => 7,
        OpKind::V128Extend => 8,
        OpKind::V128ExtAddPairwise => 9,
        OpKind::V128FloatPromote => 10,
        OpKind::V128FloatDemote => 11,
        OpKind::V128FConvertI => 12,
        OpKind::V128ITruncSatF => 13,
        _ => unreachable!(),
    }
}

// ==================== entry trampolines & shims ====================

/// Compile the per-signature entry trampoline:
/// `extern "C" fn(ctx, entry, frame)`.
pub fn emit_entry_trampoline(sig: &FuncType) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = X64Assembler::new(&mut buf);
    a.push(Reg::Rbx);
    a.push(Reg::Rbp);
    a.push(Reg::R12);
    a.push(Reg::R13);
    a.push(Reg::R14);
    a.push(Reg::R15);
    a.sub_ri(Reg::Rsp, 8, true);

    a.mov_rr(regs::CTX, Reg::Rdi);
    a.mov_rr(regs::FRAME, Reg::Rdx);
    a.mov_mr(Mem::base(regs::CTX, ctx::CTX_HOST_SP), Reg::Rsp);
    a.mov_rm(regs::MEM, Mem::base(regs::CTX, ctx::CTX_MEMORY_BASE));
    a.mov_rr(regs::SCRATCH, Reg::Rsi);

    for (slot, ty, loc) in assign_arg_regs(&sig.params) {
        match loc {
            ArgLoc::Gp(r) => a.mov_rm(r, Mem::base(regs::FRAME, slot as i32 * 8)),
            ArgLoc::Fp(x) => a.movs_xm(
                x,
                Mem::base(regs::FRAME, slot as i32 * 8),
                ty == ValType::F64,
            ),
            ArgLoc::Stack => {}
        }
    }

    a.call_r(regs::SCRATCH);

    a.add_ri(Reg::Rsp, 8, true);
    a.pop(Reg::R15);
    a.pop(Reg::R14);
    a.pop(Reg::R13);
    a.pop(Reg::R12);
    a.pop(Reg::Rbp);
    a.pop(Reg::Rbx);
    a.ret();
    buf.into_code()
}

/// Compile the host-call shim for one imported function. Callers treat
/// it exactly like a guest function.
pub fn emit_host_shim(sig: &FuncType, import_index: u32) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = X64Assembler::new(&mut buf);
    a.push(Reg::Rbp);

    for (slot, ty, loc) in assign_arg_regs(&sig.params) {
        match loc {
            ArgLoc::Gp(r) => a.mov_mr(Mem::base(regs::FRAME, slot as i32 * 8), r),
            ArgLoc::Fp(x) => a.movs_mx(
                Mem::base(regs::FRAME, slot as i32 * 8),
                x,
                ty == ValType::F64,
            ),
            ArgLoc::Stack => {}
        }
    }

    a.mov_rr(Reg::Rdi, regs::CTX);
    a.mov_r32_i32(Reg::Rsi, import_index);
    a.mov_rr(Reg::Rdx, regs::FRAME);
    a.mov_rm(Reg::Rax, Mem::base(regs::CTX, ctx::CTX_HELPERS));
    a.call_m(Mem::base(Reg::Rax, HelperIndex::HostCall as i32 * 8));

    a.test_rr(Reg::Rax, Reg::Rax, true);
    let ok = a.jcc_rel32(Cond::E, 0);
    a.cmp_ri(Reg::Rax, ctx::HELPER_EXIT as i32, true);
    let not_exit = a.jcc_rel32(Cond::Ne, 0);
    a.mov_mi64(Mem::base(regs::CTX, ctx::CTX_STATUS), ctx::STATUS_EXIT as i32);
    let to_unwind = a.jmp_rel32(0);
    let not_exit_target = a.offset();
    a.add_ri(Reg::Rax, -(ctx::HELPER_TRAP_BASE as i32), true);
    a.mov_mr(Mem::base(regs::CTX, ctx::CTX_TRAP_KIND), Reg::Rax);
    a.mov_mi64(Mem::base(regs::CTX, ctx::CTX_TRAP_SITE), -1);
    a.mov_mi64(Mem::base(regs::CTX, ctx::CTX_STATUS), ctx::STATUS_TRAP as i32);
    let unwind_target = a.offset();
    a.mov_rm(Reg::Rsp, Mem::base(regs::CTX, ctx::CTX_HOST_SP));
    a.add_ri(Reg::Rsp, 8, true);
    a.pop(Reg::R15);
    a.pop(Reg::R14);
    a.pop(Reg::R13);
    a.pop(Reg::R12);
    a.pop(Reg::Rbp);
    a.pop(Reg::Rbx);
    a.ret();

    let ok_target = a.offset();
    for (slot, ty, loc) in assign_arg_regs(&sig.results) {
        match loc {
            ArgLoc::Gp(r) => a.mov_rm(r, Mem::base(regs::FRAME, slot as i32 * 8)),
            ArgLoc::Fp(x) => a.movs_xm(
                x,
                Mem::base(regs::FRAME, slot as i32 * 8),
                ty == ValType::F64,
            ),
            ArgLoc::Stack => {}
        }
    }
    a.pop(Reg::Rbp);
    a.ret();
    drop(a);

    // Patch the three local forward references. `not_exit` jumps past the
    // exit path; `ok` jumps to the result reload.
    let patch = |buf: &mut CodeBuffer, site: usize, target: usize| {
        let disp = target as i64 - (site as i64 + 4);
        buf.patch_u32(site, disp as u32);
    };
    patch(&mut buf, ok, ok_target);
    patch(&mut buf, not_exit, not_exit_target);
    patch(&mut buf, to_unwind, unwind_target);
    buf.into_code()
}

/// The segment-level unwind stub used by the signal path: identical to a
/// function-local exit restore.
pub fn emit_segment_exit_stub() -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut a = X64Assembler::new(&mut buf);
    a.mov_rm(Reg::Rsp, Mem::base(regs::CTX, ctx::CTX_HOST_SP));
    a.add_ri(Reg::Rsp, 8, true);
    a.pop(Reg::R15);
    a.pop(Reg::R14);
    a.pop(Reg::R13);
    a.pop(Reg::R12);
    a.pop(Reg::Rbp);
    a.pop(Reg::Rbx);
    a.ret();
    buf.into_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_arg_regs() {
        let args = assign_arg_regs(&[
            ValType::I32,
            ValType::F64,
            ValType::I64,
            ValType::V128,
            ValType::F32,
        ]);
        assert_eq!(args[0], (0, ValType::I32, ArgLoc::Gp(Reg::Rdi)));
        assert_eq!(args[1], (1, ValType::F64, ArgLoc::Fp(0)));
        assert_eq!(args[2], (2, ValType::I64, ArgLoc::Gp(Reg::Rsi)));
        assert_eq!(args[3], (3, ValType::V128, ArgLoc::Stack));
        assert_eq!(args[4], (5, ValType::F32, ArgLoc::Fp(1)));
    }

    #[test]
    fn test_arg_regs_spill_past_six_ints() {
        let types = vec![ValType::I32; 8];
        let args = assign_arg_regs(&types);
        assert!(matches!(args[5].2, ArgLoc::Gp(_)));
        assert_eq!(args[6].2, ArgLoc::Stack);
        assert_eq!(args[7].2, ArgLoc::Stack);
    }

    #[test]
    fn test_entry_trampoline_shape() {
        let sig = FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        let code = emit_entry_trampoline(&sig);
        // Starts by saving rbx, ends with ret.
        assert_eq!(code[0], 0x53);
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_exit_stub_restores_host_sp() {
        let code = emit_segment_exit_stub();
        assert_eq!(*code.last().unwrap(), 0xC3);
        // Contains the host-sp reload: mov rsp, [r14+0x20].
        let needle = [0x49, 0x8B, 0x66, 0x20];
        assert!(code.windows(4).any(|w| w == needle));
    }
}
