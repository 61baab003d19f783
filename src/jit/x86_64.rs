//! x86-64 instruction encoding.
//!
//! This module provides functions for encoding x86-64 instructions
//! as machine code bytes. Uses System V AMD64 ABI conventions.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub fn from_code(code: u8) -> Reg {
        match code & 0xF {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }

    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register needs a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// A memory operand: `[base + index*2^scale + disp]`.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Mem {
        Mem {
            base,
            index: None,
            scale: 0,
            disp,
        }
    }

    pub fn index(base: Reg, index: Reg, scale: u8, disp: i32) -> Mem {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index register");
        debug_assert!(scale <= 3);
        Mem {
            base,
            index: Some(index),
            scale,
            disp,
        }
    }
}

/// x86-64 assembler writing into a code buffer.
pub struct X64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== prefix / ModRM helpers ====================

    fn rex_bits(w: bool, r_ext: bool, x_ext: bool, b_ext: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r_ext as u8) << 2) | ((x_ext as u8) << 1) | (b_ext as u8)
    }

    /// Emit a REX prefix for a register-register form if required.
    fn emit_rex_rr(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = Self::rex_bits(w, reg >= 8, false, rm >= 8);
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    fn emit_rex_mem(&mut self, w: bool, reg: u8, mem: Mem) {
        let x = mem.index.map(|r| r.needs_rex_ext()).unwrap_or(false);
        let rex = Self::rex_bits(w, reg >= 8, x, mem.base.needs_rex_ext());
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit ModRM (+SIB, +disp) for `reg, [mem]`.
    fn emit_modrm_mem(&mut self, reg: u8, mem: Mem) {
        let base_code = mem.base.code();
        let force_disp = base_code == 0b101; // rbp/r13 need an explicit disp
        let (mode, disp8) = if mem.disp == 0 && !force_disp {
            (0b00, false)
        } else if (-128..=127).contains(&mem.disp) {
            (0b01, true)
        } else {
            (0b10, false)
        };

        match mem.index {
            Some(index) => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                let sib = (mem.scale << 6) | ((index.code() & 0x7) << 3) | base_code;
                self.buf.emit_u8(sib);
            }
            None => {
                if base_code == 0b100 {
                    // rsp/r12 as base always need a SIB byte.
                    self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                    self.buf.emit_u8(0x24);
                } else {
                    self.buf.emit_u8(Self::modrm(mode, reg, base_code));
                }
            }
        }

        if mode == 0b01 {
            debug_assert!(disp8);
            self.buf.emit_u8(mem.disp as u8);
        } else if mode == 0b10 {
            self.buf.emit_u32(mem.disp as u32);
        }
    }

    // ==================== data movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(true, src as u8, dst as u8);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r32, r32 (zero-extends into the upper half)
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(false, src as u8, dst as u8);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.buf.emit_u8(Self::rex_bits(true, false, false, dst.needs_rex_ext()));
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32 (zero-extends into the upper half)
    pub fn mov_r32_i32(&mut self, dst: Reg, imm: u32) {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// Load an arbitrary 64-bit constant, using the shortest form.
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        if imm <= u32::MAX as u64 {
            self.mov_r32_i32(dst, imm as u32);
        } else {
            self.mov_ri64(dst, imm as i64);
        }
    }

    /// MOV r64, [mem]
    pub fn mov_rm(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(true, dst as u8, mem);
        self.buf.emit_u8(0x8B);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOV r32, [mem] (zero-extends)
    pub fn mov_rm32(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(false, dst as u8, mem);
        self.buf.emit_u8(0x8B);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOV [mem], r64
    pub fn mov_mr(&mut self, mem: Mem, src: Reg) {
        self.emit_rex_mem(true, src as u8, mem);
        self.buf.emit_u8(0x89);
        self.emit_modrm_mem(src.code(), mem);
    }

    /// MOV [mem], r32
    pub fn mov_mr32(&mut self, mem: Mem, src: Reg) {
        self.emit_rex_mem(false, src as u8, mem);
        self.buf.emit_u8(0x89);
        self.emit_modrm_mem(src.code(), mem);
    }

    /// MOV [mem], r16
    pub fn mov_mr16(&mut self, mem: Mem, src: Reg) {
        self.buf.emit_u8(0x66);
        self.emit_rex_mem(false, src as u8, mem);
        self.buf.emit_u8(0x89);
        self.emit_modrm_mem(src.code(), mem);
    }

    /// MOV [mem], r8
    pub fn mov_mr8(&mut self, mem: Mem, src: Reg) {
        // Always emit REX so spl/sil/dil encode instead of ah/ch/dh.
        let x = mem.index.map(|r| r.needs_rex_ext()).unwrap_or(false);
        let rex = Self::rex_bits(false, src as u8 >= 8, x, mem.base.needs_rex_ext());
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x88);
        self.emit_modrm_mem(src.code(), mem);
    }

    /// MOV qword [mem], imm32 (sign-extended)
    pub fn mov_mi64(&mut self, mem: Mem, imm: i32) {
        self.emit_rex_mem(true, 0, mem);
        self.buf.emit_u8(0xC7);
        self.emit_modrm_mem(0, mem);
        self.buf.emit_u32(imm as u32);
    }

    /// MOVZX r32, byte [mem]
    pub fn movzx_rm8(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(false, dst as u8, mem);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOVZX r32, word [mem]
    pub fn movzx_rm16(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(false, dst as u8, mem);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOVSX r32/r64, byte [mem]
    pub fn movsx_rm8(&mut self, dst: Reg, mem: Mem, w: bool) {
        self.emit_rex_mem(w, dst as u8, mem);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOVSX r32/r64, word [mem]
    pub fn movsx_rm16(&mut self, dst: Reg, mem: Mem, w: bool) {
        self.emit_rex_mem(w, dst as u8, mem);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOVSXD r64, dword [mem]
    pub fn movsxd_rm(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(true, dst as u8, mem);
        self.buf.emit_u8(0x63);
        self.emit_modrm_mem(dst.code(), mem);
    }

    /// MOVSX r64/r32, r8 (register form)
    pub fn movsx_rr8(&mut self, dst: Reg, src: Reg, w: bool) {
        let rex = Self::rex_bits(w, dst as u8 >= 8, false, src as u8 >= 8);
        // 8-bit source always gets a REX for the spl/sil/dil encodings.
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVSX r64/r32, r16
    pub fn movsx_rr16(&mut self, dst: Reg, src: Reg, w: bool) {
        self.emit_rex_rr(w, dst as u8, src as u8);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVSXD r64, r32
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_rr(true, dst as u8, src as u8);
        self.buf.emit_u8(0x63);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVZX r32, r8
    pub fn movzx_rr8(&mut self, dst: Reg, src: Reg) {
        let rex = Self::rex_bits(false, dst as u8 >= 8, false, src as u8 >= 8);
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// LEA r64, [mem]
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.emit_rex_mem(true, dst as u8, mem);
        self.buf.emit_u8(0x8D);
        self.emit_modrm_mem(dst.code(), mem);
    }

    // ==================== ALU ====================

    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg, w: bool) {
        self.emit_rex_rr(w, src as u8, dst as u8);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    fn alu_ri(&mut self, ext: u8, dst: Reg, imm: i32, w: bool) {
        self.emit_rex_rr(w, 0, dst as u8);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x01, dst, src, w);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x29, dst, src, w);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x21, dst, src, w);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x09, dst, src, w);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x31, dst, src, w);
    }

    pub fn cmp_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.alu_rr(0x39, dst, src, w);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg, w: bool) {
        self.alu_rr(0x85, a, b, w);
    }

    pub fn add_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(0, dst, imm, w);
    }

    pub fn sub_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(5, dst, imm, w);
    }

    pub fn and_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(4, dst, imm, w);
    }

    pub fn or_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(1, dst, imm, w);
    }

    pub fn xor_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(6, dst, imm, w);
    }

    pub fn cmp_ri(&mut self, dst: Reg, imm: i32, w: bool) {
        self.alu_ri(7, dst, imm, w);
    }

    /// CMP r64, [mem]
    pub fn cmp_rm(&mut self, reg: Reg, mem: Mem) {
        self.emit_rex_mem(true, reg as u8, mem);
        self.buf.emit_u8(0x3B);
        self.emit_modrm_mem(reg.code(), mem);
    }

    /// CMP qword [mem], imm8
    pub fn cmp_mi8(&mut self, mem: Mem, imm: i8) {
        self.emit_rex_mem(true, 7, mem);
        self.buf.emit_u8(0x83);
        self.emit_modrm_mem(7, mem);
        self.buf.emit_u8(imm as u8);
    }

    /// IMUL r, r
    pub fn imul_rr(&mut self, dst: Reg, src: Reg, w: bool) {
        self.emit_rex_rr(w, dst as u8, src as u8);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IDIV r (signed divide rdx:rax by r)
    pub fn idiv(&mut self, src: Reg, w: bool) {
        self.emit_rex_rr(w, 0, src as u8);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// DIV r (unsigned divide rdx:rax by r)
    pub fn div(&mut self, src: Reg, w: bool) {
        self.emit_rex_rr(w, 0, src as u8);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 6, src.code()));
    }

    /// CQO (64-bit) / CDQ (32-bit): sign-extend rax into rdx:rax.
    pub fn cqo(&mut self, w: bool) {
        if w {
            self.buf.emit_u8(0x48);
        }
        self.buf.emit_u8(0x99);
    }

    /// NEG r
    pub fn neg(&mut self, dst: Reg, w: bool) {
        self.emit_rex_rr(w, 0, dst as u8);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    fn shift_cl(&mut self, ext: u8, dst: Reg, w: bool) {
        self.emit_rex_rr(w, 0, dst as u8);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
    }

    fn shift_imm(&mut self, ext: u8, dst: Reg, imm: u8, w: bool) {
        self.emit_rex_rr(w, 0, dst as u8);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
        self.buf.emit_u8(imm);
    }

    pub fn shl_cl(&mut self, dst: Reg, w: bool) {
        self.shift_cl(4, dst, w);
    }

    pub fn shr_cl(&mut self, dst: Reg, w: bool) {
        self.shift_cl(5, dst, w);
    }

    pub fn sar_cl(&mut self, dst: Reg, w: bool) {
        self.shift_cl(7, dst, w);
    }

    pub fn rol_cl(&mut self, dst: Reg, w: bool) {
        self.shift_cl(0, dst, w);
    }

    pub fn ror_cl(&mut self, dst: Reg, w: bool) {
        self.shift_cl(1, dst, w);
    }

    pub fn shl_ri(&mut self, dst: Reg, imm: u8, w: bool) {
        self.shift_imm(4, dst, imm, w);
    }

    pub fn shr_ri(&mut self, dst: Reg, imm: u8, w: bool) {
        self.shift_imm(5, dst, imm, w);
    }

    pub fn sar_ri(&mut self, dst: Reg, imm: u8, w: bool) {
        self.shift_imm(7, dst, imm, w);
    }

    // ==================== conditionals ====================

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        if dst as u8 >= 4 {
            // spl/bpl/sil/dil and r8b..r15b need a REX prefix.
            self.buf
                .emit_u8(Self::rex_bits(false, false, false, dst.needs_rex_ext()));
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    /// CMOVcc r, r
    pub fn cmovcc(&mut self, cond: Cond, dst: Reg, src: Reg, w: bool) {
        self.emit_rex_rr(w, dst as u8, src as u8);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// AND r8, r8 (for combining setcc results)
    pub fn and_rr8(&mut self, dst: Reg, src: Reg) {
        let rex = Self::rex_bits(false, src as u8 >= 8, false, dst as u8 >= 8);
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x20);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// OR r8, r8
    pub fn or_rr8(&mut self, dst: Reg, src: Reg) {
        let rex = Self::rex_bits(false, src as u8 >= 8, false, dst as u8 >= 8);
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x08);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    // ==================== stack & control flow ====================

    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// JMP rel32; returns the offset of the 32-bit displacement field.
    pub fn jmp_rel32(&mut self, offset: i32) -> usize {
        self.buf.emit_u8(0xE9);
        let at = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// Jcc rel32; returns the offset of the 32-bit displacement field.
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let at = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// CALL rel32; returns the offset of the displacement field.
    pub fn call_rel32(&mut self, offset: i32) -> usize {
        self.buf.emit_u8(0xE8);
        let at = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// CALL [mem]
    pub fn call_m(&mut self, mem: Mem) {
        self.emit_rex_mem(false, 2, mem);
        self.buf.emit_u8(0xFF);
        self.emit_modrm_mem(2, mem);
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 4, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn nop(&mut self) {
        self.buf.emit_u8(0x90);
    }

    /// UD2: the canonical trap instruction.
    pub fn ud2(&mut self) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x0B);
    }

    // ==================== SSE scalar ====================

    fn sse_op(&mut self, prefix: Option<u8>, opcode: u8, reg: u8, rm: u8, w: bool) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        let rex = Self::rex_bits(w, reg >= 8, false, rm >= 8);
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, reg & 0x7, rm & 0x7));
    }

    fn sse_op_mem(&mut self, prefix: Option<u8>, opcode: u8, reg: u8, mem: Mem) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        let x = mem.index.map(|r| r.needs_rex_ext()).unwrap_or(false);
        let rex = Self::rex_bits(false, reg >= 8, x, mem.base.needs_rex_ext());
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.emit_modrm_mem(reg & 0x7, mem);
    }

    /// MOVQ xmm, r64
    pub fn movq_xr(&mut self, xmm: u8, src: Reg) {
        self.buf.emit_u8(0x66);
        self.buf
            .emit_u8(Self::rex_bits(true, xmm >= 8, false, src.needs_rex_ext()));
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, xmm & 0x7, src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_rx(&mut self, dst: Reg, xmm: u8) {
        self.buf.emit_u8(0x66);
        self.buf
            .emit_u8(Self::rex_bits(true, xmm >= 8, false, dst.needs_rex_ext()));
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, xmm & 0x7, dst.code()));
    }

    /// MOVD xmm, r32
    pub fn movd_xr(&mut self, xmm: u8, src: Reg) {
        self.buf.emit_u8(0x66);
        let rex = Self::rex_bits(false, xmm >= 8, false, src.needs_rex_ext());
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, xmm & 0x7, src.code()));
    }

    /// MOVD r32, xmm
    pub fn movd_rx(&mut self, dst: Reg, xmm: u8) {
        self.buf.emit_u8(0x66);
        let rex = Self::rex_bits(false, xmm >= 8, false, dst.needs_rex_ext());
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, xmm & 0x7, dst.code()));
    }

    /// MOVSS xmm, [mem] / MOVSD with `double`
    pub fn movs_xm(&mut self, xmm: u8, mem: Mem, double: bool) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.sse_op_mem(Some(prefix), 0x10, xmm, mem);
    }

    /// MOVSS [mem], xmm / MOVSD with `double`
    pub fn movs_mx(&mut self, mem: Mem, xmm: u8, double: bool) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.sse_op_mem(Some(prefix), 0x11, xmm, mem);
    }

    /// MOVAPS xmm, xmm (full 128-bit register move)
    pub fn movaps_rr(&mut self, dst: u8, src: u8) {
        self.sse_op(None, 0x28, dst, src, false);
    }

    /// MOVUPS xmm, [mem] (128-bit load)
    pub fn movups_xm(&mut self, xmm: u8, mem: Mem) {
        self.sse_op_mem(None, 0x10, xmm, mem);
    }

    /// MOVUPS [mem], xmm (128-bit store)
    pub fn movups_mx(&mut self, mem: Mem, xmm: u8) {
        self.sse_op_mem(None, 0x11, xmm, mem);
    }

    fn scalar_fp(&mut self, opcode: u8, dst: u8, src: u8, double: bool) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.sse_op(Some(prefix), opcode, dst, src, false);
    }

    pub fn adds(&mut self, dst: u8, src: u8, double: bool) {
        self.scalar_fp(0x58, dst, src, double);
    }

    pub fn subs(&mut self, dst: u8, src: u8, double: bool) {
        self.scalar_fp(0x5C, dst, src, double);
    }

    pub fn muls(&mut self, dst: u8, src: u8, double: bool) {
        self.scalar_fp(0x59, dst, src, double);
    }

    pub fn divs(&mut self, dst: u8, src: u8, double: bool) {
        self.scalar_fp(0x5E, dst, src, double);
    }

    pub fn sqrts(&mut self, dst: u8, src: u8, double: bool) {
        self.scalar_fp(0x51, dst, src, double);
    }

    /// UCOMISS / UCOMISD
    pub fn ucomis(&mut self, a: u8, b: u8, double: bool) {
        let prefix = if double { Some(0x66) } else { None };
        self.sse_op(prefix, 0x2E, a, b, false);
    }

    /// CVTSI2SS/SD xmm, r32/r64
    pub fn cvtsi2s(&mut self, xmm: u8, src: Reg, double: bool, w: bool) {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.buf.emit_u8(prefix);
        let rex = Self::rex_bits(w, xmm >= 8, false, src.needs_rex_ext());
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2A);
        self.buf.emit_u8(Self::modrm(0b11, xmm & 0x7, src.code()));
    }

    /// CVTSS2SD xmm, xmm
    pub fn cvtss2sd(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0xF3), 0x5A, dst, src, false);
    }

    /// CVTSD2SS xmm, xmm
    pub fn cvtsd2ss(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0xF2), 0x5A, dst, src, false);
    }

    /// ANDPS / ANDPD
    pub fn andp(&mut self, dst: u8, src: u8, double: bool) {
        let prefix = if double { Some(0x66) } else { None };
        self.sse_op(prefix, 0x54, dst, src, false);
    }

    /// XORPS / XORPD
    pub fn xorp(&mut self, dst: u8, src: u8, double: bool) {
        let prefix = if double { Some(0x66) } else { None };
        self.sse_op(prefix, 0x57, dst, src, false);
    }

    // ==================== SSE2 packed integer ====================

    /// PAND xmm, xmm
    pub fn pand(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0x66), 0xDB, dst, src, false);
    }

    /// PANDN xmm, xmm (dst = !dst & src)
    pub fn pandn(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0x66), 0xDF, dst, src, false);
    }

    /// POR xmm, xmm
    pub fn por(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0x66), 0xEB, dst, src, false);
    }

    /// PXOR xmm, xmm
    pub fn pxor(&mut self, dst: u8, src: u8) {
        self.sse_op(Some(0x66), 0xEF, dst, src, false);
    }

    /// PADDB/W/D/Q by lane-size log2
    pub fn padd(&mut self, dst: u8, src: u8, lane_log2: u8) {
        let opcode = match lane_log2 {
            0 => 0xFC,
            1 => 0xFD,
            2 => 0xFE,
            _ => 0xD4,
        };
        self.sse_op(Some(0x66), opcode, dst, src, false);
    }

    /// PSUBB/W/D/Q by lane-size log2
    pub fn psub(&mut self, dst: u8, src: u8, lane_log2: u8) {
        let opcode = match lane_log2 {
            0 => 0xF8,
            1 => 0xF9,
            2 => 0xFA,
            _ => 0xFB,
        };
        self.sse_op(Some(0x66), opcode, dst, src, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut X64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X64Assembler::new(&mut buf);
        f(&mut asm);
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::Rax, Reg::Rbx)),
            vec![0x48, 0x89, 0xD8]
        );
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(
            assemble(|a| a.mov_rr(Reg::R9, Reg::R8)),
            vec![0x4D, 0x89, 0xC1]
        );
    }

    #[test]
    fn test_mov_rr32() {
        // MOV EAX, EBX = 89 D8
        assert_eq!(assemble(|a| a.mov_rr32(Reg::Rax, Reg::Rbx)), vec![0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri64() {
        // MOV RAX, imm64 = 48 B8 ..
        assert_eq!(
            assemble(|a| a.mov_ri64(Reg::Rax, 0x1122334455667788)),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_r32_i32() {
        // MOV EAX, 7 = B8 07 00 00 00
        assert_eq!(
            assemble(|a| a.mov_r32_i32(Reg::Rax, 7)),
            vec![0xB8, 0x07, 0x00, 0x00, 0x00]
        );
        // MOV R10D, 7 = 41 BA 07 00 00 00
        assert_eq!(
            assemble(|a| a.mov_r32_i32(Reg::R10, 7)),
            vec![0x41, 0xBA, 0x07, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_rm_base_forms() {
        // MOV RAX, [RBX] = 48 8B 03
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::Rbx, 0))),
            vec![0x48, 0x8B, 0x03]
        );
        // MOV RAX, [RBX+16] = 48 8B 43 10
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::Rbx, 16))),
            vec![0x48, 0x8B, 0x43, 0x10]
        );
        // MOV RAX, [RSP] needs a SIB = 48 8B 04 24
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::Rsp, 0))),
            vec![0x48, 0x8B, 0x04, 0x24]
        );
        // MOV RAX, [R13] forces disp8 = 49 8B 45 00
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::R13, 0))),
            vec![0x49, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_mov_rm_index() {
        // MOV RAX, [R12 + RCX*1] = 49 8B 04 0C
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Mem::index(Reg::R12, Reg::Rcx, 0, 0))),
            vec![0x49, 0x8B, 0x04, 0x0C]
        );
        // MOV RCX, [RAX + RDX*8 + 8] = 48 8B 4C D0 08
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rcx, Mem::index(Reg::Rax, Reg::Rdx, 3, 8))),
            vec![0x48, 0x8B, 0x4C, 0xD0, 0x08]
        );
    }

    #[test]
    fn test_mov_mr() {
        // MOV [RBX], RAX = 48 89 03
        assert_eq!(
            assemble(|a| a.mov_mr(Mem::base(Reg::Rbx, 0), Reg::Rax)),
            vec![0x48, 0x89, 0x03]
        );
        // MOV [R13+256], RSI = 49 89 B5 00 01 00 00
        assert_eq!(
            assemble(|a| a.mov_mr(Mem::base(Reg::R13, 256), Reg::Rsi)),
            vec![0x49, 0x89, 0xB5, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_mr8() {
        // MOV [RBX], SIL = 40 88 33
        assert_eq!(
            assemble(|a| a.mov_mr8(Mem::base(Reg::Rbx, 0), Reg::Rsi)),
            vec![0x40, 0x88, 0x33]
        );
    }

    #[test]
    fn test_mov_mi64() {
        // MOV qword [R14+0x30], 1 = 49 C7 46 30 01 00 00 00
        assert_eq!(
            assemble(|a| a.mov_mi64(Mem::base(Reg::R14, 0x30), 1)),
            vec![0x49, 0xC7, 0x46, 0x30, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_extending_loads() {
        // MOVZX EAX, byte [RBX] = 0F B6 03
        assert_eq!(
            assemble(|a| a.movzx_rm8(Reg::Rax, Mem::base(Reg::Rbx, 0))),
            vec![0x0F, 0xB6, 0x03]
        );
        // MOVSX RAX, byte [RBX] = 48 0F BE 03
        assert_eq!(
            assemble(|a| a.movsx_rm8(Reg::Rax, Mem::base(Reg::Rbx, 0), true)),
            vec![0x48, 0x0F, 0xBE, 0x03]
        );
        // MOVSXD RAX, dword [RBX] = 48 63 03
        assert_eq!(
            assemble(|a| a.movsxd_rm(Reg::Rax, Mem::base(Reg::Rbx, 0))),
            vec![0x48, 0x63, 0x03]
        );
    }

    #[test]
    fn test_alu() {
        // ADD RAX, RBX = 48 01 D8
        assert_eq!(
            assemble(|a| a.add_rr(Reg::Rax, Reg::Rbx, true)),
            vec![0x48, 0x01, 0xD8]
        );
        // ADD EAX, EBX = 01 D8
        assert_eq!(
            assemble(|a| a.add_rr(Reg::Rax, Reg::Rbx, false)),
            vec![0x01, 0xD8]
        );
        // SUB RSP, 32 = 48 83 EC 20
        assert_eq!(
            assemble(|a| a.sub_ri(Reg::Rsp, 32, true)),
            vec![0x48, 0x83, 0xEC, 0x20]
        );
        // ADD RAX, 256 = 48 81 C0 00 01 00 00
        assert_eq!(
            assemble(|a| a.add_ri(Reg::Rax, 256, true)),
            vec![0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]
        );
        // XOR RAX, RAX = 48 31 C0
        assert_eq!(
            assemble(|a| a.xor_rr(Reg::Rax, Reg::Rax, true)),
            vec![0x48, 0x31, 0xC0]
        );
        // TEST RAX, RAX = 48 85 C0
        assert_eq!(
            assemble(|a| a.test_rr(Reg::Rax, Reg::Rax, true)),
            vec![0x48, 0x85, 0xC0]
        );
    }

    #[test]
    fn test_div_helpers() {
        // CQO = 48 99; IDIV RCX = 48 F7 F9
        assert_eq!(assemble(|a| a.cqo(true)), vec![0x48, 0x99]);
        assert_eq!(assemble(|a| a.idiv(Reg::Rcx, true)), vec![0x48, 0xF7, 0xF9]);
        // CDQ = 99; DIV ECX = F7 F1
        assert_eq!(assemble(|a| a.cqo(false)), vec![0x99]);
        assert_eq!(assemble(|a| a.div(Reg::Rcx, false)), vec![0xF7, 0xF1]);
    }

    #[test]
    fn test_shifts() {
        // SHL RAX, CL = 48 D3 E0
        assert_eq!(assemble(|a| a.shl_cl(Reg::Rax, true)), vec![0x48, 0xD3, 0xE0]);
        // SAR EAX, CL = D3 F8
        assert_eq!(assemble(|a| a.sar_cl(Reg::Rax, false)), vec![0xD3, 0xF8]);
        // ROL RBX, CL = 48 D3 C3
        assert_eq!(assemble(|a| a.rol_cl(Reg::Rbx, true)), vec![0x48, 0xD3, 0xC3]);
    }

    #[test]
    fn test_setcc() {
        // SETE AL = 0F 94 C0
        assert_eq!(
            assemble(|a| a.setcc(Cond::E, Reg::Rax)),
            vec![0x0F, 0x94, 0xC0]
        );
        // SETB SIL = 40 0F 92 C6
        assert_eq!(
            assemble(|a| a.setcc(Cond::B, Reg::Rsi)),
            vec![0x40, 0x0F, 0x92, 0xC6]
        );
    }

    #[test]
    fn test_cmov() {
        // CMOVE RAX, RBX = 48 0F 44 C3
        assert_eq!(
            assemble(|a| a.cmovcc(Cond::E, Reg::Rax, Reg::Rbx, true)),
            vec![0x48, 0x0F, 0x44, 0xC3]
        );
    }

    #[test]
    fn test_control_flow() {
        // JMP +16 = E9 10 00 00 00
        assert_eq!(
            assemble(|a| {
                a.jmp_rel32(0x10);
            }),
            vec![0xE9, 0x10, 0x00, 0x00, 0x00]
        );
        // JE +16 = 0F 84 10 00 00 00
        assert_eq!(
            assemble(|a| {
                a.jcc_rel32(Cond::E, 0x10);
            }),
            vec![0x0F, 0x84, 0x10, 0x00, 0x00, 0x00]
        );
        // CALL RAX = FF D0; CALL R12 = 41 FF D4
        assert_eq!(assemble(|a| a.call_r(Reg::Rax)), vec![0xFF, 0xD0]);
        assert_eq!(assemble(|a| a.call_r(Reg::R12)), vec![0x41, 0xFF, 0xD4]);
        // CALL [RAX+8] = FF 50 08
        assert_eq!(
            assemble(|a| a.call_m(Mem::base(Reg::Rax, 8))),
            vec![0xFF, 0x50, 0x08]
        );
        // RET = C3
        assert_eq!(assemble(|a| a.ret()), vec![0xC3]);
    }

    #[test]
    fn test_lea() {
        // LEA RAX, [R13+8] = 49 8D 45 08
        assert_eq!(
            assemble(|a| a.lea(Reg::Rax, Mem::base(Reg::R13, 8))),
            vec![0x49, 0x8D, 0x45, 0x08]
        );
    }

    #[test]
    fn test_sse_moves() {
        // MOVQ XMM0, RAX = 66 48 0F 6E C0
        assert_eq!(
            assemble(|a| a.movq_xr(0, Reg::Rax)),
            vec![0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        // MOVQ RAX, XMM0 = 66 48 0F 7E C0
        assert_eq!(
            assemble(|a| a.movq_rx(Reg::Rax, 0)),
            vec![0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
        // MOVD XMM1, EAX = 66 0F 6E C8
        assert_eq!(
            assemble(|a| a.movd_xr(1, Reg::Rax)),
            vec![0x66, 0x0F, 0x6E, 0xC8]
        );
        // MOVSD XMM0, [R13+8] = F2 41 0F 10 45 08
        assert_eq!(
            assemble(|a| a.movs_xm(0, Mem::base(Reg::R13, 8), true)),
            vec![0xF2, 0x41, 0x0F, 0x10, 0x45, 0x08]
        );
        // MOVUPS XMM0, [RBX] = 0F 10 03
        assert_eq!(
            assemble(|a| a.movups_xm(0, Mem::base(Reg::Rbx, 0))),
            vec![0x0F, 0x10, 0x03]
        );
        // MOVAPS XMM1, XMM2 = 0F 28 CA
        assert_eq!(assemble(|a| a.movaps_rr(1, 2)), vec![0x0F, 0x28, 0xCA]);
    }

    #[test]
    fn test_sse_arith() {
        // ADDSD XMM0, XMM1 = F2 0F 58 C1
        assert_eq!(assemble(|a| a.adds(0, 1, true)), vec![0xF2, 0x0F, 0x58, 0xC1]);
        // ADDSS XMM0, XMM1 = F3 0F 58 C1
        assert_eq!(assemble(|a| a.adds(0, 1, false)), vec![0xF3, 0x0F, 0x58, 0xC1]);
        // SQRTSD XMM2, XMM2 = F2 0F 51 D2
        assert_eq!(assemble(|a| a.sqrts(2, 2, true)), vec![0xF2, 0x0F, 0x51, 0xD2]);
        // UCOMISD XMM0, XMM1 = 66 0F 2E C1
        assert_eq!(assemble(|a| a.ucomis(0, 1, true)), vec![0x66, 0x0F, 0x2E, 0xC1]);
        // UCOMISS XMM0, XMM1 = 0F 2E C1
        assert_eq!(assemble(|a| a.ucomis(0, 1, false)), vec![0x0F, 0x2E, 0xC1]);
    }

    #[test]
    fn test_cvt() {
        // CVTSI2SD XMM0, RAX = F2 48 0F 2A C0
        assert_eq!(
            assemble(|a| a.cvtsi2s(0, Reg::Rax, true, true)),
            vec![0xF2, 0x48, 0x0F, 0x2A, 0xC0]
        );
        // CVTSI2SS XMM0, EAX = F3 0F 2A C0
        assert_eq!(
            assemble(|a| a.cvtsi2s(0, Reg::Rax, false, false)),
            vec![0xF3, 0x0F, 0x2A, 0xC0]
        );
        // CVTSS2SD XMM0, XMM1 = F3 0F 5A C1
        assert_eq!(assemble(|a| a.cvtss2sd(0, 1)), vec![0xF3, 0x0F, 0x5A, 0xC1]);
    }

    #[test]
    fn test_packed_int() {
        // PXOR XMM0, XMM0 = 66 0F EF C0
        assert_eq!(assemble(|a| a.pxor(0, 0)), vec![0x66, 0x0F, 0xEF, 0xC0]);
        // PADDD XMM0, XMM1 = 66 0F FE C1
        assert_eq!(assemble(|a| a.padd(0, 1, 2)), vec![0x66, 0x0F, 0xFE, 0xC1]);
        // PADDQ XMM0, XMM1 = 66 0F D4 C1
        assert_eq!(assemble(|a| a.padd(0, 1, 3)), vec![0x66, 0x0F, 0xD4, 0xC1]);
        // PSUBB XMM3, XMM4 = 66 0F F8 DC
        assert_eq!(assemble(|a| a.psub(3, 4, 0)), vec![0x66, 0x0F, 0xF8, 0xDC]);
    }

    #[test]
    fn test_push_pop() {
        let code = assemble(|a| {
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
        });
        assert_eq!(code, vec![0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]);
    }
}
