//! Runtime helpers callable from compiled guest code.
//!
//! Every entry has the uniform ABI `fn(ctx, a, b, c, d) -> (status,
//! value)`. A non-zero status is either an exit request or a trap kind;
//! the compiled call sites branch on it. The v128 dispatchers take
//! pointers into guest stack slots and do their lane work here rather
//! than in per-ISA encodings.

use super::context::{
    HelperIndex, HelperRet, VmContext, HELPER_COUNT,
};
use super::instance::InstanceState;
use super::trap::TrapKind;
use crate::ir::Shape;
use crate::module::PAGE_SIZE;

/// Build the function-pointer table installed into every context.
pub fn build_helper_table() -> Vec<u64> {
    let mut table = vec![0u64; HELPER_COUNT];
    let mut set = |i: HelperIndex, f: super::context::HelperFn| {
        table[i as usize] = f as usize as u64;
    };
    set(HelperIndex::MemoryGrow, helper_memory_grow);
    set(HelperIndex::MemoryInit, helper_memory_init);
    set(HelperIndex::MemoryCopy, helper_memory_copy);
    set(HelperIndex::MemoryFill, helper_memory_fill);
    set(HelperIndex::DataDrop, helper_data_drop);
    set(HelperIndex::TableGet, helper_table_get);
    set(HelperIndex::TableSet, helper_table_set);
    set(HelperIndex::TableGrow, helper_table_grow);
    set(HelperIndex::TableInit, helper_table_init);
    set(HelperIndex::TableCopy, helper_table_copy);
    set(HelperIndex::TableFill, helper_table_fill);
    set(HelperIndex::ElemDrop, helper_elem_drop);
    set(HelperIndex::HostCall, helper_host_call);
    set(HelperIndex::ITrunc, helper_itrunc);
    set(HelperIndex::FRound, helper_fround);
    set(HelperIndex::FMinMax, helper_fminmax);
    set(HelperIndex::FCopysign, helper_fcopysign);
    set(HelperIndex::IBitcnt, helper_ibitcnt);
    set(HelperIndex::U64ToF, helper_u64_to_f);
    set(HelperIndex::V128Binop, helper_v128_binop);
    set(HelperIndex::V128Unop, helper_v128_unop);
    set(HelperIndex::V128Shift, helper_v128_shift);
    set(HelperIndex::V128Splat, helper_v128_splat);
    set(HelperIndex::V128Extract, helper_v128_extract);
    set(HelperIndex::V128Replace, helper_v128_replace);
    set(HelperIndex::V128Shuffle, helper_v128_shuffle);
    set(HelperIndex::V128Swizzle, helper_v128_swizzle);
    set(HelperIndex::V128Bitselect, helper_v128_bitselect);
    set(HelperIndex::V128Load, helper_v128_load);
    set(HelperIndex::V128LoadLane, helper_v128_load_lane);
    set(HelperIndex::V128StoreLane, helper_v128_store_lane);
    set(HelperIndex::V128Reduce, helper_v128_reduce);
    table
}

unsafe fn state<'a>(ctx: *mut VmContext) -> &'a mut InstanceState {
    unsafe { &mut *((*ctx).instance as *mut InstanceState) }
}

unsafe fn mem_len(ctx: *mut VmContext) -> usize {
    unsafe { (*ctx).memory_pages as usize * PAGE_SIZE as usize }
}

unsafe fn mem_slice<'a>(ctx: *mut VmContext) -> &'a mut [u8] {
    unsafe { std::slice::from_raw_parts_mut((*ctx).memory_base, mem_len(ctx)) }
}

fn oob() -> HelperRet {
    HelperRet::trap(TrapKind::OutOfBoundsMemoryAccess as u64)
}

fn table_oob() -> HelperRet {
    HelperRet::trap(TrapKind::OutOfBoundsTableAccess as u64)
}

// ==================== memory ====================

unsafe extern "C" fn helper_memory_grow(
    ctx: *mut VmContext,
    delta: u64,
    _b: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let Some(memory) = st.memory.as_mut() else {
        return HelperRet::ok(u32::MAX as u64);
    };
    match memory.grow(delta as u32) {
        Some(old) => {
            unsafe {
                (*ctx).memory_pages = memory.pages() as u64;
            }
            HelperRet::ok(old as u64)
        }
        None => HelperRet::ok(u32::MAX as u64),
    }
}

unsafe extern "C" fn helper_memory_init(
    ctx: *mut VmContext,
    dst: u64,
    src: u64,
    len: u64,
    data_idx: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let empty = Vec::new();
    let data = st.datas[data_idx as usize].as_ref().unwrap_or(&empty);
    let (dst, src, len) = (dst as u32 as usize, src as u32 as usize, len as u32 as usize);
    if src.checked_add(len).map_or(true, |e| e > data.len()) {
        return oob();
    }
    let mem = unsafe { mem_slice(ctx) };
    if dst.checked_add(len).map_or(true, |e| e > mem.len()) {
        return oob();
    }
    mem[dst..dst + len].copy_from_slice(&data[src..src + len]);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_memory_copy(
    ctx: *mut VmContext,
    dst: u64,
    src: u64,
    len: u64,
    _d: u64,
) -> HelperRet {
    let (dst, src, len) = (dst as u32 as usize, src as u32 as usize, len as u32 as usize);
    let mem = unsafe { mem_slice(ctx) };
    if dst.checked_add(len).map_or(true, |e| e > mem.len())
        || src.checked_add(len).map_or(true, |e| e > mem.len())
    {
        return oob();
    }
    mem.copy_within(src..src + len, dst);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_memory_fill(
    ctx: *mut VmContext,
    dst: u64,
    val: u64,
    len: u64,
    _d: u64,
) -> HelperRet {
    let (dst, len) = (dst as u32 as usize, len as u32 as usize);
    let mem = unsafe { mem_slice(ctx) };
    if dst.checked_add(len).map_or(true, |e| e > mem.len()) {
        return oob();
    }
    mem[dst..dst + len].fill(val as u8);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_data_drop(
    ctx: *mut VmContext,
    data_idx: u64,
    _b: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    st.datas[data_idx as usize] = None;
    HelperRet::ok(0)
}

// ==================== tables ====================

unsafe extern "C" fn helper_table_get(
    ctx: *mut VmContext,
    idx: u64,
    table_idx: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let table = &st.tables[table_idx as usize];
    match table.get(idx as u32 as usize) {
        Some(v) => HelperRet::ok(*v),
        None => table_oob(),
    }
}

unsafe extern "C" fn helper_table_set(
    ctx: *mut VmContext,
    idx: u64,
    val: u64,
    table_idx: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let table = &mut st.tables[table_idx as usize];
    match table.get_mut(idx as u32 as usize) {
        Some(slot) => {
            *slot = val;
            HelperRet::ok(0)
        }
        None => table_oob(),
    }
}

unsafe extern "C" fn helper_table_grow(
    ctx: *mut VmContext,
    delta: u64,
    init: u64,
    table_idx: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let t = table_idx as usize;
    let old = st.tables[t].len() as u32;
    let Some(new) = old.checked_add(delta as u32) else {
        return HelperRet::ok(u32::MAX as u64);
    };
    if new > st.table_limits[t] {
        return HelperRet::ok(u32::MAX as u64);
    }
    st.tables[t].resize(new as usize, init);
    st.refresh_table_repr(t);
    HelperRet::ok(old as u64)
}

unsafe extern "C" fn helper_table_init(
    ctx: *mut VmContext,
    dst: u64,
    src: u64,
    len: u64,
    pack: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let elem_idx = (pack & 0xFFFF_FFFF) as usize;
    let table_idx = (pack >> 32) as usize;
    let (dst, src, len) = (dst as u32 as usize, src as u32 as usize, len as u32 as usize);
    let empty = Vec::new();
    let elem = st.elems[elem_idx].as_ref().unwrap_or(&empty);
    if src.checked_add(len).map_or(true, |e| e > elem.len()) {
        return table_oob();
    }
    let refs: Vec<u64> = elem[src..src + len].to_vec();
    let table = &mut st.tables[table_idx];
    if dst.checked_add(len).map_or(true, |e| e > table.len()) {
        return table_oob();
    }
    table[dst..dst + len].copy_from_slice(&refs);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_table_copy(
    ctx: *mut VmContext,
    dst: u64,
    src: u64,
    len: u64,
    pack: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let dst_t = (pack & 0xFFFF_FFFF) as usize;
    let src_t = (pack >> 32) as usize;
    let (dst, src, len) = (dst as u32 as usize, src as u32 as usize, len as u32 as usize);
    if src.checked_add(len).map_or(true, |e| e > st.tables[src_t].len())
        || dst.checked_add(len).map_or(true, |e| e > st.tables[dst_t].len())
    {
        return table_oob();
    }
    if dst_t == src_t {
        st.tables[dst_t].copy_within(src..src + len, dst);
    } else {
        let tmp: Vec<u64> = st.tables[src_t][src..src + len].to_vec();
        st.tables[dst_t][dst..dst + len].copy_from_slice(&tmp);
    }
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_table_fill(
    ctx: *mut VmContext,
    dst: u64,
    val: u64,
    len: u64,
    pack: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let table = &mut st.tables[(pack & 0xFFFF_FFFF) as usize];
    let (dst, len) = (dst as u32 as usize, len as u32 as usize);
    if dst.checked_add(len).map_or(true, |e| e > table.len()) {
        return table_oob();
    }
    table[dst..dst + len].fill(val);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_elem_drop(
    ctx: *mut VmContext,
    elem_idx: u64,
    _b: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    st.elems[elem_idx as usize] = None;
    HelperRet::ok(0)
}

// ==================== host calls ====================

unsafe extern "C" fn helper_host_call(
    ctx: *mut VmContext,
    import_idx: u64,
    frame: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let st = unsafe { state(ctx) };
    let entry = &st.host_funcs[import_idx as usize];
    let f = entry.func;
    let nparams = entry.param_slots as usize;
    let nresults = entry.result_slots as usize;
    let frame = frame as *mut u64;
    let args: Vec<u64> =
        unsafe { std::slice::from_raw_parts(frame, nparams) }.to_vec();
    let mut results = vec![0u64; nresults];

    let outcome = f(unsafe { &mut *ctx }, st, &args, &mut results);
    match outcome {
        super::instance::HostOutcome::Ok => {
            let out = unsafe { std::slice::from_raw_parts_mut(frame, nresults) };
            out.copy_from_slice(&results);
            HelperRet::ok(0)
        }
        super::instance::HostOutcome::Exit => HelperRet::exit(),
        super::instance::HostOutcome::Trap(kind) => HelperRet::trap(kind as u64),
    }
}

// ==================== scalar float / integer helpers ====================

unsafe extern "C" fn helper_itrunc(
    _ctx: *mut VmContext,
    bits: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let from_double = pack & 1 != 0;
    let to64 = pack & 2 != 0;
    let signed = pack & 4 != 0;
    let sat = pack & 8 != 0;

    let v = if from_double {
        f64::from_bits(bits)
    } else {
        f32::from_bits(bits as u32) as f64
    };
    // The f32 → f64 widening above is exact, so range checks in f64 are
    // faithful for both source widths.
    if v.is_nan() {
        if sat {
            return HelperRet::ok(0);
        }
        return HelperRet::trap(TrapKind::InvalidConversionToInteger as u64);
    }
    let result = match (to64, signed) {
        (false, true) => {
            if sat {
                v as i32 as u32 as u64
            } else if v > -2147483649.0 && v < 2147483648.0 {
                v as i32 as u32 as u64
            } else {
                return HelperRet::trap(TrapKind::IntegerOverflow as u64);
            }
        }
        (false, false) => {
            if sat {
                v as u32 as u64
            } else if v > -1.0 && v < 4294967296.0 {
                v as u32 as u64
            } else {
                return HelperRet::trap(TrapKind::IntegerOverflow as u64);
            }
        }
        (true, true) => {
            if sat {
                v as i64 as u64
            } else if v >= -9223372036854775808.0 && v < 9223372036854775808.0 {
                v as i64 as u64
            } else {
                return HelperRet::trap(TrapKind::IntegerOverflow as u64);
            }
        }
        (true, false) => {
            if sat {
                v as u64
            } else if v > -1.0 && v < 18446744073709551616.0 {
                v as u64
            } else {
                return HelperRet::trap(TrapKind::IntegerOverflow as u64);
            }
        }
    };
    HelperRet::ok(result)
}

unsafe extern "C" fn helper_fround(
    _ctx: *mut VmContext,
    bits: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let mode = pack & 3;
    let double = pack & 4 != 0;
    let out = if double {
        let v = f64::from_bits(bits);
        let r = match mode {
            0 => v.ceil(),
            1 => v.floor(),
            2 => v.trunc(),
            _ => round_ties_even_f64(v),
        };
        r.to_bits()
    } else {
        let v = f32::from_bits(bits as u32);
        let r = match mode {
            0 => v.ceil(),
            1 => v.floor(),
            2 => v.trunc(),
            _ => round_ties_even_f32(v),
        };
        r.to_bits() as u64
    };
    HelperRet::ok(out)
}

fn round_ties_even_f64(v: f64) -> f64 {
    let r = v.round();
    let out = if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - v).signum()
    } else {
        r
    };
    // Rounding into zero keeps the operand's sign.
    if out == 0.0 {
        out.copysign(v)
    } else {
        out
    }
}

fn round_ties_even_f32(v: f32) -> f32 {
    let r = v.round();
    let out = if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - v).signum()
    } else {
        r
    };
    if out == 0.0 {
        out.copysign(v)
    } else {
        out
    }
}

pub(crate) fn wasm_fmin_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        // min(-0, +0) is -0.
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else if a < b {
        a
    } else {
        b
    }
}

pub(crate) fn wasm_fmax_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else if a > b {
        a
    } else {
        b
    }
}

pub(crate) fn wasm_fmin_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else if a < b {
        a
    } else {
        b
    }
}

pub(crate) fn wasm_fmax_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else if a > b {
        a
    } else {
        b
    }
}

unsafe extern "C" fn helper_fminmax(
    _ctx: *mut VmContext,
    a: u64,
    b: u64,
    pack: u64,
    _d: u64,
) -> HelperRet {
    let is_max = pack & 1 != 0;
    let double = pack & 2 != 0;
    let out = if double {
        let (x, y) = (f64::from_bits(a), f64::from_bits(b));
        if is_max {
            wasm_fmax_f64(x, y).to_bits()
        } else {
            wasm_fmin_f64(x, y).to_bits()
        }
    } else {
        let (x, y) = (f32::from_bits(a as u32), f32::from_bits(b as u32));
        let r = if is_max {
            wasm_fmax_f32(x, y)
        } else {
            wasm_fmin_f32(x, y)
        };
        r.to_bits() as u64
    };
    HelperRet::ok(out)
}

unsafe extern "C" fn helper_fcopysign(
    _ctx: *mut VmContext,
    a: u64,
    b: u64,
    double: u64,
    _d: u64,
) -> HelperRet {
    let out = if double != 0 {
        f64::from_bits(a).copysign(f64::from_bits(b)).to_bits()
    } else {
        f32::from_bits(a as u32)
            .copysign(f32::from_bits(b as u32))
            .to_bits() as u64
    };
    HelperRet::ok(out)
}

unsafe extern "C" fn helper_ibitcnt(
    _ctx: *mut VmContext,
    v: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let op = pack & 3;
    let w64 = pack & 4 != 0;
    let out = if w64 {
        match op {
            0 => v.leading_zeros() as u64,
            1 => v.trailing_zeros() as u64,
            _ => v.count_ones() as u64,
        }
    } else {
        let v = v as u32;
        match op {
            0 => v.leading_zeros() as u64,
            1 => v.trailing_zeros() as u64,
            _ => v.count_ones() as u64,
        }
    };
    HelperRet::ok(out)
}

unsafe extern "C" fn helper_u64_to_f(
    _ctx: *mut VmContext,
    v: u64,
    double: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let out = if double != 0 {
        (v as f64).to_bits()
    } else {
        (v as f32).to_bits() as u64
    };
    HelperRet::ok(out)
}

// ==================== v128 lane plumbing ====================

unsafe fn read_v128(ptr: u64) -> [u8; 16] {
    unsafe { std::ptr::read_unaligned(ptr as *const [u8; 16]) }
}

unsafe fn write_v128(ptr: u64, v: [u8; 16]) {
    unsafe { std::ptr::write_unaligned(ptr as *mut [u8; 16], v) }
}

macro_rules! lane_ops {
    ($read:ident, $write:ident, $map2:ident, $map1:ident, $ty:ty, $n:expr) => {
        fn $read(v: &[u8; 16]) -> [$ty; $n] {
            let mut out = [0 as $ty; $n];
            let size = 16 / $n;
            for (i, lane) in out.iter_mut().enumerate() {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&v[i * size..(i + 1) * size]);
                *lane = <$ty>::from_le_bytes(buf);
            }
            out
        }

        fn $write(lanes: [$ty; $n]) -> [u8; 16] {
            let mut out = [0u8; 16];
            let size = 16 / $n;
            for (i, lane) in lanes.iter().enumerate() {
                out[i * size..(i + 1) * size].copy_from_slice(&lane.to_le_bytes());
            }
            out
        }

        fn $map2(a: &[u8; 16], b: &[u8; 16], f: impl Fn($ty, $ty) -> $ty) -> [u8; 16] {
            let (la, lb) = ($read(a), $read(b));
            let mut out = [0 as $ty; $n];
            for i in 0..$n {
                out[i] = f(la[i], lb[i]);
            }
            $write(out)
        }

        fn $map1(a: &[u8; 16], f: impl Fn($ty) -> $ty) -> [u8; 16] {
            let la = $read(a);
            let mut out = [0 as $ty; $n];
            for i in 0..$n {
                out[i] = f(la[i]);
            }
            $write(out)
        }
    };
}

lane_ops!(read_u8x16, write_u8x16, map2_u8, map1_u8, u8, 16);
lane_ops!(read_u16x8, write_u16x8, map2_u16, map1_u16, u16, 8);
lane_ops!(read_u32x4, write_u32x4, map2_u32, map1_u32, u32, 4);
lane_ops!(read_u64x2, write_u64x2, map2_u64, map1_u64, u64, 2);
lane_ops!(read_f32x4, write_f32x4, map2_f32, map1_f32, f32, 4);
lane_ops!(read_f64x2, write_f64x2, map2_f64, map1_f64, f64, 2);

fn bool_lane_u8(c: bool) -> u8 {
    if c {
        0xFF
    } else {
        0
    }
}

fn bool_lane_u16(c: bool) -> u16 {
    if c {
        0xFFFF
    } else {
        0
    }
}

fn bool_lane_u32(c: bool) -> u32 {
    if c {
        u32::MAX
    } else {
        0
    }
}

fn bool_lane_u64(c: bool) -> u64 {
    if c {
        u64::MAX
    } else {
        0
    }
}

// ==================== v128 dispatchers ====================

unsafe extern "C" fn helper_v128_binop(
    _ctx: *mut VmContext,
    dst: u64,
    b_ptr: u64,
    pack: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let b = unsafe { read_v128(b_ptr) };
    let code = pack & 0xFF;
    let shape = Shape::from_u8(((pack >> 8) & 0xFF) as u8);
    let aux = ((pack >> 16) & 0xFF) as u8;
    let signed = (pack >> 24) & 0xFF != 0;
    let out = v128_binop(code, shape, aux, signed, &a, &b);
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

fn v128_binop(code: u64, shape: Shape, aux: u8, signed: bool, a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    match code {
        // add
        0 => match shape {
            Shape::I8x16 => map2_u8(a, b, |x, y| x.wrapping_add(y)),
            Shape::I16x8 => map2_u16(a, b, |x, y| x.wrapping_add(y)),
            Shape::I32x4 => map2_u32(a, b, |x, y| x.wrapping_add(y)),
            Shape::I64x2 => map2_u64(a, b, |x, y| x.wrapping_add(y)),
            Shape::F32x4 => map2_f32(a, b, |x, y| x + y),
            Shape::F64x2 => map2_f64(a, b, |x, y| x + y),
        },
        // sub
        1 => match shape {
            Shape::I8x16 => map2_u8(a, b, |x, y| x.wrapping_sub(y)),
            Shape::I16x8 => map2_u16(a, b, |x, y| x.wrapping_sub(y)),
            Shape::I32x4 => map2_u32(a, b, |x, y| x.wrapping_sub(y)),
            Shape::I64x2 => map2_u64(a, b, |x, y| x.wrapping_sub(y)),
            Shape::F32x4 => map2_f32(a, b, |x, y| x - y),
            Shape::F64x2 => map2_f64(a, b, |x, y| x - y),
        },
        // mul
        2 => match shape {
            Shape::I16x8 => map2_u16(a, b, |x, y| x.wrapping_mul(y)),
            Shape::I32x4 => map2_u32(a, b, |x, y| x.wrapping_mul(y)),
            Shape::I64x2 => map2_u64(a, b, |x, y| x.wrapping_mul(y)),
            Shape::F32x4 => map2_f32(a, b, |x, y| x * y),
            Shape::F64x2 => map2_f64(a, b, |x, y| x * y),
            Shape::I8x16 => map2_u8(a, b, |x, y| x.wrapping_mul(y)),
        },
        // div (floats only)
        3 => match shape {
            Shape::F32x4 => map2_f32(a, b, |x, y| x / y),
            _ => map2_f64(a, b, |x, y| x / y),
        },
        // add_sat
        4 => match (shape, signed) {
            (Shape::I8x16, true) => {
                map2_u8(a, b, |x, y| (x as i8).saturating_add(y as i8) as u8)
            }
            (Shape::I8x16, false) => map2_u8(a, b, |x, y| x.saturating_add(y)),
            (Shape::I16x8, true) => {
                map2_u16(a, b, |x, y| (x as i16).saturating_add(y as i16) as u16)
            }
            _ => map2_u16(a, b, |x, y| x.saturating_add(y)),
        },
        // sub_sat
        5 => match (shape, signed) {
            (Shape::I8x16, true) => {
                map2_u8(a, b, |x, y| (x as i8).saturating_sub(y as i8) as u8)
            }
            (Shape::I8x16, false) => map2_u8(a, b, |x, y| x.saturating_sub(y)),
            (Shape::I16x8, true) => {
                map2_u16(a, b, |x, y| (x as i16).saturating_sub(y as i16) as u16)
            }
            _ => map2_u16(a, b, |x, y| x.saturating_sub(y)),
        },
        // min
        6 => match (shape, signed) {
            (Shape::I8x16, true) => map2_u8(a, b, |x, y| (x as i8).min(y as i8) as u8),
            (Shape::I8x16, false) => map2_u8(a, b, |x, y| x.min(y)),
            (Shape::I16x8, true) => map2_u16(a, b, |x, y| (x as i16).min(y as i16) as u16),
            (Shape::I16x8, false) => map2_u16(a, b, |x, y| x.min(y)),
            (Shape::I32x4, true) => map2_u32(a, b, |x, y| (x as i32).min(y as i32) as u32),
            (Shape::I32x4, false) => map2_u32(a, b, |x, y| x.min(y)),
            (Shape::F32x4, _) => map2_f32(a, b, wasm_fmin_f32),
            (Shape::F64x2, _) => map2_f64(a, b, wasm_fmin_f64),
            _ => map2_u64(a, b, |x, y| (x as i64).min(y as i64) as u64),
        },
        // max
        7 => match (shape, signed) {
            (Shape::I8x16, true) => map2_u8(a, b, |x, y| (x as i8).max(y as i8) as u8),
            (Shape::I8x16, false) => map2_u8(a, b, |x, y| x.max(y)),
            (Shape::I16x8, true) => map2_u16(a, b, |x, y| (x as i16).max(y as i16) as u16),
            (Shape::I16x8, false) => map2_u16(a, b, |x, y| x.max(y)),
            (Shape::I32x4, true) => map2_u32(a, b, |x, y| (x as i32).max(y as i32) as u32),
            (Shape::I32x4, false) => map2_u32(a, b, |x, y| x.max(y)),
            (Shape::F32x4, _) => map2_f32(a, b, wasm_fmax_f32),
            (Shape::F64x2, _) => map2_f64(a, b, wasm_fmax_f64),
            _ => map2_u64(a, b, |x, y| (x as i64).max(y as i64) as u64),
        },
        // avgr_u
        8 => match shape {
            Shape::I8x16 => map2_u8(a, b, |x, y| ((x as u16 + y as u16 + 1) / 2) as u8),
            _ => map2_u16(a, b, |x, y| ((x as u32 + y as u32 + 1) / 2) as u16),
        },
        // pmin: b < a ? b : a
        9 => match shape {
            Shape::F32x4 => map2_f32(a, b, |x, y| if y < x { y } else { x }),
            _ => map2_f64(a, b, |x, y| if y < x { y } else { x }),
        },
        // pmax: a < b ? b : a
        10 => match shape {
            Shape::F32x4 => map2_f32(a, b, |x, y| if x < y { y } else { x }),
            _ => map2_f64(a, b, |x, y| if x < y { y } else { x }),
        },
        // cmp
        11 => v128_cmp(shape, aux, signed, a, b),
        // extmul (aux = low flag)
        12 => v128_extmul(shape, aux != 0, signed, a, b),
        // q15mulr_sat_s
        13 => map2_u16(a, b, |x, y| {
            let prod = (x as i16 as i32) * (y as i16 as i32);
            (((prod + 0x4000) >> 15).clamp(i16::MIN as i32, i16::MAX as i32)) as i16 as u16
        }),
        // dot_i16x8_s
        14 => {
            let la = read_u16x8(a);
            let lb = read_u16x8(b);
            let mut out = [0u32; 4];
            for i in 0..4 {
                let p0 = (la[2 * i] as i16 as i32) * (lb[2 * i] as i16 as i32);
                let p1 = (la[2 * i + 1] as i16 as i32) * (lb[2 * i + 1] as i16 as i32);
                out[i] = p0.wrapping_add(p1) as u32;
            }
            write_u32x4(out)
        }
        // narrow (shape is the origin)
        15 => v128_narrow(shape, signed, a, b),
        _ => *a,
    }
}

fn v128_cmp(shape: Shape, kind: u8, signed: bool, a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    use crate::ir::V128CmpKind as K;
    let kind = K::from_u8(kind);
    macro_rules! icmp {
        ($map:ident, $bool:ident, $s:ty, $u:ty) => {
            $map(a, b, |x, y| {
                let c = if signed {
                    let (x, y) = (x as $s, y as $s);
                    match kind {
                        K::Eq => x == y,
                        K::Ne => x != y,
                        K::Lt => x < y,
                        K::Gt => x > y,
                        K::Le => x <= y,
                        K::Ge => x >= y,
                    }
                } else {
                    let (x, y) = (x as $u, y as $u);
                    match kind {
                        K::Eq => x == y,
                        K::Ne => x != y,
                        K::Lt => x < y,
                        K::Gt => x > y,
                        K::Le => x <= y,
                        K::Ge => x >= y,
                    }
                };
                $bool(c)
            })
        };
    }
    match shape {
        Shape::I8x16 => icmp!(map2_u8, bool_lane_u8, i8, u8),
        Shape::I16x8 => icmp!(map2_u16, bool_lane_u16, i16, u16),
        Shape::I32x4 => icmp!(map2_u32, bool_lane_u32, i32, u32),
        Shape::I64x2 => icmp!(map2_u64, bool_lane_u64, i64, u64),
        Shape::F32x4 => {
            let (la, lb) = (read_f32x4(a), read_f32x4(b));
            let mut out = [0u32; 4];
            for i in 0..4 {
                let c = match kind {
                    K::Eq => la[i] == lb[i],
                    K::Ne => la[i] != lb[i],
                    K::Lt => la[i] < lb[i],
                    K::Gt => la[i] > lb[i],
                    K::Le => la[i] <= lb[i],
                    K::Ge => la[i] >= lb[i],
                };
                out[i] = bool_lane_u32(c);
            }
            write_u32x4(out)
        }
        Shape::F64x2 => {
            let (la, lb) = (read_f64x2(a), read_f64x2(b));
            let mut out = [0u64; 2];
            for i in 0..2 {
                let c = match kind {
                    K::Eq => la[i] == lb[i],
                    K::Ne => la[i] != lb[i],
                    K::Lt => la[i] < lb[i],
                    K::Gt => la[i] > lb[i],
                    K::Le => la[i] <= lb[i],
                    K::Ge => la[i] >= lb[i],
                };
                out[i] = bool_lane_u64(c);
            }
            write_u64x2(out)
        }
    }
}

fn v128_extmul(origin: Shape, low: bool, signed: bool, a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    match origin {
        Shape::I8x16 => {
            let (la, lb) = (read_u8x16(a), read_u8x16(b));
            let base = if low { 0 } else { 8 };
            let mut out = [0u16; 8];
            for i in 0..8 {
                let (x, y) = (la[base + i], lb[base + i]);
                out[i] = if signed {
                    ((x as i8 as i16).wrapping_mul(y as i8 as i16)) as u16
                } else {
                    (x as u16).wrapping_mul(y as u16)
                };
            }
            write_u16x8(out)
        }
        Shape::I16x8 => {
            let (la, lb) = (read_u16x8(a), read_u16x8(b));
            let base = if low { 0 } else { 4 };
            let mut out = [0u32; 4];
            for i in 0..4 {
                let (x, y) = (la[base + i], lb[base + i]);
                out[i] = if signed {
                    ((x as i16 as i32).wrapping_mul(y as i16 as i32)) as u32
                } else {
                    (x as u32).wrapping_mul(y as u32)
                };
            }
            write_u32x4(out)
        }
        _ => {
            let (la, lb) = (read_u32x4(a), read_u32x4(b));
            let base = if low { 0 } else { 2 };
            let mut out = [0u64; 2];
            for i in 0..2 {
                let (x, y) = (la[base + i], lb[base + i]);
                out[i] = if signed {
                    ((x as i32 as i64).wrapping_mul(y as i32 as i64)) as u64
                } else {
                    (x as u64).wrapping_mul(y as u64)
                };
            }
            write_u64x2(out)
        }
    }
}

fn v128_narrow(origin: Shape, signed: bool, a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    match origin {
        Shape::I16x8 => {
            let (la, lb) = (read_u16x8(a), read_u16x8(b));
            let mut out = [0u8; 16];
            for i in 0..8 {
                let x = la[i] as i16;
                out[i] = if signed {
                    x.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8
                } else {
                    x.clamp(0, u8::MAX as i16) as u8
                };
            }
            for i in 0..8 {
                let x = lb[i] as i16;
                out[8 + i] = if signed {
                    x.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8
                } else {
                    x.clamp(0, u8::MAX as i16) as u8
                };
            }
            out
        }
        _ => {
            let (la, lb) = (read_u32x4(a), read_u32x4(b));
            let mut out = [0u16; 8];
            for i in 0..4 {
                let x = la[i] as i32;
                out[i] = if signed {
                    x.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16
                } else {
                    x.clamp(0, u16::MAX as i32) as u16
                };
            }
            for i in 0..4 {
                let x = lb[i] as i32;
                out[4 + i] = if signed {
                    x.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16
                } else {
                    x.clamp(0, u16::MAX as i32) as u16
                };
            }
            write_u16x8(out)
        }
    }
}

unsafe extern "C" fn helper_v128_unop(
    _ctx: *mut VmContext,
    dst: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let code = pack & 0xFF;
    let shape = Shape::from_u8(((pack >> 8) & 0xFF) as u8);
    let aux = ((pack >> 16) & 0xFF) as u8;
    let signed = (pack >> 24) & 0xFF != 0;
    let out = v128_unop(code, shape, aux, signed, &a);
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

fn v128_unop(code: u64, shape: Shape, aux: u8, signed: bool, a: &[u8; 16]) -> [u8; 16] {
    match code {
        // neg
        0 => match shape {
            Shape::I8x16 => map1_u8(a, |x| (x as i8).wrapping_neg() as u8),
            Shape::I16x8 => map1_u16(a, |x| (x as i16).wrapping_neg() as u16),
            Shape::I32x4 => map1_u32(a, |x| (x as i32).wrapping_neg() as u32),
            Shape::I64x2 => map1_u64(a, |x| (x as i64).wrapping_neg() as u64),
            Shape::F32x4 => map1_f32(a, |x| -x),
            Shape::F64x2 => map1_f64(a, |x| -x),
        },
        // abs
        1 => match shape {
            Shape::I8x16 => map1_u8(a, |x| (x as i8).wrapping_abs() as u8),
            Shape::I16x8 => map1_u16(a, |x| (x as i16).wrapping_abs() as u16),
            Shape::I32x4 => map1_u32(a, |x| (x as i32).wrapping_abs() as u32),
            Shape::I64x2 => map1_u64(a, |x| (x as i64).wrapping_abs() as u64),
            Shape::F32x4 => map1_f32(a, f32::abs),
            Shape::F64x2 => map1_f64(a, f64::abs),
        },
        // sqrt
        2 => match shape {
            Shape::F32x4 => map1_f32(a, f32::sqrt),
            _ => map1_f64(a, f64::sqrt),
        },
        // popcnt (i8x16 only)
        3 => map1_u8(a, |x| x.count_ones() as u8),
        // ceil / floor / trunc / nearest
        4 => match shape {
            Shape::F32x4 => map1_f32(a, f32::ceil),
            _ => map1_f64(a, f64::ceil),
        },
        5 => match shape {
            Shape::F32x4 => map1_f32(a, f32::floor),
            _ => map1_f64(a, f64::floor),
        },
        6 => match shape {
            Shape::F32x4 => map1_f32(a, f32::trunc),
            _ => map1_f64(a, f64::trunc),
        },
        7 => match shape {
            Shape::F32x4 => map1_f32(a, round_ties_even_f32),
            _ => map1_f64(a, round_ties_even_f64),
        },
        // extend (shape = origin, aux = low flag)
        8 => v128_extend(shape, aux != 0, signed, a),
        // extadd_pairwise (shape = origin)
        9 => match shape {
            Shape::I8x16 => {
                let la = read_u8x16(a);
                let mut out = [0u16; 8];
                for i in 0..8 {
                    let (x, y) = (la[2 * i], la[2 * i + 1]);
                    out[i] = if signed {
                        ((x as i8 as i16) + (y as i8 as i16)) as u16
                    } else {
                        x as u16 + y as u16
                    };
                }
                write_u16x8(out)
            }
            _ => {
                let la = read_u16x8(a);
                let mut out = [0u32; 4];
                for i in 0..4 {
                    let (x, y) = (la[2 * i], la[2 * i + 1]);
                    out[i] = if signed {
                        ((x as i16 as i32) + (y as i16 as i32)) as u32
                    } else {
                        x as u32 + y as u32
                    };
                }
                write_u32x4(out)
            }
        },
        // f64x2.promote_low_f32x4
        10 => {
            let la = read_f32x4(a);
            write_f64x2([la[0] as f64, la[1] as f64])
        }
        // f32x4.demote_f64x2_zero
        11 => {
            let la = read_f64x2(a);
            write_f32x4([la[0] as f32, la[1] as f32, 0.0, 0.0])
        }
        // fconvert (shape = destination)
        12 => match shape {
            Shape::F32x4 => {
                let la = read_u32x4(a);
                let mut out = [0f32; 4];
                for i in 0..4 {
                    out[i] = if signed {
                        la[i] as i32 as f32
                    } else {
                        la[i] as f32
                    };
                }
                write_f32x4(out)
            }
            _ => {
                let la = read_u32x4(a);
                let mut out = [0f64; 2];
                for i in 0..2 {
                    out[i] = if signed {
                        la[i] as i32 as f64
                    } else {
                        la[i] as f64
                    };
                }
                write_f64x2(out)
            }
        },
        // itruncsat (shape = origin float shape)
        13 => match shape {
            Shape::F32x4 => {
                let la = read_f32x4(a);
                let mut out = [0u32; 4];
                for i in 0..4 {
                    out[i] = if signed {
                        la[i] as i32 as u32
                    } else {
                        la[i] as u32
                    };
                }
                write_u32x4(out)
            }
            _ => {
                let la = read_f64x2(a);
                let mut out = [0u32; 4];
                for i in 0..2 {
                    out[i] = if signed {
                        la[i] as i32 as u32
                    } else {
                        la[i] as u32
                    };
                }
                write_u32x4(out)
            }
        },
        _ => *a,
    }
}

fn v128_extend(origin: Shape, low: bool, signed: bool, a: &[u8; 16]) -> [u8; 16] {
    match origin {
        Shape::I8x16 => {
            let la = read_u8x16(a);
            let base = if low { 0 } else { 8 };
            let mut out = [0u16; 8];
            for i in 0..8 {
                out[i] = if signed {
                    la[base + i] as i8 as i16 as u16
                } else {
                    la[base + i] as u16
                };
            }
            write_u16x8(out)
        }
        Shape::I16x8 => {
            let la = read_u16x8(a);
            let base = if low { 0 } else { 4 };
            let mut out = [0u32; 4];
            for i in 0..4 {
                out[i] = if signed {
                    la[base + i] as i16 as i32 as u32
                } else {
                    la[base + i] as u32
                };
            }
            write_u32x4(out)
        }
        _ => {
            let la = read_u32x4(a);
            let base = if low { 0 } else { 2 };
            let mut out = [0u64; 2];
            for i in 0..2 {
                out[i] = if signed {
                    la[base + i] as i32 as i64 as u64
                } else {
                    la[base + i] as u64
                };
            }
            write_u64x2(out)
        }
    }
}

unsafe extern "C" fn helper_v128_shift(
    _ctx: *mut VmContext,
    dst: u64,
    count: u64,
    pack: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let shape = Shape::from_u8((pack & 0xFF) as u8);
    let signed = pack & 0x100 != 0;
    let is_shl = pack & 0x200 != 0;
    let bits = shape.lane_bytes() as u32 * 8;
    let n = (count as u32) % bits;
    let out = match shape {
        Shape::I8x16 => map1_u8(&a, |x| {
            if is_shl {
                x.wrapping_shl(n)
            } else if signed {
                ((x as i8).wrapping_shr(n)) as u8
            } else {
                x.wrapping_shr(n)
            }
        }),
        Shape::I16x8 => map1_u16(&a, |x| {
            if is_shl {
                x.wrapping_shl(n)
            } else if signed {
                ((x as i16).wrapping_shr(n)) as u16
            } else {
                x.wrapping_shr(n)
            }
        }),
        Shape::I32x4 => map1_u32(&a, |x| {
            if is_shl {
                x.wrapping_shl(n)
            } else if signed {
                ((x as i32).wrapping_shr(n)) as u32
            } else {
                x.wrapping_shr(n)
            }
        }),
        _ => map1_u64(&a, |x| {
            if is_shl {
                x.wrapping_shl(n)
            } else if signed {
                ((x as i64).wrapping_shr(n)) as u64
            } else {
                x.wrapping_shr(n)
            }
        }),
    };
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_splat(
    _ctx: *mut VmContext,
    dst: u64,
    bits: u64,
    shape: u64,
    _d: u64,
) -> HelperRet {
    let shape = Shape::from_u8(shape as u8);
    let out = match shape {
        Shape::I8x16 => [bits as u8; 16],
        Shape::I16x8 => write_u16x8([bits as u16; 8]),
        Shape::I32x4 | Shape::F32x4 => write_u32x4([bits as u32; 4]),
        Shape::I64x2 | Shape::F64x2 => write_u64x2([bits; 2]),
    };
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_extract(
    _ctx: *mut VmContext,
    a_ptr: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(a_ptr) };
    let shape = Shape::from_u8((pack & 0xFF) as u8);
    let lane = ((pack >> 8) & 0xFF) as usize;
    let signed = pack & 0x1_0000 != 0;
    let value = match shape {
        Shape::I8x16 => {
            let v = read_u8x16(&a)[lane];
            if signed {
                v as i8 as i32 as u32 as u64
            } else {
                v as u64
            }
        }
        Shape::I16x8 => {
            let v = read_u16x8(&a)[lane];
            if signed {
                v as i16 as i32 as u32 as u64
            } else {
                v as u64
            }
        }
        Shape::I32x4 | Shape::F32x4 => read_u32x4(&a)[lane] as u64,
        Shape::I64x2 | Shape::F64x2 => read_u64x2(&a)[lane],
    };
    HelperRet::ok(value)
}

unsafe extern "C" fn helper_v128_replace(
    _ctx: *mut VmContext,
    dst: u64,
    bits: u64,
    pack: u64,
    _d: u64,
) -> HelperRet {
    let mut a = unsafe { read_v128(dst) };
    let shape = Shape::from_u8((pack & 0xFF) as u8);
    let lane = ((pack >> 8) & 0xFF) as usize;
    let size = shape.lane_bytes() as usize;
    a[lane * size..(lane + 1) * size].copy_from_slice(&bits.to_le_bytes()[..size]);
    unsafe { write_v128(dst, a) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_shuffle(
    _ctx: *mut VmContext,
    dst: u64,
    b_ptr: u64,
    mask_lo: u64,
    mask_hi: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let b = unsafe { read_v128(b_ptr) };
    let mut mask = [0u8; 16];
    mask[..8].copy_from_slice(&mask_lo.to_le_bytes());
    mask[8..].copy_from_slice(&mask_hi.to_le_bytes());
    let mut out = [0u8; 16];
    for (i, m) in mask.iter().enumerate() {
        let m = *m as usize;
        out[i] = if m < 16 { a[m] } else { b[m - 16] };
    }
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_swizzle(
    _ctx: *mut VmContext,
    dst: u64,
    b_ptr: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let idx = unsafe { read_v128(b_ptr) };
    let mut out = [0u8; 16];
    for i in 0..16 {
        let j = idx[i] as usize;
        out[i] = if j < 16 { a[j] } else { 0 };
    }
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_bitselect(
    _ctx: *mut VmContext,
    dst: u64,
    b_ptr: u64,
    c_ptr: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(dst) };
    let b = unsafe { read_v128(b_ptr) };
    let c = unsafe { read_v128(c_ptr) };
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = (a[i] & c[i]) | (b[i] & !c[i]);
    }
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_load(
    ctx: *mut VmContext,
    dst: u64,
    index: u64,
    pack: u64,
    _d: u64,
) -> HelperRet {
    use crate::ir::V128LoadKind as K;
    let offset = pack as u32 as u64;
    let kind = K::from_u8(((pack >> 32) & 0xFF) as u8);
    let signed = (pack >> 40) & 1 != 0;
    let addr = (index as u32 as u64 + offset) as usize;
    let need = match kind {
        K::Full => 16,
        K::Ext8x8 | K::Ext16x4 | K::Ext32x2 | K::Splat64 | K::Zero64 => 8,
        K::Splat32 | K::Zero32 => 4,
        K::Splat16 => 2,
        K::Splat8 => 1,
    };
    let mem = unsafe { mem_slice(ctx) };
    if addr.checked_add(need).map_or(true, |e| e > mem.len()) {
        return oob();
    }
    let bytes = &mem[addr..addr + need];
    let mut out = [0u8; 16];
    match kind {
        K::Full => out.copy_from_slice(bytes),
        K::Ext8x8 => {
            let mut lanes = [0u16; 8];
            for i in 0..8 {
                lanes[i] = if signed {
                    bytes[i] as i8 as i16 as u16
                } else {
                    bytes[i] as u16
                };
            }
            out = write_u16x8(lanes);
        }
        K::Ext16x4 => {
            let mut lanes = [0u32; 4];
            for i in 0..4 {
                let v = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
                lanes[i] = if signed {
                    v as i16 as i32 as u32
                } else {
                    v as u32
                };
            }
            out = write_u32x4(lanes);
        }
        K::Ext32x2 => {
            let mut lanes = [0u64; 2];
            for i in 0..2 {
                let v = u32::from_le_bytes([
                    bytes[4 * i],
                    bytes[4 * i + 1],
                    bytes[4 * i + 2],
                    bytes[4 * i + 3],
                ]);
                lanes[i] = if signed {
                    v as i32 as i64 as u64
                } else {
                    v as u64
                };
            }
            out = write_u64x2(lanes);
        }
        K::Splat8 => out = [bytes[0]; 16],
        K::Splat16 => {
            let v = u16::from_le_bytes([bytes[0], bytes[1]]);
            out = write_u16x8([v; 8]);
        }
        K::Splat32 => {
            let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            out = write_u32x4([v; 4]);
        }
        K::Splat64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            out = write_u64x2([u64::from_le_bytes(buf); 2]);
        }
        K::Zero32 => {
            out[..4].copy_from_slice(bytes);
        }
        K::Zero64 => {
            out[..8].copy_from_slice(bytes);
        }
    }
    unsafe { write_v128(dst, out) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_load_lane(
    ctx: *mut VmContext,
    dst: u64,
    v_ptr: u64,
    index_and_pack: u64,
    pack: u64,
) -> HelperRet {
    let mut v = unsafe { read_v128(v_ptr) };
    let offset = pack as u32 as u64;
    let lane_log2 = ((pack >> 32) & 0xFF) as u32;
    let lane = ((pack >> 40) & 0xFF) as usize;
    let size = 1usize << lane_log2;
    let addr = (index_and_pack as u32 as u64 + offset) as usize;
    let mem = unsafe { mem_slice(ctx) };
    if addr.checked_add(size).map_or(true, |e| e > mem.len()) {
        return oob();
    }
    v[lane * size..(lane + 1) * size].copy_from_slice(&mem[addr..addr + size]);
    unsafe { write_v128(dst, v) };
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_store_lane(
    ctx: *mut VmContext,
    _dst: u64,
    v_ptr: u64,
    index: u64,
    pack: u64,
) -> HelperRet {
    let v = unsafe { read_v128(v_ptr) };
    let offset = pack as u32 as u64;
    let lane_log2 = ((pack >> 32) & 0xFF) as u32;
    let lane = ((pack >> 40) & 0xFF) as usize;
    let size = 1usize << lane_log2;
    let addr = (index as u32 as u64 + offset) as usize;
    let mem = unsafe { mem_slice(ctx) };
    if addr.checked_add(size).map_or(true, |e| e > mem.len()) {
        return oob();
    }
    mem[addr..addr + size].copy_from_slice(&v[lane * size..(lane + 1) * size]);
    HelperRet::ok(0)
}

unsafe extern "C" fn helper_v128_reduce(
    _ctx: *mut VmContext,
    a_ptr: u64,
    pack: u64,
    _c: u64,
    _d: u64,
) -> HelperRet {
    let a = unsafe { read_v128(a_ptr) };
    let op = pack & 0xFF;
    let shape = Shape::from_u8(((pack >> 8) & 0xFF) as u8);
    let value = match op {
        // any_true
        0 => (a.iter().any(|b| *b != 0)) as u64,
        // all_true
        1 => match shape {
            Shape::I8x16 => read_u8x16(&a).iter().all(|l| *l != 0) as u64,
            Shape::I16x8 => read_u16x8(&a).iter().all(|l| *l != 0) as u64,
            Shape::I32x4 => read_u32x4(&a).iter().all(|l| *l != 0) as u64,
            _ => read_u64x2(&a).iter().all(|l| *l != 0) as u64,
        },
        // bitmask: one bit per lane sign
        _ => match shape {
            Shape::I8x16 => {
                let lanes = read_u8x16(&a);
                lanes
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, l)| acc | ((((*l >> 7) & 1) as u64) << i))
            }
            Shape::I16x8 => {
                let lanes = read_u16x8(&a);
                lanes
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, l)| acc | ((((*l >> 15) & 1) as u64) << i))
            }
            Shape::I32x4 => {
                let lanes = read_u32x4(&a);
                lanes
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, l)| acc | ((((*l >> 31) & 1) as u64) << i))
            }
            _ => {
                let lanes = read_u64x2(&a);
                lanes
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, l)| acc | ((((*l >> 63) & 1) as u64) << i))
            }
        },
    };
    HelperRet::ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasm_min_max_nan_and_zero() {
        assert!(wasm_fmin_f64(f64::NAN, 1.0).is_nan());
        assert!(wasm_fmax_f64(1.0, f64::NAN).is_nan());
        assert!(wasm_fmin_f64(-0.0, 0.0).is_sign_negative());
        assert!(wasm_fmax_f64(-0.0, 0.0).is_sign_positive());
        assert_eq!(wasm_fmin_f32(1.0, 2.0), 1.0);
        assert_eq!(wasm_fmax_f32(1.0, 2.0), 2.0);
    }

    #[test]
    fn test_round_ties_even() {
        assert_eq!(round_ties_even_f64(0.5), 0.0);
        assert_eq!(round_ties_even_f64(1.5), 2.0);
        assert_eq!(round_ties_even_f64(2.5), 2.0);
        assert_eq!(round_ties_even_f64(-0.5), -0.0);
        assert_eq!(round_ties_even_f32(3.5), 4.0);
        assert_eq!(round_ties_even_f32(4.5), 4.0);
    }

    #[test]
    fn test_itrunc_saturating() {
        // NaN saturates to 0.
        let r = unsafe {
            helper_itrunc(
                std::ptr::null_mut(),
                f32::NAN.to_bits() as u64,
                0b1000,
                0,
                0,
            )
        };
        assert_eq!(r.status, 0);
        assert_eq!(r.value, 0);
        // +inf saturates to INT_MAX.
        let r = unsafe {
            helper_itrunc(
                std::ptr::null_mut(),
                f64::INFINITY.to_bits(),
                0b1000 | 0b100 | 1,
                0,
                0,
            )
        };
        assert_eq!(r.status, 0);
        assert_eq!(r.value as u32 as i32, i32::MAX);
    }

    #[test]
    fn test_itrunc_traps() {
        // NaN traps without the saturating flag.
        let r = unsafe {
            helper_itrunc(std::ptr::null_mut(), f64::NAN.to_bits(), 0b101, 0, 0)
        };
        assert_eq!(
            r.status,
            super::super::context::HELPER_TRAP_BASE
                + TrapKind::InvalidConversionToInteger as u64
        );
        // 2^31 traps for signed i32.
        let r = unsafe {
            helper_itrunc(std::ptr::null_mut(), (2147483648.0f64).to_bits(), 0b101, 0, 0)
        };
        assert_eq!(
            r.status,
            super::super::context::HELPER_TRAP_BASE + TrapKind::IntegerOverflow as u64
        );
        // In-range converts exactly.
        let r = unsafe {
            helper_itrunc(std::ptr::null_mut(), (-7.9f64).to_bits(), 0b101, 0, 0)
        };
        assert_eq!(r.status, 0);
        assert_eq!(r.value as u32 as i32, -7);
    }

    #[test]
    fn test_v128_binop_add_i32x4() {
        let a = write_u32x4([1, 2, 3, 4]);
        let b = write_u32x4([10, 20, 30, u32::MAX]);
        let out = v128_binop(0, Shape::I32x4, 0, false, &a, &b);
        assert_eq!(read_u32x4(&out), [11, 22, 33, 3]);
    }

    #[test]
    fn test_v128_cmp_lanes() {
        let a = write_u32x4([1, 5, 3, 0]);
        let b = write_u32x4([2, 5, 1, 0]);
        let out = v128_cmp(Shape::I32x4, crate::ir::V128CmpKind::Lt as u8, true, &a, &b);
        assert_eq!(read_u32x4(&out), [u32::MAX, 0, 0, 0]);
    }

    #[test]
    fn test_v128_narrow_saturates() {
        let a = write_u16x8([300, 5, 0xFFFF, 10, 0, 1, 2, 3]);
        let b = write_u16x8([0; 8]);
        let out = v128_narrow(Shape::I16x8, false, &a, &b);
        // 300 saturates to 255, 0xFFFF (-1 signed) clamps to 0 unsigned.
        assert_eq!(out[0], 255);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn test_v128_shuffle_and_swizzle_masks() {
        let mut mask = [0u8; 16];
        for (i, m) in mask.iter_mut().enumerate() {
            *m = (31 - i) as u8;
        }
        let lo = u64::from_le_bytes(mask[..8].try_into().unwrap());
        let hi = u64::from_le_bytes(mask[8..].try_into().unwrap());
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        for i in 0..16 {
            a[i] = i as u8;
            b[i] = 16 + i as u8;
        }
        let mut dst = a;
        unsafe {
            helper_v128_shuffle(
                std::ptr::null_mut(),
                dst.as_mut_ptr() as u64,
                b.as_ptr() as u64,
                lo,
                hi,
            );
        }
        // Reversed concatenation: lane 0 selects byte 31 (= 31 in b).
        assert_eq!(dst[0], 31);
        assert_eq!(dst[15], 16);
    }
}
