//! End-to-end scenarios: compile real module binaries, run them, and
//! check results, traps, and the runtime surfaces around them.

mod common;

use common::{leb_i32, leb_u32, WasmBuilder};
use std::sync::Arc;
use wasmica::{CompiledModule, Engine, Instance, InvokeError, TrapKind, Value};

const I32: u8 = 0x7F;
const I64: u8 = 0x7E;
const F64: u8 = 0x7C;

fn instantiate(builder: &WasmBuilder) -> Instance {
    let mut engine = Engine::default();
    let compiled = Arc::new(CompiledModule::compile(&engine, &builder.build()).unwrap());
    Instance::new(&mut engine, compiled).unwrap()
}

fn expect_trap(result: Result<Vec<Value>, InvokeError>) -> wasmica::Trap {
    match result {
        Err(InvokeError::Trap(trap)) => trap,
        other => panic!("expected a trap, got {other:?}"),
    }
}

#[test]
fn test_add_i32() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32, I32], &[I32]);
    // local.get 0, local.get 1, i32.add
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x20, 0x01, 0x6A]);
    b.export_func("add_i32", f);
    let mut inst = instantiate(&b);

    let r = inst
        .invoke("add_i32", &[Value::I32(1), Value::I32(2)])
        .unwrap();
    assert_eq!(r, vec![Value::I32(3)]);

    // Wraparound.
    let r = inst
        .invoke("add_i32", &[Value::I32(0x7fffffff), Value::I32(1)])
        .unwrap();
    assert_eq!(r, vec![Value::I32(i32::MIN)]);
}

#[test]
fn test_div_trap_carries_source_offset() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32, I32], &[I32]);
    // local.get 0, local.get 1, i32.div_s
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x20, 0x01, 0x6D]);
    b.export_func("div", f);

    let mut engine = Engine::default();
    let binary = b.build();
    let compiled = Arc::new(CompiledModule::compile(&engine, &binary).unwrap());
    // The div opcode sits 4 bytes into the body expression.
    let expected_offset = compiled.module().codes[0].body_offset as u64 + 4;
    assert_eq!(binary[expected_offset as usize], 0x6D);

    let mut inst = Instance::new(&mut engine, compiled).unwrap();
    assert_eq!(
        inst.invoke("div", &[Value::I32(10), Value::I32(2)]).unwrap(),
        vec![Value::I32(5)]
    );

    let trap = expect_trap(inst.invoke("div", &[Value::I32(10), Value::I32(0)]));
    assert_eq!(trap.kind, TrapKind::IntegerDivideByZero);
    assert_eq!(trap.source_offset, expected_offset);
}

#[test]
fn test_div_overflow_traps() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32, I32], &[I32]);
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x20, 0x01, 0x6D]);
    b.export_func("div", f);
    let mut inst = instantiate(&b);

    let trap = expect_trap(inst.invoke("div", &[Value::I32(i32::MIN), Value::I32(-1)]));
    assert_eq!(trap.kind, TrapKind::IntegerOverflow);
    // Remainder at the same operands is defined as zero.
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32, I32], &[I32]);
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x20, 0x01, 0x6F]);
    b.export_func("rem", f);
    let mut inst = instantiate(&b);
    assert_eq!(
        inst.invoke("rem", &[Value::I32(i32::MIN), Value::I32(-1)])
            .unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn test_memory_grow_and_load() {
    let mut b = WasmBuilder::new();
    b.set_memory(1, Some(3));
    let grow_ty = b.add_type(&[I32], &[I32]);
    // local.get 0, memory.grow 0
    let grow = b.add_func(grow_ty, &[], &[0x20, 0x00, 0x40, 0x00]);
    let store_ty = b.add_type(&[I32, I32], &[]);
    // local.get 0, local.get 1, i32.store align=2 offset=0
    let store = b.add_func(store_ty, &[], &[0x20, 0x00, 0x20, 0x01, 0x36, 0x02, 0x00]);
    let load_ty = b.add_type(&[I32], &[I32]);
    let load = b.add_func(load_ty, &[], &[0x20, 0x00, 0x28, 0x02, 0x00]);
    b.export_func("grow", grow);
    b.export_func("store", store);
    b.export_func("load", load);
    b.export_memory("memory");
    let mut inst = instantiate(&b);

    assert_eq!(inst.memory_pages(), 1);
    let r = inst.invoke("grow", &[Value::I32(2)]).unwrap();
    assert_eq!(r, vec![Value::I32(1)]);
    assert_eq!(inst.memory_pages(), 3);

    // A load in the newly grown page works.
    inst.invoke("store", &[Value::I32(65536), Value::I32(0x11223344)])
        .unwrap();
    let r = inst.invoke("load", &[Value::I32(65536)]).unwrap();
    assert_eq!(r, vec![Value::I32(0x11223344)]);

    // Growing past the declared maximum reports -1.
    let r = inst.invoke("grow", &[Value::I32(1)]).unwrap();
    assert_eq!(r, vec![Value::I32(-1)]);
}

#[test]
fn test_call_and_recursion() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32], &[I32]);
    // fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)
    let mut body = Vec::new();
    body.extend_from_slice(&[0x20, 0x00, 0x41, 0x02, 0x48]); // n < 2
    body.extend_from_slice(&[0x04, 0x7F]); // if (result i32)
    body.extend_from_slice(&[0x20, 0x00]); // n
    body.push(0x05); // else
    body.extend_from_slice(&[0x20, 0x00, 0x41, 0x01, 0x6B, 0x10, 0x00]); // fib(n-1)
    body.extend_from_slice(&[0x20, 0x00, 0x41, 0x02, 0x6B, 0x10, 0x00]); // fib(n-2)
    body.push(0x6A); // add
    body.push(0x0B); // end if
    let f = b.add_func(ty, &[], &body);
    b.export_func("fib", f);
    let mut inst = instantiate(&b);

    let r = inst.invoke("fib", &[Value::I32(10)]).unwrap();
    assert_eq!(r, vec![Value::I32(55)]);
}

#[test]
fn test_loop_with_locals() {
    // sum(n): acc = 0; while (n > 0) { acc += n; n -= 1 }; acc
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32], &[I32]);
    let mut body = Vec::new();
    body.extend_from_slice(&[0x02, 0x40]); // block
    body.extend_from_slice(&[0x03, 0x40]); // loop
    body.extend_from_slice(&[0x20, 0x00, 0x45, 0x0D, 0x01]); // n == 0 → br out
    body.extend_from_slice(&[0x20, 0x01, 0x20, 0x00, 0x6A, 0x21, 0x01]); // acc += n
    body.extend_from_slice(&[0x20, 0x00, 0x41, 0x01, 0x6B, 0x21, 0x00]); // n -= 1
    body.extend_from_slice(&[0x0C, 0x00]); // br loop
    body.push(0x0B); // end loop
    body.push(0x0B); // end block
    body.extend_from_slice(&[0x20, 0x01]); // acc
    let f = b.add_func(ty, &[(1, I32)], &body);
    b.export_func("sum", f);
    let mut inst = instantiate(&b);

    assert_eq!(
        inst.invoke("sum", &[Value::I32(100)]).unwrap(),
        vec![Value::I32(5050)]
    );
    assert_eq!(
        inst.invoke("sum", &[Value::I32(0)]).unwrap(),
        vec![Value::I32(0)]
    );
}

#[test]
fn test_br_table_dispatch() {
    // case(i): br_table to return 10, 20, or 99 (default).
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[I32], &[I32]);
    let mut body = Vec::new();
    body.extend_from_slice(&[0x02, 0x40]); // block 2 (outer)
    body.extend_from_slice(&[0x02, 0x40]); // block 1
    body.extend_from_slice(&[0x02, 0x40]); // block 0
    body.extend_from_slice(&[0x20, 0x00]); // local.get 0
    body.extend_from_slice(&[0x0E, 0x02, 0x00, 0x01, 0x02]); // br_table 0 1 d=2
    body.push(0x0B); // end block 0
    body.extend_from_slice(&[0x41]);
    body.extend(leb_i32(10));
    body.push(0x0F); // return 10
    body.push(0x0B); // end block 1
    body.extend_from_slice(&[0x41]);
    body.extend(leb_i32(20));
    body.push(0x0F); // return 20
    body.push(0x0B); // end block 2
    body.extend_from_slice(&[0x41]);
    body.extend(leb_i32(99));
    let f = b.add_func(ty, &[], &body);
    b.export_func("case", f);
    let mut inst = instantiate(&b);

    assert_eq!(inst.invoke("case", &[Value::I32(0)]).unwrap(), vec![Value::I32(10)]);
    assert_eq!(inst.invoke("case", &[Value::I32(1)]).unwrap(), vec![Value::I32(20)]);
    assert_eq!(inst.invoke("case", &[Value::I32(7)]).unwrap(), vec![Value::I32(99)]);
}

#[test]
fn test_indirect_call_type_mismatch() {
    let mut b = WasmBuilder::new();
    let t_i32 = b.add_type(&[], &[I32]);
    let t_i64 = b.add_type(&[], &[I64]);
    let f = b.add_func(t_i32, &[], &[0x41, 0x2A]); // () → 42
    b.add_table(1, Some(1));
    b.add_active_elem(0, &[f]);

    // good() calls through the table with the matching type.
    let mut body = vec![0x41, 0x00]; // i32.const 0
    body.extend_from_slice(&[0x11]);
    body.extend(leb_u32(t_i32));
    body.push(0x00);
    let good = b.add_func(t_i32, &[], &body);

    // bad() uses the ()→i64 type index for the same slot.
    let mut body = vec![0x41, 0x00];
    body.extend_from_slice(&[0x11]);
    body.extend(leb_u32(t_i64));
    body.push(0x00);
    let bad = b.add_func(t_i64, &[], &body);

    b.export_func("good", good);
    b.export_func("bad", bad);
    let mut inst = instantiate(&b);

    assert_eq!(inst.invoke("good", &[]).unwrap(), vec![Value::I32(42)]);
    let trap = expect_trap(inst.invoke("bad", &[]));
    assert_eq!(trap.kind, TrapKind::IndirectCallTypeMismatch);
}

#[test]
fn test_indirect_call_bounds_and_null() {
    let mut b = WasmBuilder::new();
    let t = b.add_type(&[], &[I32]);
    let f = b.add_func(t, &[], &[0x41, 0x07]);
    b.add_table(3, Some(3));
    b.add_active_elem(0, &[f]); // slots 1, 2 stay null

    let call_ty = b.add_type(&[I32], &[I32]);
    let mut body = vec![0x20, 0x00, 0x11];
    body.extend(leb_u32(t));
    body.push(0x00);
    let call = b.add_func(call_ty, &[], &body);
    b.export_func("call", call);
    let mut inst = instantiate(&b);

    assert_eq!(inst.invoke("call", &[Value::I32(0)]).unwrap(), vec![Value::I32(7)]);
    let trap = expect_trap(inst.invoke("call", &[Value::I32(1)]));
    assert_eq!(trap.kind, TrapKind::UninitializedElement);
    let trap = expect_trap(inst.invoke("call", &[Value::I32(3)]));
    assert_eq!(trap.kind, TrapKind::UndefinedElement);
}

#[test]
fn test_f64_arithmetic() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[F64, F64], &[F64]);
    // (a + b) * 2.0
    let mut body = vec![0x20, 0x00, 0x20, 0x01, 0xA0];
    body.push(0x44);
    body.extend_from_slice(&2.0f64.to_le_bytes());
    body.push(0xA2);
    let f = b.add_func(ty, &[], &body);
    b.export_func("calc", f);
    let mut inst = instantiate(&b);

    let r = inst
        .invoke("calc", &[Value::F64(1.5), Value::F64(2.5)])
        .unwrap();
    assert_eq!(r, vec![Value::F64(8.0)]);
}

#[test]
fn test_trunc_traps_and_saturates() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[F64], &[I32]);
    // i32.trunc_f64_s
    let trunc = b.add_func(ty, &[], &[0x20, 0x00, 0xAA]);
    // i32.trunc_sat_f64_s
    let sat = b.add_func(ty, &[], &[0x20, 0x00, 0xFC, 0x02]);
    b.export_func("trunc", trunc);
    b.export_func("sat", sat);
    let mut inst = instantiate(&b);

    assert_eq!(
        inst.invoke("trunc", &[Value::F64(-3.7)]).unwrap(),
        vec![Value::I32(-3)]
    );
    let trap = expect_trap(inst.invoke("trunc", &[Value::F64(f64::NAN)]));
    assert_eq!(trap.kind, TrapKind::InvalidConversionToInteger);
    let trap = expect_trap(inst.invoke("trunc", &[Value::F64(1e10)]));
    assert_eq!(trap.kind, TrapKind::IntegerOverflow);

    assert_eq!(
        inst.invoke("sat", &[Value::F64(f64::NAN)]).unwrap(),
        vec![Value::I32(0)]
    );
    assert_eq!(
        inst.invoke("sat", &[Value::F64(f64::INFINITY)]).unwrap(),
        vec![Value::I32(i32::MAX)]
    );
    assert_eq!(
        inst.invoke("sat", &[Value::F64(f64::NEG_INFINITY)]).unwrap(),
        vec![Value::I32(i32::MIN)]
    );
}

#[test]
fn test_call_stack_exhaustion() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[], &[]);
    // f() { call f }
    let mut body = vec![0x10];
    body.extend(leb_u32(0));
    let f = b.add_func(ty, &[], &body);
    assert_eq!(f, 0);
    b.export_func("f", f);
    let mut inst = instantiate(&b);

    let trap = expect_trap(inst.invoke("f", &[]));
    assert_eq!(trap.kind, TrapKind::CallStackExhausted);
}

#[test]
fn test_unreachable_traps() {
    let mut b = WasmBuilder::new();
    let ty = b.add_type(&[], &[]);
    let f = b.add_func(ty, &[], &[0x00]);
    b.export_func("boom", f);
    let mut inst = instantiate(&b);

    let trap = expect_trap(inst.invoke("boom", &[]));
    assert_eq!(trap.kind, TrapKind::Unreachable);
}

#[cfg(target_os = "linux")]
#[test]
fn test_out_of_bounds_load_traps_via_guard() {
    let mut b = WasmBuilder::new();
    b.set_memory(1, Some(1));
    let ty = b.add_type(&[I32], &[I32]);
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x28, 0x02, 0x00]);
    b.export_func("load", f);
    let mut inst = instantiate(&b);

    // In-bounds first.
    assert_eq!(inst.invoke("load", &[Value::I32(0)]).unwrap(), vec![Value::I32(0)]);
    // Far past the single committed page: the guard pages deliver it.
    let trap = expect_trap(inst.invoke("load", &[Value::I32(0x7000_0000)]));
    assert_eq!(trap.kind, TrapKind::OutOfBoundsMemoryAccess);
    // And the instance is still usable afterwards.
    assert_eq!(inst.invoke("load", &[Value::I32(4)]).unwrap(), vec![Value::I32(0)]);
}

#[test]
fn test_proc_exit_through_host_shim() {
    let mut b = WasmBuilder::new();
    let exit_ty = b.add_type(&[I32], &[]);
    let proc_exit = b.import_func("wasi_snapshot_preview1", "proc_exit", exit_ty);
    let start_ty = b.add_type(&[], &[]);
    let mut body = vec![0x41, 0x07, 0x10];
    body.extend(leb_u32(proc_exit));
    let start = b.add_func(start_ty, &[], &body);
    b.set_memory(1, Some(1));
    b.export_func("_start", start);
    let mut inst = instantiate(&b);

    match inst.invoke("_start", &[]) {
        Err(InvokeError::Exit(7)) => {}
        other => panic!("expected exit(7), got {other:?}"),
    }
    // The exit is sticky.
    match inst.invoke("_start", &[]) {
        Err(InvokeError::Exit(7)) => {}
        other => panic!("expected sticky exit, got {other:?}"),
    }
}

#[test]
fn test_cancellation_unwinds_at_call_boundary() {
    let mut b = WasmBuilder::new();
    let leaf_ty = b.add_type(&[], &[I32]);
    let leaf = b.add_func(leaf_ty, &[], &[0x41, 0x01]);
    let mut body = vec![0x10];
    body.extend(leb_u32(leaf));
    let caller = b.add_func(leaf_ty, &[], &body);
    b.export_func("caller", caller);

    let mut engine = Engine::default();
    let compiled = Arc::new(CompiledModule::compile(&engine, &b.build()).unwrap());
    let mut inst = Instance::new(&mut engine, compiled).unwrap();

    assert_eq!(inst.invoke("caller", &[]).unwrap(), vec![Value::I32(1)]);
    // Cancellation is an engine-level signal shared by its instances.
    engine.cancel();
    match inst.invoke("caller", &[]) {
        Err(InvokeError::Canceled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn test_active_data_segment_applied() {
    let mut b = WasmBuilder::new();
    b.set_memory(1, Some(1));
    b.add_active_data(16, b"wasm");
    let ty = b.add_type(&[I32], &[I32]);
    // i32.load8_u
    let f = b.add_func(ty, &[], &[0x20, 0x00, 0x2D, 0x00, 0x00]);
    b.export_func("byte_at", f);
    let mut inst = instantiate(&b);

    assert_eq!(
        inst.invoke("byte_at", &[Value::I32(16)]).unwrap(),
        vec![Value::I32(b'w' as i32)]
    );
    assert_eq!(
        inst.invoke("byte_at", &[Value::I32(19)]).unwrap(),
        vec![Value::I32(b'm' as i32)]
    );
}

#[test]
fn test_preopen_readdir_order_and_cookies() {
    use wasmica::sys::FsContext;

    let dir = tempfile::tempdir().unwrap();
    for name in ["-", "a-", "ab-"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    let mut fs = FsContext::new(
        vec![("/".to_string(), dir.path().to_path_buf())],
        Vec::new(),
    );

    let entries = fs.readdir(3, 0, 16).unwrap();
    let names: Vec<&str> = entries.iter().map(|(_, e)| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "-", "a-", "ab-"]);

    let cookies: Vec<u64> = entries.iter().map(|(c, _)| *c).collect();
    for pair in cookies.windows(2) {
        assert!(pair[1] > pair[0], "cookies must increase: {cookies:?}");
    }
}

/// The long-branch trampoline is transparent to the link register: a
/// caller placed far beyond BL range reaches the callee through its
/// island, and the callee's RET comes straight back to the caller.
#[cfg(target_arch = "aarch64")]
#[test]
fn test_long_branch_trampoline_transparency() {
    use wasmica::jit::aarch64::{A64Assembler, Reg};
    use wasmica::jit::codebuf::CodeBuffer;
    use wasmica::jit::memory::CodeSegment;
    use wasmica::jit::reloc::{resolve_relocations, A64_TRAMPOLINE_SIZE};

    // Caller at offset 0, callee far beyond the ±128 MiB BL range.
    let far = 129 * 1024 * 1024;
    let mut segment = CodeSegment::new(far + 64).unwrap();

    let mut buf = CodeBuffer::new();
    let mut a = A64Assembler::new(&mut buf);
    a.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -16);
    let site = a.bl(0); // patched by relocation resolution
    a.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 16);
    a.ret();
    let island = buf.len(); // trampoline slot right after the caller
    for _ in 0..A64_TRAMPOLINE_SIZE / 4 {
        A64Assembler::new(&mut buf).nop();
    }
    segment.write(0, buf.code()).unwrap();

    let mut buf = CodeBuffer::new();
    let mut a = A64Assembler::new(&mut buf);
    a.movz(Reg::X0, 42, 0, true);
    a.ret();
    segment.write(far, buf.code()).unwrap();

    let func_offsets = vec![0, far];
    resolve_relocations(&mut segment, &[(site, 1, island)], &func_offsets).unwrap();
    segment.mark_relocated();
    segment.make_executable().unwrap();

    let caller: extern "C" fn() -> u64 =
        unsafe { std::mem::transmute(segment.addr_of(0)) };
    assert_eq!(caller(), 42);
}
