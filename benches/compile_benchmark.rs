//! Compile and invoke benchmarks over the native-code pipeline.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use wasmica::{CompiledModule, Engine, Instance, Value};

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

/// fib(n) with the classic doubly recursive body.
fn fib_module() -> Vec<u8> {
    let mut m = b"\0asm".to_vec();
    m.extend(1u32.to_le_bytes());
    m.extend(section(1, &[0x01, 0x60, 0x01, 0x7F, 0x01, 0x7F]));
    m.extend(section(3, &[0x01, 0x00]));
    m.extend(section(7, &[0x01, 0x03, b'f', b'i', b'b', 0x00, 0x00]));
    let body: &[u8] = &[
        0x00, // no locals
        0x20, 0x00, 0x41, 0x02, 0x48, // n < 2
        0x04, 0x7F, // if (result i32)
        0x20, 0x00, // n
        0x05, // else
        0x20, 0x00, 0x41, 0x01, 0x6B, 0x10, 0x00, // fib(n-1)
        0x20, 0x00, 0x41, 0x02, 0x6B, 0x10, 0x00, // fib(n-2)
        0x6A, // add
        0x0B, // end if
        0x0B, // end
    ];
    let mut code = vec![0x01];
    code.extend(leb(body.len() as u32));
    code.extend_from_slice(body);
    m.extend(section(10, &code));
    m
}

fn bench_compile(c: &mut Criterion) {
    let binary = fib_module();
    let engine = Engine::default();
    c.bench_function("compile_fib_module", |b| {
        b.iter(|| {
            let compiled = CompiledModule::compile(&engine, black_box(&binary)).unwrap();
            black_box(compiled);
        })
    });
}

fn bench_invoke(c: &mut Criterion) {
    let binary = fib_module();
    let mut engine = Engine::default();
    let compiled = Arc::new(CompiledModule::compile(&engine, &binary).unwrap());
    let mut instance = Instance::new(&mut engine, compiled).unwrap();
    c.bench_function("invoke_fib_20", |b| {
        b.iter(|| {
            let r = instance.invoke("fib", &[Value::I32(black_box(20))]).unwrap();
            black_box(r);
        })
    });
}

criterion_group!(benches, bench_compile, bench_invoke);
criterion_main!(benches);
