use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_cpu_core::alu::{ALU, ALU_ADD, ALU_FAST};
use ember_cpu_core::exec::{run, StepExit};
use ember_cpu_core::mem::FlatBus;
use ember_cpu_core::Machine;
use ember_x86::{DecodeMode, Gpr};

fn bench_kernels(c: &mut Criterion) {
    c.bench_function("alu_add64_full", |b| {
        let mut f = 0u32;
        b.iter(|| {
            let z = ALU[ALU_ADD][3](black_box(0x1234_5678), black_box(0x1111), &mut f);
            black_box(z);
        })
    });
    c.bench_function("alu_add64_fast", |b| {
        let mut f = 0u32;
        b.iter(|| {
            let z = ALU_FAST[ALU_ADD][3](black_box(0x1234_5678), black_box(0x1111), &mut f);
            black_box(z);
        })
    });
}

fn bench_dispatch_loop(c: &mut Criterion) {
    // A tight countdown loop: dec rcx; jnz -3; hlt.
    let program = [0x48u8, 0xFF, 0xC9, 0x75, 0xFB, 0xF4];
    c.bench_function("dispatch_countdown_1k", |b| {
        b.iter(|| {
            let mut m = Machine::new(DecodeMode::Long);
            let mut bus = FlatBus::new(0x4000);
            bus.load(0x1000, &program);
            m.put64(Gpr::Rcx, 1000);
            m.set_ip(0x1000);
            let exit = run(&mut m, &mut bus, 10_000).unwrap();
            assert_eq!(exit, StepExit::Halt);
            black_box(m.get64(Gpr::Rcx));
        })
    });
}

criterion_group!(benches, bench_kernels, bench_dispatch_loop);
criterion_main!(benches);
