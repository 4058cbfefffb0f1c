//! Compare-and-branch fusion: preconditions and end-to-end equivalence.

use ember_cpu_core::mem::{self, FlatBus};
use ember_cpu_core::Machine;
use ember_jit::fusion::try_fuse;
use ember_jit::uop::{MicroOp, TapeExit};
use ember_x86::{decode_one, DecodeMode, Gpr};

const CODE: u64 = 0x1000;
const BUS_SIZE: usize = 0x10_000;

fn setup(code: &[u8]) -> (Machine, FlatBus) {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(CODE, code);
    m.set_ip(CODE);
    (m, bus)
}

fn decode_first(m: &mut Machine, bus: &mut FlatBus) -> ember_x86::Decoded {
    let (bytes, avail) = mem::fetch(m, bus, CODE as i64).unwrap();
    decode_one(m.mode, &bytes[..avail]).unwrap()
}

#[test]
fn cmp_jcc_with_dead_flags_fuses() {
    // cmp rax, rcx; jne +4; xor eax, eax (both sides clobber).
    let (mut m, mut bus) = setup(&[
        0x48, 0x39, 0xC8, // cmp rax, rcx
        0x75, 0x02, // jne +2
        0x31, 0xC0, // xor eax, eax (fall-through)
        0x31, 0xC0, // xor eax, eax (target)
        0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    let fused = try_fuse(&mut m, &mut bus, &d).expect("should fuse");
    assert_eq!(fused.jump_len, 2);
    assert!(fused
        .tape
        .iter()
        .any(|op| matches!(op, MicroOp::CmpBranch { .. })));
}

#[test]
fn fusion_refuses_when_flags_are_read_later() {
    // The branch target does sbb: CF is live.
    let (mut m, mut bus) = setup(&[
        0x48, 0x39, 0xC8, // cmp rax, rcx
        0x75, 0x02, // jne +2
        0x31, 0xC0, // xor (fall-through clobbers)
        0x19, 0xC8, // sbb eax, ecx (target reads CF)
        0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    assert!(try_fuse(&mut m, &mut bus, &d).is_none());
}

#[test]
fn fusion_refuses_without_a_following_jcc() {
    let (mut m, mut bus) = setup(&[
        0x48, 0x39, 0xC8, // cmp rax, rcx
        0x48, 0x89, 0xC3, // mov rbx, rax
        0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    assert!(try_fuse(&mut m, &mut bus, &d).is_none());
}

#[test]
fn byte_compares_are_not_fused() {
    let (mut m, mut bus) = setup(&[
        0x38, 0xC8, // cmp al, cl
        0x75, 0x02, // jne
        0x31, 0xC0, 0x31, 0xC0, 0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    assert!(try_fuse(&mut m, &mut bus, &d).is_none());
}

#[test]
fn test_fusion_requires_same_register() {
    let (mut m, mut bus) = setup(&[
        0x48, 0x85, 0xC8, // test rax, rcx (different operands)
        0x75, 0x02, // jne
        0x31, 0xC0, 0x31, 0xC0, 0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    assert!(try_fuse(&mut m, &mut bus, &d).is_none());

    let (mut m, mut bus) = setup(&[
        0x48, 0x85, 0xC0, // test rax, rax
        0x75, 0x02, // jne
        0x31, 0xC9, 0x31, 0xC9, 0xF4,
    ]);
    let d = decode_first(&mut m, &mut bus);
    assert!(try_fuse(&mut m, &mut bus, &d).is_some());
}

/// The fused fragment and the interpreter agree on both edges of the
/// branch, across signed/unsigned boundaries.
#[test]
fn fused_execution_matches_the_interpreter() {
    let program: &[u8] = &[
        0x48, 0x39, 0xC8, // cmp rax, rcx
        0x7C, 0x02, // jl +2
        0x31, 0xDB, // xor ebx, ebx (fall-through)
        0x31, 0xC9, // xor ecx, ecx (target)
        0xF4,
    ];
    let cases: &[(u64, u64)] = &[
        (0, 0),
        (1, 2),
        (2, 1),
        ((-1i64) as u64, 1),
        (1, (-1i64) as u64),
        (i64::MIN as u64, i64::MAX as u64),
    ];
    for &(x, y) in cases {
        // Reference run. RBX starts nonzero so the fall-through edge is
        // observable.
        let (mut ref_m, mut ref_bus) = setup(program);
        ref_m.put64(Gpr::Rax, x);
        ref_m.put64(Gpr::Rcx, y);
        ref_m.put64(Gpr::Rbx, 0xdead);
        loop {
            match ember_cpu_core::exec::step(&mut ref_m, &mut ref_bus).unwrap() {
                ember_cpu_core::exec::StepExit::Halt => break,
                _ => {}
            }
        }

        // Fused run: execute the fragment, then interpret to the halt.
        let (mut m, mut bus) = setup(program);
        m.put64(Gpr::Rax, x);
        m.put64(Gpr::Rcx, y);
        m.put64(Gpr::Rbx, 0xdead);
        let d = decode_first(&mut m, &mut bus);
        let fused = try_fuse(&mut m, &mut bus, &d).expect("fusible");
        let exit = ember_jit::uop::interpret(&mut m, &mut bus, &fused.tape).unwrap();
        match exit {
            TapeExit::Done | TapeExit::Branched => {}
            TapeExit::Trapped => panic!("trap"),
        }
        loop {
            match ember_cpu_core::exec::step(&mut m, &mut bus).unwrap() {
                ember_cpu_core::exec::StepExit::Halt => break,
                _ => {}
            }
        }
        assert_eq!(m.get64(Gpr::Rbx), ref_m.get64(Gpr::Rbx), "case {x:#x},{y:#x}");
        assert_eq!(m.get64(Gpr::Rcx), ref_m.get64(Gpr::Rcx), "case {x:#x},{y:#x}");
        assert_eq!(m.ip, ref_m.ip, "case {x:#x},{y:#x}");
    }
}
