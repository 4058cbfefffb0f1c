//! Whole-stack smoke test: decode, interpret, and path-build the same
//! program through the umbrella crate.

use anyhow::Result;
use ember::cpu::exec::{self, StepExit};
use ember::cpu::mem::{self, FlatBus};
use ember::cpu::Machine;
use ember::jit::path::{AddOutcome, PathBuilder, PathConfig};
use ember::x86::Gpr;
use ember::{decode_one, DecodeMode};

const CODE: u64 = 0x1000;

#[test]
fn interpreter_and_tape_agree_on_a_small_program() -> Result<()> {
    let program = [
        0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00, // mov rax, 5
        0x48, 0xFF, 0xC0, // inc rax
        0x48, 0x01, 0xC0, // add rax, rax
        0xF4, // hlt
    ];

    // Interpreter.
    let mut m1 = Machine::new(DecodeMode::Long);
    let mut bus1 = FlatBus::new(0x4000);
    bus1.load(CODE, &program);
    m1.set_ip(CODE);
    let exit = exec::run(&mut m1, &mut bus1, 100)?;
    assert_eq!(exit, StepExit::Halt);
    assert_eq!(m1.get64(Gpr::Rax), 12);

    // Tape over the same trace.
    let mut m2 = Machine::new(DecodeMode::Long);
    let mut bus2 = FlatBus::new(0x4000);
    bus2.load(CODE, &program);
    m2.set_ip(CODE);
    let mut builder = PathBuilder::new(PathConfig::default(), CODE as i64);
    let mut probe = Machine::new(DecodeMode::Long);
    let mut probe_bus = FlatBus::new(0x4000);
    probe_bus.load(CODE, &program);
    probe.set_ip(CODE);
    loop {
        let pc = probe.pc();
        let (bytes, avail) = mem::fetch(&mut probe, &mut probe_bus, pc)?;
        let d = decode_one(probe.mode, &bytes[..avail])?;
        match builder.add(&mut probe, &mut probe_bus, &d, exec::lookup(d.rde)) {
            AddOutcome::Open => probe.set_ip(probe.ip.wrapping_add(d.len() as u64)),
            _ => break,
        }
    }
    let path = builder.commit()?;
    ember::jit::path::execute(&mut m2, &mut bus2, &path)?;
    assert_eq!(m2.get64(Gpr::Rax), 12);
    Ok(())
}
