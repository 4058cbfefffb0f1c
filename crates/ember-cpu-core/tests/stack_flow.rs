use ember_cpu_core::exec::{step, StepExit};
use ember_cpu_core::flags::{FLAGS_CF, FLAGS_PF, FLAGS_ZF};
use ember_cpu_core::mem::{read_u16, read_u32, read_u64, FlatBus};
use ember_cpu_core::{Exception, Machine};
use ember_x86::{DecodeMode, Gpr};

const BUS_SIZE: usize = 0x10_000;
const CODE_BASE: u64 = 0x1000;

fn exec(m: &mut Machine, bus: &mut FlatBus, code: &[u8]) -> StepExit {
    bus.load(CODE_BASE, code);
    m.set_ip(CODE_BASE);
    step(m, bus).expect("step")
}

fn machine_with_stack() -> (Machine, FlatBus) {
    let mut m = Machine::new(DecodeMode::Long);
    m.put64(Gpr::Rsp, 0x8000);
    (m, FlatBus::new(BUS_SIZE))
}

#[test]
fn push_pop_round_trip() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rbx, 0x1122_3344_5566_7788);

    exec(&mut m, &mut bus, &[0x53]); // push rbx
    assert_eq!(m.get64(Gpr::Rsp), 0x7FF8);
    assert_eq!(
        read_u64(&mut m, &mut bus, 0x7FF8).unwrap(),
        0x1122_3344_5566_7788
    );

    exec(&mut m, &mut bus, &[0x59]); // pop rcx
    assert_eq!(m.get64(Gpr::Rsp), 0x8000);
    assert_eq!(m.get64(Gpr::Rcx), 0x1122_3344_5566_7788);
}

#[test]
fn push_imm8_sign_extends_to_stack_width() {
    let (mut m, mut bus) = machine_with_stack();
    exec(&mut m, &mut bus, &[0x6A, 0xFF]); // push -1
    assert_eq!(read_u64(&mut m, &mut bus, 0x7FF8).unwrap(), u64::MAX);
}

#[test]
fn sixteen_bit_push_moves_sp_by_two() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rbx, 0xABCD);
    exec(&mut m, &mut bus, &[0x66, 0x53]); // push bx
    assert_eq!(m.get64(Gpr::Rsp), 0x7FFE);
    assert_eq!(read_u16(&mut m, &mut bus, 0x7FFE).unwrap(), 0xABCD);
}

#[test]
fn call_pushes_return_and_ret_comes_back() {
    let (mut m, mut bus) = machine_with_stack();
    // call +0x100; the return address is the next instruction.
    let exit = exec(&mut m, &mut bus, &[0xE8, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(exit, StepExit::Branch);
    assert_eq!(m.ip, CODE_BASE + 5 + 0x100);
    assert_eq!(read_u64(&mut m, &mut bus, 0x7FF8).unwrap(), CODE_BASE + 5);

    bus.load(m.ip, &[0xC3]); // ret
    step(&mut m, &mut bus).unwrap();
    assert_eq!(m.ip, CODE_BASE + 5);
    assert_eq!(m.get64(Gpr::Rsp), 0x8000);
}

#[test]
fn ret_imm_pops_the_arguments_too() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rsp, 0x7FF0);
    bus.load(0x7FF0, &0x2000u64.to_le_bytes());

    exec(&mut m, &mut bus, &[0xC2, 0x10, 0x00]); // ret 0x10
    assert_eq!(m.ip, 0x2000);
    assert_eq!(m.get64(Gpr::Rsp), 0x7FF0 + 8 + 0x10);
}

#[test]
fn call_indirect_through_register_and_memory() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rax, 0x2000);
    let exit = exec(&mut m, &mut bus, &[0xFF, 0xD0]); // call rax
    assert_eq!(exit, StepExit::Branch);
    assert_eq!(m.ip, 0x2000);

    let (mut m, mut bus) = machine_with_stack();
    bus.load(0x3000, &0x4000u64.to_le_bytes());
    m.put64(Gpr::Rax, 0x3000);
    exec(&mut m, &mut bus, &[0xFF, 0x20]); // jmp [rax]
    assert_eq!(m.ip, 0x4000);
    assert_eq!(m.get64(Gpr::Rsp), 0x8000, "jmp must not push");
}

#[test]
fn jcc_takes_and_falls_through() {
    let (mut m, mut bus) = machine_with_stack();
    m.set_flag(FLAGS_ZF, true);
    let exit = exec(&mut m, &mut bus, &[0x74, 0x0B]); // je +11
    assert_eq!(exit, StepExit::Branch);
    assert_eq!(m.ip, CODE_BASE + 2 + 11);

    m.set_flag(FLAGS_ZF, false);
    let exit = exec(&mut m, &mut bus, &[0x74, 0x0B]);
    assert_eq!(exit, StepExit::Continue);
    assert_eq!(m.ip, CODE_BASE + 2);

    // Negative displacement.
    m.set_flag(FLAGS_ZF, false);
    exec(&mut m, &mut bus, &[0x75, 0xEA]); // jne -22
    assert_eq!(m.ip, CODE_BASE + 2 - 22);
}

#[test]
fn loop_decrements_and_branches_until_zero() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rcx, 2);
    exec(&mut m, &mut bus, &[0xE2, 0x10]); // loop +0x10
    assert_eq!(m.get64(Gpr::Rcx), 1);
    assert_eq!(m.ip, CODE_BASE + 2 + 0x10);

    exec(&mut m, &mut bus, &[0xE2, 0x10]);
    assert_eq!(m.get64(Gpr::Rcx), 0);
    assert_eq!(m.ip, CODE_BASE + 2, "count hit zero: fall through");
}

#[test]
fn jrcxz_checks_the_whole_register() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rcx, 0x1_0000_0000);
    exec(&mut m, &mut bus, &[0xE3, 0x10]); // jrcxz
    assert_eq!(m.ip, CODE_BASE + 2, "rcx is nonzero");

    // With a 67 prefix only ECX is tested.
    exec(&mut m, &mut bus, &[0x67, 0xE3, 0x10]); // jecxz
    assert_eq!(m.ip, CODE_BASE + 3 + 0x10);
}

#[test]
fn pusha_lands_registers_in_address_order_di_to_ax() {
    let mut m = Machine::new(DecodeMode::Legacy);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsp, 0x8000);
    for (i, r) in [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
    ]
    .iter()
    .enumerate()
    {
        if *r != Gpr::Rsp {
            m.put32(*r, 0x10 + i as u64);
        }
    }

    exec(&mut m, &mut bus, &[0x60]); // pusha
    assert_eq!(m.get64(Gpr::Rsp), 0x8000 - 32);
    let order = [0x17u32, 0x16, 0x15, 0x8000, 0x13, 0x12, 0x11, 0x10];
    for (i, want) in order.iter().enumerate() {
        let got = read_u32(&mut m, &mut bus, (0x8000 - 32 + i as u64 * 4) as i64).unwrap();
        assert_eq!(got, *want, "slot {i} is di..ax order");
    }
}

#[test]
fn popa_restores_everything_except_sp() {
    let mut m = Machine::new(DecodeMode::Legacy);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsp, 0x8000 - 32);
    for i in 0..8u32 {
        bus.load(0x8000 - 32 + i as u64 * 4, &(0x100 + i).to_le_bytes());
    }

    exec(&mut m, &mut bus, &[0x61]); // popa
    assert_eq!(m.get32(Gpr::Rdi), 0x100);
    assert_eq!(m.get32(Gpr::Rsi), 0x101);
    assert_eq!(m.get32(Gpr::Rbp), 0x102);
    assert_eq!(m.get64(Gpr::Rsp), 0x8000, "stored SP slot is skipped");
    assert_eq!(m.get32(Gpr::Rbx), 0x104);
    assert_eq!(m.get32(Gpr::Rdx), 0x105);
    assert_eq!(m.get32(Gpr::Rcx), 0x106);
    assert_eq!(m.get32(Gpr::Rax), 0x107);
}

#[test]
fn pusha_popa_are_undefined_in_long_mode() {
    let (mut m, mut bus) = machine_with_stack();
    bus.load(CODE_BASE, &[0x60]);
    m.set_ip(CODE_BASE);
    assert_eq!(step(&mut m, &mut bus), Err(Exception::UndefinedInstruction));

    bus.load(CODE_BASE, &[0x61]);
    m.set_ip(CODE_BASE);
    assert_eq!(step(&mut m, &mut bus), Err(Exception::UndefinedInstruction));
}

#[test]
fn pushf_exports_clean_flags_and_popf_reimports() {
    let (mut m, mut bus) = machine_with_stack();
    // Leave a lazy-parity byte in the high bits: it must not escape.
    m.put64(Gpr::Rax, 0x102);
    m.put64(Gpr::Rcx, 1);
    exec(&mut m, &mut bus, &[0x48, 0x01, 0xC8]); // add rax, rcx => 0x103
    assert_ne!(m.flags >> 24, 0);

    exec(&mut m, &mut bus, &[0x9C]); // pushf
    let sp = m.get64(Gpr::Rsp) as i64;
    let pushed = read_u64(&mut m, &mut bus, sp).unwrap();
    assert_eq!(pushed >> 24 & 0xff, 0, "lazy bits are non-architectural");
    assert_eq!(pushed & 1 << 2 != 0, m.get_flag(FLAGS_PF));
    assert_ne!(pushed & 1 << 1, 0, "bit 1 always reads set");

    // popf with PF and CF set.
    let sp = m.get64(Gpr::Rsp);
    bus.load(sp, &(pushed | 1 << 2 | 1).to_le_bytes());
    exec(&mut m, &mut bus, &[0x9D]); // popf
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_PF));
}

#[test]
fn lahf_sahf_round_trip() {
    let (mut m, mut bus) = machine_with_stack();
    m.set_flag(FLAGS_CF, true);
    m.set_flag(FLAGS_ZF, true);

    exec(&mut m, &mut bus, &[0x9F]); // lahf
    let ah = m.get16(Gpr::Rax) >> 8;
    assert_eq!(ah & 1, 1);
    assert_ne!(ah & 0x40, 0);
    assert_ne!(ah & 0x02, 0, "bit 1 reads as one");

    m.set_flag(FLAGS_CF, false);
    m.set_flag(FLAGS_ZF, false);
    exec(&mut m, &mut bus, &[0x9E]); // sahf
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_ZF));
}

#[test]
fn enter_and_leave_frame_discipline() {
    let (mut m, mut bus) = machine_with_stack();
    m.put64(Gpr::Rbp, 0x1111_2222);

    exec(&mut m, &mut bus, &[0xC8, 0x20, 0x00, 0x00]); // enter 0x20, 0
    let frame = m.get64(Gpr::Rbp);
    assert_eq!(frame, 0x8000 - 8);
    assert_eq!(m.get64(Gpr::Rsp), frame - 0x20);
    assert_eq!(
        read_u64(&mut m, &mut bus, frame as i64).unwrap(),
        0x1111_2222
    );

    exec(&mut m, &mut bus, &[0xC9]); // leave
    assert_eq!(m.get64(Gpr::Rbp), 0x1111_2222);
    assert_eq!(m.get64(Gpr::Rsp), 0x8000);
}

#[test]
fn hlt_pause_syscall_and_int_exit_the_loop() {
    let (mut m, mut bus) = machine_with_stack();
    assert_eq!(exec(&mut m, &mut bus, &[0xF4]), StepExit::Halt);
    assert_eq!(m.ip, CODE_BASE + 1, "HLT retires before exiting");

    assert_eq!(exec(&mut m, &mut bus, &[0xF3, 0x90]), StepExit::Pause);

    assert_eq!(
        exec(&mut m, &mut bus, &[0xCD, 0x80]),
        StepExit::Interrupt(0x80)
    );
    assert_eq!(exec(&mut m, &mut bus, &[0xCC]), StepExit::Interrupt(3));

    let exit = exec(&mut m, &mut bus, &[0x0F, 0x05]);
    assert_eq!(exit, StepExit::Syscall);
    assert_eq!(
        m.get64(Gpr::Rcx),
        CODE_BASE + 2,
        "syscall saves the return IP"
    );
}

#[test]
fn setcc_and_cmovcc() {
    let (mut m, mut bus) = machine_with_stack();
    m.set_flag(FLAGS_ZF, true);
    exec(&mut m, &mut bus, &[0x0F, 0x94, 0xC0]); // sete al
    assert_eq!(m.get_reg(0, Gpr::Rax), 1);
    exec(&mut m, &mut bus, &[0x0F, 0x95, 0xC0]); // setne al
    assert_eq!(m.get_reg(0, Gpr::Rax), 0);

    m.put64(Gpr::Rax, 0xFFFF_FFFF_FFFF_FFFF);
    m.put64(Gpr::Rcx, 0x1234);
    m.set_flag(FLAGS_ZF, false);
    exec(&mut m, &mut bus, &[0x0F, 0x44, 0xC1]); // cmove eax, ecx (not taken)
    assert_eq!(
        m.get64(Gpr::Rax),
        0xFFFF_FFFF,
        "an untaken 32-bit cmov still zero-extends"
    );
    m.set_flag(FLAGS_ZF, true);
    exec(&mut m, &mut bus, &[0x0F, 0x44, 0xC1]);
    assert_eq!(m.get64(Gpr::Rax), 0x1234);
}
