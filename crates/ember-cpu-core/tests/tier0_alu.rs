use ember_cpu_core::exec::{step, StepExit};
use ember_cpu_core::flags::{FLAGS_AF, FLAGS_CF, FLAGS_OF, FLAGS_PF, FLAGS_SF, FLAGS_ZF};
use ember_cpu_core::mem::FlatBus;
use ember_cpu_core::{Exception, Machine};
use ember_x86::{DecodeMode, Gpr};

const BUS_SIZE: usize = 0x10_000;
const CODE_BASE: u64 = 0x1000;

fn exec_one(m: &mut Machine, bus: &mut FlatBus, code: &[u8]) {
    bus.load(CODE_BASE, code);
    m.set_ip(CODE_BASE);
    let exit = step(m, bus).expect("step");
    assert!(
        matches!(exit, StepExit::Continue | StepExit::Branch),
        "unexpected exit: {exit:?}"
    );
}

#[test]
fn add_reg_reg_sets_carry_and_overflow() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put32(Gpr::Rax, 0x8000_0000);
    m.put32(Gpr::Rcx, 0x8000_0001);

    exec_one(&mut m, &mut bus, &[0x01, 0xC8]); // add eax, ecx

    assert_eq!(m.get32(Gpr::Rax), 1);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_OF));
    assert!(!m.get_flag(FLAGS_ZF));
    assert!(!m.get_flag(FLAGS_SF));
}

#[test]
fn thirty_two_bit_results_zero_extend() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0xdead_beef_0000_0001);
    m.put64(Gpr::Rcx, 1);

    exec_one(&mut m, &mut bus, &[0x01, 0xC8]);
    assert_eq!(m.get64(Gpr::Rax), 2);
}

#[test]
fn sixteen_bit_results_merge() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0xdead_beef_1234_0001);
    m.put64(Gpr::Rcx, 1);

    exec_one(&mut m, &mut bus, &[0x66, 0x01, 0xC8]); // add ax, cx
    assert_eq!(m.get64(Gpr::Rax), 0xdead_beef_1234_0002);
}

#[test]
fn high_byte_registers_resolve_without_rex() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0x1200);
    m.put64(Gpr::Rcx, 0x34);

    // 00 CC => add ah, cl
    exec_one(&mut m, &mut bus, &[0x00, 0xCC]);
    assert_eq!(m.get64(Gpr::Rax), 0x4600);

    // With REX, the same modrm targets SPL instead of AH.
    let mut m = Machine::new(DecodeMode::Long);
    m.put64(Gpr::Rsp, 0x12);
    m.put64(Gpr::Rcx, 0x34);
    exec_one(&mut m, &mut bus, &[0x40, 0x00, 0xCC]);
    assert_eq!(m.get64(Gpr::Rsp), 0x46);
}

#[test]
fn cmp_only_writes_flags() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 5);
    m.put64(Gpr::Rcx, 7);

    exec_one(&mut m, &mut bus, &[0x39, 0xC8]); // cmp eax, ecx
    assert_eq!(m.get64(Gpr::Rax), 5);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_SF));
}

#[test]
fn lazy_parity_byte_equals_result_low_byte() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    for (x, y) in [(0u64, 0u64), (1, 2), (0xFE, 1), (0x1234, 0x4321)] {
        m.put64(Gpr::Rax, x);
        m.put64(Gpr::Rcx, y);
        exec_one(&mut m, &mut bus, &[0x48, 0x01, 0xC8]); // add rax, rcx
        let z = m.get64(Gpr::Rax);
        assert_eq!(m.flags >> 24, z as u32 & 0xff, "x={x:#x} y={y:#x}");
        let expected_pf = (z as u8).count_ones() % 2 == 0;
        assert_eq!(m.get_flag(FLAGS_PF), expected_pf);
    }
}

#[test]
fn inc_preserves_carry_dec_sets_auxiliary() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.set_flag(FLAGS_CF, true);
    m.put64(Gpr::Rax, 0xFF);

    exec_one(&mut m, &mut bus, &[0xFF, 0xC0]); // inc eax
    assert_eq!(m.get32(Gpr::Rax), 0x100);
    assert!(m.get_flag(FLAGS_CF), "INC must not clobber CF");
    assert!(m.get_flag(FLAGS_AF));
}

#[test]
fn immediate_group_sign_extends_imm8() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0x10);

    exec_one(&mut m, &mut bus, &[0x48, 0x83, 0xC0, 0xF8]); // add rax, -8
    assert_eq!(m.get64(Gpr::Rax), 8);
}

#[test]
fn memory_operand_alu_reads_and_writes() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rdi, 0x2000);
    m.put64(Gpr::Rcx, 0x30);
    bus.load(0x2000, &0x12u32.to_le_bytes());

    exec_one(&mut m, &mut bus, &[0x01, 0x0F]); // add [rdi], ecx
    let mut b = [0u8; 4];
    b.copy_from_slice(&bus_read(&mut m, &mut bus, 0x2000, 4));
    assert_eq!(u32::from_le_bytes(b), 0x42);
}

fn bus_read(m: &mut Machine, bus: &mut FlatBus, addr: i64, n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    ember_cpu_core::mem::read_mem(m, bus, addr, &mut v).unwrap();
    v
}

#[test]
fn shifts_through_the_group_table() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 1);

    exec_one(&mut m, &mut bus, &[0xC1, 0xE0, 0x1F]); // shl eax, 31
    assert_eq!(m.get32(Gpr::Rax), 0x8000_0000);
    assert!(!m.get_flag(FLAGS_CF));

    exec_one(&mut m, &mut bus, &[0xD1, 0xE0]); // shl eax, 1
    assert_eq!(m.get32(Gpr::Rax), 0);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_ZF));

    m.put64(Gpr::Rax, 0x80);
    m.put64(Gpr::Rcx, 4);
    exec_one(&mut m, &mut bus, &[0xD2, 0xE8]); // shr al, cl
    assert_eq!(m.get_reg(0, Gpr::Rax), 0x08);
}

#[test]
fn rcr_byte_count_reduces_modulo_nine() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0x5A);
    m.set_flag(FLAGS_CF, true);

    // rcr al, 9 is a complete rotation through carry: nothing changes.
    exec_one(&mut m, &mut bus, &[0xC0, 0xD8, 0x09]);
    assert_eq!(m.get_reg(0, Gpr::Rax), 0x5A);
    assert!(m.get_flag(FLAGS_CF));
}

#[test]
fn divide_by_zero_is_a_fault_with_no_side_effects() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 100);
    m.put64(Gpr::Rdx, 0);
    m.put64(Gpr::Rcx, 0);

    bus.load(CODE_BASE, &[0x48, 0xF7, 0xF1]); // div rcx
    m.set_ip(CODE_BASE);
    assert_eq!(step(&mut m, &mut bus), Err(Exception::DivideError));
    assert_eq!(m.ip, CODE_BASE, "IP must point at the faulting divide");
    assert_eq!(m.get64(Gpr::Rax), 100);
}

#[test]
fn signed_divide_writes_quotient_and_remainder() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 7);
    m.put64(Gpr::Rdx, 0);
    m.put64(Gpr::Rsi, 2);

    exec_one(&mut m, &mut bus, &[0x48, 0xF7, 0xFE]); // idiv rsi
    assert_eq!(m.get64(Gpr::Rax), 3);
    assert_eq!(m.get64(Gpr::Rdx), 1);
}

#[test]
fn double_shift_concatenates_registers() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0x1122_3344);
    m.put64(Gpr::Rcx, 0xAABB_CCDD);

    // shld eax, ecx, 8
    exec_one(&mut m, &mut bus, &[0x0F, 0xA4, 0xC8, 0x08]);
    assert_eq!(m.get32(Gpr::Rax), 0x2233_44AA);
}

#[test]
fn bt_family_wraps_register_offsets_and_walks_memory() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x3000);
    m.put64(Gpr::Rcx, 33);

    // bts dword ptr [rsi], ecx: bit 33 lives in the next dword.
    exec_one(&mut m, &mut bus, &[0x0F, 0xAB, 0x0E]);
    assert!(!m.get_flag(FLAGS_CF));
    let b = bus_read(&mut m, &mut bus, 0x3004, 4);
    assert_eq!(u32::from_le_bytes(b.try_into().unwrap()), 0x2);

    // Register form wraps modulo the width.
    m.put64(Gpr::Rax, 0x2);
    m.put64(Gpr::Rcx, 33);
    exec_one(&mut m, &mut bus, &[0x0F, 0xA3, 0xC8]); // bt eax, ecx
    assert!(m.get_flag(FLAGS_CF));
}

#[test]
fn popcnt_and_bit_scans() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rcx, 0xF0F0);

    exec_one(&mut m, &mut bus, &[0xF3, 0x0F, 0xB8, 0xC1]); // popcnt eax, ecx
    assert_eq!(m.get64(Gpr::Rax), 8);

    exec_one(&mut m, &mut bus, &[0x0F, 0xBC, 0xD9]); // bsf ebx, ecx
    assert_eq!(m.get64(Gpr::Rbx), 4);
    exec_one(&mut m, &mut bus, &[0x0F, 0xBD, 0xD9]); // bsr ebx, ecx
    assert_eq!(m.get64(Gpr::Rbx), 15);

    // popcnt without the F3 prefix does not exist.
    bus.load(CODE_BASE, &[0x0F, 0xB8, 0xC1]);
    m.set_ip(CODE_BASE);
    assert_eq!(step(&mut m, &mut bus), Err(Exception::UndefinedInstruction));
}

#[test]
fn width_masked_kernels_match_the_wide_kernel() {
    // f_w(x, y) == f_64(x, y) & mask for pre-masked inputs, exercised
    // through the dispatcher with real encodings.
    let cases: &[(u64, u64)] = &[(0x7f, 0x01), (0xff, 0xff), (0x8000_0000, 1)];
    for &(x, y) in cases {
        for (prefix, mask) in [
            (vec![0x48u8], u64::MAX),
            (vec![], 0xffff_ffffu64),
            (vec![0x66], 0xffff),
        ] {
            let mut m = Machine::new(DecodeMode::Long);
            let mut bus = FlatBus::new(BUS_SIZE);
            m.put64(Gpr::Rax, x & mask);
            m.put64(Gpr::Rcx, y & mask);
            let mut code = prefix.clone();
            code.extend_from_slice(&[0x01, 0xC8]);
            exec_one(&mut m, &mut bus, &code);
            let narrow = m.get64(Gpr::Rax) & mask;
            assert_eq!(narrow, (x & mask).wrapping_add(y & mask) & mask);
        }
    }
}
