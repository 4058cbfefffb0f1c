use ember_cpu_core::exec::step;
use ember_cpu_core::flags::{FLAGS_CF, FLAGS_OF, FLAGS_SF, FLAGS_ZF};
use ember_cpu_core::mem::{read_u128, read_u32, read_u64, read_u8, FlatBus};
use ember_cpu_core::{Exception, Machine};
use ember_x86::{DecodeMode, Gpr};

const BUS_SIZE: usize = 0x10_000;
const CODE_BASE: u64 = 0x1000;

fn exec(m: &mut Machine, bus: &mut FlatBus, code: &[u8]) {
    bus.load(CODE_BASE, code);
    m.set_ip(CODE_BASE);
    step(m, bus).expect("step");
}

fn expect_ud(m: &mut Machine, bus: &mut FlatBus, code: &[u8]) {
    bus.load(CODE_BASE, code);
    m.set_ip(CODE_BASE);
    assert_eq!(step(m, bus), Err(Exception::UndefinedInstruction));
}

#[test]
fn lock_cmpxchg_byte_success_and_failure() {
    // Success: memory matches AL, so CL replaces it.
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x200);
    m.put_reg(0, Gpr::Rax, 0x11);
    m.put_reg(0, Gpr::Rcx, 0x22);
    bus.load(0x200, &[0x11]);

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xB0, 0x0E]);
    assert_eq!(read_u8(&mut m, &mut bus, 0x200).unwrap(), 0x22);
    assert_eq!(m.get_reg(0, Gpr::Rax), 0x11);
    assert!(m.get_flag(FLAGS_ZF));

    // Failure exercises the subtraction flags.
    let mut m = Machine::new(DecodeMode::Long);
    m.put64(Gpr::Rsi, 0x210);
    m.put_reg(0, Gpr::Rax, 0x01);
    m.put_reg(0, Gpr::Rcx, 0x33);
    bus.load(0x210, &[0x80]);

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xB0, 0x0E]);
    assert_eq!(read_u8(&mut m, &mut bus, 0x210).unwrap(), 0x80);
    assert_eq!(m.get_reg(0, Gpr::Rax), 0x80);
    assert!(!m.get_flag(FLAGS_ZF));
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_OF));
    assert!(m.get_flag(FLAGS_SF));
}

#[test]
fn lock_cmpxchg_wide_sizes() {
    // 64-bit success.
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x260);
    m.put64(Gpr::Rax, 0x1111_1111_2222_2222);
    m.put64(Gpr::Rcx, 0x3333_3333_4444_4444);
    bus.load(0x260, &0x1111_1111_2222_2222u64.to_le_bytes());

    exec(&mut m, &mut bus, &[0xF0, 0x48, 0x0F, 0xB1, 0x0E]);
    assert_eq!(
        read_u64(&mut m, &mut bus, 0x260).unwrap(),
        0x3333_3333_4444_4444
    );
    assert!(m.get_flag(FLAGS_ZF));

    // 32-bit failure loads the old value into EAX.
    let mut m = Machine::new(DecodeMode::Long);
    m.put64(Gpr::Rsi, 0x250);
    m.put64(Gpr::Rax, 2);
    m.put64(Gpr::Rcx, 0x3333_3333);
    bus.load(0x250, &1u32.to_le_bytes());

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xB1, 0x0E]);
    assert_eq!(read_u32(&mut m, &mut bus, 0x250).unwrap(), 1);
    assert_eq!(m.get64(Gpr::Rax), 1);
    assert!(!m.get_flag(FLAGS_ZF));
}

#[test]
fn cmpxchg8b_and_16b() {
    // 8B success in legacy mode.
    let mut m = Machine::new(DecodeMode::Legacy);
    let mut bus = FlatBus::new(BUS_SIZE);
    let addr = 0x300u64;
    m.put64(Gpr::Rsi, addr);
    let expected = 0x1122_3344_5566_7788u64;
    let replacement = 0xAABB_CCDD_EEFF_0011u64;
    bus.load(addr, &expected.to_le_bytes());
    m.put32(Gpr::Rax, expected & 0xffff_ffff);
    m.put32(Gpr::Rdx, expected >> 32);
    m.put32(Gpr::Rbx, replacement & 0xffff_ffff);
    m.put32(Gpr::Rcx, replacement >> 32);

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xC7, 0x0E]);
    assert_eq!(
        read_u64(&mut m, &mut bus, addr as i64).unwrap(),
        replacement
    );
    assert!(m.get_flag(FLAGS_ZF));

    // 16B success.
    let mut m = Machine::new(DecodeMode::Long);
    let addr = 0x400i64;
    m.put64(Gpr::Rsi, addr as u64);
    let expected = 0x99AA_BBCC_DDEE_FF00_1122_3344_5566_7788u128;
    let replacement = 0xB0B1_B2B3_B4B5_B6B7_A0A1_A2A3_A4A5_A6A7u128;
    bus.load(addr as u64, &expected.to_le_bytes());
    m.put64(Gpr::Rax, expected as u64);
    m.put64(Gpr::Rdx, (expected >> 64) as u64);
    m.put64(Gpr::Rbx, replacement as u64);
    m.put64(Gpr::Rcx, (replacement >> 64) as u64);

    exec(&mut m, &mut bus, &[0xF0, 0x48, 0x0F, 0xC7, 0x0E]);
    assert_eq!(read_u128(&mut m, &mut bus, addr).unwrap(), replacement);
    assert!(m.get_flag(FLAGS_ZF));

    // 16B failure refreshes RDX:RAX.
    let mut m = Machine::new(DecodeMode::Long);
    let addr = 0x420i64;
    m.put64(Gpr::Rsi, addr as u64);
    let old = 0x3333_3333_4444_4444_1111_1111_2222_2222u128;
    bus.load(addr as u64, &old.to_le_bytes());
    m.put64(Gpr::Rax, 0x5555);
    m.put64(Gpr::Rdx, 0x6666);
    exec(&mut m, &mut bus, &[0xF0, 0x48, 0x0F, 0xC7, 0x0E]);
    assert!(!m.get_flag(FLAGS_ZF));
    assert_eq!(m.get64(Gpr::Rax), old as u64);
    assert_eq!(m.get64(Gpr::Rdx), (old >> 64) as u64);
}

#[test]
fn cmpxchg16b_requires_natural_alignment() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x401);
    bus.load(CODE_BASE, &[0xF0, 0x48, 0x0F, 0xC7, 0x0E]);
    m.set_ip(CODE_BASE);
    assert_eq!(step(&mut m, &mut bus), Err(Exception::ProtectionFault));
}

#[test]
fn lock_xadd_swaps_in_the_old_value() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x500);
    bus.load(0x500, &0x8000_0000u32.to_le_bytes());
    m.put32(Gpr::Rcx, 0x8000_0001);

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xC1, 0x0E]);
    assert_eq!(read_u32(&mut m, &mut bus, 0x500).unwrap(), 1);
    assert_eq!(m.get32(Gpr::Rcx), 0x8000_0000);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_OF));
}

#[test]
fn lock_alu_read_modify_writes() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x540);
    bus.load(0x540, &0x8000_0000u32.to_le_bytes());
    m.put32(Gpr::Rcx, 0x8000_0001);

    exec(&mut m, &mut bus, &[0xF0, 0x01, 0x0E]); // lock add [rsi], ecx
    assert_eq!(read_u32(&mut m, &mut bus, 0x540).unwrap(), 1);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_OF));

    // lock inc preserves CF.
    m.set_flag(FLAGS_CF, true);
    bus.load(0x550, &0x7FFF_FFFFu32.to_le_bytes());
    m.put64(Gpr::Rsi, 0x550);
    exec(&mut m, &mut bus, &[0xF0, 0xFF, 0x06]);
    assert_eq!(read_u32(&mut m, &mut bus, 0x550).unwrap(), 0x8000_0000);
    assert!(m.get_flag(FLAGS_CF));
    assert!(m.get_flag(FLAGS_OF));
}

#[test]
fn lock_bit_test_ops() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x700);
    m.put64(Gpr::Rcx, 33);

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xAB, 0x0E]); // lock bts
    assert_eq!(read_u32(&mut m, &mut bus, 0x704).unwrap(), 0x2);
    assert!(!m.get_flag(FLAGS_CF));

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xB3, 0x0E]); // lock btr
    assert_eq!(read_u32(&mut m, &mut bus, 0x704).unwrap(), 0);
    assert!(m.get_flag(FLAGS_CF));

    exec(&mut m, &mut bus, &[0xF0, 0x0F, 0xBB, 0x0E]); // lock btc
    assert_eq!(read_u32(&mut m, &mut bus, 0x704).unwrap(), 0x2);
    assert!(!m.get_flag(FLAGS_CF));
}

#[test]
fn xchg_with_memory_is_implicitly_atomic() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rsi, 0x200);
    bus.load(0x200, &0xAABB_CCDDu32.to_le_bytes());
    m.put32(Gpr::Rax, 0x1234_5678);

    exec(&mut m, &mut bus, &[0x87, 0x06]); // xchg [rsi], eax
    assert_eq!(read_u32(&mut m, &mut bus, 0x200).unwrap(), 0x1234_5678);
    assert_eq!(m.get32(Gpr::Rax), 0xAABB_CCDD);
}

#[test]
fn lock_on_register_operands_is_undefined() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    expect_ud(&mut m, &mut bus, &[0xF0, 0x01, 0xC8]); // lock add eax, ecx
    expect_ud(&mut m, &mut bus, &[0xF0, 0x0F, 0xB1, 0xC8]); // lock cmpxchg
    expect_ud(&mut m, &mut bus, &[0xF0, 0x0F, 0xC1, 0xC8]); // lock xadd
    expect_ud(&mut m, &mut bus, &[0xF0, 0x87, 0xC8]); // lock xchg
    expect_ud(&mut m, &mut bus, &[0xF0, 0xFF, 0xC0]); // lock inc eax
}

#[test]
fn locked_rmw_split_across_pages_is_not_torn() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    let addr = 0x2000 - 4; // straddles the page boundary
    m.put64(Gpr::Rsi, addr);
    bus.load(addr, &0xFFFF_FFFF_FFFF_FFFFu64.to_le_bytes());
    m.put64(Gpr::Rcx, 1);

    exec(&mut m, &mut bus, &[0xF0, 0x48, 0x01, 0x0E]); // lock add [rsi], rcx
    assert_eq!(read_u64(&mut m, &mut bus, addr as i64).unwrap(), 0);
    assert!(m.get_flag(FLAGS_CF));
}
