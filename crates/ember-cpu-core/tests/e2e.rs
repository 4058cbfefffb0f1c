//! End-to-end programs run through the dispatch loop until HLT.

use ember_cpu_core::exec::{run, step, StepExit};
use ember_cpu_core::fpu::Sw;
use ember_cpu_core::mem::{read_u64, FlatBus};
use ember_cpu_core::{Exception, Machine};
use ember_x86::{DecodeMode, Gpr};

const BUS_SIZE: usize = 0x10_000;
const CODE_BASE: u64 = 0x1000;

fn run_until_halt(m: &mut Machine, bus: &mut FlatBus, code: &[u8]) {
    bus.load(CODE_BASE, code);
    m.set_ip(CODE_BASE);
    let exit = run(m, bus, 1_000_000).expect("program faulted");
    assert_eq!(exit, StepExit::Halt, "program must reach hlt");
}

/// A trial-division counting loop that stops at its tenth hit, leaving 15
/// in EAX. The encoding exercises the ALU rows, CDQ, IDIV, Jcc, and the
/// SBB-as-conditional-increment idiom.
#[test]
fn counting_loop_halts_with_15() {
    let program = [
        0x31, 0xD2, // xor edx, edx
        0x45, 0x31, 0xC0, // xor r8d, r8d
        0x31, 0xC9, // xor ecx, ecx
        0xBE, 0x03, 0x00, 0x00, 0x00, // mov esi, 3
        0x41, 0xFF, 0xC0, // inc r8d
        0x44, 0x89, 0xC0, // mov eax, r8d
        0x83, 0xF9, 0x0A, // cmp ecx, 10
        0x74, 0x0B, // je +11 (hlt)
        0x99, // cdq
        0xF7, 0xFE, // idiv esi
        0x83, 0xFA, 0x01, // cmp edx, 1
        0x83, 0xD9, 0xFF, // sbb ecx, -1
        0xEB, 0xEA, // jmp back to inc
        0xF4, // hlt
    ];
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    run_until_halt(&mut m, &mut bus, &program);
    assert_eq!(m.get32(Gpr::Rax), 15);
}

/// Gauss-Legendre-flavoured π: a handful of x87 ops whose top of stack
/// must converge to within 1e-4.
#[test]
fn x87_pi_approximation() {
    // fldpi is cheating, so build π from atan: pi = 4 * atan(1):
    //   fld1; fld1; fpatan  -> atan(1) = pi/4
    //   fld1; fld1; faddp   -> 2
    //   fmulp               -> pi/2
    //   fld1; fld1; faddp   -> 2
    //   fmulp               -> pi
    let program = [
        0xD9, 0xE8, // fld1
        0xD9, 0xE8, // fld1
        0xD9, 0xF3, // fpatan
        0xD9, 0xE8, // fld1
        0xD9, 0xE8, // fld1
        0xDE, 0xC1, // faddp
        0xDE, 0xC9, // fmulp
        0xD9, 0xE8, // fld1
        0xD9, 0xE8, // fld1
        0xDE, 0xC1, // faddp
        0xDE, 0xC9, // fmulp
        0xF4, // hlt
    ];
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    run_until_halt(&mut m, &mut bus, &program);
    let top = m.fpu.peek(0);
    assert!((top - std::f64::consts::PI).abs() < 1e-4, "got {top}");
}

/// `fld -1.5; fld1; fprem` leaves 1.0 on top with the reduction complete.
#[test]
fn fprem_sign_and_completion() {
    let program = [
        0xDD, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, // fld qword ptr [0x2000]
        0xD9, 0xE8, // fld1
        0xD9, 0xF8, // fprem (st0 = 1.0 mod -1.5)
        0xF4, // hlt
    ];
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x2000, &(-1.5f64).to_le_bytes());
    run_until_halt(&mut m, &mut bus, &program);
    assert_eq!(m.fpu.peek(0), 1.0);
    assert!(!m.fpu.sw.contains(Sw::C2), "reduction is complete");
}

/// The LEA address-size scenario: 64-bit arithmetic without the 67
/// prefix, 32-bit truncation with it.
#[test]
fn lea_address_size_override() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rbx, 0x2);
    m.put64(Gpr::Rax, 0xffff_ffff);

    bus.load(CODE_BASE, &[0x48, 0x8D, 0x0C, 0x03]); // lea rcx, [rbx+rax]
    m.set_ip(CODE_BASE);
    step(&mut m, &mut bus).unwrap();
    assert_eq!(m.get64(Gpr::Rcx), 0x1_0000_0001);

    bus.load(CODE_BASE, &[0x67, 0x48, 0x8D, 0x0C, 0x03]); // addr32 lea
    m.set_ip(CODE_BASE);
    step(&mut m, &mut bus).unwrap();
    assert_eq!(m.get64(Gpr::Rcx), 0x0000_0001);
}

/// A quadword store four bytes shy of a page boundary must be atomic at
/// the instruction boundary: both pages change together.
#[test]
fn cross_page_store_commits_both_pages() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    let addr = 0x2000u64 - 4;
    m.put64(Gpr::Rdi, addr);
    m.put64(Gpr::Rax, 0x1122_3344_5566_7788);

    bus.load(CODE_BASE, &[0x48, 0x89, 0x07]); // mov [rdi], rax
    m.set_ip(CODE_BASE);
    step(&mut m, &mut bus).unwrap();
    assert_eq!(
        read_u64(&mut m, &mut bus, addr as i64).unwrap(),
        0x1122_3344_5566_7788
    );
}

/// Same store against an unwritable second page: nothing may change.
#[test]
fn cross_page_store_faults_atomically() {
    let mut m = Machine::new(DecodeMode::Long);
    // A bus that ends exactly at the page boundary: the second page of
    // the split store does not exist.
    let mut bus = FlatBus::new(0x2000);
    let addr = 0x2000u64 - 4;
    m.put64(Gpr::Rdi, addr);
    m.put64(Gpr::Rax, 0x1122_3344_5566_7788);
    bus.load(CODE_BASE, &[0x48, 0x89, 0x07]);
    m.set_ip(CODE_BASE);

    let err = step(&mut m, &mut bus).unwrap_err();
    assert!(matches!(err, Exception::SegmentationFault { .. }));
    assert_eq!(m.faultaddr, 0x2000);
    // The first page is untouched.
    let mut b = [0u8; 4];
    ember_cpu_core::mem::read_mem(&mut m, &mut bus, addr as i64, &mut b).unwrap();
    assert_eq!(b, [0; 4]);
}

#[test]
fn cpuid_contract_through_the_dispatcher() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    m.put64(Gpr::Rax, 0x4000_0000);
    bus.load(CODE_BASE, &[0x0F, 0xA2]);
    m.set_ip(CODE_BASE);
    step(&mut m, &mut bus).unwrap();
    let mut vendor = [0u8; 12];
    vendor[..4].copy_from_slice(&(m.get32(Gpr::Rbx) as u32).to_le_bytes());
    vendor[4..8].copy_from_slice(&(m.get32(Gpr::Rcx) as u32).to_le_bytes());
    vendor[8..].copy_from_slice(&(m.get32(Gpr::Rdx) as u32).to_le_bytes());
    assert_eq!(&vendor, b"GenuineEmber");
}

#[test]
fn rdrand_reports_carry() {
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(CODE_BASE, &[0x48, 0x0F, 0xC7, 0xF0]); // rdrand rax
    m.set_ip(CODE_BASE);
    step(&mut m, &mut bus).unwrap();
    assert!(m.get_flag(ember_cpu_core::flags::FLAGS_CF));
}

#[test]
fn real_mode_program_with_segments() {
    let mut m = Machine::new(DecodeMode::Real);
    let mut bus = FlatBus::new(BUS_SIZE);
    // mov ax, 0x1234; mov bx, ax; hlt at 0x7C00.
    bus.load(0x7C00, &[0xB8, 0x34, 0x12, 0x89, 0xC3, 0xF4]);
    m.segs[ember_cpu_core::state::SEG_CS].base = 0x7C00;
    m.set_ip(0);
    let exit = run(&mut m, &mut bus, 16).unwrap();
    assert_eq!(exit, StepExit::Halt);
    assert_eq!(m.get16(Gpr::Rbx), 0x1234);
}

/// The interpreter as a whole: a memcpy-alike loop mixing string ops,
/// partial registers, and flags.
#[test]
fn strlen_like_loop() {
    let program = [
        0x31, 0xC0, // xor eax, eax
        0x48, 0x89, 0xF7, // mov rdi, rsi
        0xAC, // lodsb
        0x84, 0xC0, // test al, al
        0x75, 0xFB, // jnz -5 (back to lodsb)
        0x48, 0x89, 0xF0, // mov rax, rsi
        0x48, 0x29, 0xF8, // sub rax, rdi
        0x48, 0xFF, 0xC8, // dec rax
        0xF4, // hlt
    ];
    let mut m = Machine::new(DecodeMode::Long);
    let mut bus = FlatBus::new(BUS_SIZE);
    bus.load(0x2000, b"a string of length 21\0");
    m.put64(Gpr::Rsi, 0x2000);
    run_until_halt(&mut m, &mut bus, &program);
    assert_eq!(m.get64(Gpr::Rax), 21);
}
