//! The fetch-decode-dispatch loop.
//!
//! A primary table of 0x200 handlers covers the one-byte map and `0F`;
//! the sparse three-byte maps fall through to [`dispatch_sparse`]. The
//! dispatcher advances IP by the decoded length before calling the
//! handler, so branch handlers overwrite it and everything else falls
//! through. After every retired instruction any pending split store is
//! committed, which is what makes cross-page writes atomic at the
//! instruction boundary.

pub(crate) mod arith;
pub(crate) mod data;
pub(crate) mod flow;
pub(crate) mod fp;
pub(crate) mod misc;
pub(crate) mod string;
pub(crate) mod vector;

use crate::addr::Args;
use crate::exception::{Exception, PendingExit};
use crate::mem::{self, Bus};
use crate::state::Machine;
use ember_x86::{decode_one, DecodeError, Decoded};

pub(crate) type R = Result<(), Exception>;

/// How one [`step`] ended, when it did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// Straight-line instruction retired.
    Continue,
    /// The instruction changed IP.
    Branch,
    /// SYSCALL retired; the OS layer takes over with IP past it.
    Syscall,
    /// INT n / INT3 / ICEBP retired.
    Interrupt(u8),
    /// PAUSE: an invitation to yield.
    Pause,
    /// HLT retired.
    Halt,
}

/// The uniform handler shape every dispatch-table entry has.
pub type OpFn = fn(&mut Machine, &mut dyn Bus, Args) -> Result<(), Exception>;

/// Resolves the handler the dispatcher would run for this instruction.
/// Path builders record these to replay the trace later.
pub fn lookup(rde: ember_x86::Rde) -> OpFn {
    let index = rde.mopcode() as usize;
    if index < 0x200 {
        DISPATCH[index]
    } else {
        sparse_trampoline
    }
}

fn sparse_trampoline(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    dispatch_sparse(m, bus, a, a.rde.mopcode() as usize)
}

/// Executes one instruction at CS:IP.
pub fn step(m: &mut Machine, bus: &mut dyn Bus) -> Result<StepExit, Exception> {
    let start_ip = m.ip;
    let pc = m.pc();
    let (bytes, avail) = mem::fetch(m, bus, pc)?;
    let d = match decode_one(m.mode, &bytes[..avail]) {
        Ok(d) => d,
        Err(DecodeError::TooShort(_)) => {
            // The mapping ended inside the instruction.
            return Err(m.segv(pc + avail as i64));
        }
        Err(_) => return Err(Exception::UndefinedInstruction),
    };
    match execute(m, bus, &d) {
        Ok(()) => {
            commit(m, bus)?;
            if let Some(exit) = m.pending_exit.take() {
                return Ok(match exit {
                    PendingExit::Syscall => StepExit::Syscall,
                    PendingExit::Interrupt(n) => StepExit::Interrupt(n),
                    PendingExit::Pause => StepExit::Pause,
                    PendingExit::Halt => StepExit::Halt,
                });
            }
            let expected = start_ip.wrapping_add(d.len() as u64);
            if m.masked_ip() == crate::state::mask_address(m.mode, expected) {
                Ok(StepExit::Continue)
            } else {
                Ok(StepExit::Branch)
            }
        }
        Err(e) => {
            // No partial effects: drop any in-flight split store and leave
            // IP pointing at the faulting instruction.
            mem::drop_stash(m);
            m.pending_exit = None;
            m.ip = start_ip;
            if let Exception::SegmentationFault { addr } = e {
                m.faultaddr = addr;
            }
            tracing::debug!(ip = format_args!("{:#x}", start_ip), %e, "instruction faulted");
            Err(e)
        }
    }
}

/// Dispatches one already-decoded instruction, advancing IP first.
pub fn execute(m: &mut Machine, bus: &mut dyn Bus, d: &Decoded) -> R {
    m.set_ip(m.ip.wrapping_add(d.len() as u64));
    let a = Args::new(d.rde, d.disp, d.uimm).with_uimm1(d.uimm1);
    lookup(d.rde)(m, bus, a)
}

fn commit(m: &mut Machine, bus: &mut dyn Bus) -> R {
    mem::commit_stash(m, bus)
}

/// The secondary maps (`0F 38`, `0F 3A`) are sparse enough for a match.
fn dispatch_sparse(m: &mut Machine, bus: &mut dyn Bus, a: Args, index: usize) -> R {
    match index {
        0x200 => vector::pshufb(m, bus, a),
        0x201 => vector::phaddw(m, bus, a),
        0x202 => vector::phaddd(m, bus, a),
        0x203 => vector::phaddsw(m, bus, a),
        0x204 => vector::pmaddubsw(m, bus, a),
        0x205 => vector::phsubw(m, bus, a),
        0x206 => vector::phsubd(m, bus, a),
        0x207 => vector::phsubsw(m, bus, a),
        0x208 => vector::psignb(m, bus, a),
        0x209 => vector::psignw(m, bus, a),
        0x20A => vector::psignd(m, bus, a),
        0x20B => vector::pmulhrsw(m, bus, a),
        0x21C => vector::pabsb(m, bus, a),
        0x21D => vector::pabsw(m, bus, a),
        0x21E => vector::pabsd(m, bus, a),
        0x22A => vector::movntdqa(m, bus, a),
        0x240 => vector::pmulld(m, bus, a),
        0x2F0 | 0x2F1 => arith::crc32_op(m, bus, a),
        #[cfg(feature = "bmi2")]
        0x2F5 => arith::pdep_pext(m, bus, a),
        #[cfg(feature = "bmi2")]
        0x2F6 => arith::mulx(m, bus, a),
        0x30F => vector::palignr(m, bus, a),
        #[cfg(feature = "bmi2")]
        0x3F0 => arith::rorx(m, bus, a),
        _ => Err(Exception::UndefinedInstruction),
    }
}

/// The primary dispatch table, indexed `map << 8 | opcode`.
static DISPATCH: [OpFn; 0x200] = build_dispatch();

const fn build_dispatch() -> [OpFn; 0x200] {
    let mut t: [OpFn; 0x200] = [misc::ud; 0x200];
    // The eight ALU rows at 00..3D.
    let mut row = 0;
    while row < 8 {
        let base = row * 8;
        t[base] = arith::alub;
        t[base + 1] = arith::aluw;
        t[base + 2] = arith::alub_flip;
        t[base + 3] = arith::aluw_flip;
        t[base + 4] = arith::alu_al_ib;
        t[base + 5] = arith::alu_rax_ivds;
        row += 1;
    }
    t[0x06] = flow::push_seg;
    t[0x07] = flow::pop_seg;
    t[0x0E] = flow::push_seg;
    t[0x16] = flow::push_seg;
    t[0x17] = flow::pop_seg;
    t[0x1E] = flow::push_seg;
    t[0x1F] = flow::pop_seg;
    t[0x27] = arith::daa;
    t[0x2F] = arith::das;
    t[0x37] = arith::aaa;
    t[0x3F] = arith::aas;
    let mut i = 0x40;
    while i < 0x48 {
        t[i] = arith::inc_zv;
        i += 1;
    }
    while i < 0x50 {
        t[i] = arith::dec_zv;
        i += 1;
    }
    while i < 0x58 {
        t[i] = flow::push_zvq;
        i += 1;
    }
    while i < 0x60 {
        t[i] = flow::pop_zvq;
        i += 1;
    }
    t[0x60] = flow::pusha;
    t[0x61] = flow::popa;
    t[0x63] = data::movsxd;
    t[0x68] = flow::push_imm;
    t[0x69] = arith::imul_gvqp_evqp_imm;
    t[0x6A] = flow::push_imm;
    t[0x6B] = arith::imul_gvqp_evqp_imm;
    t[0x6C] = string::ins;
    t[0x6D] = string::ins;
    t[0x6E] = string::outs;
    t[0x6F] = string::outs;
    i = 0x70;
    while i < 0x80 {
        t[i] = flow::jcc;
        i += 1;
    }
    t[0x80] = arith::alubi_reg;
    t[0x81] = arith::aluwi_reg;
    t[0x82] = arith::alubi_reg;
    t[0x83] = arith::aluwi_reg;
    t[0x84] = arith::alub_test;
    t[0x85] = arith::aluw_test;
    t[0x86] = data::xchg_gb_eb;
    t[0x87] = data::xchg_gvqp_evqp;
    t[0x88] = data::mov_eb_gb;
    t[0x89] = data::mov_evqp_gvqp;
    t[0x8A] = data::mov_gb_eb;
    t[0x8B] = data::mov_gvqp_evqp;
    t[0x8C] = data::mov_evqp_sw;
    t[0x8D] = data::lea;
    t[0x8E] = data::mov_sw_evqp;
    t[0x8F] = flow::pop_evq;
    t[0x90] = misc::nop_or_pause;
    i = 0x91;
    while i < 0x98 {
        t[i] = data::xchg_zvqp;
        i += 1;
    }
    t[0x98] = data::sax;
    t[0x99] = data::convert;
    t[0x9A] = flow::callf;
    t[0x9B] = misc::fwait;
    t[0x9C] = flow::pushf;
    t[0x9D] = flow::popf;
    t[0x9E] = flow::sahf;
    t[0x9F] = flow::lahf;
    t[0xA0] = data::mov_al_ob;
    t[0xA1] = data::mov_rax_ovqp;
    t[0xA2] = data::mov_ob_al;
    t[0xA3] = data::mov_ovqp_rax;
    t[0xA4] = string::movs;
    t[0xA5] = string::movs;
    t[0xA6] = string::cmps;
    t[0xA7] = string::cmps;
    t[0xA8] = arith::test_al_ib;
    t[0xA9] = arith::test_rax_ivds;
    t[0xAA] = string::stos;
    t[0xAB] = string::stos;
    t[0xAC] = string::lods;
    t[0xAD] = string::lods;
    t[0xAE] = string::scas;
    t[0xAF] = string::scas;
    i = 0xB0;
    while i < 0xB8 {
        t[i] = data::mov_zb_ib;
        i += 1;
    }
    while i < 0xC0 {
        t[i] = data::mov_zvqp_ivqp;
        i += 1;
    }
    t[0xC0] = arith::bsubi_imm;
    t[0xC1] = arith::bsuwi_imm;
    t[0xC2] = flow::ret;
    t[0xC3] = flow::ret;
    t[0xC4] = flow::les;
    t[0xC5] = flow::lds;
    t[0xC6] = data::mov_eb_ib;
    t[0xC7] = data::mov_evqp_ivds;
    t[0xC8] = flow::enter;
    t[0xC9] = flow::leave;
    t[0xCA] = flow::retf;
    t[0xCB] = flow::retf;
    t[0xCC] = misc::int3;
    t[0xCD] = misc::int_imm;
    t[0xD0] = arith::bsubi_one;
    t[0xD1] = arith::bsuwi_one;
    t[0xD2] = arith::bsubi_cl;
    t[0xD3] = arith::bsuwi_cl;
    t[0xD4] = arith::aam;
    t[0xD5] = arith::aad;
    t[0xD6] = arith::salc;
    t[0xD7] = data::xlat;
    i = 0xD8;
    while i < 0xE0 {
        t[i] = fp::fpu;
        i += 1;
    }
    t[0xE0] = flow::loop_op;
    t[0xE1] = flow::loop_op;
    t[0xE2] = flow::loop_op;
    t[0xE3] = flow::jcxz;
    t[0xE4] = misc::in_al_imm;
    t[0xE5] = misc::in_ax_imm;
    t[0xE6] = misc::out_imm_al;
    t[0xE7] = misc::out_imm_ax;
    t[0xE8] = flow::call_jvds;
    t[0xE9] = flow::jmp;
    t[0xEA] = flow::jmpf;
    t[0xEB] = flow::jmp;
    t[0xEC] = misc::in_al_dx;
    t[0xED] = misc::in_ax_dx;
    t[0xEE] = misc::out_dx_al;
    t[0xEF] = misc::out_dx_ax;
    t[0xF1] = misc::int1;
    t[0xF4] = misc::hlt;
    t[0xF5] = misc::cmc;
    t[0xF6] = arith::group_f6;
    t[0xF7] = arith::group_f7;
    t[0xF8] = misc::clc;
    t[0xF9] = misc::stc;
    t[0xFA] = misc::cli;
    t[0xFB] = misc::sti;
    t[0xFC] = misc::cld;
    t[0xFD] = misc::std;
    t[0xFE] = arith::group_fe;
    t[0xFF] = flow::group_ff;

    // Map 1 (0F xx).
    t[0x101] = misc::group_101;
    t[0x103] = misc::lsl;
    t[0x105] = misc::syscall;
    t[0x10B] = misc::ud; // ud2
    t[0x10D] = misc::hint_nop_ev;
    t[0x110] = vector::mov_0f10;
    t[0x111] = vector::mov_0f11;
    t[0x112] = vector::mov_0f12;
    t[0x113] = vector::mov_0f13;
    t[0x114] = vector::unpcklpsd;
    t[0x115] = vector::unpckhpsd;
    t[0x116] = vector::mov_0f16;
    t[0x117] = vector::mov_0f17;
    i = 0x118;
    while i < 0x120 {
        t[i] = misc::hint_nop_ev;
        i += 1;
    }
    t[0x11F] = misc::nop_ev;
    t[0x120] = misc::mov_rq_cq;
    t[0x122] = misc::mov_cq_rq;
    t[0x128] = vector::mov_0f28;
    t[0x129] = vector::mov_0f29;
    t[0x12A] = vector::cvt_0f2a;
    t[0x12B] = vector::mov_0f2b;
    t[0x12C] = vector::cvtt_0f2c;
    t[0x12D] = vector::cvt_0f2d;
    t[0x12E] = vector::comis;
    t[0x12F] = vector::comis;
    t[0x130] = misc::wrmsr;
    t[0x131] = misc::rdtsc;
    t[0x132] = misc::rdmsr;
    i = 0x140;
    while i < 0x150 {
        t[i] = data::cmovcc;
        i += 1;
    }
    t[0x150] = vector::movmskpsd;
    t[0x151] = vector::sqrtpsd;
    t[0x152] = vector::rsqrtps;
    t[0x153] = vector::rcpps;
    t[0x154] = vector::andpsd;
    t[0x155] = vector::andnpsd;
    t[0x156] = vector::orpsd;
    t[0x157] = vector::xorpsd;
    t[0x158] = vector::addpsd;
    t[0x159] = vector::mulpsd;
    t[0x15A] = vector::cvt_0f5a;
    t[0x15B] = vector::cvt_0f5b;
    t[0x15C] = vector::subpsd;
    t[0x15D] = vector::minpsd;
    t[0x15E] = vector::divpsd;
    t[0x15F] = vector::maxpsd;
    t[0x160] = vector::punpcklbw;
    t[0x161] = vector::punpcklwd;
    t[0x162] = vector::punpckldq;
    t[0x163] = vector::packsswb;
    t[0x164] = vector::pcmpgtb;
    t[0x165] = vector::pcmpgtw;
    t[0x166] = vector::pcmpgtd;
    t[0x167] = vector::packuswb;
    t[0x168] = vector::punpckhbw;
    t[0x169] = vector::punpckhwd;
    t[0x16A] = vector::punpckhdq;
    t[0x16B] = vector::packssdw;
    t[0x16C] = vector::punpcklqdq;
    t[0x16D] = vector::punpckhqdq;
    t[0x16E] = vector::mov_0f6e;
    t[0x16F] = vector::mov_0f6f;
    t[0x170] = vector::shuffle;
    t[0x171] = vector::group_171;
    t[0x172] = vector::group_172;
    t[0x173] = vector::group_173;
    t[0x174] = vector::pcmpeqb;
    t[0x175] = vector::pcmpeqw;
    t[0x176] = vector::pcmpeqd;
    t[0x177] = misc::emms;
    t[0x17C] = vector::haddpsd;
    t[0x17D] = vector::hsubpsd;
    t[0x17E] = vector::mov_0f7e;
    t[0x17F] = vector::mov_0f7f;
    i = 0x180;
    while i < 0x190 {
        t[i] = flow::jcc;
        i += 1;
    }
    while i < 0x1A0 {
        t[i] = data::setcc;
        i += 1;
    }
    t[0x1A0] = flow::push_seg;
    t[0x1A1] = flow::pop_seg;
    t[0x1A2] = misc::cpuid_op;
    t[0x1A3] = arith::bit_ops;
    t[0x1A4] = arith::double_shift;
    t[0x1A5] = arith::double_shift;
    t[0x1A8] = flow::push_seg;
    t[0x1A9] = flow::pop_seg;
    t[0x1AB] = arith::bit_ops;
    t[0x1AC] = arith::double_shift;
    t[0x1AD] = arith::double_shift;
    t[0x1AE] = misc::group_1ae;
    t[0x1AF] = arith::imul_gvqp_evqp;
    t[0x1B0] = data::cmpxchg_eb;
    t[0x1B1] = data::cmpxchg_evqp;
    t[0x1B3] = arith::bit_ops;
    t[0x1B6] = data::movzb;
    t[0x1B7] = data::movzw;
    t[0x1B8] = arith::group_1b8;
    t[0x1BA] = arith::bit_ops;
    t[0x1BB] = arith::bit_ops;
    t[0x1BC] = arith::bsf;
    t[0x1BD] = arith::bsr;
    t[0x1BE] = data::movsb_ext;
    t[0x1BF] = data::movsw_ext;
    t[0x1C0] = data::xadd_eb;
    t[0x1C1] = data::xadd_evqp;
    t[0x1C2] = vector::cmppsd;
    t[0x1C3] = data::movnti;
    t[0x1C4] = vector::pinsrw;
    t[0x1C5] = vector::pextrw;
    t[0x1C6] = vector::shufpsd;
    t[0x1C7] = data::group_1c7;
    i = 0x1C8;
    while i < 0x1D0 {
        t[i] = data::bswap;
        i += 1;
    }
    t[0x1D0] = vector::addsubpsd;
    t[0x1D1] = vector::psrlw_v;
    t[0x1D2] = vector::psrld_v;
    t[0x1D3] = vector::psrlq_v;
    t[0x1D4] = vector::paddq;
    t[0x1D5] = vector::pmullw;
    t[0x1D6] = vector::mov_0fd6;
    t[0x1D7] = vector::pmovmskb;
    t[0x1D8] = vector::psubusb;
    t[0x1D9] = vector::psubusw;
    t[0x1DA] = vector::pminub;
    t[0x1DB] = vector::pand;
    t[0x1DC] = vector::paddusb;
    t[0x1DD] = vector::paddusw;
    t[0x1DE] = vector::pmaxub;
    t[0x1DF] = vector::pandn;
    t[0x1E0] = vector::pavgb;
    t[0x1E1] = vector::psraw_v;
    t[0x1E2] = vector::psrad_v;
    t[0x1E3] = vector::pavgw;
    t[0x1E4] = vector::pmulhuw;
    t[0x1E5] = vector::pmulhw;
    t[0x1E6] = vector::cvt_0fe6;
    t[0x1E7] = vector::mov_0fe7;
    t[0x1E8] = vector::psubsb;
    t[0x1E9] = vector::psubsw;
    t[0x1EA] = vector::pminsw;
    t[0x1EB] = vector::por;
    t[0x1EC] = vector::paddsb;
    t[0x1ED] = vector::paddsw;
    t[0x1EE] = vector::pmaxsw;
    t[0x1EF] = vector::pxor;
    t[0x1F0] = vector::lddqu;
    t[0x1F1] = vector::psllw_v;
    t[0x1F2] = vector::pslld_v;
    t[0x1F3] = vector::psllq_v;
    t[0x1F4] = vector::pmuludq;
    t[0x1F5] = vector::pmaddwd;
    t[0x1F6] = vector::psadbw;
    t[0x1F7] = vector::maskmov;
    t[0x1F8] = vector::psubb;
    t[0x1F9] = vector::psubw;
    t[0x1FA] = vector::psubd;
    t[0x1FB] = vector::psubq;
    t[0x1FC] = vector::paddb;
    t[0x1FD] = vector::paddw;
    t[0x1FE] = vector::paddd;
    t
}

/// Runs until the machine leaves the straight-line world: a halt, a trap,
/// or `limit` retired instructions.
pub fn run(m: &mut Machine, bus: &mut dyn Bus, limit: u64) -> Result<StepExit, Exception> {
    let mut exit = StepExit::Continue;
    for _ in 0..limit {
        exit = step(m, bus)?;
        match exit {
            StepExit::Continue | StepExit::Branch => {}
            _ => break,
        }
    }
    Ok(exit)
}
