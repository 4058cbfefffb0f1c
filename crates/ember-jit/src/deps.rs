//! Flag dependency and clobber analysis.
//!
//! Two pure per-opcode functions describe each instruction's relationship
//! to the six arithmetic flags, and [`needed_flags`] walks the instruction
//! stream forward to decide which bits of a flag-producing op's output are
//! ever read before being overwritten. `None` means "assume everything":
//! the walk hit a precious op, ran out of budget, or failed to decode.

use ember_cpu_core::flags::{AF, CF, OF, PF, SF, ZF};
use ember_cpu_core::mem::{self, Bus};
use ember_cpu_core::Machine;
use ember_x86::{decode_one, Rde};

pub const ALL_ARITH: u32 = CF | ZF | SF | OF | AF | PF;

/// How the path builder treats an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Normal,
    /// Direct or conditional control transfer with a knowable target.
    Branching,
    /// Unknowable side effects (syscalls, interrupts); ends speculation.
    Precious,
    /// Must not be reordered or fused across (cpuid, fences).
    Serializing,
}

/// Bitset of flags this op definitely writes or leaves undefined, or
/// `None` when it may clobber anything (calls, returns, syscalls).
pub fn flag_clobbers(rde: Rde) -> Option<u32> {
    Some(match rde.mopcode() {
        0xE8 | 0xC3 | 0xC2 | 0x105 => return None,
        // The ALU rows and everything that funnels into them.
        0x000..=0x005
        | 0x008..=0x00D
        | 0x010..=0x015
        | 0x018..=0x01D
        | 0x020..=0x025
        | 0x028..=0x02D
        | 0x030..=0x035
        | 0x038..=0x03D
        | 0x080..=0x085
        | 0x0A6
        | 0x0A7
        | 0x0A8
        | 0x0A9
        | 0x0AE
        | 0x0AF
        | 0x069
        | 0x06B
        | 0x1AF
        | 0x12E
        | 0x12F
        | 0x1A4
        | 0x1A5
        | 0x1AC
        | 0x1AD
        | 0x1B0
        | 0x1B1
        | 0x1BC
        | 0x1BD
        | 0x1C0
        | 0x1C1
        | 0x02F
        | 0x037
        | 0x03F
        | 0x0D5
        | 0x0D4
        | 0x027 => ALL_ARITH,
        // Shift group: rotates touch only CF/OF, shifts everything.
        0x0C0 | 0x0C1 | 0x0D0 | 0x0D1 | 0x0D2 | 0x0D3 => match rde.reg() {
            0..=3 => OF | CF,
            _ => ALL_ARITH,
        },
        // fucomip/fcomip clear OF/SF/AF and write ZF/PF/CF.
        0x0DB | 0x0DF => {
            if rde.is_register_form() && (rde.reg() == 5 || rde.reg() == 6) {
                ALL_ARITH
            } else {
                0
            }
        }
        0x0F5 | 0x0F8 | 0x0F9 => CF,
        0x0F6 | 0x0F7 => match rde.reg() {
            2 => 0,
            _ => ALL_ARITH,
        },
        0x0FE | 0x0FF => match rde.reg() {
            0 | 1 => ZF | SF | OF | AF | PF,
            2 => return None, // call Ev
            _ => 0,
        },
        0x040..=0x04F => ZF | SF | OF | AF | PF, // legacy inc/dec
        0x1A3 | 0x1AB | 0x1B3 | 0x1BA | 0x1BB => CF | SF | OF | AF | PF,
        0x09E => CF | ZF | SF | AF | PF, // sahf
        0x09D => return None,           // popf
        0x1B8 => {
            if rde.rep() == 3 {
                ALL_ARITH // popcnt
            } else {
                0
            }
        }
        0x1C7 => {
            if rde.is_register_form() {
                ALL_ARITH // rdrand/rdseed
            } else {
                ZF
            }
        }
        _ => 0,
    })
}

/// Bitset of flags this op reads.
pub fn flag_deps(rde: Rde) -> u32 {
    let cc_deps = |cc: u32| match cc >> 1 {
        0 => OF,
        1 => CF,
        2 => ZF,
        3 => CF | ZF,
        4 => SF,
        5 => PF,
        6 => OF | SF,
        _ => OF | SF | ZF,
    };
    match rde.mopcode() {
        // ADC/SBB consume the carry.
        0x010..=0x015 | 0x018..=0x01D | 0x0D6 | 0x0F5 => CF,
        // Jcc, SETcc, CMOVcc by condition nibble.
        0x070..=0x07F | 0x140..=0x14F | 0x180..=0x18F | 0x190..=0x19F => {
            cc_deps(rde.opcode() & 0xf)
        }
        0x0E0 | 0x0E1 => ZF, // loope/loopne
        0x080..=0x083 => match rde.reg() {
            2 | 3 => CF, // adc/sbb immediate forms
            _ => 0,
        },
        0x0C0 | 0x0C1 | 0x0D0 | 0x0D1 | 0x0D2 | 0x0D3 => match rde.reg() {
            2 | 3 => CF, // rcl/rcr
            _ => 0,
        },
        0x0DA | 0x0DB if rde.is_register_form() => match rde.reg() {
            0 => CF, // fcmovb/fcmovnb
            1 | 2 => ZF | CF,
            3 => PF,
            _ => 0,
        },
        0x09F => CF | ZF | SF | AF | PF, // lahf
        0x02F | 0x037 | 0x03F | 0x027 => CF | AF,
        0x09C => 0x00ff_ffff, // pushf reads the world
        0x0A6 | 0x0A7 | 0x0AE | 0x0AF if rde.rep() != 0 => ZF, // repz/repnz termination
        _ => 0,
    }
}

fn is_unconditional_jump(rde: Rde) -> bool {
    matches!(rde.mopcode(), 0xE9 | 0xEB)
}

fn is_conditional_jump(rde: Rde) -> bool {
    matches!(rde.mopcode(), 0x070..=0x07F | 0x180..=0x18F)
}

pub fn classify(rde: Rde) -> OpClass {
    match rde.mopcode() {
        0x070..=0x07F | 0x180..=0x18F => OpClass::Branching,
        0x09A | 0x0C2 | 0x0C3 | 0x0CA | 0x0CB | 0x0CF => OpClass::Branching,
        0x0E0..=0x0E3 | 0x0E8..=0x0EB => OpClass::Branching,
        0x0FF => match rde.reg() {
            2 | 4 => OpClass::Branching,
            _ => OpClass::Normal,
        },
        0x0F1 | 0x0CC | 0x0CD | 0x105 | 0x0F4 => OpClass::Precious,
        0x130 | 0x1A2 => OpClass::Serializing,
        0x1AE => match rde.reg() {
            5 | 6 => OpClass::Serializing,
            _ => OpClass::Normal,
        },
        _ => OpClass::Normal,
    }
}

const SPECULATION_BUDGET: u32 = 32;
const RECURSION_LIMIT: u32 = 8;

/// Walks forward from `pc`, accumulating which of `my_flags` something
/// reads before every producer bit has been overwritten. Pure over the
/// static instruction stream: repeated calls return identical answers.
pub fn needed_flags(
    m: &mut Machine,
    bus: &mut dyn Bus,
    pc: i64,
    my_flags: u32,
) -> Option<u32> {
    crawl(m, bus, pc, my_flags, SPECULATION_BUDGET, 0)
}

fn crawl(
    m: &mut Machine,
    bus: &mut dyn Bus,
    mut pc: i64,
    mut my_flags: u32,
    mut look: u32,
    depth: u32,
) -> Option<u32> {
    if depth > RECURSION_LIMIT {
        return None;
    }
    let mut need = 0;
    loop {
        let (bytes, avail) = mem::fetch(m, bus, pc).ok()?;
        let d = decode_one(m.mode, &bytes[..avail]).ok()?;
        pc += d.len() as i64;
        need |= flag_deps(d.rde) & my_flags;
        my_flags &= !flag_clobbers(d.rde)?;
        if my_flags == 0 {
            return Some(need);
        }
        look = look.checked_sub(1)?;
        if is_unconditional_jump(d.rde) {
            pc += d.disp;
        } else if is_conditional_jump(d.rde) {
            need |= crawl(m, bus, pc + d.disp, my_flags, look, depth + 1)?;
        } else if classify(d.rde) != OpClass::Normal {
            tracing::trace!(pc, "speculation hit an abnormal op");
            return None;
        }
    }
}
