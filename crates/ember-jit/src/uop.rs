//! The micro-op tape: a typed rendition of the path builder's RPN
//! directive language, executed here by a switch-threaded interpreter.
//!
//! The directive vocabulary is a small stack machine over virtual
//! registers (two results, six arguments, four saves). Most guest
//! instructions compile to `BeginOp` / `Call` / `EndOp`; register-only ALU
//! traffic is devirtualised to [`MicroOp::Alu`] so the flag-eliding kernel
//! table can be used when the dependency crawl allows, and fused
//! compare-branches become a single [`MicroOp::CmpBranch`] that touches no
//! flags at all.

use ember_cpu_core::alu::{ALU, ALU_FAST};
use ember_cpu_core::flags;
use ember_cpu_core::mem::Bus;
use ember_cpu_core::{Args, Exception, Machine};
use ember_x86::Gpr;

/// A handler from the execution core's dispatch surface.
pub type HostFn = fn(&mut Machine, &mut dyn Bus, Args) -> Result<(), Exception>;

/// A micro helper: machine plus one scalar argument.
pub type MicroFn = fn(&mut Machine, u64);

/// One slot on the directive stack: a virtual register name or the
/// machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Res(u8),
    Arg(u8),
    Sav(u8),
    Machine,
}

/// The tape directives. Each maps to one spelling in the printf-style
/// source language; the enum carries the operands the varargs used to.
#[derive(Debug, Clone, Copy)]
pub enum MicroOp {
    /// `zN`: force the next operand access to width log2 N.
    Size(u8),
    /// `rN` / `aN` / `sN`: push a virtual register.
    Push(Slot),
    /// `q`: push the machine.
    PushMachine,
    /// `t`: duplicate the top slot.
    Dup,
    /// `u`: drop the top slot.
    Drop,
    /// `i`: pop a register and load it with an immediate.
    Imm(u64),
    /// `=`: pop dst, pop src, move.
    Move,
    /// `A`: res0 = Read(Reg(rexr_reg)).
    ReadReg,
    /// `B`: res0 = Read(RegOrMem(rexb_rm)).
    ReadRegOrMem,
    /// `C`: Write(Reg(rexr_reg)) = res0.
    WriteReg,
    /// `D`: Write(RegOrMem(rexb_rm)) = res0.
    WriteRegOrMem,
    /// `$`: res0 = CL.
    ReadCl,
    /// `!`: trap: abandon the path at runtime.
    Trap,
    /// `c`: call a full handler with the recorded arguments.
    Call(HostFn),
    /// `m`: call a micro helper with arg1.
    Micro(MicroFn),
    /// Establishes the current instruction: decoded arguments plus the
    /// length to advance IP by before the handler body runs.
    BeginOp(Args, u8),
    /// Commits any split store the op left in flight.
    EndOp,
    /// Devirtualised register-register ALU, choosing the fast kernel when
    /// the crawl proved the elided flags dead.
    Alu {
        op: u8,
        log2: u8,
        fast: bool,
    },
    /// A fused compare (or test) and branch: evaluates the predicate
    /// straight off sav1/res0 without materialising flags, then either
    /// falls through or displaces IP.
    CmpBranch {
        cc: u8,
        log2: u8,
        test: bool,
        disp: i64,
    },
}

/// Outcomes of running a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeExit {
    /// Ran to the end of the tape.
    Done,
    /// A fused branch left the straight line.
    Branched,
    /// A `Trap` directive fired; re-enter the interpreter at IP.
    Trapped,
}

struct VirtualRegs {
    res: [u64; 2],
    arg: [u64; 6],
    sav: [u64; 4],
}

impl VirtualRegs {
    fn get(&self, s: Slot, m: &Machine) -> u64 {
        match s {
            Slot::Res(i) => self.res[i as usize],
            Slot::Arg(i) => self.arg[i as usize],
            Slot::Sav(i) => self.sav[i as usize],
            Slot::Machine => m.ip,
        }
    }

    fn set(&mut self, s: Slot, v: u64) {
        match s {
            Slot::Res(i) => self.res[i as usize] = v,
            Slot::Arg(i) => self.arg[i as usize] = v,
            Slot::Sav(i) => self.sav[i as usize] = v,
            Slot::Machine => {}
        }
    }
}

/// Interprets one tape. The contract: identical machine state to running
/// the same instructions through the plain dispatch loop.
pub fn interpret(
    m: &mut Machine,
    bus: &mut dyn Bus,
    tape: &[MicroOp],
) -> Result<TapeExit, Exception> {
    let mut regs = VirtualRegs {
        res: [0; 2],
        arg: [0; 6],
        sav: [0; 4],
    };
    let mut stack: Vec<Slot> = Vec::with_capacity(8);
    let mut cur = Args::new(Default::default(), 0, 0);
    let mut size_override: Option<u8> = None;
    for op in tape {
        match *op {
            MicroOp::Size(n) => size_override = Some(n),
            MicroOp::Push(s) => stack.push(s),
            MicroOp::PushMachine => stack.push(Slot::Machine),
            MicroOp::Dup => {
                if let Some(&top) = stack.last() {
                    stack.push(top);
                }
            }
            MicroOp::Drop => {
                stack.pop();
            }
            MicroOp::Imm(v) => {
                if let Some(dst) = stack.pop() {
                    regs.set(dst, v);
                }
            }
            MicroOp::Move => {
                let dst = stack.pop();
                let src = stack.pop();
                if let (Some(dst), Some(src)) = (dst, src) {
                    let v = regs.get(src, m);
                    regs.set(dst, v);
                }
            }
            MicroOp::ReadReg => {
                let log2 = effective_log2(&mut size_override, cur);
                regs.res[0] = if log2 == 0 {
                    m.get_byte_reg(cur.rde.byte_rexr_reg())
                } else {
                    m.get_reg(log2, Gpr::from_index(cur.rde.rexr_reg()))
                };
            }
            MicroOp::ReadRegOrMem => {
                let log2 = effective_log2(&mut size_override, cur);
                regs.res[0] = ember_cpu_core::addr::read_rm(m, bus, cur, log2)?;
            }
            MicroOp::WriteReg => {
                let log2 = effective_log2(&mut size_override, cur);
                if log2 == 0 {
                    m.put_byte_reg(cur.rde.byte_rexr_reg(), regs.res[0]);
                } else {
                    m.put_reg(log2, Gpr::from_index(cur.rde.rexr_reg()), regs.res[0]);
                }
            }
            MicroOp::WriteRegOrMem => {
                let log2 = effective_log2(&mut size_override, cur);
                ember_cpu_core::addr::write_rm(m, bus, cur, log2, regs.res[0])?;
            }
            MicroOp::ReadCl => {
                regs.res[0] = m.get_reg(0, Gpr::Rcx);
            }
            MicroOp::Trap => return Ok(TapeExit::Trapped),
            MicroOp::Call(f) => f(m, bus, cur)?,
            MicroOp::Micro(f) => f(m, regs.arg[1]),
            MicroOp::BeginOp(args, len) => {
                cur = args;
                size_override = None;
                m.set_ip(m.ip.wrapping_add(len as u64));
            }
            MicroOp::EndOp => {
                ember_cpu_core::mem::commit_stash(m, bus)?;
            }
            MicroOp::Alu { op, log2, fast } => {
                let table = if fast { &ALU_FAST } else { &ALU };
                let x = m.get_rm_reg(cur.rde, log2 as usize);
                let y = m.get_reg(log2 as usize, Gpr::from_index(cur.rde.rexr_reg()));
                let z = table[op as usize][log2 as usize](x, y, &mut m.flags);
                if op != ember_cpu_core::alu::ALU_CMP as u8 {
                    m.put_rm_reg(cur.rde, log2 as usize, z);
                }
            }
            MicroOp::CmpBranch {
                cc,
                log2,
                test,
                disp,
            } => {
                // The destination operand (r/m) sits in res0, the source
                // register in sav1, so the predicate sees r/m - reg.
                let x = regs.res[0];
                let y = regs.sav[1];
                if fused_predicate(cc, log2, test, x, y) {
                    m.set_ip(m.ip.wrapping_add(disp as u64));
                    return Ok(TapeExit::Branched);
                }
            }
        }
    }
    Ok(TapeExit::Done)
}

fn effective_log2(size_override: &mut Option<u8>, cur: Args) -> usize {
    match size_override.take() {
        Some(n) => n as usize,
        None => cur.rde.word_log2(),
    }
}

/// Evaluates a Jcc predicate straight from the comparison inputs, the way
/// a fused host `cmp; jcc` would. `x` is the destination operand.
fn fused_predicate(cc: u8, log2: u8, test: bool, x: u64, y: u64) -> bool {
    let bits = (8u32 << log2) as u64;
    let shift = 64 - bits;
    let xu = x << shift >> shift;
    let yu = y << shift >> shift;
    let signed_less = (((x << shift) as i64) >> shift) < (((y << shift) as i64) >> shift);
    let (z, cf) = if test {
        (xu & yu, false)
    } else {
        (xu.wrapping_sub(yu) << shift >> shift, xu < yu)
    };
    let zf = z == 0;
    let sf = z >> (bits - 1) & 1 != 0;
    // SF ^ OF is the signed-less predicate, which recovers OF.
    let of = !test && (signed_less != sf);
    let sf_ne_of = if test { sf } else { signed_less };
    let base = match cc >> 1 {
        0 => of,
        1 => cf,
        2 => zf,
        3 => cf || zf,
        4 => sf,
        5 => flags::parity(z as u8),
        6 => sf_ne_of,
        _ => zf || sf_ne_of,
    };
    base ^ (cc & 1 != 0)
}

/// Micro helper: the StartOp half of an op that only needs its IP moved.
pub fn advance_ip(m: &mut Machine, delta: u64) {
    m.set_ip(m.ip.wrapping_add(delta));
}

/// Micro helper: displace IP (branch target edge of a fused pair).
pub fn displace_ip(m: &mut Machine, disp: u64) {
    m.set_ip(m.ip.wrapping_add(disp));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fused_predicates_match_flag_semantics() {
        // cmp 5, 3: not equal, above, greater.
        assert!(!fused_predicate(0x4, 2, false, 5, 3)); // je
        assert!(fused_predicate(0x5, 2, false, 5, 3)); // jne
        assert!(fused_predicate(0x7, 2, false, 5, 3)); // ja
        assert!(fused_predicate(0xF, 2, false, 5, 3)); // jg

        // cmp -1, 1 (32-bit): unsigned above, signed less.
        let minus1 = 0xffff_ffffu64;
        assert!(!fused_predicate(0x2, 2, false, minus1, 1)); // jb
        assert!(fused_predicate(0x7, 2, false, minus1, 1)); // ja
        assert!(fused_predicate(0xC, 2, false, minus1, 1)); // jl

        // test rax, rax with zero.
        assert!(fused_predicate(0x4, 3, true, 0, 0)); // jz
        assert!(!fused_predicate(0x5, 3, true, 0, 0)); // jnz
    }
}
