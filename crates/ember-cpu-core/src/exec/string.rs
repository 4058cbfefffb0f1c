//! MOVS/CMPS/STOS/LODS/SCAS with their REP/REPZ/REPNZ loops. The plain
//! loop retires one element per iteration; the enhanced path moves whole
//! page runs for REP MOVSB/STOSB when the configuration allows it.

use super::R;
use crate::addr::{self, Args};
use crate::alu::{self, ALU};
use crate::flags::{FLAGS_DF, FLAGS_ZF};
use crate::mem::{self, Bus};
use crate::state::Machine;
use ember_x86::{Eamode, Gpr, Rde};

#[derive(Clone, Copy, PartialEq, Eq)]
enum StringOp {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Outs,
    Ins,
}

fn count(m: &Machine, rde: Rde) -> u64 {
    match rde.eamode() {
        Eamode::Real => m.get16(Gpr::Rcx),
        Eamode::Legacy => m.get32(Gpr::Rcx),
        Eamode::Long => m.get64(Gpr::Rcx),
    }
}

fn subtract_count(m: &mut Machine, rde: Rde, n: u64) -> u64 {
    let cx = m.get64(Gpr::Rcx).wrapping_sub(n);
    match rde.eamode() {
        Eamode::Real => {
            m.put16(Gpr::Rcx, cx);
            cx & 0xffff
        }
        Eamode::Legacy => {
            m.put64(Gpr::Rcx, cx & 0xffff_ffff);
            cx & 0xffff_ffff
        }
        Eamode::Long => {
            m.put64(Gpr::Rcx, cx);
            cx
        }
    }
}

fn string_op(m: &mut Machine, bus: &mut dyn Bus, a: Args, op: StringOp) -> R {
    let rde = a.rde;
    let log2 = rde.word_log2();
    let n = 1i64 << log2;
    let down = m.get_flag(FLAGS_DF);
    if m.config.enhanced_rep_strings && rde.rep() != 0 && !down && log2 == 0 {
        match op {
            StringOp::Movs => return rep_movsb_enhanced(m, bus, rde),
            StringOp::Stos => return rep_stosb_enhanced(m, bus, rde),
            _ => {}
        }
    }
    loop {
        if rde.rep() != 0 && count(m, rde) == 0 {
            break;
        }
        let mut stop = false;
        match op {
            StringOp::Movs => {
                let src = addr::address_si(m, rde);
                let v = mem::read_sized(m, bus, src, log2)?;
                let dst = addr::address_di(m, rde);
                mem::write_sized(m, bus, dst, log2, v)?;
                advance_si(m, rde, n, down);
                advance_di(m, rde, n, down);
            }
            StringOp::Cmps => {
                let x = mem::read_sized(m, bus, addr::address_si(m, rde), log2)?;
                let y = mem::read_sized(m, bus, addr::address_di(m, rde), log2)?;
                ALU[alu::ALU_SUB][log2](x, y, &mut m.flags);
                advance_si(m, rde, n, down);
                advance_di(m, rde, n, down);
                stop = rep_should_stop(m, rde);
            }
            StringOp::Stos => {
                let v = m.get_reg(log2, Gpr::Rax);
                let dst = addr::address_di(m, rde);
                mem::write_sized(m, bus, dst, log2, v)?;
                advance_di(m, rde, n, down);
            }
            StringOp::Lods => {
                let v = mem::read_sized(m, bus, addr::address_si(m, rde), log2)?;
                m.put_reg(log2, Gpr::Rax, v);
                advance_si(m, rde, n, down);
            }
            StringOp::Scas => {
                let x = m.get_reg(log2, Gpr::Rax);
                let y = mem::read_sized(m, bus, addr::address_di(m, rde), log2)?;
                ALU[alu::ALU_SUB][log2](x, y, &mut m.flags);
                advance_di(m, rde, n, down);
                stop = rep_should_stop(m, rde);
            }
            StringOp::Outs => {
                let v = mem::read_sized(m, bus, addr::address_si(m, rde), log2)?;
                bus.io_write(m.get16(Gpr::Rdx) as u16, 1 << log2, v)?;
                advance_si(m, rde, n, down);
            }
            StringOp::Ins => {
                let v = bus.io_read(m.get16(Gpr::Rdx) as u16, 1 << log2)?;
                let dst = addr::address_di(m, rde);
                mem::write_sized(m, bus, dst, log2, v)?;
                advance_di(m, rde, n, down);
            }
        }
        if rde.rep() != 0 {
            subtract_count(m, rde, 1);
        } else {
            break;
        }
        if stop {
            break;
        }
        // A split store inside the loop must land before the next element.
        mem::commit_stash(m, bus)?;
    }
    Ok(())
}

fn rep_should_stop(m: &Machine, rde: Rde) -> bool {
    let zf = m.get_flag(FLAGS_ZF);
    (rde.rep() == 2 && zf) || (rde.rep() == 3 && !zf)
}

fn advance_si(m: &mut Machine, rde: Rde, n: i64, down: bool) {
    addr::advance_index(m, rde, Gpr::Rsi, n, down);
}

fn advance_di(m: &mut Machine, rde: Rde, n: i64, down: bool) {
    addr::advance_index(m, rde, Gpr::Rdi, n, down);
}

/// ERMS-style fast path: copies page-bounded runs instead of single bytes.
fn rep_movsb_enhanced(m: &mut Machine, bus: &mut dyn Bus, rde: Rde) -> R {
    let mut cx = count(m, rde);
    if cx == 0 {
        return Ok(());
    }
    let mut src = addr::address_si(m, rde);
    let mut dst = addr::address_di(m, rde);
    if src == dst {
        return Ok(());
    }
    let mut buf = [0u8; 4096];
    while cx != 0 {
        let src_room = 4096 - (src as u64 & 4095) as usize;
        let dst_room = 4096 - (dst as u64 & 4095) as usize;
        let n = (cx as usize).min(src_room).min(dst_room).min(buf.len());
        mem::read_mem(m, bus, src, &mut buf[..n])?;
        mem::write_mem(m, bus, dst, &buf[..n])?;
        mem::commit_stash(m, bus)?;
        advance_si(m, rde, n as i64, false);
        advance_di(m, rde, n as i64, false);
        src = addr::address_si(m, rde);
        dst = addr::address_di(m, rde);
        cx = subtract_count(m, rde, n as u64);
    }
    Ok(())
}

fn rep_stosb_enhanced(m: &mut Machine, bus: &mut dyn Bus, rde: Rde) -> R {
    let mut cx = count(m, rde);
    let fill = m.get_reg(0, Gpr::Rax) as u8;
    let buf = [fill; 4096];
    while cx != 0 {
        let dst = addr::address_di(m, rde);
        let room = 4096 - (dst as u64 & 4095) as usize;
        let n = (cx as usize).min(room);
        mem::write_mem(m, bus, dst, &buf[..n])?;
        mem::commit_stash(m, bus)?;
        advance_di(m, rde, n as i64, false);
        cx = subtract_count(m, rde, n as u64);
    }
    Ok(())
}

pub fn movs(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Movs)
}

pub fn cmps(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Cmps)
}

pub fn stos(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Stos)
}

pub fn lods(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Lods)
}

pub fn scas(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Scas)
}

pub fn outs(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Outs)
}

pub fn ins(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    string_op(m, bus, a, StringOp::Ins)
}
