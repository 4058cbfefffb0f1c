//! Branches, calls, returns, loops, and the stack family.

use super::R;
use crate::addr::{self, Args};
use crate::exception::Exception;
use crate::flags::{self, eval_cond};
use crate::mem::{self, Bus};
use crate::state::{Machine, SEG_CS, SEG_DS, SEG_ES, SEG_FS, SEG_GS, SEG_SS};
use ember_x86::{DecodeMode, Eamode, Gpr, OpMap, Rde};

/// Stack word width in bytes by `[osz][mode]`: pushes are 64-bit in long
/// mode (a 66 prefix still gives 16), 32-bit otherwise.
const STACK_OSZ: [[u32; 3]; 2] = [[4, 4, 8], [2, 2, 2]];
/// Call/ret width: a 66 prefix cannot shrink far control transfers out of
/// 64 bits.
const CALL_OSZ: [[u32; 3]; 2] = [[4, 4, 8], [2, 2, 8]];

fn stack_osz(rde: Rde) -> u32 {
    STACK_OSZ[rde.osz() as usize][rde.mode() as usize]
}

fn call_osz(rde: Rde) -> u32 {
    CALL_OSZ[rde.osz() as usize][rde.mode() as usize]
}

fn osz_log2(osz: u32) -> usize {
    match osz {
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

/// Pushes a stack word, updating rSP at the stack address width.
pub fn push(m: &mut Machine, bus: &mut dyn Bus, rde: Rde, x: u64) -> Result<(), Exception> {
    push_n(m, bus, x, rde.eamode(), stack_osz(rde))
}

fn push_n(
    m: &mut Machine,
    bus: &mut dyn Bus,
    x: u64,
    eamode: Eamode,
    osz: u32,
) -> Result<(), Exception> {
    let v = match eamode {
        Eamode::Real => {
            let v = m.get32(Gpr::Rsp).wrapping_sub(osz as u64) & 0xffff;
            m.put16(Gpr::Rsp, v);
            v.wrapping_add(m.segs[SEG_SS].base)
        }
        Eamode::Legacy => {
            let v = m.get32(Gpr::Rsp).wrapping_sub(osz as u64) & 0xffff_ffff;
            m.put64(Gpr::Rsp, v);
            v.wrapping_add(m.segs[SEG_SS].base)
        }
        Eamode::Long => {
            let v = m.get64(Gpr::Rsp).wrapping_sub(osz as u64);
            m.put64(Gpr::Rsp, v);
            v
        }
    };
    mem::write_sized(m, bus, v as i64, osz_log2(osz), x)
}

/// Pops a stack word; `extra` is the RET imm16 adjustment.
pub fn pop(m: &mut Machine, bus: &mut dyn Bus, rde: Rde, extra: u16) -> Result<u64, Exception> {
    pop_n(m, bus, rde, extra, stack_osz(rde))
}

fn pop_n(
    m: &mut Machine,
    bus: &mut dyn Bus,
    rde: Rde,
    extra: u16,
    osz: u32,
) -> Result<u64, Exception> {
    let bump = osz as u64 + extra as u64;
    let v = match rde.eamode() {
        Eamode::Long => {
            let v = m.get64(Gpr::Rsp);
            m.put64(Gpr::Rsp, v.wrapping_add(bump));
            v
        }
        Eamode::Legacy => {
            let v = m.get32(Gpr::Rsp);
            m.put64(Gpr::Rsp, v.wrapping_add(bump) & 0xffff_ffff);
            v.wrapping_add(m.segs[SEG_SS].base)
        }
        Eamode::Real => {
            let v = m.get16(Gpr::Rsp);
            m.put16(Gpr::Rsp, v.wrapping_add(bump));
            v.wrapping_add(m.segs[SEG_SS].base)
        }
    };
    mem::read_sized(m, bus, v as i64, osz_log2(osz))
}

/// `50..57`: PUSH Zvq.
pub fn push_zvq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = stack_osz(a.rde);
    let x = m.get_reg(osz_log2(osz), Gpr::from_index(a.rde.rexb_srm()));
    push_n(m, bus, x, a.rde.eamode(), osz)
}

/// `58..5F`: POP Zvq.
pub fn pop_zvq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = stack_osz(a.rde);
    let x = pop_n(m, bus, a.rde, 0, osz)?;
    let r = Gpr::from_index(a.rde.rexb_srm());
    match osz {
        2 => m.put16(r, x),
        _ => m.put64(r, x),
    }
    Ok(())
}

/// `68`/`6A`: PUSH imm.
pub fn push_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    push(m, bus, a.rde, a.uimm)
}

/// `FF /6`: PUSH Evq.
pub fn push_evq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = stack_osz(a.rde);
    let x = addr::read_rm(m, bus, a, osz_log2(osz))?;
    push_n(m, bus, x, a.rde.eamode(), osz)
}

/// `8F /0`: POP Evq.
pub fn pop_evq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.reg() != 0 {
        return Err(Exception::UndefinedInstruction);
    }
    let osz = stack_osz(a.rde);
    let x = pop_n(m, bus, a.rde, 0, osz)?;
    addr::write_rm(m, bus, a, osz_log2(osz), x)
}

/// `06/0E/16/1E`, `0F A0/A8`: PUSH seg.
pub fn push_seg(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let seg = seg_from_opcode(a.rde)?;
    if m.mode == DecodeMode::Long && a.rde.map() == OpMap::Map0 {
        return Err(Exception::UndefinedInstruction);
    }
    push(m, bus, a.rde, m.segs[seg].selector as u64)
}

/// `07/17/1F`, `0F A1/A9`: POP seg.
pub fn pop_seg(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let seg = seg_from_opcode(a.rde)?;
    if m.mode == DecodeMode::Long && a.rde.map() == OpMap::Map0 {
        return Err(Exception::UndefinedInstruction);
    }
    let v = pop(m, bus, a.rde, 0)? as u16;
    m.segs[seg].selector = v;
    if m.mode != DecodeMode::Long {
        m.segs[seg].base = (v as u64) << 4;
    }
    Ok(())
}

fn seg_from_opcode(rde: Rde) -> Result<usize, Exception> {
    Ok(match (rde.map(), rde.opcode() & !1) {
        (OpMap::Map0, 0x06) => SEG_ES,
        (OpMap::Map0, 0x0E) => SEG_CS,
        (OpMap::Map0, 0x16) => SEG_SS,
        (OpMap::Map0, 0x1E) => SEG_DS,
        (OpMap::Map1, 0xA0) => SEG_FS,
        (OpMap::Map1, 0xA8) => SEG_GS,
        _ => return Err(Exception::UndefinedInstruction),
    })
}

/// `60`: PUSHA (legacy only).
pub fn pusha(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if m.mode == DecodeMode::Long {
        return Err(Exception::UndefinedInstruction);
    }
    let w = if a.rde.osz() { 2u32 } else { 4 };
    let log2 = osz_log2(w);
    let order = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
    ];
    let sp_before = m.get_reg(log2, Gpr::Rsp);
    for r in order {
        let v = if r == Gpr::Rsp {
            sp_before
        } else {
            m.get_reg(log2, r)
        };
        push_n(m, bus, v, a.rde.eamode(), w)?;
    }
    Ok(())
}

/// `61`: POPA: restores everything except SP.
pub fn popa(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if m.mode == DecodeMode::Long {
        return Err(Exception::UndefinedInstruction);
    }
    let w = if a.rde.osz() { 2u32 } else { 4 };
    let log2 = osz_log2(w);
    let order = [
        Gpr::Rdi,
        Gpr::Rsi,
        Gpr::Rbp,
        Gpr::Rsp,
        Gpr::Rbx,
        Gpr::Rdx,
        Gpr::Rcx,
        Gpr::Rax,
    ];
    for r in order {
        let v = pop_n(m, bus, a.rde, 0, w)?;
        if r != Gpr::Rsp {
            m.put_reg(log2, r, v);
        }
    }
    Ok(())
}

/// `9C`: PUSHF: exports the architectural flags word (lazy bits folded).
pub fn pushf(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let f = flags::export_flags(m.flags) as u64;
    push(m, bus, a.rde, f)
}

/// `9D`: POPF.
pub fn popf(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let f = pop(m, bus, a.rde, 0)?;
    m.flags = flags::import_flags(f as u32);
    Ok(())
}

/// `9E`: SAHF: loads SF/ZF/AF/PF/CF from AH.
pub fn sahf(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let ah = (m.get16(Gpr::Rax) >> 8) as u32;
    m.set_flag(flags::FLAGS_SF, ah & 0x80 != 0);
    m.set_flag(flags::FLAGS_ZF, ah & 0x40 != 0);
    m.set_flag(flags::FLAGS_AF, ah & 0x10 != 0);
    m.set_flag(flags::FLAGS_PF, ah & 0x04 != 0);
    m.set_flag(flags::FLAGS_CF, ah & 0x01 != 0);
    Ok(())
}

/// `9F`: LAHF.
pub fn lahf(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let f = flags::export_flags(m.flags);
    let ah = (f & 0xff) as u64;
    m.put16(Gpr::Rax, (m.get16(Gpr::Rax) & 0xff) | ah << 8);
    Ok(())
}

/// `70..7F`, `0F 80..8F`: Jcc.
pub fn jcc(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if eval_cond(m.flags, a.rde.opcode() & 0xf) {
        m.set_ip(m.ip.wrapping_add(a.disp as u64));
    }
    Ok(())
}

/// `E9`/`EB`: JMP rel.
pub fn jmp(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    m.set_ip(m.ip.wrapping_add(a.disp as u64));
    Ok(())
}

/// `E8`: CALL rel.
pub fn call_jvds(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let ret = m.ip;
    push_n(m, bus, ret, a.rde.eamode(), call_osz(a.rde))?;
    m.set_ip(m.ip.wrapping_add(a.disp as u64));
    Ok(())
}

/// `FF /2`: CALL Ev, `/4`: JMP Ev (dispatched from the group).
pub fn call_eq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = call_osz(a.rde);
    let target = addr::read_rm(m, bus, a, osz_log2(osz))?;
    let ret = m.ip;
    push_n(m, bus, ret, a.rde.eamode(), osz)?;
    m.set_ip(target);
    Ok(())
}

pub fn jmp_eq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = call_osz(a.rde);
    let target = addr::read_rm(m, bus, a, osz_log2(osz))?;
    m.set_ip(target);
    Ok(())
}

/// `C2`/`C3`: RET (imm16 form pops the extra bytes).
pub fn ret(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let osz = call_osz(a.rde);
    let target = pop_n(m, bus, a.rde, a.uimm as u16, osz)?;
    m.set_ip(target);
    Ok(())
}

/// `CA/CB`: RETF, `9A`: CALLF, `EA`: JMPF: far control transfers exist
/// only outside long mode.
pub fn retf(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if m.mode == DecodeMode::Long {
        return Err(Exception::UndefinedInstruction);
    }
    let osz = call_osz(a.rde);
    let ip = pop_n(m, bus, a.rde, 0, osz)?;
    let cs = pop_n(m, bus, a.rde, a.uimm as u16, osz)? as u16;
    load_cs(m, cs);
    m.set_ip(ip);
    Ok(())
}

pub fn callf(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if m.mode == DecodeMode::Long {
        return Err(Exception::UndefinedInstruction);
    }
    let osz = call_osz(a.rde);
    let cs = m.segs[SEG_CS].selector as u64;
    push_n(m, bus, cs, a.rde.eamode(), osz)?;
    let ip = m.ip;
    push_n(m, bus, ip, a.rde.eamode(), osz)?;
    load_cs(m, a.uimm as u16);
    m.set_ip(a.disp as u64);
    Ok(())
}

pub fn jmpf(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if m.mode == DecodeMode::Long {
        return Err(Exception::UndefinedInstruction);
    }
    load_cs(m, a.uimm as u16);
    m.set_ip(a.disp as u64);
    Ok(())
}

fn load_cs(m: &mut Machine, selector: u16) {
    m.segs[SEG_CS].selector = selector;
    if m.mode != DecodeMode::Long {
        m.segs[SEG_CS].base = (selector as u64) << 4;
    }
}

fn count_reg(m: &Machine, rde: Rde) -> u64 {
    match rde.eamode() {
        Eamode::Real => m.get16(Gpr::Rcx),
        Eamode::Legacy => m.get32(Gpr::Rcx),
        Eamode::Long => m.get64(Gpr::Rcx),
    }
}

fn dec_count_reg(m: &mut Machine, rde: Rde) -> u64 {
    let cx = m.get64(Gpr::Rcx).wrapping_sub(1);
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

/// `E0/E1/E2`: LOOPNE/LOOPE/LOOP.
pub fn loop_op(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let cx = dec_count_reg(m, a.rde);
    let zf = m.get_flag(flags::FLAGS_ZF);
    let take = match a.rde.opcode() {
        0xE0 => cx != 0 && !zf,
        0xE1 => cx != 0 && zf,
        _ => cx != 0,
    };
    if take {
        m.set_ip(m.ip.wrapping_add(a.disp as u64));
    }
    Ok(())
}

/// `E3`: JCXZ/JECXZ/JRCXZ.
pub fn jcxz(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if count_reg(m, a.rde) == 0 {
        m.set_ip(m.ip.wrapping_add(a.disp as u64));
    }
    Ok(())
}

/// `C8`: ENTER imm16, imm8.
pub fn enter(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let alloc = a.uimm & 0xffff;
    let nesting = (a.uimm1 & 31) as u64;
    let osz = stack_osz(a.rde);
    let log2 = osz_log2(osz);
    push_n(m, bus, m.get_reg(log2, Gpr::Rbp), a.rde.eamode(), osz)?;
    let frame = m.get_reg(log2, Gpr::Rsp);
    if nesting > 0 {
        for i in 1..nesting {
            let at = m.get_reg(log2, Gpr::Rbp).wrapping_sub(i * osz as u64);
            let slot = mem::read_sized(m, bus, m.segs[SEG_SS].base.wrapping_add(at) as i64, log2)?;
            push_n(m, bus, slot, a.rde.eamode(), osz)?;
        }
        push_n(m, bus, frame, a.rde.eamode(), osz)?;
    }
    m.put_reg(log2, Gpr::Rbp, frame);
    let sp = m.get_reg(log2, Gpr::Rsp).wrapping_sub(alloc);
    match a.rde.eamode() {
        Eamode::Real => m.put16(Gpr::Rsp, sp),
        Eamode::Legacy => m.put64(Gpr::Rsp, sp & 0xffff_ffff),
        Eamode::Long => m.put64(Gpr::Rsp, sp),
    }
    Ok(())
}

/// `C9`: LEAVE.
pub fn leave(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    match a.rde.eamode() {
        Eamode::Long => {
            let bp = m.get64(Gpr::Rbp);
            m.put64(Gpr::Rsp, bp);
            let v = pop(m, bus, a.rde, 0)?;
            m.put64(Gpr::Rbp, v);
        }
        Eamode::Legacy => {
            let bp = m.get32(Gpr::Rbp);
            m.put64(Gpr::Rsp, bp);
            let v = pop(m, bus, a.rde, 0)?;
            m.put64(Gpr::Rbp, v & 0xffff_ffff);
        }
        Eamode::Real => {
            let bp = m.get16(Gpr::Rbp);
            m.put16(Gpr::Rsp, bp);
            let v = pop(m, bus, a.rde, 0)?;
            m.put16(Gpr::Rbp, v);
        }
    }
    Ok(())
}

/// `C4`/`C5`: LES/LDS far pointer loads (legacy only).
pub fn les(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    far_pointer_load(m, bus, a, SEG_ES)
}

pub fn lds(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    far_pointer_load(m, bus, a, SEG_DS)
}

fn far_pointer_load(m: &mut Machine, bus: &mut dyn Bus, a: Args, seg: usize) -> R {
    if m.mode == DecodeMode::Long || a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let w = if a.rde.osz() { 2 } else { 4 };
    let log2 = osz_log2(w);
    let at = addr::compute_address(m, a);
    let offset = mem::read_sized(m, bus, at, log2)?;
    let selector = mem::read_u16(m, bus, at.wrapping_add(w as i64))?;
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), offset);
    m.segs[seg].selector = selector;
    m.segs[seg].base = (selector as u64) << 4;
    Ok(())
}

/// The `FF` group fans out to INC/DEC/CALL/JMP/PUSH.
pub fn group_ff(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    match a.rde.reg() {
        0 | 1 => super::arith::inc_dec_evqp(m, bus, a),
        2 => call_eq(m, bus, a),
        4 => jmp_eq(m, bus, a),
        6 => push_evq(m, bus, a),
        _ => Err(Exception::UndefinedInstruction),
    }
}
