//! Data movement: MOV in all its shapes, exchanges, conditional moves,
//! sign/zero extension, and the compare-exchange family.

use super::R;
use crate::addr::{self, Args};
use crate::alu::{self, ALU};
use crate::exception::Exception;
use crate::flags::{eval_cond, FLAGS_CF, FLAGS_ZF};
use crate::mem::{self, Bus};
use crate::rdrand;
use crate::state::{Machine, SEG_DS};
use ember_x86::{DecodeMode, Gpr};

/// `88`: MOV Eb, Gb.
pub fn mov_eb_gb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = m.get_byte_reg(a.rde.byte_rexr_reg());
    addr::write_rm(m, bus, a, 0, v)
}

/// `89`: MOV Evqp, Gvqp.
pub fn mov_evqp_gvqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    addr::write_rm(m, bus, a, log2, v)
}

/// `8A`: MOV Gb, Eb.
pub fn mov_gb_eb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = addr::read_rm(m, bus, a, 0)?;
    m.put_byte_reg(a.rde.byte_rexr_reg(), v);
    Ok(())
}

/// `8B`: MOV Gvqp, Evqp.
pub fn mov_gvqp_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = addr::read_rm(m, bus, a, log2)?;
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), v);
    Ok(())
}

/// `C6 /0`: MOV Eb, imm8.
pub fn mov_eb_ib(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.reg() != 0 {
        return Err(Exception::UndefinedInstruction);
    }
    addr::write_rm(m, bus, a, 0, a.uimm)
}

/// `C7 /0`: MOV Evqp, immz.
pub fn mov_evqp_ivds(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.reg() != 0 {
        return Err(Exception::UndefinedInstruction);
    }
    let log2 = a.rde.word_log2();
    addr::write_rm(m, bus, a, log2, a.uimm)
}

/// `B0..B7`: MOV byte register, imm8.
pub fn mov_zb_ib(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    m.put_byte_reg(a.rde.byte_rexb_srm(), a.uimm);
    Ok(())
}

/// `B8..BF`: MOV Zvqp, imm (up to 64 bits wide).
pub fn mov_zvqp_ivqp(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    m.put_reg(log2, Gpr::from_index(a.rde.rexb_srm()), a.uimm);
    Ok(())
}

/// `A0`: MOV AL, moffs.
pub fn mov_al_ob(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::address_ob(m, a);
    let v = mem::read_u8(m, bus, at)?;
    m.put_reg(0, Gpr::Rax, v as u64);
    Ok(())
}

/// `A2`: MOV moffs, AL.
pub fn mov_ob_al(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::address_ob(m, a);
    let v = m.get_reg(0, Gpr::Rax);
    mem::write_u8(m, bus, at, v as u8)
}

/// `A1`: MOV rAX, moffs.
pub fn mov_rax_ovqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let at = addr::address_ob(m, a);
    let v = mem::read_sized(m, bus, at, log2)?;
    m.put_reg(log2, Gpr::Rax, v);
    Ok(())
}

/// `A3`: MOV moffs, rAX.
pub fn mov_ovqp_rax(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let at = addr::address_ob(m, a);
    let v = m.get_reg(log2, Gpr::Rax);
    mem::write_sized(m, bus, at, log2, v)
}

/// `0F B6`: MOVZX Gvqp, Eb.
pub fn movzb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = if a.rde.is_register_form() {
        m.get_byte_reg(a.rde.byte_rexb_rm())
    } else {
        let at = addr::compute_address(m, a);
        mem::read_u8(m, bus, at)? as u64
    };
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), v);
    Ok(())
}

/// `0F B7`: MOVZX Gvqp, Ew.
pub fn movzw(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = addr::read_rm(m, bus, a, 1)?;
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), v);
    Ok(())
}

/// `0F BE`: MOVSX Gvqp, Eb.
pub fn movsb_ext(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = if a.rde.is_register_form() {
        m.get_byte_reg(a.rde.byte_rexb_rm())
    } else {
        let at = addr::compute_address(m, a);
        mem::read_u8(m, bus, at)? as u64
    };
    m.put_reg(
        log2,
        Gpr::from_index(a.rde.rexr_reg()),
        v as u8 as i8 as i64 as u64,
    );
    Ok(())
}

/// `0F BF`: MOVSX Gvqp, Ew.
pub fn movsw_ext(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = addr::read_rm(m, bus, a, 1)?;
    m.put_reg(
        log2,
        Gpr::from_index(a.rde.rexr_reg()),
        v as u16 as i16 as i64 as u64,
    );
    Ok(())
}

/// `63`: MOVSXD Gdqp, Ed.
pub fn movsxd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = addr::read_rm(m, bus, a, 2)? as u32 as i32 as i64 as u64;
    if a.rde.rexw() {
        m.put64(Gpr::from_index(a.rde.rexr_reg()), v);
    } else {
        m.put32(Gpr::from_index(a.rde.rexr_reg()), v);
    }
    Ok(())
}

/// `8D`: LEA Gvqp, M.
pub fn lea(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    // The effective address, without any segment base.
    let (offset, _) = addr::load_effective_address(m, a);
    let log2 = a.rde.word_log2();
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), offset);
    Ok(())
}

/// `86`: XCHG Eb, Gb (implicitly atomic on memory).
pub fn xchg_gb_eb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = m.get_byte_reg(a.rde.byte_rexr_reg());
    if a.rde.is_register_form() {
        let x = m.get_byte_reg(a.rde.byte_rexb_rm());
        m.put_byte_reg(a.rde.byte_rexb_rm(), y);
        m.put_byte_reg(a.rde.byte_rexr_reg(), x);
    } else {
        let at = addr::compute_address(m, a);
        let old = mem::locked_rmw(m, bus, at, 0, |_| y)?;
        m.put_byte_reg(a.rde.byte_rexr_reg(), old);
    }
    Ok(())
}

/// `87`: XCHG Evqp, Gvqp.
pub fn xchg_gvqp_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let y = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    if a.rde.is_register_form() {
        let x = m.get_rm_reg(a.rde, log2);
        m.put_rm_reg(a.rde, log2, y);
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), x);
    } else {
        let at = addr::compute_address(m, a);
        let old = mem::locked_rmw(m, bus, at, log2, |_| y)?;
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), old);
    }
    Ok(())
}

/// `91..97`: XCHG rAX, Zvqp. (`90` is NOP/PAUSE and never lands here.)
pub fn xchg_zvqp(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let r = Gpr::from_index(a.rde.rexb_srm());
    let x = m.get_reg(log2, Gpr::Rax);
    let y = m.get_reg(log2, r);
    m.put_reg(log2, Gpr::Rax, y);
    m.put_reg(log2, r, x);
    Ok(())
}

/// `0F C8..CF`: BSWAP.
pub fn bswap(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let r = Gpr::from_index(a.rde.rexb_srm());
    if a.rde.rexw() {
        let v = m.get64(r);
        m.put64(r, v.swap_bytes());
    } else if !a.rde.osz() {
        let v = m.get32(r) as u32;
        m.put32(r, v.swap_bytes() as u64);
    } else {
        // 16-bit BSWAP is architecturally undefined; real parts zero it.
        m.put16(r, 0);
    }
    Ok(())
}

/// `D7`: XLAT.
pub fn xlat(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let base = match a.rde.eamode() {
        ember_x86::Eamode::Real => m.get16(Gpr::Rbx),
        ember_x86::Eamode::Legacy => m.get32(Gpr::Rbx),
        ember_x86::Eamode::Long => m.get64(Gpr::Rbx),
    };
    let at = m
        .seg_base(a.rde, SEG_DS)
        .wrapping_add(base.wrapping_add(m.get_reg(0, Gpr::Rax))) as i64;
    let v = mem::read_u8(m, bus, at)?;
    m.put_reg(0, Gpr::Rax, v as u64);
    Ok(())
}

/// `98`: CBW/CWDE/CDQE.
pub fn sax(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rexw() {
        m.put64(Gpr::Rax, m.get32(Gpr::Rax) as u32 as i32 as i64 as u64);
    } else if !a.rde.osz() {
        m.put32(
            Gpr::Rax,
            m.get16(Gpr::Rax) as u16 as i16 as i32 as u32 as u64,
        );
    } else {
        let v = m.get_reg(0, Gpr::Rax) as u8 as i8 as i16 as u16;
        m.put16(Gpr::Rax, v as u64);
    }
    Ok(())
}

/// `99`: CWD/CDQ/CQO.
pub fn convert(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rexw() {
        let v = (m.get64(Gpr::Rax) as i64 >> 63) as u64;
        m.put64(Gpr::Rdx, v);
    } else if !a.rde.osz() {
        let v = (m.get32(Gpr::Rax) as u32 as i32 >> 31) as u32;
        m.put32(Gpr::Rdx, v as u64);
    } else {
        let v = (m.get16(Gpr::Rax) as u16 as i16 >> 15) as u16;
        m.put16(Gpr::Rdx, v as u64);
    }
    Ok(())
}

/// `0F 90..9F`: SETcc Eb.
pub fn setcc(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = eval_cond(m.flags, a.rde.opcode() & 0xf) as u64;
    addr::write_rm(m, bus, a, 0, v)
}

/// `0F 40..4F`: CMOVcc Gvqp, Evqp. The load happens regardless of the
/// predicate; a false condition still zero-extends 32-bit destinations.
pub fn cmovcc(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = addr::read_rm(m, bus, a, log2)?;
    if eval_cond(m.flags, a.rde.opcode() & 0xf) {
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), v);
    } else if log2 == 2 {
        let keep = m.get32(Gpr::from_index(a.rde.rexr_reg()));
        m.put32(Gpr::from_index(a.rde.rexr_reg()), keep);
    }
    Ok(())
}

/// `0F B0`: CMPXCHG Eb, Gb.
pub fn cmpxchg_eb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    cmpxchg(m, bus, a, 0)
}

/// `0F B1`: CMPXCHG Evqp, Gvqp.
pub fn cmpxchg_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    cmpxchg(m, bus, a, a.rde.word_log2())
}

fn cmpxchg(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize) -> R {
    let desired = if log2 == 0 {
        m.get_byte_reg(a.rde.byte_rexr_reg())
    } else {
        m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()))
    };
    let expected = m.get_reg(log2, Gpr::Rax);
    let old;
    if a.rde.is_register_form() {
        if a.rde.lock() {
            return Err(Exception::UndefinedInstruction);
        }
        old = m.get_rm_reg(a.rde, log2);
        if old == expected {
            m.put_rm_reg(a.rde, log2, desired);
        }
    } else {
        let at = addr::compute_address(m, a);
        old = mem::locked_rmw(
            m,
            bus,
            at,
            log2,
            |x| if x == expected { desired } else { x },
        )?;
    }
    // Flags come from the comparison, like a CMP of rAX against the old
    // value.
    ALU[alu::ALU_SUB][log2](expected, old, &mut m.flags);
    if !m.get_flag(FLAGS_ZF) {
        m.put_reg(log2, Gpr::Rax, old);
    }
    Ok(())
}

/// `0F C7` group: CMPXCHG8B/16B (/1) and RDRAND (/6) / RDSEED (/7).
pub fn group_1c7(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    match a.rde.reg() {
        1 if !a.rde.is_register_form() => {
            if a.rde.rexw() {
                cmpxchg16b(m, bus, a)
            } else {
                cmpxchg8b(m, bus, a)
            }
        }
        6 if a.rde.is_register_form() => rdrand_reg(m, a),
        7 if a.rde.is_register_form() => rdrand_reg(m, a),
        _ => Err(Exception::UndefinedInstruction),
    }
}

fn cmpxchg8b(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::compute_address(m, a);
    let expected = m.get32(Gpr::Rdx) << 32 | m.get32(Gpr::Rax);
    let desired = m.get32(Gpr::Rcx) << 32 | m.get32(Gpr::Rbx);
    let old = mem::locked_rmw(m, bus, at, 3, |x| if x == expected { desired } else { x })?;
    m.set_flag(FLAGS_ZF, old == expected);
    if old != expected {
        m.put32(Gpr::Rax, old & 0xffff_ffff);
        m.put32(Gpr::Rdx, old >> 32);
    }
    Ok(())
}

fn cmpxchg16b(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::compute_address(m, a);
    if at & 15 != 0 {
        return Err(Exception::ProtectionFault);
    }
    let expected = (m.get64(Gpr::Rdx) as u128) << 64 | m.get64(Gpr::Rax) as u128;
    let desired = (m.get64(Gpr::Rcx) as u128) << 64 | m.get64(Gpr::Rbx) as u128;
    let (swapped, old) = mem::locked_cmpxchg16b(m, bus, at, expected, desired)?;
    m.set_flag(FLAGS_ZF, swapped);
    if !swapped {
        m.put64(Gpr::Rax, old as u64);
        m.put64(Gpr::Rdx, (old >> 64) as u64);
    }
    Ok(())
}

fn rdrand_reg(m: &mut Machine, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let v = rdrand::entropy();
    m.put_rm_reg(a.rde, log2, v);
    m.set_flag(FLAGS_CF, true);
    m.set_flag(FLAGS_ZF, false);
    Ok(())
}

/// `0F C0`: XADD Eb, Gb.
pub fn xadd_eb(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    xadd(m, bus, a, 0)
}

/// `0F C1`: XADD Evqp, Gvqp.
pub fn xadd_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    xadd(m, bus, a, a.rde.word_log2())
}

fn xadd(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize) -> R {
    let y = if log2 == 0 {
        m.get_byte_reg(a.rde.byte_rexr_reg())
    } else {
        m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()))
    };
    let old;
    if a.rde.is_register_form() {
        if a.rde.lock() {
            return Err(Exception::UndefinedInstruction);
        }
        old = m.get_rm_reg(a.rde, log2);
        let z = ALU[alu::ALU_ADD][log2](old, y, &mut m.flags);
        m.put_rm_reg(a.rde, log2, z);
    } else {
        let at = addr::compute_address(m, a);
        let base = m.flags;
        let mut f = base;
        old = mem::locked_rmw(m, bus, at, log2, |x| {
            f = base;
            ALU[alu::ALU_ADD][log2](x, y, &mut f)
        })?;
        m.flags = f;
    }
    if log2 == 0 {
        m.put_byte_reg(a.rde.byte_rexr_reg(), old);
    } else {
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), old);
    }
    Ok(())
}

/// `8C`: MOV Evqp, Sw.
pub fn mov_evqp_sw(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let seg = a.rde.reg() as usize;
    if seg >= 6 {
        return Err(Exception::UndefinedInstruction);
    }
    let v = m.segs[seg].selector as u64;
    let log2 = if a.rde.is_register_form() {
        a.rde.word_log2()
    } else {
        1
    };
    addr::write_rm(m, bus, a, log2, v)
}

/// `8E`: MOV Sw, Evqp. Loading CS this way is invalid.
pub fn mov_sw_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let seg = a.rde.reg() as usize;
    if seg >= 6 || seg == crate::state::SEG_CS {
        return Err(Exception::UndefinedInstruction);
    }
    let v = addr::read_rm(m, bus, a, 1)? as u16;
    m.segs[seg].selector = v;
    if m.mode != DecodeMode::Long {
        // Real-mode descriptor cache: base tracks selector << 4.
        m.segs[seg].base = (v as u64) << 4;
    }
    Ok(())
}

/// `0F C3`: MOVNTI: an ordinary store as far as the guest can tell.
pub fn movnti(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let log2 = if a.rde.rexw() { 3 } else { 2 };
    let v = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    let at = addr::compute_address(m, a);
    mem::write_sized(m, bus, at, log2, v)
}
