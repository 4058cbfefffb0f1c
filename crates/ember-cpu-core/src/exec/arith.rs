//! Integer arithmetic handlers: the ALU rows, shift groups, F6/F7/FE/FF
//! groups, double shifts, bit tests, and the BCD row.

use super::R;
use crate::addr::{self, Args};
use crate::alu::{self, ALU, BSU};
use crate::bcd;
use crate::bit;
#[cfg(feature = "bmi2")]
use crate::bmi2;
use crate::crc32;
use crate::divmul;
use crate::exception::Exception;
use crate::flags::FLAGS_CF;
use crate::mem::{self, Bus};
use crate::state::Machine;
use ember_x86::{DecodeMode, Gpr};

/// ALU row index taken from bits 3..6 of the opcode.
#[inline]
fn alu_row(a: Args) -> usize {
    (a.rde.opcode() as usize & 0o070) >> 3
}

/// Applies an ALU kernel to the r/m operand, honouring LOCK on memory
/// forms. CMP-row calls discard the result.
fn alu_rm(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize, op: usize, y: u64) -> R {
    if a.rde.lock() {
        if a.rde.is_register_form() || op == alu::ALU_CMP {
            return Err(Exception::UndefinedInstruction);
        }
        let addr = addr::compute_address(m, a);
        let base = m.flags;
        let mut f = base;
        mem::locked_rmw(m, bus, addr, log2, |x| {
            // The kernel may run more than once if the CAS retries; start
            // each attempt from the incoming flags.
            f = base;
            ALU[op][log2](x, y, &mut f)
        })?;
        m.flags = f;
        return Ok(());
    }
    let x = addr::read_rm(m, bus, a, log2)?;
    let z = ALU[op][log2](x, y, &mut m.flags);
    if op != alu::ALU_CMP {
        addr::write_rm(m, bus, a, log2, z)?;
    }
    Ok(())
}

/// `00/08/10/18/20/28/30`: Eb ← Eb op Gb, plus `38` CMP.
pub fn alub(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = m.get_byte_reg(a.rde.byte_rexr_reg());
    alu_rm(m, bus, a, 0, alu_row(a), y)
}

/// `02/0A/...`: Gb ← Gb op Eb (flipped), plus `3A` CMP.
pub fn alub_flip(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let op = alu_row(a);
    let x = m.get_byte_reg(a.rde.byte_rexr_reg());
    let y = addr::read_rm(m, bus, a, 0)?;
    let z = ALU[op][0](x, y, &mut m.flags);
    if op != alu::ALU_CMP {
        m.put_byte_reg(a.rde.byte_rexr_reg(), z);
    }
    Ok(())
}

/// `01/09/...`: Evqp ← Evqp op Gvqp, plus `39` CMP.
pub fn aluw(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let y = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    alu_rm(m, bus, a, log2, alu_row(a), y)
}

/// `03/0B/...`: Gvqp ← Gvqp op Evqp, plus `3B` CMP.
pub fn aluw_flip(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let op = alu_row(a);
    let log2 = a.rde.word_log2();
    let x = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    let y = addr::read_rm(m, bus, a, log2)?;
    let z = ALU[op][log2](x, y, &mut m.flags);
    if op != alu::ALU_CMP {
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), z);
    }
    Ok(())
}

/// `04/0C/...`: AL ← AL op imm8, plus `3C` CMP.
pub fn alu_al_ib(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let op = alu_row(a);
    let x = m.get_reg(0, Gpr::Rax);
    let z = ALU[op][0](x, a.uimm, &mut m.flags);
    if op != alu::ALU_CMP {
        m.put_reg(0, Gpr::Rax, z);
    }
    Ok(())
}

/// `05/0D/...`: rAX ← rAX op immz, plus `3D` CMP.
pub fn alu_rax_ivds(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let op = alu_row(a);
    let log2 = a.rde.word_log2();
    let x = m.get_reg(log2, Gpr::Rax);
    let z = ALU[op][log2](x, a.uimm, &mut m.flags);
    if op != alu::ALU_CMP {
        m.put_reg(log2, Gpr::Rax, z);
    }
    Ok(())
}

/// `80/82` group: Eb ← Eb group[modrm.reg] imm8.
pub fn alubi_reg(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    alu_rm(m, bus, a, 0, a.rde.reg() as usize, a.uimm)
}

/// `81/83` group: Evqp ← Evqp group[modrm.reg] imm.
pub fn aluwi_reg(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    alu_rm(m, bus, a, log2, a.rde.reg() as usize, a.uimm)
}

/// `84`: TEST Eb, Gb.
pub fn alub_test(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let x = addr::read_rm(m, bus, a, 0)?;
    let y = m.get_byte_reg(a.rde.byte_rexr_reg());
    ALU[alu::ALU_AND][0](x, y, &mut m.flags);
    Ok(())
}

/// `85`: TEST Evqp, Gvqp.
pub fn aluw_test(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let x = addr::read_rm(m, bus, a, log2)?;
    let y = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    ALU[alu::ALU_AND][log2](x, y, &mut m.flags);
    Ok(())
}

/// `A8`: TEST AL, imm8.
pub fn test_al_ib(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let x = m.get_reg(0, Gpr::Rax);
    ALU[alu::ALU_AND][0](x, a.uimm, &mut m.flags);
    Ok(())
}

/// `A9`: TEST rAX, immz.
pub fn test_rax_ivds(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let x = m.get_reg(log2, Gpr::Rax);
    ALU[alu::ALU_AND][log2](x, a.uimm, &mut m.flags);
    Ok(())
}

fn shift_count_cl(m: &Machine) -> u64 {
    m.get_reg(0, Gpr::Rcx)
}

fn bsu_rm(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize, count: u64) -> R {
    let op = a.rde.reg() as usize;
    let x = addr::read_rm(m, bus, a, log2)?;
    let z = BSU[op][log2](x, count, &mut m.flags);
    addr::write_rm(m, bus, a, log2, z)
}

/// `C0`: shift group, Eb by imm8.
pub fn bsubi_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    bsu_rm(m, bus, a, 0, a.uimm)
}

/// `C1`: shift group, Evqp by imm8.
pub fn bsuwi_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    bsu_rm(m, bus, a, log2, a.uimm)
}

/// `D0`/`D1`: shift by one.
pub fn bsubi_one(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    bsu_rm(m, bus, a, 0, 1)
}

pub fn bsuwi_one(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    bsu_rm(m, bus, a, log2, 1)
}

/// `D2`/`D3`: shift by CL.
pub fn bsubi_cl(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    bsu_rm(m, bus, a, 0, shift_count_cl(m))
}

pub fn bsuwi_cl(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    bsu_rm(m, bus, a, log2, shift_count_cl(m))
}

/// `0F A4/A5/AC/AD`: SHLD/SHRD by imm8 or CL.
pub fn double_shift(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let right = a.rde.opcode() & 8 != 0;
    let count = if a.rde.opcode() & 1 != 0 {
        shift_count_cl(m) as u8
    } else {
        a.uimm as u8
    };
    let x = addr::read_rm(m, bus, a, log2)?;
    let y = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    let z = alu::double_shift(log2, x, y, count, right, &mut m.flags);
    addr::write_rm(m, bus, a, log2, z)
}

/// `F6` group: TEST/TEST/NOT/NEG/MUL/IMUL/DIV/IDIV on Eb.
pub fn group_f6(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    group_f6_f7(m, bus, a, 0)
}

/// `F7` group on Evqp.
pub fn group_f7(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    group_f6_f7(m, bus, a, log2)
}

fn group_f6_f7(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize) -> R {
    match a.rde.reg() {
        0 | 1 => {
            let x = addr::read_rm(m, bus, a, log2)?;
            ALU[alu::ALU_AND][log2](x, a.uimm, &mut m.flags);
            Ok(())
        }
        2 => alu_rm(m, bus, a, log2, alu::ALU_NOT, 0),
        3 => alu_rm(m, bus, a, log2, alu::ALU_NEG, 0),
        4 => {
            let y = addr::read_rm(m, bus, a, log2)?;
            divmul::mul_unsigned(m, log2, y);
            Ok(())
        }
        5 => {
            let y = addr::read_rm(m, bus, a, log2)?;
            divmul::mul_signed(m, log2, y);
            Ok(())
        }
        6 => {
            let y = addr::read_rm(m, bus, a, log2)?;
            divmul::div_unsigned(m, log2, y)
        }
        _ => {
            let y = addr::read_rm(m, bus, a, log2)?;
            divmul::div_signed(m, log2, y)
        }
    }
}

/// `FE` group: INC/DEC Eb.
pub fn group_fe(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    match a.rde.reg() {
        0 => alu_rm(m, bus, a, 0, alu::ALU_INC, 0),
        1 => alu_rm(m, bus, a, 0, alu::ALU_DEC, 0),
        _ => Err(Exception::UndefinedInstruction),
    }
}

/// `40..47` / `48..4F` legacy INC/DEC Zv (decoded as REX in long mode).
pub fn inc_zv(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    let r = Gpr::from_index(a.rde.srm() as usize);
    let x = m.get_reg(log2, r);
    let z = ALU[alu::ALU_INC][log2](x, 0, &mut m.flags);
    m.put_reg(log2, r, z);
    Ok(())
}

pub fn dec_zv(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    let r = Gpr::from_index(a.rde.srm() as usize);
    let x = m.get_reg(log2, r);
    let z = ALU[alu::ALU_DEC][log2](x, 0, &mut m.flags);
    m.put_reg(log2, r, z);
    Ok(())
}

/// `0F AF` and the `69`/`6B` immediate forms.
pub fn imul_gvqp_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let x = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    let y = addr::read_rm(m, bus, a, log2)?;
    let z = divmul::imul_truncating(m, log2, x, y);
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), z);
    Ok(())
}

pub fn imul_gvqp_evqp_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let x = addr::read_rm(m, bus, a, log2)?;
    let z = divmul::imul_truncating(m, log2, x, a.uimm);
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), z);
    Ok(())
}

/// `0F A3/AB/B3/BB` and the `0F BA` immediate group.
pub fn bit_ops(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let (op, bytedisp, bitidx) = if a.rde.opcode() == 0xBA {
        // Immediate form: the bit index wraps in place, no byte walking.
        let op = a.rde.reg();
        if op < 4 {
            return Err(Exception::UndefinedInstruction);
        }
        (op, 0i64, a.uimm as u32 & ((8u32 << log2) - 1))
    } else {
        let op = (a.rde.opcode() & 0o070) >> 3;
        let raw = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
        // Sign-extend the register offset.
        let shift = 64 - (8u32 << log2);
        let offset = (raw << shift) as i64 >> shift;
        let (d, b) = bit::bit_disp(offset, log2);
        (op, d, b)
    };
    let mask = 1u64 << bitidx;
    if a.rde.is_register_form() {
        let x = m.get_rm_reg(a.rde, log2);
        m.set_flag(FLAGS_CF, x & mask != 0);
        if op != bit::BIT_BT {
            m.put_rm_reg(a.rde, log2, bit::bit_op(op, x, mask));
        }
        Ok(())
    } else {
        let addr = addr::compute_address(m, a).wrapping_add(bytedisp);
        if op == bit::BIT_BT {
            let x = mem::read_sized(m, bus, addr, log2)?;
            m.set_flag(FLAGS_CF, x & mask != 0);
            Ok(())
        } else if a.rde.lock() {
            let mut cf = false;
            mem::locked_rmw(m, bus, addr, log2, |x| {
                cf = x & mask != 0;
                bit::bit_op(op, x, mask)
            })?;
            m.set_flag(FLAGS_CF, cf);
            Ok(())
        } else {
            let x = mem::read_sized(m, bus, addr, log2)?;
            m.set_flag(FLAGS_CF, x & mask != 0);
            mem::write_sized(m, bus, addr, log2, bit::bit_op(op, x, mask))
        }
    }
}

/// `0F BC`: BSF.
pub fn bsf(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let y = addr::read_rm(m, bus, a, log2)?;
    if let Some(idx) = bit::bsf(m, y) {
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), idx);
    }
    Ok(())
}

/// `0F BD`: BSR.
pub fn bsr(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    let y = addr::read_rm(m, bus, a, log2)?;
    if let Some(idx) = bit::bsr(m, y) {
        m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), idx);
    }
    Ok(())
}

/// `0F B8`: POPCNT with F3, #UD otherwise.
pub fn group_1b8(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() != 3 {
        return Err(Exception::UndefinedInstruction);
    }
    let log2 = a.rde.word_log2();
    let y = addr::read_rm(m, bus, a, log2)?;
    let z = bit::popcnt(m, y);
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), z);
    Ok(())
}

/// `F2 0F 38 F0/F1`: CRC32 accumulate.
pub fn crc32_op(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() != 2 {
        return Err(Exception::UndefinedInstruction);
    }
    let log2 = if a.rde.opcode() & 1 == 0 {
        0
    } else {
        a.rde.word_log2().max(1)
    };
    let y = addr::read_rm(m, bus, a, log2)?;
    let h = m.get32(Gpr::from_index(a.rde.rexr_reg())) as u32;
    let z = crc32::castagnoli(h, y, 1 << log2);
    m.put64(Gpr::from_index(a.rde.rexr_reg()), z as u64);
    Ok(())
}

/// `0F 38 F5`: PDEP (F2) / PEXT (F3), feature-gated.
#[cfg(feature = "bmi2")]
pub fn pdep_pext(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let wide = a.rde.rexw();
    let log2 = if wide { 3 } else { 2 };
    let mask = addr::read_rm(m, bus, a, log2)?;
    let src = m.get_reg(log2, Gpr::from_index(a.rde.rexr_reg()));
    let z = match a.rde.rep() {
        2 => bmi2::pdep(src, mask),
        3 => bmi2::pext(src, mask),
        _ => return Err(Exception::UndefinedInstruction),
    };
    m.put_reg(
        log2,
        Gpr::from_index(a.rde.rexr_reg()),
        if wide { z } else { z as u32 as u64 },
    );
    Ok(())
}

/// `F2 0F 3A F0`: RORX.
#[cfg(feature = "bmi2")]
pub fn rorx(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() != 2 {
        return Err(Exception::UndefinedInstruction);
    }
    let wide = a.rde.rexw();
    let log2 = if wide { 3 } else { 2 };
    let x = addr::read_rm(m, bus, a, log2)?;
    let z = bmi2::rorx(x, a.uimm as u32, wide);
    m.put64(Gpr::from_index(a.rde.rexr_reg()), z);
    Ok(())
}

/// `F2 0F 38 F6`: MULX: flagless widening multiply of rDX by r/m.
#[cfg(feature = "bmi2")]
pub fn mulx(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() != 2 {
        return Err(Exception::UndefinedInstruction);
    }
    let wide = a.rde.rexw();
    let log2 = if wide { 3 } else { 2 };
    let y = addr::read_rm(m, bus, a, log2)?;
    let (lo, hi) = if wide {
        let p = m.get64(Gpr::Rdx) as u128 * y as u128;
        (p as u64, (p >> 64) as u64)
    } else {
        let p = m.get32(Gpr::Rdx) * y;
        (p & 0xffff_ffff, p >> 32)
    };
    m.put_reg(log2, Gpr::Rdx, lo);
    m.put_reg(log2, Gpr::from_index(a.rde.rexr_reg()), hi);
    Ok(())
}

/// BCD adjustments share a legacy-mode gate.
fn legacy_only(m: &Machine) -> R {
    if m.mode == DecodeMode::Long {
        Err(Exception::UndefinedInstruction)
    } else {
        Ok(())
    }
}

pub fn daa(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    legacy_only(m)?;
    bcd::daa(m);
    Ok(())
}

pub fn das(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    legacy_only(m)?;
    bcd::das(m);
    Ok(())
}

pub fn aaa(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    legacy_only(m)?;
    bcd::aaa(m);
    Ok(())
}

pub fn aas(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    legacy_only(m)?;
    bcd::aas(m);
    Ok(())
}

pub fn aam(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    legacy_only(m)?;
    bcd::aam(m, a.uimm as u8)
}

pub fn aad(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    legacy_only(m)?;
    bcd::aad(m, a.uimm as u8);
    Ok(())
}

/// `D6`: SALC: AL = CF ? 0xFF : 0 (undocumented but real).
pub fn salc(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    legacy_only(m)?;
    let v = if m.get_flag(FLAGS_CF) { 0xff } else { 0 };
    m.put_reg(0, Gpr::Rax, v);
    Ok(())
}

/// Group FF routes INC/DEC here; the flow handlers own the rest.
pub fn inc_dec_evqp(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = a.rde.word_log2();
    match a.rde.reg() {
        0 => alu_rm(m, bus, a, log2, alu::ALU_INC, 0),
        1 => alu_rm(m, bus, a, log2, alu::ALU_DEC, 0),
        _ => Err(Exception::UndefinedInstruction),
    }
}
