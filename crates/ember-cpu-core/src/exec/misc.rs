//! Flag manipulation, system leaves, I/O ports, and the odds and ends of
//! the one- and two-byte maps.

use super::{PendingExit, R};
use crate::addr::{self, Args};
use crate::cpuid;
use crate::exception::{Exception, HaltReason};
use crate::flags::{FLAGS_CF, FLAGS_DF, FLAGS_IF, FLAGS_ZF};
use crate::fpu;
use crate::ldbl;
use crate::mem::{self, Bus};
use crate::rdrand;
use crate::state::{Machine, SEG_FS, SEG_GS};
use ember_x86::Gpr;

pub fn noop(_m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    Ok(())
}

/// `90`: NOP, or PAUSE with an F3 prefix, or XCHG R8 with REX.B.
pub fn nop_or_pause(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() == 3 {
        m.pending_exit = Some(PendingExit::Pause);
        Ok(())
    } else if a.rde.rexb() {
        super::data::xchg_zvqp(m, bus, a)
    } else {
        Ok(())
    }
}

pub fn ud(_m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    Err(Exception::UndefinedInstruction)
}

/// `0F 0D`, `0F 18..1E`: prefetch/hint NOPs with a decoded ModR/M.
pub fn hint_nop_ev(_m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    Ok(())
}

pub fn nop_ev(_m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    Ok(())
}

pub fn cmc(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let cf = m.get_flag(FLAGS_CF);
    m.set_flag(FLAGS_CF, !cf);
    Ok(())
}

pub fn clc(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_CF, false);
    Ok(())
}

pub fn stc(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_CF, true);
    Ok(())
}

pub fn cli(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_IF, false);
    Ok(())
}

pub fn sti(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_IF, true);
    Ok(())
}

pub fn cld(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_DF, false);
    Ok(())
}

pub fn std(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_DF, true);
    Ok(())
}

/// `F4`: HLT hands control back to the embedder.
pub fn hlt(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.pending_exit = Some(PendingExit::Halt);
    Ok(())
}

/// `CC`/`CD`/`F1`: software interrupts surface as exits.
pub fn int3(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.pending_exit = Some(PendingExit::Interrupt(3));
    Ok(())
}

pub fn int1(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.pending_exit = Some(PendingExit::Interrupt(1));
    Ok(())
}

pub fn int_imm(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    m.pending_exit = Some(PendingExit::Interrupt(a.uimm as u8));
    Ok(())
}

/// `0F 05`: SYSCALL: the trap boundary with the OS emulation layer.
pub fn syscall(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    // RCX/R11 receive the return context, per the architectural contract.
    m.put64(Gpr::Rcx, m.ip);
    m.put64(Gpr::R11, crate::flags::export_flags(m.flags) as u64);
    m.pending_exit = Some(PendingExit::Syscall);
    Ok(())
}

/// `0F A2`: CPUID.
pub fn cpuid_op(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    if m.config.trap_cpuid {
        return Err(m.segv(0));
    }
    cpuid::cpuid(m);
    Ok(())
}

/// `0F 31`: RDTSC.
pub fn rdtsc(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let t = rdrand::timestamp();
    m.put64(Gpr::Rax, t & 0xffff_ffff);
    m.put64(Gpr::Rdx, t >> 32);
    Ok(())
}

const MSR_FS_BASE: u32 = 0xC000_0100;
const MSR_GS_BASE: u32 = 0xC000_0101;

/// `0F 32`: RDMSR (FS/GS base only; anything else faults).
pub fn rdmsr(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let v = match m.get32(Gpr::Rcx) as u32 {
        MSR_FS_BASE => m.segs[SEG_FS].base,
        MSR_GS_BASE => m.segs[SEG_GS].base,
        _ => return Err(Exception::ProtectionFault),
    };
    m.put64(Gpr::Rax, v & 0xffff_ffff);
    m.put64(Gpr::Rdx, v >> 32);
    Ok(())
}

/// `0F 30`: WRMSR.
pub fn wrmsr(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let v = m.get32(Gpr::Rdx) << 32 | m.get32(Gpr::Rax);
    match m.get32(Gpr::Rcx) as u32 {
        MSR_FS_BASE => m.segs[SEG_FS].base = v,
        MSR_GS_BASE => m.segs[SEG_GS].base = v,
        _ => return Err(Exception::ProtectionFault),
    }
    Ok(())
}

/// `0F 01` group: SWAPGS, RDTSCP, INVLPG; descriptor-table loads are
/// userspace no-ops here.
pub fn group_101(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        match a.rde.modrm() {
            // SWAPGS touches the kernel GS shadow, which a userspace
            // machine does not have.
            0xF8 => Err(Exception::ProtectionFault),
            0xF9 => {
                // RDTSCP: timestamp plus the processor id in ECX.
                let t = rdrand::timestamp();
                m.put64(Gpr::Rax, t & 0xffff_ffff);
                m.put64(Gpr::Rdx, t >> 32);
                m.put64(Gpr::Rcx, 0);
                Ok(())
            }
            _ => Err(Exception::UndefinedInstruction),
        }
    } else {
        match a.rde.reg() {
            7 => {
                // INVLPG.
                bus.invalidate_tlb();
                Ok(())
            }
            _ => Err(Exception::UndefinedInstruction),
        }
    }
}

/// `0F 03`: LSL: no descriptor tables to consult, so the load never
/// succeeds and ZF stays clear.
pub fn lsl(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.set_flag(FLAGS_ZF, false);
    Ok(())
}

/// `0F AE` group: LDMXCSR/STMXCSR, FXSAVE/FXRSTOR, CLFLUSH, and the
/// fences (which a single-bus interpreter already satisfies).
pub fn group_1ae(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return match a.rde.reg() {
            5 | 6 | 7 => Ok(()), // lfence/mfence/sfence
            _ => Err(Exception::UndefinedInstruction),
        };
    }
    match a.rde.reg() {
        0 => fxsave(m, bus, a),
        1 => fxrstor(m, bus, a),
        2 => {
            let at = addr::compute_address(m, a);
            m.mxcsr = mem::read_u32(m, bus, at)?;
            Ok(())
        }
        3 => {
            let at = addr::compute_address(m, a);
            mem::write_u32(m, bus, at, m.mxcsr)
        }
        7 => Ok(()), // clflush
        _ => Err(Exception::UndefinedInstruction),
    }
}

/// FXSAVE: the 512-byte layout with x87 registers serialised to the
/// ten-byte format in their 16-byte slots.
fn fxsave(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::compute_address(m, a);
    if at & 15 != 0 {
        return Err(Exception::ProtectionFault);
    }
    let mut buf = [0u8; 512];
    buf[0..2].copy_from_slice(&(m.fpu.cw as u16).to_le_bytes());
    buf[2..4].copy_from_slice(&(m.fpu.sw.bits() as u16).to_le_bytes());
    buf[4] = abridge_tag(m.fpu.tw);
    buf[6..8].copy_from_slice(&(m.fpu.op as u16).to_le_bytes());
    buf[8..16].copy_from_slice(&(m.fpu.ip as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&(m.fpu.dp as u64).to_le_bytes());
    buf[24..28].copy_from_slice(&m.mxcsr.to_le_bytes());
    buf[28..32].copy_from_slice(&0xffffu32.to_le_bytes());
    for i in 0..8 {
        let b = ldbl::serialize_ldbl(m.fpu.peek(i as i32));
        buf[32 + i * 16..32 + i * 16 + 10].copy_from_slice(&b);
    }
    for i in 0..16 {
        buf[160 + i * 16..160 + i * 16 + 16].copy_from_slice(&m.xmm[i]);
    }
    mem::write_mem(m, bus, at, &buf)
}

fn fxrstor(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let at = addr::compute_address(m, a);
    if at & 15 != 0 {
        return Err(Exception::ProtectionFault);
    }
    let mut buf = [0u8; 512];
    mem::read_mem(m, bus, at, &mut buf)?;
    m.fpu.cw = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as u32;
    m.fpu.sw = fpu::Sw::from_bits_retain(u16::from_le_bytes(buf[2..4].try_into().unwrap()) as u32);
    m.fpu.tw = unabridge_tag(buf[4]);
    m.fpu.op = u16::from_le_bytes(buf[6..8].try_into().unwrap()) as u32;
    m.fpu.ip = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as i64;
    m.fpu.dp = u64::from_le_bytes(buf[16..24].try_into().unwrap()) as i64;
    m.mxcsr = u32::from_le_bytes(buf[24..28].try_into().unwrap());
    for i in 0..8 {
        let b: [u8; 10] = buf[32 + i * 16..32 + i * 16 + 10].try_into().unwrap();
        let v = ldbl::deserialize_ldbl(&b);
        m.fpu.set_st(i as i32, v);
    }
    for i in 0..16 {
        m.xmm[i].copy_from_slice(&buf[160 + i * 16..160 + i * 16 + 16]);
    }
    Ok(())
}

/// Full tag word to the FXSAVE one-bit-per-register form.
fn abridge_tag(tw: u32) -> u8 {
    let mut out = 0u8;
    for i in 0..8 {
        if tw >> (i * 2) & 3 != crate::fpu::TAG_EMPTY {
            out |= 1 << i;
        }
    }
    out
}

fn unabridge_tag(abridged: u8) -> u32 {
    let mut out = 0u32;
    for i in 0..8 {
        let t = if abridged & 1 << i != 0 {
            crate::fpu::TAG_VALID
        } else {
            crate::fpu::TAG_EMPTY
        };
        out |= t << (i * 2);
    }
    out
}

/// `9B`: FWAIT surfaces unmasked x87 exceptions.
pub fn fwait(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    let sw = m.fpu.sw.bits();
    let unmasked = sw & 0x3f & !(m.fpu.cw & 0x3f);
    if unmasked != 0 {
        return Err(Exception::Halted(HaltReason::FpuException));
    }
    Ok(())
}

/// `0F 77`: EMMS.
pub fn emms(m: &mut Machine, _bus: &mut dyn Bus, _a: Args) -> R {
    m.fpu.tw = 0xffff;
    Ok(())
}

/// `E4..E7`, `EC..EF`: port I/O.
pub fn in_al_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = bus.io_read(a.uimm as u16, 1)?;
    m.put_reg(0, Gpr::Rax, v);
    Ok(())
}

pub fn in_ax_imm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    let v = bus.io_read(a.uimm as u16, 1 << log2)?;
    m.put_reg(log2, Gpr::Rax, v);
    Ok(())
}

pub fn in_al_dx(m: &mut Machine, bus: &mut dyn Bus, _a: Args) -> R {
    let v = bus.io_read(m.get16(Gpr::Rdx) as u16, 1)?;
    m.put_reg(0, Gpr::Rax, v);
    Ok(())
}

pub fn in_ax_dx(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    let v = bus.io_read(m.get16(Gpr::Rdx) as u16, 1 << log2)?;
    m.put_reg(log2, Gpr::Rax, v);
    Ok(())
}

pub fn out_imm_al(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    bus.io_write(a.uimm as u16, 1, m.get_reg(0, Gpr::Rax))
}

pub fn out_imm_ax(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    bus.io_write(a.uimm as u16, 1 << log2, m.get_reg(log2, Gpr::Rax))
}

pub fn out_dx_al(m: &mut Machine, bus: &mut dyn Bus, _a: Args) -> R {
    bus.io_write(m.get16(Gpr::Rdx) as u16, 1, m.get_reg(0, Gpr::Rax))
}

pub fn out_dx_ax(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.osz() { 1 } else { 2 };
    bus.io_write(
        m.get16(Gpr::Rdx) as u16,
        1 << log2,
        m.get_reg(log2, Gpr::Rax),
    )
}

/// `0F 20`: MOV reg, CRn.
pub fn mov_rq_cq(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    let v = match a.rde.reg() {
        0 => m.cr0,
        2 => m.cr2,
        3 => m.cr3,
        4 => m.cr4,
        _ => return Err(Exception::UndefinedInstruction),
    };
    m.put64(Gpr::from_index(a.rde.rexb_rm()), v);
    Ok(())
}

/// `0F 22`: MOV CRn, reg.
pub fn mov_cq_rq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = m.get64(Gpr::from_index(a.rde.rexb_rm()));
    match a.rde.reg() {
        0 => m.cr0 = v,
        2 => m.cr2 = v,
        3 => {
            m.cr3 = v;
            bus.invalidate_tlb();
        }
        4 => m.cr4 = v,
        _ => return Err(Exception::UndefinedInstruction),
    }
    Ok(())
}
