//! Effective-address computation and ModR/M operand access.

use crate::exception::Exception;
use crate::mem::{self, Bus};
use crate::state::{mask_address, Machine, SEG_DS, SEG_ES, SEG_SS};
use ember_x86::{DecodeMode, Eamode, Gpr, Rde};

/// Arguments forwarded from the decoder to every handler.
#[derive(Debug, Clone, Copy)]
pub struct Args {
    pub rde: Rde,
    pub disp: i64,
    pub uimm: u64,
    /// The second immediate byte (ENTER only).
    pub uimm1: u8,
}

impl Args {
    pub fn new(rde: Rde, disp: i64, uimm: u64) -> Self {
        Args {
            rde,
            disp,
            uimm,
            uimm1: 0,
        }
    }

    pub fn with_uimm1(mut self, uimm1: u8) -> Self {
        self.uimm1 = uimm1;
        self
    }
}

/// Computes the linear address of a memory operand: the effective address
/// plus the (possibly overridden) segment base.
pub fn compute_address(m: &Machine, a: Args) -> i64 {
    let (offset, seg) = load_effective_address(m, a);
    m.seg_base(a.rde, seg).wrapping_add(offset) as i64
}

/// Base/index/displacement arithmetic modulo the address size, returning
/// the raw offset and the default segment it would be relative to.
/// `mod == 3` forms must not get here.
pub fn load_effective_address(m: &Machine, a: Args) -> (u64, usize) {
    let rde = a.rde;
    let mut i = a.disp as u64;
    let mut seg = SEG_DS;
    match rde.eamode() {
        Eamode::Real => {
            // The 8-case 16-bit base/index table.
            match rde.rm() {
                0 => {
                    i = i
                        .wrapping_add(m.get16(Gpr::Rbx))
                        .wrapping_add(m.get16(Gpr::Rsi));
                }
                1 => {
                    i = i
                        .wrapping_add(m.get16(Gpr::Rbx))
                        .wrapping_add(m.get16(Gpr::Rdi));
                }
                2 => {
                    seg = SEG_SS;
                    i = i
                        .wrapping_add(m.get16(Gpr::Rbp))
                        .wrapping_add(m.get16(Gpr::Rsi));
                }
                3 => {
                    seg = SEG_SS;
                    i = i
                        .wrapping_add(m.get16(Gpr::Rbp))
                        .wrapping_add(m.get16(Gpr::Rdi));
                }
                4 => i = i.wrapping_add(m.get16(Gpr::Rsi)),
                5 => i = i.wrapping_add(m.get16(Gpr::Rdi)),
                6 => {
                    if rde.modrm_mod() != 0 {
                        seg = SEG_SS;
                        i = i.wrapping_add(m.get16(Gpr::Rbp));
                    }
                }
                _ => i = i.wrapping_add(m.get16(Gpr::Rbx)),
            }
            i &= 0xffff;
        }
        _ => {
            if !rde.sib_exists() {
                if rde.is_rip_relative() {
                    if rde.mode() == DecodeMode::Long {
                        i = i.wrapping_add(m.ip);
                    }
                } else {
                    i = i.wrapping_add(m.get64(Gpr::from_index(rde.rexb_rm())));
                    if rde.rexb_rm() == 4 || rde.rexb_rm() == 5 {
                        seg = SEG_SS;
                    }
                }
            } else {
                if rde.sib_has_base() {
                    i = i.wrapping_add(m.get64(Gpr::from_index(rde.rexb_base())));
                    if rde.rexb_base() == 4 || rde.rexb_base() == 5 {
                        seg = SEG_SS;
                    }
                }
                if rde.sib_has_index() {
                    i = i.wrapping_add(
                        m.get64(Gpr::from_index(rde.rexx_index())) << rde.sib_scale(),
                    );
                }
            }
            if rde.eamode() == Eamode::Legacy {
                i &= 0xffff_ffff;
            }
        }
    }
    (i, seg)
}

/// Address of the `Ob`/`Ov` absolute-offset forms (`A0..A3`).
pub fn address_ob(m: &Machine, a: Args) -> i64 {
    m.seg_base(a.rde, SEG_DS).wrapping_add(a.disp as u64) as i64
}

/// DS:rSI for string reads, masked by the address size.
pub fn address_si(m: &Machine, rde: Rde) -> i64 {
    let i = match rde.eamode() {
        Eamode::Real => m.get16(Gpr::Rsi),
        Eamode::Legacy => m.get32(Gpr::Rsi),
        Eamode::Long => m.get64(Gpr::Rsi),
    };
    m.seg_base(rde, SEG_DS).wrapping_add(i) as i64
}

/// ES:rDI for string writes; ES is not overridable.
pub fn address_di(m: &Machine, rde: Rde) -> i64 {
    let i = match rde.eamode() {
        Eamode::Real => m.get16(Gpr::Rdi),
        Eamode::Legacy => m.get32(Gpr::Rdi),
        Eamode::Long => m.get64(Gpr::Rdi),
    };
    m.segs[SEG_ES].base.wrapping_add(i) as i64
}

/// Advances rSI/rDI by `n` (negated under DF), masked to the address size.
pub fn advance_index(m: &mut Machine, rde: Rde, r: Gpr, n: i64, down: bool) {
    let delta = if down { n.wrapping_neg() } else { n } as u64;
    let v = m.get64(r).wrapping_add(delta);
    match rde.eamode() {
        Eamode::Real => m.put16(r, v),
        Eamode::Legacy => m.put32(r, v & 0xffff_ffff),
        Eamode::Long => m.put64(r, v),
    }
}

/// Reads the r/m operand at the instruction's operand size.
pub fn read_rm(m: &mut Machine, bus: &mut dyn Bus, a: Args, log2: usize) -> Result<u64, Exception> {
    if a.rde.is_register_form() {
        Ok(m.get_rm_reg(a.rde, log2))
    } else {
        let addr = compute_address(m, a);
        mem::read_sized(m, bus, addr, log2)
    }
}

/// Writes the r/m operand at the instruction's operand size.
pub fn write_rm(
    m: &mut Machine,
    bus: &mut dyn Bus,
    a: Args,
    log2: usize,
    v: u64,
) -> Result<(), Exception> {
    if a.rde.is_register_form() {
        m.put_rm_reg(a.rde, log2, v);
        Ok(())
    } else {
        let addr = compute_address(m, a);
        mem::write_sized(m, bus, addr, log2, v)
    }
}

/// Reads the r/m operand as a 128-bit lane (register or memory).
pub fn read_rm_xmm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> Result<[u8; 16], Exception> {
    if a.rde.is_register_form() {
        Ok(m.xmm[a.rde.rexb_rm()])
    } else {
        let addr = compute_address(m, a);
        let mut b = [0u8; 16];
        mem::read_mem(m, bus, addr, &mut b)?;
        Ok(b)
    }
}

pub fn write_rm_xmm(
    m: &mut Machine,
    bus: &mut dyn Bus,
    a: Args,
    v: [u8; 16],
) -> Result<(), Exception> {
    if a.rde.is_register_form() {
        m.xmm[a.rde.rexb_rm()] = v;
        Ok(())
    } else {
        let addr = compute_address(m, a);
        mem::write_mem(m, bus, addr, &v)
    }
}

/// Reads the r/m operand as an 8-byte MMX lane. MMX registers alias the low
/// half of the XMM file and ignore REX.
pub fn read_rm_mm(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> Result<[u8; 8], Exception> {
    if a.rde.is_register_form() {
        let mut b = [0u8; 8];
        b.copy_from_slice(&m.xmm[a.rde.rm() as usize][..8]);
        Ok(b)
    } else {
        let addr = compute_address(m, a);
        let mut b = [0u8; 8];
        mem::read_mem(m, bus, addr, &mut b)?;
        Ok(b)
    }
}

pub fn write_rm_mm(
    m: &mut Machine,
    bus: &mut dyn Bus,
    a: Args,
    v: [u8; 8],
) -> Result<(), Exception> {
    if a.rde.is_register_form() {
        m.xmm[a.rde.rm() as usize][..8].copy_from_slice(&v);
        Ok(())
    } else {
        let addr = compute_address(m, a);
        mem::write_mem(m, bus, addr, &v)
    }
}

/// Masks a prospective IP/SP value to the mode width.
pub fn mask_sp(mode: DecodeMode, x: u64) -> u64 {
    mask_address(mode, x)
}
