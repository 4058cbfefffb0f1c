//! Dispatch glue for the MMX/SSE instruction space: operand routing between
//! the 8-byte and 16-byte lane files, prefix-based form selection, and the
//! move/convert/compare forms. The arithmetic itself lives in the lane
//! kernels.

use super::R;
use crate::addr::{self, Args};
use crate::cvt;
use crate::exception::Exception;
use crate::mem::{self, Bus};
use crate::sse;
use crate::ssefloat;
use crate::state::Machine;
use ember_x86::Gpr;

type LaneKernel = fn(&mut [u8], &[u8]);

/// An integer vector op: XMM form with 66, MMX form otherwise.
fn int_binop(m: &mut Machine, bus: &mut dyn Bus, a: Args, kernel: LaneKernel) -> R {
    if a.rde.osz() {
        let y = addr::read_rm_xmm(m, bus, a)?;
        kernel(&mut m.xmm[a.rde.rexr_reg()], &y);
    } else {
        let y = addr::read_rm_mm(m, bus, a)?;
        kernel(&mut m.xmm[a.rde.reg() as usize][..8], &y);
    }
    Ok(())
}

macro_rules! int_ops {
    ($($name:ident => $kernel:path),* $(,)?) => {
        $(pub fn $name(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
            int_binop(m, bus, a, $kernel)
        })*
    };
}

int_ops! {
    paddb => sse::paddb, paddw => sse::paddw, paddd => sse::paddd, paddq => sse::paddq,
    psubb => sse::psubb, psubw => sse::psubw, psubd => sse::psubd, psubq => sse::psubq,
    paddsb => sse::paddsb, paddsw => sse::paddsw, psubsb => sse::psubsb, psubsw => sse::psubsw,
    paddusb => sse::paddusb, paddusw => sse::paddusw,
    psubusb => sse::psubusb, psubusw => sse::psubusw,
    pand => sse::pand, pandn => sse::pandn, por => sse::por, pxor => sse::pxor,
    pavgb => sse::pavgb, pavgw => sse::pavgw,
    pminub => sse::pminub, pmaxub => sse::pmaxub,
    pminsw => sse::pminsw, pmaxsw => sse::pmaxsw,
    pmullw => sse::pmullw, pmulhw => sse::pmulhw, pmulhuw => sse::pmulhuw,
    pmulhrsw => sse::pmulhrsw, pmulld => sse::pmulld, pmuludq => sse::pmuludq,
    pmaddwd => sse::pmaddwd, pmaddubsw => sse::pmaddubsw, psadbw => sse::psadbw,
    pcmpeqb => sse::pcmpeqb, pcmpeqw => sse::pcmpeqw, pcmpeqd => sse::pcmpeqd,
    pcmpgtb => sse::pcmpgtb, pcmpgtw => sse::pcmpgtw, pcmpgtd => sse::pcmpgtd,
    packsswb => sse::packsswb, packssdw => sse::packssdw, packuswb => sse::packuswb,
    punpcklbw => sse::punpcklbw, punpcklwd => sse::punpcklwd, punpckldq => sse::punpckldq,
    punpckhbw => sse::punpckhbw, punpckhwd => sse::punpckhwd, punpckhdq => sse::punpckhdq,
    phaddw => sse::phaddw, phaddd => sse::phaddd, phaddsw => sse::phaddsw,
    phsubw => sse::phsubw, phsubd => sse::phsubd, phsubsw => sse::phsubsw,
    psignb => sse::psignb, psignw => sse::psignw, psignd => sse::psignd,
    pabsb => sse::pabsb, pabsw => sse::pabsw, pabsd => sse::pabsd,
    pshufb => sse::pshufb,
}

/// PUNPCKLQDQ/PUNPCKHQDQ only exist in the XMM form.
pub fn punpcklqdq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.osz() {
        return Err(Exception::UndefinedInstruction);
    }
    int_binop(m, bus, a, sse::punpcklqdq)
}

pub fn punpckhqdq(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.osz() {
        return Err(Exception::UndefinedInstruction);
    }
    int_binop(m, bus, a, sse::punpckhqdq)
}

/// Variable shifts take the count from the low quadword of the source.
fn shift_v(m: &mut Machine, bus: &mut dyn Bus, a: Args, kernel: fn(&mut [u8], u64)) -> R {
    if a.rde.osz() {
        let y = addr::read_rm_xmm(m, bus, a)?;
        let count = u64::from_le_bytes(y[..8].try_into().unwrap());
        kernel(&mut m.xmm[a.rde.rexr_reg()], count);
    } else {
        let y = addr::read_rm_mm(m, bus, a)?;
        let count = u64::from_le_bytes(y);
        kernel(&mut m.xmm[a.rde.reg() as usize][..8], count);
    }
    Ok(())
}

macro_rules! shift_ops {
    ($($name:ident => $kernel:path),* $(,)?) => {
        $(pub fn $name(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
            shift_v(m, bus, a, $kernel)
        })*
    };
}

shift_ops! {
    psllw_v => sse::psllw, pslld_v => sse::pslld, psllq_v => sse::psllq,
    psrlw_v => sse::psrlw, psrld_v => sse::psrld, psrlq_v => sse::psrlq,
    psraw_v => sse::psraw, psrad_v => sse::psrad,
}

fn shift_imm_target<'a>(m: &'a mut Machine, a: Args) -> &'a mut [u8] {
    if a.rde.osz() {
        &mut m.xmm[a.rde.rexb_rm()]
    } else {
        &mut m.xmm[a.rde.rm() as usize][..8]
    }
}

/// `0F 71` group: word shifts by imm8 (register destination only).
pub fn group_171(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let n = a.uimm;
    let x = shift_imm_target(m, a);
    match a.rde.reg() {
        2 => sse::psrlw(x, n),
        4 => sse::psraw(x, n),
        6 => sse::psllw(x, n),
        _ => return Err(Exception::UndefinedInstruction),
    }
    Ok(())
}

/// `0F 72` group: dword shifts by imm8.
pub fn group_172(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let n = a.uimm;
    let x = shift_imm_target(m, a);
    match a.rde.reg() {
        2 => sse::psrld(x, n),
        4 => sse::psrad(x, n),
        6 => sse::pslld(x, n),
        _ => return Err(Exception::UndefinedInstruction),
    }
    Ok(())
}

/// `0F 73` group: qword and whole-register shifts by imm8.
pub fn group_173(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let n = a.uimm;
    let osz = a.rde.osz();
    let x = shift_imm_target(m, a);
    match a.rde.reg() {
        2 => sse::psrlq(x, n),
        3 if osz => sse::psrldq(x, n as usize),
        6 => sse::psllq(x, n),
        7 if osz => sse::pslldq(x, n as usize),
        _ => return Err(Exception::UndefinedInstruction),
    }
    Ok(())
}

/// `0F 70`: PSHUFW (MMX), PSHUFD (66), PSHUFHW (F3), PSHUFLW (F2).
pub fn shuffle(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let imm = a.uimm as u8;
    if a.rde.osz() {
        let src = addr::read_rm_xmm(m, bus, a)?;
        let mut out = [0u8; 16];
        sse::shuffle_lanes(&mut out, &src, 4, imm);
        m.xmm[a.rde.rexr_reg()] = out;
    } else if a.rde.rep() == 3 {
        let src = addr::read_rm_xmm(m, bus, a)?;
        let mut out = [0u8; 16];
        sse::pshufhw(&mut out, &src, imm);
        m.xmm[a.rde.rexr_reg()] = out;
    } else if a.rde.rep() == 2 {
        let src = addr::read_rm_xmm(m, bus, a)?;
        let mut out = [0u8; 16];
        sse::pshuflw(&mut out, &src, imm);
        m.xmm[a.rde.rexr_reg()] = out;
    } else {
        let src = addr::read_rm_mm(m, bus, a)?;
        let mut out = [0u8; 8];
        sse::shuffle_lanes(&mut out, &src, 2, imm);
        m.xmm[a.rde.reg() as usize][..8].copy_from_slice(&out);
    }
    Ok(())
}

/// `0F C6`: SHUFPS/SHUFPD.
pub fn shufpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let imm = a.uimm as u8;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.osz() {
        sse::shufpd(x, &y, imm);
    } else {
        sse::shufps(x, &y, imm);
    }
    Ok(())
}

/// `0F 3A 0F`: PALIGNR.
pub fn palignr(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let imm = a.uimm as usize;
    if a.rde.osz() {
        let y = addr::read_rm_xmm(m, bus, a)?;
        sse::palignr(&mut m.xmm[a.rde.rexr_reg()], &y, imm);
    } else {
        let y = addr::read_rm_mm(m, bus, a)?;
        sse::palignr(&mut m.xmm[a.rde.reg() as usize][..8], &y, imm);
    }
    Ok(())
}

/// Packed-float arithmetic fans out on prefix: none = ps, 66 = pd,
/// F3 = ss, F2 = sd.
fn float_binop(
    m: &mut Machine,
    bus: &mut dyn Bus,
    a: Args,
    ps: LaneKernel,
    pd: LaneKernel,
    ss: fn(f32, f32) -> f32,
    sd: fn(f64, f64) -> f64,
) -> R {
    let reg = a.rde.rexr_reg();
    match (a.rde.rep(), a.rde.osz()) {
        (3, _) => {
            let y = read_rm_scalar(m, bus, a, 4)?;
            ssefloat::scalar_f32(&mut m.xmm[reg], &y, ss);
        }
        (2, _) => {
            let y = read_rm_scalar(m, bus, a, 8)?;
            ssefloat::scalar_f64(&mut m.xmm[reg], &y, sd);
        }
        (_, true) => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            pd(&mut m.xmm[reg], &y);
        }
        _ => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            ps(&mut m.xmm[reg], &y);
        }
    }
    Ok(())
}

/// Scalar forms load only their operand width from memory.
fn read_rm_scalar(
    m: &mut Machine,
    bus: &mut dyn Bus,
    a: Args,
    width: usize,
) -> Result<[u8; 16], Exception> {
    if a.rde.is_register_form() {
        Ok(m.xmm[a.rde.rexb_rm()])
    } else {
        let at = addr::compute_address(m, a);
        let mut out = [0u8; 16];
        mem::read_mem(m, bus, at, &mut out[..width])?;
        Ok(out)
    }
}

pub fn addpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::addps,
        ssefloat::addpd,
        |a, b| a + b,
        |a, b| a + b,
    )
}

pub fn subpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::subps,
        ssefloat::subpd,
        |a, b| a - b,
        |a, b| a - b,
    )
}

pub fn mulpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::mulps,
        ssefloat::mulpd,
        |a, b| a * b,
        |a, b| a * b,
    )
}

pub fn divpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::divps,
        ssefloat::divpd,
        |a, b| a / b,
        |a, b| a / b,
    )
}

pub fn minpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::minps,
        ssefloat::minpd,
        |a, b| if b < a { b } else { a },
        |a, b| if b < a { b } else { a },
    )
}

pub fn maxpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::maxps,
        ssefloat::maxpd,
        |a, b| if a < b { b } else { a },
        |a, b| if a < b { b } else { a },
    )
}

pub fn sqrtpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    float_binop(
        m,
        bus,
        a,
        ssefloat::sqrtps,
        ssefloat::sqrtpd,
        |_, b| b.sqrt(),
        |_, b| b.sqrt(),
    )
}

/// `0F 52`/`0F 53`: RSQRTPS/RCPPS (ps and ss forms only).
pub fn rsqrtps(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    if a.rde.rep() == 3 {
        let y = read_rm_scalar(m, bus, a, 4)?;
        ssefloat::scalar_f32(&mut m.xmm[reg], &y, |_, b| 1.0 / b.sqrt());
    } else {
        let y = addr::read_rm_xmm(m, bus, a)?;
        ssefloat::rsqrtps(&mut m.xmm[reg], &y);
    }
    Ok(())
}

pub fn rcpps(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    if a.rde.rep() == 3 {
        let y = read_rm_scalar(m, bus, a, 4)?;
        ssefloat::scalar_f32(&mut m.xmm[reg], &y, |_, b| 1.0 / b);
    } else {
        let y = addr::read_rm_xmm(m, bus, a)?;
        ssefloat::rcpps(&mut m.xmm[reg], &y);
    }
    Ok(())
}

/// `0F 54..57`: bitwise float logic (identical across ps/pd).
pub fn andpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    sse::pand(&mut m.xmm[a.rde.rexr_reg()], &y);
    Ok(())
}

pub fn andnpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    sse::pandn(&mut m.xmm[a.rde.rexr_reg()], &y);
    Ok(())
}

pub fn orpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    sse::por(&mut m.xmm[a.rde.rexr_reg()], &y);
    Ok(())
}

pub fn xorpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    sse::pxor(&mut m.xmm[a.rde.rexr_reg()], &y);
    Ok(())
}

/// `0F D0`: ADDSUBPS (F2) / ADDSUBPD (66).
pub fn addsubpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.osz() {
        ssefloat::addsubpd(x, &y);
    } else if a.rde.rep() == 2 {
        ssefloat::addsubps(x, &y);
    } else {
        return Err(Exception::UndefinedInstruction);
    }
    Ok(())
}

/// `0F 7C`/`0F 7D`: HADDPS/HSUBPS (F2) and the pd forms (66).
pub fn haddpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.rep() == 2 {
        ssefloat::haddps(x, &y);
    } else if a.rde.osz() {
        // haddpd: one pair per operand.
        let f = |b: &[u8], i: usize| f64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
        let out = [f(x, 0) + f(x, 1), f(&y, 0) + f(&y, 1)];
        x[..8].copy_from_slice(&out[0].to_le_bytes());
        x[8..].copy_from_slice(&out[1].to_le_bytes());
    } else {
        return Err(Exception::UndefinedInstruction);
    }
    Ok(())
}

pub fn hsubpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.rep() == 2 {
        ssefloat::hsubps(x, &y);
    } else if a.rde.osz() {
        let f = |b: &[u8], i: usize| f64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
        let out = [f(x, 0) - f(x, 1), f(&y, 0) - f(&y, 1)];
        x[..8].copy_from_slice(&out[0].to_le_bytes());
        x[8..].copy_from_slice(&out[1].to_le_bytes());
    } else {
        return Err(Exception::UndefinedInstruction);
    }
    Ok(())
}

/// `0F C2`: CMPPS/CMPPD/CMPSS/CMPSD.
pub fn cmppsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let pred = a.uimm as u8;
    if pred > 7 {
        return Err(Exception::UndefinedInstruction);
    }
    let reg = a.rde.rexr_reg();
    match (a.rde.rep(), a.rde.osz()) {
        (3, _) => {
            let y = read_rm_scalar(m, bus, a, 4)?;
            ssefloat::cmpss(&mut m.xmm[reg], &y, pred);
        }
        (2, _) => {
            let y = read_rm_scalar(m, bus, a, 8)?;
            ssefloat::cmpsd(&mut m.xmm[reg], &y, pred);
        }
        (_, true) => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            ssefloat::cmppd(&mut m.xmm[reg], &y, pred);
        }
        _ => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            ssefloat::cmpps(&mut m.xmm[reg], &y, pred);
        }
    }
    Ok(())
}

/// `0F 2E`/`0F 2F`: UCOMISS/COMISS and the sd forms.
pub fn comis(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let (x, y) = if a.rde.osz() {
        let y = read_rm_scalar(m, bus, a, 8)?;
        (
            f64::from_le_bytes(m.xmm[a.rde.rexr_reg()][..8].try_into().unwrap()),
            f64::from_le_bytes(y[..8].try_into().unwrap()),
        )
    } else {
        let y = read_rm_scalar(m, bus, a, 4)?;
        (
            f32::from_le_bytes(m.xmm[a.rde.rexr_reg()][..4].try_into().unwrap()) as f64,
            f32::from_le_bytes(y[..4].try_into().unwrap()) as f64,
        )
    };
    ssefloat::comis(m, x, y);
    Ok(())
}

/// `0F 14`/`0F 15`: UNPCKLPS/PD, UNPCKHPS/PD.
pub fn unpcklpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.osz() {
        ssefloat::unpcklpd(x, &y);
    } else {
        ssefloat::unpcklps(x, &y);
    }
    Ok(())
}

pub fn unpckhpsd(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let y = addr::read_rm_xmm(m, bus, a)?;
    let x = &mut m.xmm[a.rde.rexr_reg()];
    if a.rde.osz() {
        ssefloat::unpckhpd(x, &y);
    } else {
        ssefloat::unpckhps(x, &y);
    }
    Ok(())
}

/// `0F 50`: MOVMSKPS/PD.
pub fn movmskpsd(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let x = m.xmm[a.rde.rexb_rm()];
    let mask = if a.rde.osz() {
        ssefloat::movmskpd(&x)
    } else {
        ssefloat::movmskps(&x)
    };
    m.put64(Gpr::from_index(a.rde.rexr_reg()), mask as u64);
    Ok(())
}

/// `0F D7`: PMOVMSKB.
pub fn pmovmskb(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let mask = if a.rde.osz() {
        sse::pmovmskb(&m.xmm[a.rde.rexb_rm()])
    } else {
        sse::pmovmskb(&m.xmm[a.rde.rm() as usize][..8])
    };
    m.put64(Gpr::from_index(a.rde.rexr_reg()), mask as u64);
    Ok(())
}

/// `0F C4`: PINSRW.
pub fn pinsrw(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = if a.rde.is_register_form() {
        m.get16(Gpr::from_index(a.rde.rexb_rm())) as u16
    } else {
        let at = addr::compute_address(m, a);
        mem::read_u16(m, bus, at)?
    };
    if a.rde.osz() {
        let lane = a.uimm as usize & 7;
        m.xmm[a.rde.rexr_reg()][lane * 2..lane * 2 + 2].copy_from_slice(&v.to_le_bytes());
    } else {
        let lane = a.uimm as usize & 3;
        m.xmm[a.rde.reg() as usize][lane * 2..lane * 2 + 2].copy_from_slice(&v.to_le_bytes());
    }
    Ok(())
}

/// `0F C5`: PEXTRW (register source only).
pub fn pextrw(m: &mut Machine, _bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let v = if a.rde.osz() {
        let lane = a.uimm as usize & 7;
        u16::from_le_bytes(
            m.xmm[a.rde.rexb_rm()][lane * 2..lane * 2 + 2]
                .try_into()
                .unwrap(),
        )
    } else {
        let lane = a.uimm as usize & 3;
        u16::from_le_bytes(
            m.xmm[a.rde.rm() as usize][lane * 2..lane * 2 + 2]
                .try_into()
                .unwrap(),
        )
    };
    m.put64(Gpr::from_index(a.rde.rexr_reg()), v as u64);
    Ok(())
}

/// `0F F7`: MASKMOVQ/MASKMOVDQU: byte store to ES:rDI under a sign mask.
pub fn maskmov(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if !a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let (data, mask): (Vec<u8>, Vec<u8>) = if a.rde.osz() {
        (
            m.xmm[a.rde.rexr_reg()].to_vec(),
            m.xmm[a.rde.rexb_rm()].to_vec(),
        )
    } else {
        (
            m.xmm[a.rde.reg() as usize][..8].to_vec(),
            m.xmm[a.rde.rm() as usize][..8].to_vec(),
        )
    };
    let base = addr::address_di(m, a.rde);
    for (i, (d, k)) in data.iter().zip(mask.iter()).enumerate() {
        if k & 0x80 != 0 {
            mem::write_u8(m, bus, base.wrapping_add(i as i64), *d)?;
            mem::commit_stash(m, bus)?;
        }
    }
    Ok(())
}

// --- Moves ---------------------------------------------------------------

fn aligned(at: i64) -> Result<i64, Exception> {
    if at & 15 != 0 {
        Err(Exception::ProtectionFault)
    } else {
        Ok(at)
    }
}

/// `0F 10`: MOVUPS/MOVUPD/MOVSD/MOVSS loads.
pub fn mov_0f10(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    match a.rde.rep() {
        3 => {
            let y = read_rm_scalar(m, bus, a, 4)?;
            if a.rde.is_register_form() {
                m.xmm[reg][..4].copy_from_slice(&y[..4]);
            } else {
                // Memory loads zero the rest of the register.
                m.xmm[reg] = [0; 16];
                m.xmm[reg][..4].copy_from_slice(&y[..4]);
            }
        }
        2 => {
            let y = read_rm_scalar(m, bus, a, 8)?;
            if a.rde.is_register_form() {
                m.xmm[reg][..8].copy_from_slice(&y[..8]);
            } else {
                m.xmm[reg] = [0; 16];
                m.xmm[reg][..8].copy_from_slice(&y[..8]);
            }
        }
        _ => {
            m.xmm[reg] = addr::read_rm_xmm(m, bus, a)?;
        }
    }
    Ok(())
}

/// `0F 11`: the store direction of `0F 10`.
pub fn mov_0f11(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    match a.rde.rep() {
        3 => {
            if a.rde.is_register_form() {
                let v: [u8; 4] = m.xmm[reg][..4].try_into().unwrap();
                m.xmm[a.rde.rexb_rm()][..4].copy_from_slice(&v);
            } else {
                let at = addr::compute_address(m, a);
                let v: [u8; 4] = m.xmm[reg][..4].try_into().unwrap();
                mem::write_mem(m, bus, at, &v)?;
            }
        }
        2 => {
            if a.rde.is_register_form() {
                let v: [u8; 8] = m.xmm[reg][..8].try_into().unwrap();
                m.xmm[a.rde.rexb_rm()][..8].copy_from_slice(&v);
            } else {
                let at = addr::compute_address(m, a);
                let v: [u8; 8] = m.xmm[reg][..8].try_into().unwrap();
                mem::write_mem(m, bus, at, &v)?;
            }
        }
        _ => {
            let v = m.xmm[reg];
            addr::write_rm_xmm(m, bus, a, v)?;
        }
    }
    Ok(())
}

/// `0F 28`: MOVAPS/MOVAPD load with alignment checking.
pub fn mov_0f28(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    if a.rde.is_register_form() {
        m.xmm[reg] = m.xmm[a.rde.rexb_rm()];
    } else {
        let at = aligned(addr::compute_address(m, a))?;
        let mut b = [0u8; 16];
        mem::read_mem(m, bus, at, &mut b)?;
        m.xmm[reg] = b;
    }
    Ok(())
}

/// `0F 29`: MOVAPS/MOVAPD store.
pub fn mov_0f29(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let v = m.xmm[a.rde.rexr_reg()];
    if a.rde.is_register_form() {
        m.xmm[a.rde.rexb_rm()] = v;
        Ok(())
    } else {
        let at = aligned(addr::compute_address(m, a))?;
        mem::write_mem(m, bus, at, &v)
    }
}

/// `0F 2B`: MOVNTPS/MOVNTPD.
pub fn mov_0f2b(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    mov_0f29(m, bus, a)
}

/// `0F 12`: MOVLPS/MOVLPD/MOVDDUP/MOVSLDUP.
pub fn mov_0f12(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    match a.rde.rep() {
        2 => {
            // movddup
            let y = read_rm_scalar(m, bus, a, 8)?;
            m.xmm[reg][..8].copy_from_slice(&y[..8]);
            let lo: [u8; 8] = m.xmm[reg][..8].try_into().unwrap();
            m.xmm[reg][8..].copy_from_slice(&lo);
        }
        3 => {
            // movsldup
            let y = addr::read_rm_xmm(m, bus, a)?;
            for i in [0usize, 2] {
                let lane: [u8; 4] = y[i * 4..i * 4 + 4].try_into().unwrap();
                m.xmm[reg][i * 4..i * 4 + 4].copy_from_slice(&lane);
                m.xmm[reg][(i + 1) * 4..(i + 1) * 4 + 4].copy_from_slice(&lane);
            }
        }
        _ => {
            if a.rde.is_register_form() {
                // movhlps: high half of the source into the low half.
                let hi: [u8; 8] = m.xmm[a.rde.rexb_rm()][8..].try_into().unwrap();
                m.xmm[reg][..8].copy_from_slice(&hi);
            } else {
                let y = read_rm_scalar(m, bus, a, 8)?;
                m.xmm[reg][..8].copy_from_slice(&y[..8]);
            }
        }
    }
    Ok(())
}

/// `0F 13`: MOVLPS/MOVLPD store.
pub fn mov_0f13(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let at = addr::compute_address(m, a);
    let v: [u8; 8] = m.xmm[a.rde.rexr_reg()][..8].try_into().unwrap();
    mem::write_mem(m, bus, at, &v)
}

/// `0F 16`: MOVHPS/MOVHPD/MOVSHDUP.
pub fn mov_0f16(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    if a.rde.rep() == 3 {
        let y = addr::read_rm_xmm(m, bus, a)?;
        for i in [1usize, 3] {
            let lane: [u8; 4] = y[i * 4..i * 4 + 4].try_into().unwrap();
            m.xmm[reg][(i - 1) * 4..(i - 1) * 4 + 4].copy_from_slice(&lane);
            m.xmm[reg][i * 4..i * 4 + 4].copy_from_slice(&lane);
        }
    } else if a.rde.is_register_form() {
        // movlhps
        let lo: [u8; 8] = m.xmm[a.rde.rexb_rm()][..8].try_into().unwrap();
        m.xmm[reg][8..].copy_from_slice(&lo);
    } else {
        let y = read_rm_scalar(m, bus, a, 8)?;
        m.xmm[reg][8..].copy_from_slice(&y[..8]);
    }
    Ok(())
}

/// `0F 17`: MOVHPS/MOVHPD store.
pub fn mov_0f17(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    let at = addr::compute_address(m, a);
    let v: [u8; 8] = m.xmm[a.rde.rexr_reg()][8..].try_into().unwrap();
    mem::write_mem(m, bus, at, &v)
}

/// `0F 6E`: MOVD/MOVQ into a vector register.
pub fn mov_0f6e(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let log2 = if a.rde.rexw() { 3 } else { 2 };
    let v = addr::read_rm(m, bus, a, log2)?;
    let reg = if a.rde.osz() {
        a.rde.rexr_reg()
    } else {
        a.rde.reg() as usize
    };
    if a.rde.osz() {
        m.xmm[reg] = [0; 16];
    } else {
        m.xmm[reg][..8].fill(0);
    }
    m.xmm[reg][..8].copy_from_slice(&v.to_le_bytes());
    Ok(())
}

/// `0F 7E`: MOVD/MOVQ out of a vector register, or the F3 MOVQ load.
pub fn mov_0f7e(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() == 3 {
        // movq xmm, xmm/m64: zero-extending 64-bit load.
        let y = read_rm_scalar(m, bus, a, 8)?;
        let reg = a.rde.rexr_reg();
        m.xmm[reg] = [0; 16];
        m.xmm[reg][..8].copy_from_slice(&y[..8]);
        return Ok(());
    }
    let log2 = if a.rde.rexw() { 3 } else { 2 };
    let reg = if a.rde.osz() {
        a.rde.rexr_reg()
    } else {
        a.rde.reg() as usize
    };
    let v = u64::from_le_bytes(m.xmm[reg][..8].try_into().unwrap());
    let v = if log2 == 2 { v & 0xffff_ffff } else { v };
    addr::write_rm(m, bus, a, log2, v)
}

/// `0F 6F`: MOVDQA (66, aligned), MOVDQU (F3), MOVQ mmx.
pub fn mov_0f6f(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.osz() {
        let reg = a.rde.rexr_reg();
        if a.rde.is_register_form() {
            m.xmm[reg] = m.xmm[a.rde.rexb_rm()];
        } else {
            let at = aligned(addr::compute_address(m, a))?;
            let mut b = [0u8; 16];
            mem::read_mem(m, bus, at, &mut b)?;
            m.xmm[reg] = b;
        }
    } else if a.rde.rep() == 3 {
        m.xmm[a.rde.rexr_reg()] = addr::read_rm_xmm(m, bus, a)?;
    } else {
        let y = addr::read_rm_mm(m, bus, a)?;
        m.xmm[a.rde.reg() as usize][..8].copy_from_slice(&y);
    }
    Ok(())
}

/// `0F 7F`: the store direction of `0F 6F`.
pub fn mov_0f7f(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.osz() {
        let v = m.xmm[a.rde.rexr_reg()];
        if a.rde.is_register_form() {
            m.xmm[a.rde.rexb_rm()] = v;
        } else {
            let at = aligned(addr::compute_address(m, a))?;
            mem::write_mem(m, bus, at, &v)?;
        }
    } else if a.rde.rep() == 3 {
        let v = m.xmm[a.rde.rexr_reg()];
        addr::write_rm_xmm(m, bus, a, v)?;
    } else {
        let mut v = [0u8; 8];
        v.copy_from_slice(&m.xmm[a.rde.reg() as usize][..8]);
        addr::write_rm_mm(m, bus, a, v)?;
    }
    Ok(())
}

/// `0F D6`: MOVQ store, MOVQ2DQ (F3), MOVDQ2Q (F2).
pub fn mov_0fd6(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.rep() == 3 {
        if !a.rde.is_register_form() {
            return Err(Exception::UndefinedInstruction);
        }
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&m.xmm[a.rde.rm() as usize][..8]);
        m.xmm[a.rde.rexr_reg()] = out;
        Ok(())
    } else if a.rde.rep() == 2 {
        if !a.rde.is_register_form() {
            return Err(Exception::UndefinedInstruction);
        }
        let lo: [u8; 8] = m.xmm[a.rde.rexb_rm()][..8].try_into().unwrap();
        m.xmm[a.rde.reg() as usize][..8].copy_from_slice(&lo);
        Ok(())
    } else if a.rde.osz() {
        if a.rde.is_register_form() {
            let lo: [u8; 8] = m.xmm[a.rde.rexr_reg()][..8].try_into().unwrap();
            let mut out = [0u8; 16];
            out[..8].copy_from_slice(&lo);
            m.xmm[a.rde.rexb_rm()] = out;
            Ok(())
        } else {
            let at = addr::compute_address(m, a);
            let v: [u8; 8] = m.xmm[a.rde.rexr_reg()][..8].try_into().unwrap();
            mem::write_mem(m, bus, at, &v)
        }
    } else {
        Err(Exception::UndefinedInstruction)
    }
}

/// `0F E7`: MOVNTQ/MOVNTDQ.
pub fn mov_0fe7(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() {
        return Err(Exception::UndefinedInstruction);
    }
    if a.rde.osz() {
        let at = aligned(addr::compute_address(m, a))?;
        let v = m.xmm[a.rde.rexr_reg()];
        mem::write_mem(m, bus, at, &v)
    } else {
        let at = addr::compute_address(m, a);
        let v: [u8; 8] = m.xmm[a.rde.reg() as usize][..8].try_into().unwrap();
        mem::write_mem(m, bus, at, &v)
    }
}

/// `F2 0F F0`: LDDQU (an unaligned 16-byte load).
pub fn lddqu(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() || a.rde.rep() != 2 {
        return Err(Exception::UndefinedInstruction);
    }
    m.xmm[a.rde.rexr_reg()] = addr::read_rm_xmm(m, bus, a)?;
    Ok(())
}

/// `66 0F 38 2A`: MOVNTDQA.
pub fn movntdqa(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    if a.rde.is_register_form() || !a.rde.osz() {
        return Err(Exception::UndefinedInstruction);
    }
    let at = aligned(addr::compute_address(m, a))?;
    let mut b = [0u8; 16];
    mem::read_mem(m, bus, at, &mut b)?;
    m.xmm[a.rde.rexr_reg()] = b;
    Ok(())
}

// --- Conversions ---------------------------------------------------------

/// `0F 2A`: CVTSI2SS/SD (and the MMX CVTPI2PS/PD forms).
pub fn cvt_0f2a(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    match a.rde.rep() {
        3 => {
            let log2 = if a.rde.rexw() { 3 } else { 2 };
            let v = addr::read_rm(m, bus, a, log2)?;
            let f = if log2 == 3 {
                v as i64 as f32
            } else {
                v as u32 as i32 as f32
            };
            m.xmm[reg][..4].copy_from_slice(&f.to_le_bytes());
        }
        2 => {
            let log2 = if a.rde.rexw() { 3 } else { 2 };
            let v = addr::read_rm(m, bus, a, log2)?;
            let f = if log2 == 3 {
                v as i64 as f64
            } else {
                v as u32 as i32 as f64
            };
            m.xmm[reg][..8].copy_from_slice(&f.to_le_bytes());
        }
        _ => {
            // cvtpi2ps / cvtpi2pd from an MMX or memory quadword.
            let y = addr::read_rm_mm(m, bus, a)?;
            let a0 = i32::from_le_bytes(y[..4].try_into().unwrap());
            let a1 = i32::from_le_bytes(y[4..].try_into().unwrap());
            if a.rde.osz() {
                m.xmm[reg][..8].copy_from_slice(&(a0 as f64).to_le_bytes());
                m.xmm[reg][8..].copy_from_slice(&(a1 as f64).to_le_bytes());
            } else {
                m.xmm[reg][..4].copy_from_slice(&(a0 as f32).to_le_bytes());
                m.xmm[reg][4..8].copy_from_slice(&(a1 as f32).to_le_bytes());
            }
        }
    }
    Ok(())
}

fn cvt_to_int(m: &mut Machine, bus: &mut dyn Bus, a: Args, truncate: bool) -> R {
    let wide = a.rde.rexw();
    match a.rde.rep() {
        3 => {
            // cvt(t)ss2si
            let y = read_rm_scalar(m, bus, a, 4)?;
            let f = f32::from_le_bytes(y[..4].try_into().unwrap()) as f64;
            let f = if truncate {
                f.trunc()
            } else {
                cvt::mxcsr_round(m.mxcsr, f)
            };
            write_int_result(m, a, wide, f);
        }
        2 => {
            let y = read_rm_scalar(m, bus, a, 8)?;
            let f = f64::from_le_bytes(y[..8].try_into().unwrap());
            let f = if truncate {
                f.trunc()
            } else {
                cvt::mxcsr_round(m.mxcsr, f)
            };
            write_int_result(m, a, wide, f);
        }
        _ => {
            // cvt(t)ps2pi / cvt(t)pd2pi target an MMX register.
            let y = addr::read_rm_xmm(m, bus, a)?;
            let (f0, f1) = if a.rde.osz() {
                (
                    f64::from_le_bytes(y[..8].try_into().unwrap()),
                    f64::from_le_bytes(y[8..].try_into().unwrap()),
                )
            } else {
                (
                    f32::from_le_bytes(y[..4].try_into().unwrap()) as f64,
                    f32::from_le_bytes(y[4..8].try_into().unwrap()) as f64,
                )
            };
            let round = |m: &Machine, f: f64| {
                if truncate {
                    f.trunc()
                } else {
                    cvt::mxcsr_round(m.mxcsr, f)
                }
            };
            let z0 = cvt::to_i32(round(m, f0));
            let z1 = cvt::to_i32(round(m, f1));
            let reg = a.rde.reg() as usize;
            m.xmm[reg][..4].copy_from_slice(&z0.to_le_bytes());
            m.xmm[reg][4..8].copy_from_slice(&z1.to_le_bytes());
        }
    }
    Ok(())
}

fn write_int_result(m: &mut Machine, a: Args, wide: bool, f: f64) {
    let reg = Gpr::from_index(a.rde.rexr_reg());
    if wide {
        m.put64(reg, cvt::to_i64(f) as u64);
    } else {
        m.put32(reg, cvt::to_i32(f) as u32 as u64);
    }
}

/// `0F 2C`: truncating conversions to integer.
pub fn cvtt_0f2c(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    cvt_to_int(m, bus, a, true)
}

/// `0F 2D`: rounded conversions to integer.
pub fn cvt_0f2d(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    cvt_to_int(m, bus, a, false)
}

/// `0F 5A`: CVTPS2PD/CVTPD2PS/CVTSS2SD/CVTSD2SS.
pub fn cvt_0f5a(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    match (a.rde.rep(), a.rde.osz()) {
        (3, _) => {
            let y = read_rm_scalar(m, bus, a, 4)?;
            let f = f32::from_le_bytes(y[..4].try_into().unwrap()) as f64;
            m.xmm[reg][..8].copy_from_slice(&f.to_le_bytes());
        }
        (2, _) => {
            let y = read_rm_scalar(m, bus, a, 8)?;
            let f = f64::from_le_bytes(y[..8].try_into().unwrap()) as f32;
            m.xmm[reg][..4].copy_from_slice(&f.to_le_bytes());
        }
        (_, true) => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            let mut out = [0u8; 16];
            cvt::pd2ps(&mut out, &y);
            m.xmm[reg] = out;
        }
        _ => {
            let y = addr::read_rm_xmm(m, bus, a)?;
            let mut out = m.xmm[reg];
            cvt::ps2pd(&mut out, &y);
            m.xmm[reg] = out;
        }
    }
    Ok(())
}

/// `0F 5B`: CVTDQ2PS/CVTPS2DQ/CVTTPS2DQ.
pub fn cvt_0f5b(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    let y = addr::read_rm_xmm(m, bus, a)?;
    let mut out = [0u8; 16];
    if a.rde.rep() == 3 {
        cvt::tps2dq(&mut out, &y);
    } else if a.rde.osz() {
        cvt::ps2dq(&mut out, &y, m.mxcsr);
    } else {
        cvt::dq2ps(&mut out, &y);
    }
    m.xmm[reg] = out;
    Ok(())
}

/// `0F E6`: CVTPD2DQ (F2), CVTTPD2DQ (66), CVTDQ2PD (F3).
pub fn cvt_0fe6(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let reg = a.rde.rexr_reg();
    let y = addr::read_rm_xmm(m, bus, a)?;
    let mut out = [0u8; 16];
    if a.rde.rep() == 3 {
        cvt::dq2pd(&mut out, &y);
    } else if a.rde.rep() == 2 {
        cvt::pd2dq(&mut out, &y, m.mxcsr);
    } else if a.rde.osz() {
        cvt::tpd2dq(&mut out, &y);
    } else {
        return Err(Exception::UndefinedInstruction);
    }
    m.xmm[reg] = out;
    Ok(())
}
