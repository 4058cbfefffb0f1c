//! The `D8..DF` x87 escape space: one handler keyed on
//! `(opcode & 7, mod == 3, modrm.reg)` the way the hardware decodes it,
//! with the register-form subtables keyed further on `modrm.rm`.

use super::R;
use crate::addr::{self, Args};
use crate::exception::Exception;
use crate::flags::{FLAGS_CF, FLAGS_PF, FLAGS_ZF};
use crate::fpu::{self, Sw, TAG_EMPTY};
use crate::ldbl;
use crate::mem::{self, Bus};
use crate::state::{mask_address, Machine};
use ember_x86::Gpr;

fn ld_const(slot: u32) -> Option<f64> {
    Some(match slot {
        0 => 1.0,
        1 => 3.321928094887362, // log2(10)
        2 => std::f64::consts::LOG2_E,
        3 => std::f64::consts::PI,
        4 => std::f64::consts::LOG10_2,
        5 => std::f64::consts::LN_2,
        6 => 0.0,
        _ => return None,
    })
}

fn get_mem_f32(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    let raw = mem::read_u32(m, bus, m.fpu.dp)?;
    Ok(f32::from_bits(raw) as f64)
}

fn get_mem_f64(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    let raw = mem::read_u64(m, bus, m.fpu.dp)?;
    Ok(f64::from_bits(raw))
}

fn get_mem_i16(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    Ok(mem::read_u16(m, bus, m.fpu.dp)? as i16 as f64)
}

fn get_mem_i32(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    Ok(mem::read_u32(m, bus, m.fpu.dp)? as i32 as f64)
}

fn get_mem_i64(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    Ok(mem::read_u64(m, bus, m.fpu.dp)? as i64 as f64)
}

fn get_mem_ldbl(m: &mut Machine, bus: &mut dyn Bus) -> Result<f64, Exception> {
    let mut b = [0u8; 10];
    mem::read_mem(m, bus, m.fpu.dp, &mut b)?;
    Ok(ldbl::deserialize_ldbl(&b))
}

fn set_mem_f32(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_u32(m, bus, at, (x as f32).to_bits())
}

fn set_mem_f64(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_u64(m, bus, at, x.to_bits())
}

fn set_mem_i16(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_u16(m, bus, at, clamp_i64(x) as i16 as u16)
}

fn set_mem_i32(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_u32(m, bus, at, crate::cvt::to_i32(x) as u32)
}

fn set_mem_i64(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_u64(m, bus, at, crate::cvt::to_i64(x) as u64)
}

fn clamp_i64(x: f64) -> i64 {
    crate::cvt::to_i64(x)
}

fn set_mem_ldbl(m: &mut Machine, bus: &mut dyn Bus, x: f64) -> R {
    let at = m.fpu.dp;
    mem::write_mem(m, bus, at, &ldbl::serialize_ldbl(x))
}

/// C0/C2/C3 copied into ZF/PF/CF, the FCOMI convention.
fn sw_to_flags(m: &mut Machine) {
    let sw = m.fpu.sw;
    m.set_flag(FLAGS_ZF, sw.contains(Sw::C3));
    m.set_flag(FLAGS_PF, sw.contains(Sw::C2));
    m.set_flag(FLAGS_CF, sw.contains(Sw::C0));
}

fn fcomi(m: &mut Machine, rm: i32) {
    let y = m.fpu.st(rm);
    m.fpu.compare(y);
    sw_to_flags(m);
}

fn fcmov(m: &mut Machine, rm: i32, take: bool) {
    if take {
        let v = m.fpu.st(rm);
        m.fpu.set_st(0, v);
    }
}

/// The 14/28-byte FLDENV/FSTENV image (16-bit fields in the legacy
/// layout, 32-bit fields otherwise).
fn fstenv(m: &mut Machine, bus: &mut dyn Bus, wide: bool) -> R {
    let at = m.fpu.dp;
    if wide {
        let words = [
            m.fpu.cw,
            m.fpu.sw.bits(),
            m.fpu.tw,
            m.fpu.ip as u32,
            0,
            m.fpu.dp as u32,
            0,
        ];
        for (i, w) in words.iter().enumerate() {
            mem::write_u32(m, bus, at + i as i64 * 4, *w)?;
        }
    } else {
        let words = [
            m.fpu.cw,
            m.fpu.sw.bits(),
            m.fpu.tw,
            m.fpu.ip as u32,
            0,
            m.fpu.dp as u32,
            0,
        ];
        for (i, w) in words.iter().enumerate() {
            mem::write_u16(m, bus, at + i as i64 * 2, *w as u16)?;
        }
    }
    Ok(())
}

fn fldenv(m: &mut Machine, bus: &mut dyn Bus, wide: bool) -> R {
    let at = m.fpu.dp;
    let mut words = [0u32; 7];
    if wide {
        for (i, w) in words.iter_mut().enumerate() {
            *w = mem::read_u32(m, bus, at + i as i64 * 4)?;
        }
    } else {
        for (i, w) in words.iter_mut().enumerate() {
            *w = mem::read_u16(m, bus, at + i as i64 * 2)? as u32;
        }
    }
    m.fpu.cw = words[0];
    m.fpu.sw = Sw::from_bits_retain(words[1] & 0xffff);
    m.fpu.tw = words[2] & 0xffff;
    Ok(())
}

fn env_size(wide: bool) -> i64 {
    if wide {
        28
    } else {
        14
    }
}

/// FSAVE/FRSTOR: the environment image followed by the eight registers in
/// ten-byte format.
fn fsave(m: &mut Machine, bus: &mut dyn Bus, wide: bool) -> R {
    fstenv(m, bus, wide)?;
    let base = m.fpu.dp + env_size(wide);
    for i in 0..8 {
        let b = ldbl::serialize_ldbl(m.fpu.peek(i));
        mem::write_mem(m, bus, base + i as i64 * 10, &b)?;
        mem::commit_stash(m, bus)?;
    }
    m.fpu.init();
    Ok(())
}

fn frstor(m: &mut Machine, bus: &mut dyn Bus, wide: bool) -> R {
    fldenv(m, bus, wide)?;
    let base = m.fpu.dp + env_size(wide);
    for i in 0..8 {
        let mut b = [0u8; 10];
        mem::read_mem(m, bus, base + i as i64 * 10, &mut b)?;
        let v = ldbl::deserialize_ldbl(&b);
        m.fpu.set_st(i, v);
    }
    Ok(())
}

/// The whole x87 escape space.
pub fn fpu(m: &mut Machine, bus: &mut dyn Bus, a: Args) -> R {
    let op = a.rde.opcode() & 7;
    let memory = !a.rde.is_register_form();
    let reg = a.rde.reg();
    let rm = a.rde.rm() as i32;
    m.fpu.ip = mask_address(m.mode, m.ip.wrapping_sub(a.rde.oplength())) as i64;
    m.fpu.op = (op << 8 | a.rde.modrm() as u32 & 0x3f) as u32;
    m.fpu.dp = if memory {
        addr::compute_address(m, a)
    } else {
        0
    };
    let wide_env = !a.rde.osz();
    match (op, memory, reg) {
        // D8: float32 arithmetic against ST0.
        (0, false, 0) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.add(x, y);
            m.fpu.set_st(0, z);
        }
        (0, false, 1) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.mul(x, y);
            m.fpu.set_st(0, z);
        }
        (0, false, 2) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
        }
        (0, false, 3) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
            m.fpu.pop();
        }
        (0, false, 4) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st(0, z);
        }
        (0, false, 5) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.sub(y, x);
            m.fpu.set_st(0, z);
        }
        (0, false, 6) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.div(x, y);
            m.fpu.set_st(0, z);
        }
        (0, false, 7) => {
            let y = m.fpu.st(rm);
            let x = m.fpu.st(0);
            let z = m.fpu.div(y, x);
            m.fpu.set_st(0, z);
        }
        (0, true, _) => {
            let y = get_mem_f32(m, bus)?;
            mem_arith(m, reg, y)?;
        }

        // D9.
        (1, false, 0) => {
            let v = m.fpu.st(rm);
            m.fpu.push(v);
        }
        (1, false, 1) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            m.fpu.set_st(0, y);
            m.fpu.set_st(rm, x);
        }
        (1, false, 2) => {} // fnop
        (1, false, 3) => {
            let v = m.fpu.st(0);
            m.fpu.set_st_pop(rm, v);
        }
        (1, false, 4) => match rm {
            0 => {
                let v = -m.fpu.st(0);
                m.fpu.set_st(0, v);
            }
            1 => {
                let v = m.fpu.st(0).abs();
                m.fpu.set_st(0, v);
            }
            4 => m.fpu.compare(0.0),
            5 => m.fpu.fxam(),
            _ => return Err(Exception::UndefinedInstruction),
        },
        (1, false, 5) => match ld_const(rm as u32) {
            Some(v) => m.fpu.push(v),
            None => return Err(Exception::UndefinedInstruction),
        },
        (1, false, 6) => match rm {
            0 => {
                let v = fpu::f2xm1(m.fpu.st(0));
                m.fpu.set_st(0, v);
            }
            1 => {
                let z = fpu::fyl2x(m.fpu.st(0), m.fpu.st(1));
                m.fpu.set_st_pop(1, z);
            }
            2 => {
                let v = m.fpu.st(0).tan();
                m.fpu.set_st(0, v);
                m.fpu.push(1.0);
                m.fpu.sw -= Sw::C2;
            }
            3 => {
                let z = m.fpu.st(1).atan2(m.fpu.st(0));
                m.fpu.set_st_pop(1, z);
            }
            4 => {
                // fxtract
                let x = m.fpu.st(0);
                let e = if x == 0.0 {
                    f64::NEG_INFINITY
                } else {
                    x.abs().log2().floor()
                };
                m.fpu.set_st(0, e);
                m.fpu.push(x / 2.0f64.powf(e));
            }
            5 => {
                let x = m.fpu.st(0);
                let y = m.fpu.st(1);
                let z = m.fpu.fprem1(x, y);
                m.fpu.set_st(0, z);
            }
            6 => m.fpu.bump(-1),
            _ => m.fpu.bump(1),
        },
        (1, false, 7) => match rm {
            0 => {
                let x = m.fpu.st(0);
                let y = m.fpu.st(1);
                let z = m.fpu.fprem(x, y);
                m.fpu.set_st(0, z);
            }
            1 => {
                let z = fpu::fyl2xp1(m.fpu.st(0), m.fpu.st(1));
                m.fpu.set_st_pop(1, z);
            }
            2 => {
                let v = m.fpu.st(0).sqrt();
                m.fpu.set_st(0, v);
            }
            3 => {
                let x = m.fpu.st(0);
                m.fpu.set_st(0, x.sin());
                m.fpu.push(x.cos());
                m.fpu.sw -= Sw::C2;
            }
            4 => {
                let st0 = m.fpu.st(0);
                let v = m.fpu.round(st0);
                m.fpu.set_st(0, v);
            }
            5 => {
                let z = fpu::fscale(m.fpu.st(0), m.fpu.st(1));
                m.fpu.set_st(0, z);
            }
            6 => {
                let v = m.fpu.st(0).sin();
                m.fpu.set_st(0, v);
                m.fpu.sw -= Sw::C2;
            }
            _ => {
                let v = m.fpu.st(0).cos();
                m.fpu.set_st(0, v);
                m.fpu.sw -= Sw::C2;
            }
        },
        (1, true, 0) => {
            let v = get_mem_f32(m, bus)?;
            m.fpu.push(v);
        }
        (1, true, 2) => {
            let v = m.fpu.st(0);
            set_mem_f32(m, bus, v)?;
        }
        (1, true, 3) => {
            let v = m.fpu.st(0);
            set_mem_f32(m, bus, v)?;
            m.fpu.pop();
        }
        (1, true, 4) => fldenv(m, bus, wide_env)?,
        (1, true, 5) => {
            m.fpu.cw = mem::read_u16(m, bus, m.fpu.dp)? as u32;
        }
        (1, true, 6) => fstenv(m, bus, wide_env)?,
        (1, true, 7) => {
            let cw = m.fpu.cw as u16;
            let at = m.fpu.dp;
            mem::write_u16(m, bus, at, cw)?;
        }

        // DA: int32 arithmetic and FCMOV.
        (2, false, 0) => {
            let cf = m.get_flag(FLAGS_CF);
            fcmov(m, rm, cf);
        }
        (2, false, 1) => {
            let zf = m.get_flag(FLAGS_ZF);
            fcmov(m, rm, zf);
        }
        (2, false, 2) => {
            let take = m.get_flag(FLAGS_CF) || m.get_flag(FLAGS_ZF);
            fcmov(m, rm, take);
        }
        (2, false, 3) => {
            let pf = m.get_flag(FLAGS_PF);
            fcmov(m, rm, pf);
        }
        (2, false, 5) if rm == 1 => {
            // fucompp
            let y = m.fpu.st(1);
            m.fpu.compare(y);
            m.fpu.pop();
            m.fpu.pop();
        }
        (2, true, _) => {
            let y = get_mem_i32(m, bus)?;
            mem_arith(m, reg, y)?;
        }

        // DB: FCMOVNcc, FCOMI, int32 loads/stores, extended loads.
        (3, false, 0) => {
            let take = !m.get_flag(FLAGS_CF);
            fcmov(m, rm, take);
        }
        (3, false, 1) => {
            let take = !m.get_flag(FLAGS_ZF);
            fcmov(m, rm, take);
        }
        (3, false, 2) => {
            let take = !(m.get_flag(FLAGS_CF) || m.get_flag(FLAGS_ZF));
            fcmov(m, rm, take);
        }
        (3, false, 3) => {
            let take = !m.get_flag(FLAGS_PF);
            fcmov(m, rm, take);
        }
        (3, false, 4) => match rm {
            2 => m.fpu.sw -= Sw::from_bits_retain(0xff), // fnclex
            3 => m.fpu.init(),                           // fninit
            _ => return Err(Exception::UndefinedInstruction),
        },
        (3, false, 5) | (3, false, 6) => fcomi(m, rm),
        (3, true, 0) => {
            let v = get_mem_i32(m, bus)?;
            m.fpu.push(v);
        }
        (3, true, 1) => {
            let v = m.fpu.pop();
            set_mem_i32(m, bus, v.trunc())?;
        }
        (3, true, 2) => {
            let st0 = m.fpu.st(0);
            let v = m.fpu.round(st0);
            set_mem_i32(m, bus, v)?;
        }
        (3, true, 3) => {
            let st0 = m.fpu.st(0);
            let v = m.fpu.round(st0);
            set_mem_i32(m, bus, v)?;
            m.fpu.pop();
        }
        (3, true, 5) => {
            let v = get_mem_ldbl(m, bus)?;
            m.fpu.push(v);
        }
        (3, true, 7) => {
            let v = m.fpu.pop();
            set_mem_ldbl(m, bus, v)?;
        }

        // DC: float64 arithmetic, reversed-destination register forms.
        (4, false, 0) => {
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.add(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, false, 1) => {
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.mul(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, false, 2) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
        }
        (4, false, 3) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
            m.fpu.pop();
        }
        (4, false, 4) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, false, 5) => {
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, false, 6) => {
            // fdivr: ST(i) = ST(0) / ST(i).
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.div(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, false, 7) => {
            // fdiv: ST(i) = ST(i) / ST(0).
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.div(x, y);
            m.fpu.set_st(rm, z);
        }
        (4, true, _) => {
            let y = get_mem_f64(m, bus)?;
            mem_arith(m, reg, y)?;
        }

        // DD.
        (5, false, 0) => m.fpu.set_tag(rm, TAG_EMPTY), // ffree
        (5, false, 1) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            m.fpu.set_st(0, y);
            m.fpu.set_st(rm, x);
        }
        (5, false, 2) => {
            let v = m.fpu.st(0);
            m.fpu.set_st(rm, v);
        }
        (5, false, 3) => {
            let v = m.fpu.st(0);
            m.fpu.set_st_pop(rm, v);
        }
        (5, false, 4) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
        }
        (5, false, 5) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
            m.fpu.pop();
        }
        (5, true, 0) => {
            let v = get_mem_f64(m, bus)?;
            m.fpu.push(v);
        }
        (5, true, 1) => {
            let v = m.fpu.pop();
            set_mem_i64(m, bus, v.trunc())?;
        }
        (5, true, 2) => {
            let v = m.fpu.st(0);
            set_mem_f64(m, bus, v)?;
        }
        (5, true, 3) => {
            let v = m.fpu.st(0);
            set_mem_f64(m, bus, v)?;
            m.fpu.pop();
        }
        (5, true, 4) => frstor(m, bus, wide_env)?,
        (5, true, 6) => fsave(m, bus, wide_env)?,
        (5, true, 7) => {
            let sw = m.fpu.sw.bits() as u16;
            let at = m.fpu.dp;
            mem::write_u16(m, bus, at, sw)?;
        }

        // DE: popping arithmetic and int16 memory forms.
        (6, false, 0) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.add(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, false, 1) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.mul(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, false, 2) => {
            let y = m.fpu.st(rm);
            m.fpu.compare(y);
            m.fpu.pop();
        }
        (6, false, 3) if rm == 1 => {
            // fcompp
            let y = m.fpu.st(1);
            m.fpu.compare(y);
            m.fpu.pop();
            m.fpu.pop();
        }
        (6, false, 4) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, false, 5) => {
            // fsubp: ST(i) = ST(i) - ST(0), pop.
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, false, 6) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            let z = m.fpu.div(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, false, 7) => {
            let x = m.fpu.st(rm);
            let y = m.fpu.st(0);
            let z = m.fpu.div(x, y);
            m.fpu.set_st_pop(rm, z);
        }
        (6, true, _) => {
            let y = get_mem_i16(m, bus)?;
            mem_arith(m, reg, y)?;
        }

        // DF.
        (7, false, 0) => {
            m.fpu.set_tag(rm, TAG_EMPTY);
            m.fpu.pop();
        }
        (7, false, 1) => {
            let x = m.fpu.st(0);
            let y = m.fpu.st(rm);
            m.fpu.set_st(0, y);
            m.fpu.set_st(rm, x);
        }
        (7, false, 2) | (7, false, 3) => {
            let v = m.fpu.st(0);
            m.fpu.set_st_pop(rm, v);
        }
        (7, false, 4) if rm == 0 => {
            // fnstsw %ax
            let sw = m.fpu.sw.bits() as u64;
            m.put16(Gpr::Rax, sw);
        }
        (7, false, 5) | (7, false, 6) => {
            fcomi(m, rm);
            m.fpu.pop();
        }
        (7, true, 0) => {
            let v = get_mem_i16(m, bus)?;
            m.fpu.push(v);
        }
        (7, true, 1) => {
            let v = m.fpu.pop();
            set_mem_i16(m, bus, v.trunc())?;
        }
        (7, true, 2) => {
            let st0 = m.fpu.st(0);
            let v = m.fpu.round(st0);
            set_mem_i16(m, bus, v)?;
        }
        (7, true, 3) => {
            let st0 = m.fpu.st(0);
            let v = m.fpu.round(st0);
            set_mem_i16(m, bus, v)?;
            m.fpu.pop();
        }
        (7, true, 5) => {
            let v = get_mem_i64(m, bus)?;
            m.fpu.push(v);
        }
        (7, true, 7) => {
            let st0 = m.fpu.st(0);
            let v = m.fpu.round(st0);
            set_mem_i64(m, bus, v)?;
            m.fpu.pop();
        }

        _ => return Err(Exception::UndefinedInstruction),
    }
    Ok(())
}

/// The shared memory-operand arithmetic row (ADD/MUL/COM/COMP/SUB/SUBR/
/// DIV/DIVR) once the operand has been fetched and widened.
fn mem_arith(m: &mut Machine, reg: u32, y: f64) -> R {
    match reg {
        0 => {
            let x = m.fpu.st(0);
            let z = m.fpu.add(x, y);
            m.fpu.set_st(0, z);
        }
        1 => {
            let x = m.fpu.st(0);
            let z = m.fpu.mul(x, y);
            m.fpu.set_st(0, z);
        }
        2 => m.fpu.compare(y),
        3 => {
            m.fpu.compare(y);
            m.fpu.pop();
        }
        4 => {
            let x = m.fpu.st(0);
            let z = m.fpu.sub(x, y);
            m.fpu.set_st(0, z);
        }
        5 => {
            let x = m.fpu.st(0);
            let z = m.fpu.sub(y, x);
            m.fpu.set_st(0, z);
        }
        6 => {
            let x = m.fpu.st(0);
            let z = m.fpu.div(x, y);
            m.fpu.set_st(0, z);
        }
        _ => {
            let x = m.fpu.st(0);
            let z = m.fpu.div(y, x);
            m.fpu.set_st(0, z);
        }
    }
    Ok(())
}
