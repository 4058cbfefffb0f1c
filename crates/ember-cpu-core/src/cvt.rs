//! Integer/floating conversions, honouring the MXCSR rounding-control
//! field. The truncating variants force round-to-zero regardless of RC.

use crate::fpu::rint;
use crate::ssefloat::MXCSR_RC;

/// Rounds a double per MXCSR.RC.
pub fn mxcsr_round(mxcsr: u32, x: f64) -> f64 {
    match (mxcsr & MXCSR_RC) >> 13 {
        0 => rint(x),
        1 => x.floor(),
        2 => x.ceil(),
        _ => x.trunc(),
    }
}

/// Converts to i32 with saturation to the x86 "integer indefinite" value.
pub fn to_i32(x: f64) -> i32 {
    if x.is_nan() || x < i32::MIN as f64 || x > i32::MAX as f64 {
        i32::MIN
    } else {
        x as i32
    }
}

/// Converts to i64 with the indefinite-value convention.
pub fn to_i64(x: f64) -> i64 {
    if x.is_nan() || x < i64::MIN as f64 || x >= 0x8000_0000_0000_0000u64 as f64 {
        i64::MIN
    } else {
        x as i64
    }
}

/// `CVTPS2DQ`-style rounded conversion.
pub fn ps2dq(x: &mut [u8; 16], y: &[u8; 16], mxcsr: u32) {
    for i in 0..4 {
        let f = f32::from_le_bytes(y[i * 4..i * 4 + 4].try_into().unwrap());
        let z = to_i32(mxcsr_round(mxcsr, f as f64));
        x[i * 4..i * 4 + 4].copy_from_slice(&z.to_le_bytes());
    }
}

/// `CVTTPS2DQ`: truncating, RC ignored.
pub fn tps2dq(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..4 {
        let f = f32::from_le_bytes(y[i * 4..i * 4 + 4].try_into().unwrap());
        let z = to_i32((f as f64).trunc());
        x[i * 4..i * 4 + 4].copy_from_slice(&z.to_le_bytes());
    }
}

/// `CVTPD2DQ` (two results in the low half, high half zeroed).
pub fn pd2dq(x: &mut [u8; 16], y: &[u8; 16], mxcsr: u32) {
    for i in 0..2 {
        let f = f64::from_le_bytes(y[i * 8..i * 8 + 8].try_into().unwrap());
        let z = to_i32(mxcsr_round(mxcsr, f));
        x[i * 4..i * 4 + 4].copy_from_slice(&z.to_le_bytes());
    }
    x[8..].fill(0);
}

pub fn tpd2dq(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..2 {
        let f = f64::from_le_bytes(y[i * 8..i * 8 + 8].try_into().unwrap());
        let z = to_i32(f.trunc());
        x[i * 4..i * 4 + 4].copy_from_slice(&z.to_le_bytes());
    }
    x[8..].fill(0);
}

/// `CVTDQ2PS`.
pub fn dq2ps(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..4 {
        let v = i32::from_le_bytes(y[i * 4..i * 4 + 4].try_into().unwrap());
        x[i * 4..i * 4 + 4].copy_from_slice(&(v as f32).to_le_bytes());
    }
}

/// `CVTDQ2PD`: low two dwords widen to doubles.
pub fn dq2pd(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..2 {
        let v = i32::from_le_bytes(y[i * 4..i * 4 + 4].try_into().unwrap());
        x[i * 8..i * 8 + 8].copy_from_slice(&(v as f64).to_le_bytes());
    }
}

/// `CVTPS2PD`.
pub fn ps2pd(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..2 {
        let v = f32::from_le_bytes(y[i * 4..i * 4 + 4].try_into().unwrap());
        x[i * 8..i * 8 + 8].copy_from_slice(&(v as f64).to_le_bytes());
    }
}

/// `CVTPD2PS`: narrows into the low half, zeroing the rest.
pub fn pd2ps(x: &mut [u8; 16], y: &[u8; 16]) {
    for i in 0..2 {
        let v = f64::from_le_bytes(y[i * 8..i * 8 + 8].try_into().unwrap());
        x[i * 4..i * 4 + 4].copy_from_slice(&(v as f32).to_le_bytes());
    }
    x[8..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    const RC_ZERO: u32 = 3 << 13;
    const RC_DOWN: u32 = 1 << 13;

    #[test]
    fn rc_field_selects_rounding() {
        assert_eq!(mxcsr_round(0, 2.5), 2.0); // nearest even
        assert_eq!(mxcsr_round(0, 3.5), 4.0);
        assert_eq!(mxcsr_round(RC_DOWN, 2.9), 2.0);
        assert_eq!(mxcsr_round(RC_DOWN, -2.1), -3.0);
        assert_eq!(mxcsr_round(RC_ZERO, -2.9), -2.0);
    }

    #[test]
    fn truncating_variant_ignores_rc() {
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        y[..4].copy_from_slice(&2.9f32.to_le_bytes());
        y[4..8].copy_from_slice(&(-2.9f32).to_le_bytes());
        tps2dq(&mut x, &y);
        assert_eq!(i32::from_le_bytes(x[..4].try_into().unwrap()), 2);
        assert_eq!(i32::from_le_bytes(x[4..8].try_into().unwrap()), -2);
    }

    #[test]
    fn out_of_range_becomes_integer_indefinite() {
        assert_eq!(to_i32(f64::NAN), i32::MIN);
        assert_eq!(to_i32(1e300), i32::MIN);
        assert_eq!(to_i64(-1e300), i64::MIN);
        assert_eq!(to_i32(-2147483648.0), i32::MIN);
        assert_eq!(to_i32(2147483646.0), 2147483646);
    }

    #[test]
    fn widening_round_trips() {
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        y[..4].copy_from_slice(&(-7i32).to_le_bytes());
        y[4..8].copy_from_slice(&42i32.to_le_bytes());
        dq2pd(&mut x, &y);
        assert_eq!(f64::from_le_bytes(x[..8].try_into().unwrap()), -7.0);
        assert_eq!(f64::from_le_bytes(x[8..].try_into().unwrap()), 42.0);
    }
}
