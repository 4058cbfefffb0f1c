//! Branch micro-op fusion.
//!
//! When `CMP r,r` or `TEST r,r` is immediately followed by a Jcc, and the
//! dependency crawl proves that neither the fall-through path nor the
//! branch target reads any of the six flags the comparison would produce,
//! the pair collapses into a tape fragment that evaluates the predicate
//! straight off the operand values. No flag word is touched.

use crate::deps;
use crate::uop::{MicroOp, Slot};
use ember_cpu_core::mem::{self, Bus};
use ember_cpu_core::{Args, Machine};
use ember_x86::{decode_one, Decoded};

/// A fused compare-and-branch fragment.
pub struct Fused {
    pub tape: Vec<MicroOp>,
    /// Bytes of the following jump the fragment swallowed.
    pub jump_len: usize,
}

/// The CMP/TEST register-register forms that qualify.
fn fusible_kind(d: &Decoded) -> Option<bool> {
    let rde = d.rde;
    if !rde.is_register_form() || rde.word_log2() < 2 {
        // Byte and word fusion would need partial-width predicates.
        return None;
    }
    match rde.mopcode() {
        0x039 => Some(false),                              // cmp r/m, r
        0x085 if rde.rexr_reg() == rde.rexb_rm() => Some(true), // test r, r
        _ => None,
    }
}

/// Peeks at the bytes after the comparison for a Jcc in either
/// displacement width.
fn following_jcc(
    m: &mut Machine,
    bus: &mut dyn Bus,
    after_cmp: i64,
) -> Option<(u8, i64, usize)> {
    let (bytes, avail) = mem::fetch(m, bus, after_cmp).ok()?;
    if avail >= 2 && bytes[0] & 0xf0 == 0x70 {
        return Some((bytes[0] & 0x0f, bytes[1] as i8 as i64, 2));
    }
    if avail >= 6 && bytes[0] == 0x0F && bytes[1] & 0xf0 == 0x80 {
        let disp = i32::from_le_bytes(bytes[2..6].try_into().unwrap()) as i64;
        return Some((bytes[1] & 0x0f, disp, 6));
    }
    // Make sure what follows decodes at all before giving up quietly.
    let _ = decode_one(m.mode, &bytes[..avail]);
    None
}

/// Attempts to fuse `d` (about to retire, IP still at it) with the next
/// instruction. Returns the fragment on success.
pub fn try_fuse(m: &mut Machine, bus: &mut dyn Bus, d: &Decoded) -> Option<Fused> {
    let test = fusible_kind(d)?;
    let after_cmp = m.pc().wrapping_add(d.len() as i64);
    let (cc, disp, jlen) = following_jcc(m, bus, after_cmp)?;
    let after_jcc = after_cmp.wrapping_add(jlen as i64);

    // Both successors must be indifferent to every flag the compare
    // produces, or eliding the flag word would be observable.
    let taken = after_jcc.wrapping_add(disp);
    if deps::needed_flags(m, bus, taken, deps::ALL_ARITH) != Some(0) {
        tracing::trace!("fusion rejected: branch target reads flags");
        return None;
    }
    if deps::needed_flags(m, bus, after_jcc, deps::ALL_ARITH) != Some(0) {
        tracing::trace!("fusion rejected: fall-through reads flags");
        return None;
    }

    let args = Args::new(d.rde, d.disp, d.uimm);
    let total_len = d.len() + jlen;
    let mut tape = Vec::with_capacity(8);
    // One BeginOp covers both instructions: IP lands after the Jcc, which
    // is the state either edge of the branch starts from.
    tape.push(MicroOp::BeginOp(args, total_len as u8));
    tape.push(MicroOp::ReadReg); // res0 = lhs register
    tape.push(MicroOp::Push(Slot::Res(0)));
    tape.push(MicroOp::Push(Slot::Sav(1)));
    tape.push(MicroOp::Move); // sav1 = res0
    tape.push(MicroOp::ReadRegOrMem); // res0 = rhs
    tape.push(MicroOp::CmpBranch {
        cc,
        log2: d.rde.word_log2() as u8,
        test,
        disp,
    });
    Some(Fused {
        tape,
        jump_len: jlen,
    })
}
