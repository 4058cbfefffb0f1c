//! x86_64 instruction-length decoder.
//!
//! This crate turns a raw byte stream into a fixed-size [`Decoded`] record:
//! total length, displacement, immediate, and the packed [`Rde`] attribute
//! word that the execution core keys every downstream decision off of. It is
//! allocation-free and carries no machine state, so the same decoder serves
//! the interpreter, the speculative flag crawler, and the path builder.
//!
//! Decoding covers the legacy one/two/three-byte maps (`MAP0`, `0F`,
//! `0F 38`, `0F 3A`). VEX/EVEX encodings are rejected as unknown opcodes by
//! the dispatcher rather than decoded here.

mod decode;
mod error;
mod rde;
mod reg;
mod tables;

pub use decode::{decode_one, Decoded};
pub use error::DecodeError;
pub use rde::{DecodeMode, Eamode, OpMap, Rde};
pub use reg::{byte_reg, ByteReg, Gpr};

/// Architectural limit on the byte length of one instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;
