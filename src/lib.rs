//! Umbrella crate: re-exports the decoder, the execution core, and the
//! path-building layer under one name.

pub use ember_cpu_core as cpu;
pub use ember_jit as jit;
pub use ember_x86 as x86;

pub use ember_cpu_core::{exec, Machine, MachineConfig};
pub use ember_x86::{decode_one, DecodeMode};
