//! The execution core of a user-mode x86_64 machine.
//!
//! Given a bus full of guest memory and a [`Machine`] holding the
//! architectural register state, [`exec::step`] answers the central
//! question: what is the next state? Everything else in this crate exists
//! in service of that function: the operand resolver, the split-page
//! store protocol, the size-generic integer kernels with their lazy-parity
//! flag scheme, the x87 stack engine, and the MMX/SSE lane kernels.
//!
//! ```no_run
//! use ember_cpu_core::{exec, mem::FlatBus, Machine};
//! use ember_x86::DecodeMode;
//!
//! let mut m = Machine::new(DecodeMode::Long);
//! let mut bus = FlatBus::new(0x10000);
//! bus.load(0x1000, &[0xF4]); // hlt
//! m.set_ip(0x1000);
//! let exit = exec::step(&mut m, &mut bus).unwrap();
//! assert_eq!(exit, exec::StepExit::Halt);
//! ```

pub mod addr;
pub mod alu;
pub mod bcd;
pub mod bit;
pub mod bmi2;
pub mod cpuid;
pub mod crc32;
pub mod cvt;
pub mod divmul;
mod exception;
pub mod exec;
pub mod flags;
pub mod fpu;
pub mod ldbl;
pub mod mem;
pub mod rdrand;
pub mod sse;
pub mod ssefloat;
pub mod state;

pub use addr::Args;
pub use exception::{Exception, HaltReason, PendingExit};
pub use exec::{step, StepExit};
pub use state::{Machine, MachineConfig, Segment};
