//! Path building for the execution core: the flag-dependency analyser, the
//! micro-op tape, and branch fusion.
//!
//! A *path* is a straight-line guest trace compiled into a tape of
//! [`uop::MicroOp`]s. The reference sink interprets the tape; a machine-code
//! backend may lower the same tape instead. Either way the contract is that
//! running the tape leaves guest registers, flags, and memory exactly as
//! sequential calls to the plain handlers would.
//!
//! The interesting part is what the tape is allowed to *elide*: the
//! [`deps`] crawler walks the instructions ahead of a flag-producing op to
//! prove which flag bits are dead, which lets the builder pick the fast
//! ALU kernels and lets [`fusion`] collapse a compare-and-branch pair into
//! a single predicate evaluation with no flag materialisation at all.

pub mod deps;
pub mod fusion;
pub mod path;
pub mod uop;

use thiserror::Error;

/// Why a path could not be built. The dispatcher falls back to the
/// interpreter and keeps a statistic; nothing is guest-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("path has no instructions")]
    EmptyPath,
    #[error("path length limit reached")]
    PathTooLong,
    #[error("precious op terminates path")]
    PreciousOp,
    #[error("could not decode instruction at {0:#x}")]
    DecodeFailed(i64),
}
