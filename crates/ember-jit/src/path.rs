//! Recording straight-line guest traces into micro-op tapes.
//!
//! The builder consumes decoded instructions one at a time, exactly as the
//! interpreter is about to retire them, and appends tape entries. A path
//! ends at a branch, a precious op, or the length limit; committing yields
//! a [`Path`] keyed by its entry point that the owning runtime installs in
//! its code cache.

use crate::deps::{self, OpClass};
use crate::fusion;
use crate::uop::{self, HostFn, MicroOp};
use crate::CompileError;
use ember_cpu_core::alu;
use ember_cpu_core::mem::Bus;
use ember_cpu_core::{Args, Machine};
use ember_x86::Decoded;

/// Knobs for path construction.
#[derive(Debug, Clone, Copy)]
pub struct PathConfig {
    /// Most instructions a single path may cover.
    pub max_elements: usize,
    /// Whether the flag crawl may select flag-eliding kernels.
    pub lazy_flags: bool,
    /// Whether compare-and-branch pairs may fuse.
    pub fusion: bool,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            max_elements: 64,
            lazy_flags: true,
            fusion: true,
        }
    }
}

/// A committed path: the guest linear address it begins at and its tape.
#[derive(Debug, Clone)]
pub struct Path {
    pub start: i64,
    pub tape: Vec<MicroOp>,
    pub elements: usize,
}

/// What the builder did with one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Recorded; keep feeding instructions.
    Open,
    /// Recorded as the terminal element (branch or fused pair).
    Closed,
    /// This instruction ends path building and was NOT recorded.
    Rejected,
}

pub struct PathBuilder {
    config: PathConfig,
    start: i64,
    tape: Vec<MicroOp>,
    elements: usize,
    /// How many extra instruction bytes the last element swallowed
    /// (nonzero after a fused branch).
    pub skip: usize,
}

impl PathBuilder {
    pub fn new(config: PathConfig, start: i64) -> Self {
        tracing::debug!(start = format_args!("{start:#x}"), "starting new path");
        PathBuilder {
            config,
            start,
            tape: Vec::new(),
            elements: 0,
            skip: 0,
        }
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Records one decoded instruction. The machine is positioned with IP
    /// still at the instruction (the builder is consulted before the
    /// interpreter retires it).
    pub fn add(
        &mut self,
        m: &mut Machine,
        bus: &mut dyn Bus,
        d: &Decoded,
        handler: HostFn,
    ) -> AddOutcome {
        if self.elements >= self.config.max_elements {
            return AddOutcome::Rejected;
        }
        let rde = d.rde;
        match deps::classify(rde) {
            OpClass::Precious | OpClass::Serializing => return AddOutcome::Rejected,
            OpClass::Branching => {
                // A branch may end a path but is still recorded, so the
                // tape reproduces the whole trace.
                self.push_plain(d, handler);
                self.elements += 1;
                return AddOutcome::Closed;
            }
            OpClass::Normal => {}
        }
        if self.config.fusion {
            if let Some(fused) = fusion::try_fuse(m, bus, d) {
                self.tape.extend_from_slice(&fused.tape);
                self.elements += 2;
                self.skip = fused.jump_len;
                tracing::debug!(
                    ip = format_args!("{:#x}", m.ip),
                    "fused compare and branch"
                );
                return AddOutcome::Closed;
            }
        }
        if self.config.lazy_flags {
            if let Some(op) = self.try_fast_alu(m, bus, d) {
                self.tape.push(MicroOp::BeginOp(
                    Args::new(d.rde, d.disp, d.uimm),
                    d.length,
                ));
                self.tape.push(op);
                self.tape.push(MicroOp::EndOp);
                self.elements += 1;
                return AddOutcome::Open;
            }
        }
        self.push_plain(d, handler);
        self.elements += 1;
        AddOutcome::Open
    }

    fn push_plain(&mut self, d: &Decoded, handler: HostFn) {
        self.tape.push(MicroOp::BeginOp(
            Args::new(d.rde, d.disp, d.uimm).with_uimm1(d.uimm1),
            d.length,
        ));
        self.tape.push(MicroOp::Call(handler));
        self.tape.push(MicroOp::EndOp);
    }

    /// Register-register ALU rows qualify for the devirtualised tape op;
    /// the crawl decides whether the flag-eliding kernel is legal.
    fn try_fast_alu(
        &mut self,
        m: &mut Machine,
        bus: &mut dyn Bus,
        d: &Decoded,
    ) -> Option<MicroOp> {
        let rde = d.rde;
        let mop = rde.mopcode();
        // The Evqp ← Gvqp ALU rows only (01/09/11/19/21/29/31/39).
        if !matches!(mop, 0x001 | 0x009 | 0x011 | 0x019 | 0x021 | 0x029 | 0x031 | 0x039) {
            return None;
        }
        if !rde.is_register_form() || rde.lock() {
            return None;
        }
        let op = (rde.opcode() as usize & 0o070) >> 3;
        // ADC/SBB also read CF; they stay on the full kernels.
        if matches!(op, alu::ALU_ADC | alu::ALU_SBB) {
            return None;
        }
        let next = m.pc().wrapping_add(d.len() as i64);
        let needed =
            deps::needed_flags(m, bus, next, deps::ALL_ARITH).unwrap_or(deps::ALL_ARITH);
        let fast_legal = needed & !(ember_cpu_core::flags::CF | ember_cpu_core::flags::ZF) == 0;
        Some(MicroOp::Alu {
            op: op as u8,
            log2: rde.word_log2() as u8,
            fast: fast_legal,
        })
    }

    /// Finishes the path. An empty path is a compile failure the caller
    /// counts and forgets.
    pub fn commit(self) -> Result<Path, CompileError> {
        if self.elements == 0 {
            return Err(CompileError::EmptyPath);
        }
        tracing::debug!(
            start = format_args!("{:#x}", self.start),
            elements = self.elements,
            "committing path"
        );
        Ok(Path {
            start: self.start,
            tape: self.tape,
            elements: self.elements,
        })
    }

    /// Drops the recording.
    pub fn abandon(self) {
        tracing::debug!(start = format_args!("{:#x}", self.start), "abandoning path");
    }
}

/// Runs a committed path against the machine.
pub fn execute(
    m: &mut Machine,
    bus: &mut dyn Bus,
    path: &Path,
) -> Result<uop::TapeExit, ember_cpu_core::Exception> {
    uop::interpret(m, bus, &path.tape)
}
