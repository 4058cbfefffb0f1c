use crate::exception::{Exception, HaltReason};
use crate::flags;
use crate::fpu::Fpu;
use ember_x86::{byte_reg, DecodeMode, Gpr, Rde};

/// One guest segment register: the selector plus its cached descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attrs: u16,
}

/// Segment register file indices, in the override-encoding order.
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;

/// In-flight bytes of a store that straddles a page boundary. The handler
/// writes into `buf`; the dispatcher scatters it out to the two underlying
/// pages once the instruction has fully retired.
#[derive(Clone)]
pub struct Stash {
    pub addr: i64,
    pub size: u32,
    pub buf: [u8; 4096],
}

impl Default for Stash {
    fn default() -> Self {
        Stash {
            addr: 0,
            size: 0,
            buf: [0; 4096],
        }
    }
}

/// Interpreter behaviour knobs.
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Move whole page runs for REP MOVSB/STOSB instead of single bytes.
    pub enhanced_rep_strings: bool,
    /// Fault on CPUID (used by embedders that virtualise it themselves).
    pub trap_cpuid: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            enhanced_rep_strings: true,
            trap_cpuid: false,
        }
    }
}

/// The complete architectural state of one guest thread of execution.
pub struct Machine {
    pub ip: u64,
    /// EFLAGS, with the lazy-parity result byte in bits 24..32.
    pub flags: u32,
    regs: [u64; 16],
    pub segs: [Segment; 6],
    pub xmm: [[u8; 16]; 16],
    pub mxcsr: u32,
    pub fpu: Fpu,
    pub mode: DecodeMode,
    /// Linear address of the most recent memory fault.
    pub faultaddr: i64,
    pub stash: Stash,
    pub cr0: u64,
    pub cr2: u64,
    /// CR3 mirror handed to the paged bus on MOV CR3.
    pub cr3: u64,
    pub cr4: u64,
    pub config: MachineConfig,
    /// Set by handlers whose effect is to hand control to the embedder
    /// after the instruction retires (syscall, int, HLT, PAUSE).
    pub pending_exit: Option<crate::exception::PendingExit>,
}

pub const MXCSR_DEFAULT: u32 = 0x1f80;

impl Machine {
    pub fn new(mode: DecodeMode) -> Self {
        Machine {
            ip: 0,
            flags: 1 << flags::FLAGS_VF,
            regs: [0; 16],
            segs: [Segment::default(); 6],
            xmm: [[0; 16]; 16],
            mxcsr: MXCSR_DEFAULT,
            fpu: Fpu::default(),
            mode,
            faultaddr: 0,
            stash: Stash::default(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            config: MachineConfig::default(),
            pending_exit: None,
        }
    }

    pub fn with_config(mode: DecodeMode, config: MachineConfig) -> Self {
        let mut m = Machine::new(mode);
        m.config = config;
        m
    }

    /// IP masked to the current mode's width.
    #[inline]
    pub fn masked_ip(&self) -> u64 {
        mask_address(self.mode, self.ip)
    }

    /// Linear address of the next instruction.
    #[inline]
    pub fn pc(&self) -> i64 {
        (self.segs[SEG_CS].base.wrapping_add(self.masked_ip())) as i64
    }

    #[inline]
    pub fn set_ip(&mut self, ip: u64) {
        self.ip = mask_address(self.mode, ip);
    }

    #[inline]
    pub fn get64(&self, r: Gpr) -> u64 {
        self.regs[r.index()]
    }

    #[inline]
    pub fn put64(&mut self, r: Gpr, v: u64) {
        self.regs[r.index()] = v;
    }

    #[inline]
    pub fn get32(&self, r: Gpr) -> u64 {
        self.regs[r.index()] & 0xffff_ffff
    }

    /// 32-bit register writes zero-extend into the full register.
    #[inline]
    pub fn put32(&mut self, r: Gpr, v: u64) {
        self.regs[r.index()] = v & 0xffff_ffff;
    }

    #[inline]
    pub fn get16(&self, r: Gpr) -> u64 {
        self.regs[r.index()] & 0xffff
    }

    /// 16-bit writes merge into the low word, preserving the rest.
    #[inline]
    pub fn put16(&mut self, r: Gpr, v: u64) {
        let p = &mut self.regs[r.index()];
        *p = (*p & !0xffff) | (v & 0xffff);
    }

    /// Sized read: `log2` of the width in bytes (0..=3).
    #[inline]
    pub fn get_reg(&self, log2: usize, r: Gpr) -> u64 {
        match log2 {
            0 => self.regs[r.index()] & 0xff,
            1 => self.get16(r),
            2 => self.get32(r),
            _ => self.get64(r),
        }
    }

    /// Sized write with the architectural merge/zero-extend rules.
    #[inline]
    pub fn put_reg(&mut self, log2: usize, r: Gpr, v: u64) {
        match log2 {
            0 => {
                let p = &mut self.regs[r.index()];
                *p = (*p & !0xff) | (v & 0xff);
            }
            1 => self.put16(r, v),
            2 => self.put32(r, v),
            _ => self.put64(r, v),
        }
    }

    /// Reads a legacy byte register through its five-bit selector, which
    /// distinguishes the AH family from the REX low-byte window.
    #[inline]
    pub fn get_byte_reg(&self, selector: usize) -> u64 {
        let br = byte_reg(selector);
        let v = self.regs[br.reg.index()];
        if br.high {
            v >> 8 & 0xff
        } else {
            v & 0xff
        }
    }

    #[inline]
    pub fn put_byte_reg(&mut self, selector: usize, v: u64) {
        let br = byte_reg(selector);
        let p = &mut self.regs[br.reg.index()];
        if br.high {
            *p = (*p & !0xff00) | (v & 0xff) << 8;
        } else {
            *p = (*p & !0xff) | (v & 0xff);
        }
    }

    /// The r/m operand when `mod == 3`, honouring byte-register selection.
    #[inline]
    pub fn get_rm_reg(&self, rde: Rde, log2: usize) -> u64 {
        if log2 == 0 {
            self.get_byte_reg(rde.byte_rexb_rm())
        } else {
            self.get_reg(log2, Gpr::from_index(rde.rexb_rm()))
        }
    }

    #[inline]
    pub fn put_rm_reg(&mut self, rde: Rde, log2: usize, v: u64) {
        if log2 == 0 {
            self.put_byte_reg(rde.byte_rexb_rm(), v);
        } else {
            self.put_reg(log2, Gpr::from_index(rde.rexb_rm()), v);
        }
    }

    /// The reg operand, honouring byte-register selection.
    #[inline]
    pub fn get_reg_operand(&self, rde: Rde, log2: usize) -> u64 {
        if log2 == 0 {
            self.get_byte_reg(rde.byte_rexr_reg())
        } else {
            self.get_reg(log2, Gpr::from_index(rde.rexr_reg()))
        }
    }

    #[inline]
    pub fn put_reg_operand(&mut self, rde: Rde, log2: usize, v: u64) {
        if log2 == 0 {
            self.put_byte_reg(rde.byte_rexr_reg(), v);
        } else {
            self.put_reg(log2, Gpr::from_index(rde.rexr_reg()), v);
        }
    }

    #[inline]
    pub fn xmm_u128(&self, i: usize) -> u128 {
        u128::from_le_bytes(self.xmm[i])
    }

    #[inline]
    pub fn set_xmm_u128(&mut self, i: usize, v: u128) {
        self.xmm[i] = v.to_le_bytes();
    }

    #[inline]
    pub fn get_flag(&self, bit: u32) -> bool {
        flags::get_flag(self.flags, bit)
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u32, v: bool) {
        self.flags = flags::set_flag(self.flags, bit, v);
    }

    /// Requests a non-local exit from the dispatch loop.
    #[inline]
    pub fn halt(&self, code: i32) -> Exception {
        Exception::Halted(HaltReason::Requested(code))
    }

    /// Records a faulting linear address and produces the exception.
    #[inline]
    pub fn segv(&mut self, addr: i64) -> Exception {
        self.faultaddr = addr;
        Exception::segv(addr)
    }

    /// Default data-segment base for the current instruction, honouring an
    /// override prefix.
    #[inline]
    pub fn seg_base(&self, rde: Rde, default: usize) -> u64 {
        match rde.sego() {
            0 => self.segs[default].base,
            s => self.segs[s as usize - 1].base,
        }
    }
}

/// Masks an address to the width of the given mode.
#[inline]
pub fn mask_address(mode: DecodeMode, x: u64) -> u64 {
    match mode {
        DecodeMode::Real => x & 0xffff,
        DecodeMode::Legacy => x & 0xffff_ffff,
        DecodeMode::Long => x,
    }
}
