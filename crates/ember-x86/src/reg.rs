/// General-purpose register names in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline]
    pub fn from_index(i: usize) -> Gpr {
        Self::ALL[i & 15]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where a legacy byte-register lives: which 64-bit register, and whether it
/// is the high byte (AH/CH/DH/BH) of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteReg {
    pub reg: Gpr,
    pub high: bool,
}

/// Resolves a five-bit byte-register selector
/// (`rex-present << 4 | rex.b << 3 | index`).
///
/// Without REX the window is AL, CL, DL, BL, AH, CH, DH, BH; with any REX
/// prefix it is the low byte of all sixteen registers, so SPL/BPL/SIL/DIL
/// replace the AH family.
#[inline]
pub fn byte_reg(selector: usize) -> ByteReg {
    debug_assert!(selector < 32);
    if selector & 0x10 != 0 {
        ByteReg {
            reg: Gpr::from_index(selector & 15),
            high: false,
        }
    } else if selector & 4 != 0 {
        ByteReg {
            reg: Gpr::from_index(selector & 3),
            high: true,
        }
    } else {
        ByteReg {
            reg: Gpr::from_index(selector & 3),
            high: false,
        }
    }
}
