//! Static length-decoding tables, transcribed from the Intel ILD attribute
//! grammar. Indexed by `[map][opcode]` for the three 256-entry tables and by
//! `[eamode][mod][rm]` for the ModR/M-derived ones.

// Immediate-width resolution kinds (IMM_KIND values).
pub(crate) const IMM_NONE: u8 = 1;
pub(crate) const IMM_BYREG_C7: u8 = 2;
pub(crate) const IMM_BYREG_F6: u8 = 3;
pub(crate) const IMM_BYREG_F7: u8 = 4;
pub(crate) const IMM_SIMM8: u8 = 5;
pub(crate) const IMM_SIMMZ_DF64: u8 = 6;
pub(crate) const IMM_SIMMZ: u8 = 7;
pub(crate) const IMM_UIMM16: u8 = 8;
pub(crate) const IMM_UIMM8: u8 = 9;
pub(crate) const IMM_UIMMV: u8 = 10;
pub(crate) const IMM_ENTER: u8 = 11;
pub(crate) const IMM_BYPREFIX_0F78: u8 = 12;

// Displacement-width resolution kinds (DISP_KIND values).
pub(crate) const DISP_BRDISP8: u8 = 1;
pub(crate) const DISP_BRDISPZ: u8 = 2;
pub(crate) const DISP_BRANCH: u8 = 3;
pub(crate) const DISP_REGULAR: u8 = 4;
pub(crate) const DISP_MEMDISPV: u8 = 5;
pub(crate) const DISP_BYREG_C7: u8 = 6;

// HAS_MODRM marker for opcodes that carry a ModR/M byte whose mod field is
// not used for addressing (XCHG-style encodings).
pub(crate) const MODRM_IGNORE_MOD: u8 = 2;

/// Whether a SIB byte follows, by `[eamode][mod][rm]`.
pub(crate) const HAS_SIB: [[[u8; 8]; 4]; 3] = [
    [[0; 8], [0; 8], [0; 8], [0; 8]],
    [
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0],
    ],
    [
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 1, 0, 0, 0],
        [0, 0, 0, 0, 0, 0, 0, 0],
    ],
];

/// ModR/M-implied displacement width in bytes, by `[eamode][mod][rm]`.
pub(crate) const DISP_REGULAR_BYTES: [[[u8; 8]; 4]; 3] = [
    [
        [0, 0, 0, 0, 0, 0, 2, 0],
        [1; 8],
        [2; 8],
        [0; 8],
    ],
    [
        [0, 0, 0, 0, 0, 4, 0, 0],
        [1; 8],
        [4; 8],
        [0; 8],
    ],
    [
        [0, 0, 0, 0, 0, 4, 0, 0],
        [1; 8],
        [4; 8],
        [0; 8],
    ],
];

/// Effective-address mode from `[asz][mode]`.
pub(crate) const EAMODE: [[u8; 3]; 2] = [[0, 1, 2], [1, 0, 1]];

/// Effective address size log2 from `[asz][mode]` (1 = 16-bit .. 3 = 64-bit).
pub(crate) const EASZ: [[u8; 3]; 2] = [[1, 2, 3], [2, 1, 2]];

/// Effective operand size log2 from `[rexw][osz][mode]`.
pub(crate) const EOSZ: [[[u8; 3]; 2]; 2] = [[[1, 2, 2], [2, 1, 1]], [[1, 2, 3], [2, 1, 3]]];

/// Like `EOSZ` but defaulting to 64-bit in long mode (stack pushes,
/// `PUSH imm`, near branches).
pub(crate) const EOSZ_DF64: [[[u8; 3]; 2]; 2] = [[[1, 2, 3], [2, 1, 1]], [[1, 2, 3], [2, 1, 3]]];

/// `SIMMz` immediate width in bits per effective operand size log2.
pub(crate) const SIMMZ_BITS: [u8; 4] = [0, 16, 32, 32];

/// `UIMMv` immediate width in bits per effective operand size log2.
pub(crate) const UIMMV_BITS: [u8; 4] = [0, 16, 32, 64];

/// `BRDISPz` branch-displacement width in bits per effective operand size.
pub(crate) const BRDISPZ_BITS: [u8; 4] = [0, 16, 32, 32];

/// `MEMDISPv` absolute-offset width in bits per effective address size.
pub(crate) const MEMDISPV_BITS: [u8; 4] = [0, 16, 32, 64];

/// Operand-size log2 from `[!(opcode & 1)][osz][rexw]`; even opcodes in the
/// ALU rows are the byte forms.
pub(crate) const WORD_LOG2: [[[u8; 2]; 2]; 2] = [[[2, 3], [1, 3]], [[0, 0], [0, 0]]];

pub(crate) const IMM_KIND: [[u8; 256]; 2] = [
    [
        1, 1, 1, 1, 5, 7, 1, 1, 1, 1, 1, 1, 9, 7, 1, 0, // 0x
        1, 1, 1, 1, 5, 7, 1, 1, 1, 1, 1, 1, 5, 7, 1, 1, // 1x
        1, 1, 1, 1, 5, 7, 0, 1, 1, 1, 1, 1, 5, 7, 0, 1, // 2x
        1, 1, 1, 1, 9, 7, 0, 1, 1, 1, 1, 1, 5, 7, 0, 1, // 3x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 4x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 5x
        1, 1, 1, 1, 0, 0, 0, 0, 6, 7, 5, 5, 1, 1, 1, 1, // 6x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 7x
        5, 7, 5, 5, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 8x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 8, 1, 1, 1, 1, 1, // 9x
        1, 1, 1, 1, 1, 1, 1, 1, 5, 7, 1, 1, 1, 1, 1, 1, // Ax
        9, 9, 9, 9, 9, 9, 9, 9, 10, 10, 10, 10, 10, 10, 10, 10, // Bx
        9, 9, 8, 1, 1, 1, 9, 2, 11, 1, 8, 1, 1, 9, 1, 1, // Cx
        1, 1, 1, 1, 9, 9, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Dx
        1, 1, 1, 1, 9, 9, 9, 9, 1, 1, 8, 1, 1, 1, 1, 1, // Ex
        0, 1, 0, 0, 1, 1, 3, 4, 1, 1, 1, 1, 1, 1, 1, 1, // Fx
    ],
    [
        1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 0, 1, 0, 1, 1, 0, // 0x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 1x
        1, 1, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, // 2x
        1, 1, 1, 1, 1, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, // 3x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 4x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 5x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 6x
        9, 9, 9, 9, 1, 1, 1, 1, 12, 1, 1, 1, 1, 1, 1, 1, // 7x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 8x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 9x
        1, 1, 1, 1, 9, 1, 0, 0, 1, 1, 1, 1, 9, 1, 1, 1, // Ax
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 9, 1, 1, 1, 1, 1, // Bx
        1, 1, 9, 1, 9, 9, 9, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Cx
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Dx
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Ex
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Fx
    ],
];
pub(crate) const HAS_MODRM: [[u8; 256]; 2] = [
    [
        1, 1, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 0, 0, 0, 3, // 0x
        1, 1, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 0, 0, 0, 0, // 1x
        1, 1, 1, 1, 0, 0, 3, 0, 1, 1, 1, 1, 0, 0, 3, 0, // 2x
        1, 1, 1, 1, 0, 0, 3, 0, 1, 1, 1, 1, 0, 0, 3, 0, // 3x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 4x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 5x
        0, 0, 1, 1, 3, 3, 3, 3, 0, 1, 0, 1, 0, 0, 0, 0, // 6x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 7x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 8x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 9x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // Ax
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // Bx
        1, 1, 0, 0, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, // Cx
        1, 1, 1, 1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, // Dx
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // Ex
        3, 0, 3, 3, 0, 0, 1, 1, 0, 0, 0, 0, 0, 0, 1, 1, // Fx
    ],
    [
        1, 1, 1, 1, 3, 0, 0, 0, 0, 0, 3, 0, 3, 1, 0, 3, // 0x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 1x
        2, 2, 2, 2, 3, 3, 3, 3, 1, 1, 1, 1, 1, 1, 1, 1, // 2x
        0, 0, 0, 0, 0, 0, 3, 0, 3, 3, 3, 3, 3, 3, 3, 3, // 3x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 4x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 5x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 6x
        1, 1, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 1, 1, 1, // 7x
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 8x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 9x
        0, 0, 0, 1, 1, 1, 3, 3, 0, 0, 0, 1, 1, 1, 1, 1, // Ax
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Bx
        1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, // Cx
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Dx
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Ex
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // Fx
    ],
];
pub(crate) const DISP_KIND: [[u8; 256]; 2] = [
    [
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 0, // 0x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 1x
        4, 4, 4, 4, 4, 4, 0, 4, 4, 4, 4, 4, 4, 4, 0, 4, // 2x
        4, 4, 4, 4, 4, 4, 0, 4, 4, 4, 4, 4, 4, 4, 0, 4, // 3x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 4x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 5x
        4, 4, 4, 4, 0, 0, 0, 0, 4, 4, 4, 4, 4, 4, 4, 4, // 6x
        1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // 7x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 8x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 2, 4, 4, 4, 4, 4, // 9x
        5, 5, 5, 5, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Ax
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Bx
        4, 4, 4, 4, 4, 4, 4, 6, 4, 4, 4, 4, 4, 4, 4, 4, // Cx
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Dx
        1, 1, 1, 1, 4, 4, 4, 4, 3, 3, 2, 1, 4, 4, 4, 4, // Ex
        0, 4, 0, 0, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Fx
    ],
    [
        4, 4, 4, 4, 0, 4, 4, 4, 4, 4, 0, 4, 0, 4, 4, 0, // 0x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 1x
        4, 4, 4, 4, 0, 0, 0, 0, 4, 4, 4, 4, 4, 4, 4, 4, // 2x
        4, 4, 4, 4, 4, 4, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, // 3x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 4x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 5x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 6x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 7x
        3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, // 8x
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // 9x
        4, 4, 4, 4, 4, 4, 0, 0, 4, 4, 4, 4, 4, 4, 4, 4, // Ax
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Bx
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Cx
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Dx
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Ex
        4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, // Fx
    ],
];
