use crate::error::DecodeError;
use crate::rde::{DecodeMode, OpMap, Rde};
use crate::tables::*;
use crate::MAX_INSTRUCTION_LEN;

/// A decoded instruction: the raw bytes, total length, the packed attribute
/// word, and the displacement/immediate values sign- or zero-extended the
/// way each opcode's grammar dictates.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub bytes: [u8; MAX_INSTRUCTION_LEN],
    pub length: u8,
    pub rde: Rde,
    /// Displacement, sign-extended (unsigned only for absolute-offset MOVs).
    pub disp: i64,
    /// Primary immediate, extended to 64 bits.
    pub uimm: u64,
    /// Second immediate byte (`ENTER imm16, imm8`).
    pub uimm1: u8,
}

impl Decoded {
    #[inline]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

struct Ild {
    bytes: [u8; MAX_INSTRUCTION_LEN],
    max_bytes: u8,
    length: u8,
    rde: Rde,
    map: OpMap,
    opcode: u8,
    has_modrm: u8,
    has_sib: bool,
    disp_bytes: u8,
    disp_unsigned: bool,
    imm_bits: u8,
    imm_signed: bool,
    disp: i64,
    uimm: u64,
    uimm1: u8,
}

/// Reads `n` little-endian bytes, sign-extending when `signed`.
fn read_number(p: &[u8], n: usize, signed: bool) -> u64 {
    let mut raw = [0u8; 8];
    raw[..n].copy_from_slice(&p[..n]);
    let v = u64::from_le_bytes(raw);
    if signed {
        let shift = 64 - n as u32 * 8;
        ((v << shift) as i64 >> shift) as u64
    } else {
        v
    }
}

impl Ild {
    fn new(mode: DecodeMode, itext: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
        let n = itext.len().min(MAX_INSTRUCTION_LEN);
        bytes[..n].copy_from_slice(&itext[..n]);
        let mut rde = Rde::default();
        rde.set_mode(mode);
        Ild {
            bytes,
            max_bytes: n as u8,
            length: 0,
            rde,
            map: OpMap::Map0,
            opcode: 0,
            has_modrm: 0,
            has_sib: false,
            disp_bytes: 0,
            disp_unsigned: false,
            imm_bits: 0,
            imm_signed: false,
            disp: 0,
            uimm: 0,
            uimm1: 0,
        }
    }

    fn too_short(&self) -> DecodeError {
        if self.max_bytes as usize >= MAX_INSTRUCTION_LEN {
            DecodeError::InstrTooLong
        } else {
            DecodeError::TooShort(self.max_bytes)
        }
    }

    fn take(&mut self) -> Result<u8, DecodeError> {
        if self.length < self.max_bytes {
            let b = self.bytes[self.length as usize];
            self.length += 1;
            Ok(b)
        } else {
            Err(self.too_short())
        }
    }

    fn scan_prefixes(&mut self) -> Result<(), DecodeError> {
        let long = self.rde.mode() == DecodeMode::Long;
        let mut rex: u8 = 0;
        while self.length < self.max_bytes {
            let b = self.bytes[self.length as usize];
            match b {
                0x66 => {
                    rex = 0;
                    self.rde.set_osz();
                }
                0x67 => {
                    rex = 0;
                    self.rde.set_asz();
                }
                0x2E => {
                    // CS override; a branch hint in long mode, ignored.
                    if !long {
                        self.rde.set_sego(2);
                    }
                    rex = 0;
                }
                0x3E => {
                    if !long {
                        self.rde.set_sego(4);
                    }
                    rex = 0;
                }
                0x26 => {
                    if !long {
                        self.rde.set_sego(1);
                    }
                    rex = 0;
                }
                0x36 => {
                    if !long {
                        self.rde.set_sego(3);
                    }
                    rex = 0;
                }
                0x64 => {
                    self.rde.set_sego(5);
                    rex = 0;
                }
                0x65 => {
                    self.rde.set_sego(6);
                    rex = 0;
                }
                0xF0 => {
                    self.rde.set_lock();
                    rex = 0;
                }
                0xF2 | 0xF3 => {
                    self.rde.set_rep(b as u64 & 3);
                    rex = 0;
                }
                0x40..=0x4F if long => {
                    // Only a REX immediately before the opcode takes effect.
                    rex = b;
                }
                _ => break,
            }
            self.length += 1;
        }
        if rex != 0 {
            self.rde.set_rex(rex);
        }
        if self.length >= self.max_bytes {
            return Err(self.too_short());
        }
        Ok(())
    }

    fn scan_opcode(&mut self) -> Result<(), DecodeError> {
        let b = self.take()?;
        if b != 0x0F {
            self.opcode = b;
            return Ok(());
        }
        let b = self.take()?;
        match b {
            0x38 => {
                self.map = OpMap::Map2;
                self.opcode = self.take()?;
            }
            0x3A => {
                self.map = OpMap::Map3;
                self.imm_bits = 8;
                self.opcode = self.take()?;
            }
            0x0F | 0x39 | 0x3B..=0x3F => return Err(DecodeError::BadMap),
            _ => {
                self.map = OpMap::Map1;
                self.opcode = b;
            }
        }
        Ok(())
    }

    fn scan_modrm(&mut self) -> Result<(), DecodeError> {
        self.has_modrm = match self.map {
            OpMap::Map0 | OpMap::Map1 => HAS_MODRM[self.map as usize][self.opcode as usize],
            _ => 1,
        };
        if self.has_modrm == 0 {
            return Ok(());
        }
        let b = self.take()?;
        self.rde.set_modrm(b);
        if self.has_modrm != MODRM_IGNORE_MOD {
            let eamode = EAMODE[self.rde.asz() as usize][self.rde.mode() as usize] as usize;
            let mod_ = self.rde.modrm_mod() as usize;
            let rm = self.rde.rm() as usize;
            self.disp_bytes = DISP_REGULAR_BYTES[eamode][mod_][rm];
            self.has_sib = HAS_SIB[eamode][mod_][rm] != 0;
        }
        Ok(())
    }

    fn scan_sib(&mut self) -> Result<(), DecodeError> {
        if !self.has_sib {
            return Ok(());
        }
        let b = self.take()?;
        self.rde.set_sib(b);
        if b & 7 == 5 && self.rde.modrm_mod() == 0 {
            self.disp_bytes = 4;
        }
        Ok(())
    }

    fn eosz(&self) -> usize {
        EOSZ[self.rde.rexw() as usize][self.rde.osz() as usize][self.rde.mode() as usize] as usize
    }

    fn scan_disp(&mut self) -> Result<(), DecodeError> {
        if matches!(self.map, OpMap::Map0 | OpMap::Map1) {
            match DISP_KIND[self.map as usize][self.opcode as usize] {
                DISP_BRDISP8 => {
                    self.disp_bytes = 1;
                }
                DISP_BRDISPZ => {
                    self.disp_bytes = BRDISPZ_BITS[self.eosz()] / 8;
                    self.disp_unsigned = true;
                }
                DISP_BRANCH => {
                    // Jcc/CALL/JMP relative: operand-sized in legacy modes,
                    // always 32-bit in long mode.
                    if self.rde.mode() == DecodeMode::Long {
                        self.disp_bytes = 4;
                    } else {
                        self.disp_bytes = BRDISPZ_BITS[self.eosz()] / 8;
                    }
                }
                DISP_REGULAR => {}
                DISP_MEMDISPV => {
                    let easz =
                        EASZ[self.rde.asz() as usize][self.rde.mode() as usize] as usize;
                    self.disp_bytes = MEMDISPV_BITS[easz] / 8;
                    self.disp_unsigned = true;
                }
                DISP_BYREG_C7 => {
                    if self.rde.reg() == 7 {
                        // XBEGIN.
                        self.disp_bytes = BRDISPZ_BITS[self.eosz()] / 8;
                        self.disp_unsigned = true;
                    }
                }
                _ => return Err(DecodeError::General),
            }
        }
        if self.disp_bytes != 0 {
            let at = self.length as usize;
            if at + self.disp_bytes as usize > self.max_bytes as usize {
                return Err(self.too_short());
            }
            self.disp = read_number(
                &self.bytes[at..],
                self.disp_bytes as usize,
                !self.disp_unsigned,
            ) as i64;
            self.length += self.disp_bytes;
        }
        Ok(())
    }

    fn resolve_imm_bits(&mut self) -> Result<(), DecodeError> {
        if self.imm_bits != 0 || !matches!(self.map, OpMap::Map0 | OpMap::Map1) {
            return Ok(());
        }
        match IMM_KIND[self.map as usize][self.opcode as usize] {
            IMM_NONE => {}
            IMM_BYREG_C7 => {
                if self.rde.reg() == 0 {
                    self.imm_bits = SIMMZ_BITS[self.eosz()];
                    self.imm_signed = true;
                }
            }
            IMM_BYREG_F6 => {
                if self.rde.reg() <= 1 {
                    self.imm_bits = 8;
                    self.imm_signed = true;
                }
            }
            IMM_BYREG_F7 => {
                if self.rde.reg() <= 1 {
                    self.imm_bits = SIMMZ_BITS[self.eosz()];
                    self.imm_signed = true;
                }
            }
            IMM_SIMM8 => {
                self.imm_bits = 8;
                self.imm_signed = true;
            }
            IMM_SIMMZ_DF64 => {
                let eosz = EOSZ_DF64[self.rde.rexw() as usize][self.rde.osz() as usize]
                    [self.rde.mode() as usize] as usize;
                self.imm_bits = SIMMZ_BITS[eosz];
                self.imm_signed = true;
            }
            IMM_SIMMZ => {
                self.imm_bits = SIMMZ_BITS[self.eosz()];
                self.imm_signed = true;
            }
            IMM_UIMM16 => self.imm_bits = 16,
            IMM_UIMM8 => self.imm_bits = 8,
            IMM_UIMMV => self.imm_bits = UIMMV_BITS[self.eosz()],
            IMM_ENTER => self.imm_bits = 16,
            IMM_BYPREFIX_0F78 => {
                if self.rde.osz() || self.rde.rep() == 2 {
                    self.imm_bits = 8;
                }
            }
            _ => return Err(DecodeError::General),
        }
        Ok(())
    }

    fn scan_imm(&mut self) -> Result<(), DecodeError> {
        self.resolve_imm_bits()?;
        let imm_bytes = self.imm_bits as usize / 8;
        if imm_bytes != 0 {
            let at = self.length as usize;
            if at + imm_bytes > self.max_bytes as usize {
                return Err(self.too_short());
            }
            self.uimm = read_number(&self.bytes[at..], imm_bytes, self.imm_signed);
            self.length += imm_bytes as u8;
        }
        if self.map == OpMap::Map0 && self.opcode == 0xC8 {
            // ENTER carries a second, byte-wide immediate.
            self.uimm1 = self.take()?;
        }
        Ok(())
    }

    fn finish(mut self) -> Decoded {
        self.rde.set_map(self.map);
        self.rde.set_opcode(self.opcode);
        self.rde.set_srm();
        if self.rde.mode() == DecodeMode::Real {
            // In real mode the 66 prefix means 32-bit, so flip the bit to
            // keep "osz set" meaning "16-bit operands" everywhere downstream.
            self.rde.flip_osz();
        }
        let log2 = WORD_LOG2[(!self.opcode & 1) as usize][self.rde.osz() as usize]
            [self.rde.rexw() as usize];
        self.rde.set_word_log2(log2 as u64);
        self.rde
            .set_eamode(EAMODE[self.rde.asz() as usize][self.rde.mode() as usize] as u64);
        self.rde.set_oplength(self.length);
        Decoded {
            bytes: self.bytes,
            length: self.length,
            rde: self.rde,
            disp: self.disp,
            uimm: self.uimm,
            uimm1: self.uimm1,
        }
    }
}

/// Decodes the length and attributes of the instruction starting at
/// `itext[0]`. At most [`MAX_INSTRUCTION_LEN`] bytes are examined; bytes
/// beyond the reported length are never read.
pub fn decode_one(mode: DecodeMode, itext: &[u8]) -> Result<Decoded, DecodeError> {
    let mut ild = Ild::new(mode, itext);
    ild.scan_prefixes()?;
    ild.scan_opcode()?;
    ild.scan_modrm()?;
    ild.scan_sib()?;
    ild.scan_disp()?;
    ild.scan_imm()?;
    Ok(ild.finish())
}
