//! SSE4.2 CRC32 over the Castagnoli polynomial.

use std::sync::OnceLock;

fn table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        // Bit-reversed 0x1EDC6F41.
        const POLY: u32 = 0x82F6_3B78;
        let mut t = [0u32; 256];
        for (d, slot) in t.iter_mut().enumerate() {
            let mut r = d as u32;
            for _ in 0..8 {
                r = r >> 1 ^ if r & 1 != 0 { POLY } else { 0 };
            }
            *slot = r;
        }
        t
    })
}

/// Folds `n` low bytes of `w` into the running checksum `h`.
pub fn castagnoli(mut h: u32, mut w: u64, n: usize) -> u32 {
    let t = table();
    for _ in 0..n {
        h = h >> 8 ^ t[((h & 255) as u8 ^ w as u8) as usize];
        w >>= 8;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // A zero byte folded into a zero checksum stays zero.
        assert_eq!(castagnoli(0, 0x00, 1), 0);
        // The guest-visible recurrence: crc32 eax, bl style accumulation.
        let mut h = !0u32;
        for b in b"123456789" {
            h = castagnoli(h, *b as u64, 1);
        }
        assert_eq!(!h, 0xE306_9283); // standard CRC-32C check value
    }
}
