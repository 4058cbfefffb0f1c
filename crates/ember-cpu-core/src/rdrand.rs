//! RDRAND/RDSEED entropy and the timestamp counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static STATE: AtomicU64 = AtomicU64::new(0);

fn seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15)
}

/// Hardware-entropy stand-in: a SplitMix64 stream seeded from wall time.
/// Always succeeds, so the handler reports CF=1 like functioning silicon.
pub fn entropy() -> u64 {
    let mut cur = STATE.load(Ordering::Relaxed);
    if cur == 0 {
        let _ = STATE.compare_exchange(0, seed() | 1, Ordering::Relaxed, Ordering::Relaxed);
        cur = STATE.load(Ordering::Relaxed);
    }
    let next = cur.wrapping_add(0x9e37_79b9_7f4a_7c15);
    STATE.store(next, Ordering::Relaxed);
    let mut z = next;
    z = (z ^ z >> 30).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ z >> 27).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ z >> 31
}

/// A monotonic-enough timestamp for RDTSC: nanoseconds scaled to look like
/// a few GHz of cycle counting.
pub fn timestamp() -> u64 {
    seed().wrapping_mul(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_stream_varies() {
        let a = entropy();
        let b = entropy();
        let c = entropy();
        assert!(a != b || b != c);
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let a = timestamp();
        let b = timestamp();
        assert!(b >= a);
    }
}
