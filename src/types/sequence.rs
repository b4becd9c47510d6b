//! 16-bit RTP sequence arithmetic

/// Forward distance from `last` to `seq` modulo 65536.
#[inline]
pub fn seq_distance(seq: u16, last: u16) -> u16 {
    seq.wrapping_sub(last)
}

/// Compare sequence numbers in u16 space with wraparound using the half-range rule.
/// Returns true if `a` is considered newer than `b`.
#[inline]
pub fn seq_after(a: u16, b: u16) -> bool {
    if a == b {
        return false;
    }
    seq_distance(a, b) < 0x8000
}
