/// Round up `n` to the nearest multiple of `to`. `to` must be non-zero.
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Like [`round_up()`], but `None` instead of wrapping around.
pub fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to != 0);
    let rem = n % to;
    if rem == 0 {
        Some(n)
    } else {
        n.checked_add(to - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(4, 4), 4);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    pub fn checked_round_up_reports_overflow() {
        assert_eq!(checked_round_up(5, 4), Some(8));
        assert_eq!(checked_round_up(usize::MAX - 1, 4), None);
        assert_eq!(checked_round_up(usize::MAX, 1), Some(usize::MAX));
    }
}
