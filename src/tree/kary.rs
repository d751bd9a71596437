//! K-ary tree: tree rank `r` has children `r*k+1 ..= r*k+k`.

/// Children of tree rank `rank` in a k-ary tree of `size` ranks.
pub(crate) fn children(rank: u32, size: u32, ratio: u32) -> Vec<u32> {
    let first = rank as u64 * ratio as u64 + 1;
    let last = (first + ratio as u64).min(size as u64);
    (first..last).map(|c| c as u32).collect()
}

/// Parent of non-root tree rank `rank`.
pub(crate) fn parent(rank: u32, ratio: u32) -> u32 {
    debug_assert!(rank > 0);
    (rank - 1) / ratio
}

#[cfg(test)]
mod kary_tests {
    use super::*;

    #[test]
    fn binary_shape() {
        assert_eq!(children(0, 7, 2), vec![1, 2]);
        assert_eq!(children(2, 7, 2), vec![5, 6]);
        assert_eq!(children(2, 6, 2), vec![5]);
        assert!(children(3, 7, 2).is_empty());
        assert_eq!(parent(6, 2), 2);
        assert_eq!(parent(1, 2), 0);
    }
}
