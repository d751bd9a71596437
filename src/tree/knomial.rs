//! K-nomial tree, computed over the base-k digits of tree ranks.
//!
//! A rank's children are obtained by setting, one at a time, each digit
//! position below its lowest nonzero digit to every value in `1..k`. The
//! parent is obtained by zeroing the lowest nonzero digit.

/// Children of tree rank `rank` in a k-nomial tree of `size` ranks.
pub(crate) fn children(rank: u32, size: u32, ratio: u32) -> Vec<u32> {
    let (rank, size, ratio) = (rank as u64, size as u64, ratio as u64);
    let mut kids = Vec::new();
    let mut rest = rank;
    let mut weight = 1u64;

    while weight < size && rest % ratio == 0 {
        for digit in 1..ratio {
            let child = rank + digit * weight;
            if child >= size {
                break;
            }
            kids.push(child as u32);
        }
        rest /= ratio;
        weight *= ratio;
    }

    kids
}

/// Parent of non-root tree rank `rank`.
pub(crate) fn parent(rank: u32, ratio: u32) -> u32 {
    debug_assert!(rank > 0);
    let mut rest = rank;
    let mut weight = 1u32;
    while rest % ratio == 0 {
        rest /= ratio;
        weight *= ratio;
    }
    rank - (rest % ratio) * weight
}

#[cfg(test)]
mod knomial_tests {
    use super::*;

    #[test]
    fn binomial_shape() {
        // classic binomial tree over 8 ranks
        assert_eq!(children(0, 8, 2), vec![1, 2, 4]);
        assert_eq!(children(2, 8, 2), vec![3]);
        assert_eq!(children(4, 8, 2), vec![5, 6]);
        assert!(children(5, 8, 2).is_empty());
        assert_eq!(parent(6, 2), 4);
        assert_eq!(parent(7, 2), 6);
        assert_eq!(parent(4, 2), 0);
    }

    #[test]
    fn trinomial_clipped() {
        assert_eq!(children(0, 10, 3), vec![1, 2, 3, 6, 9]);
        assert_eq!(children(3, 10, 3), vec![4, 5]);
        assert_eq!(children(9, 10, 3), Vec::<u32>::new());
        assert_eq!(parent(5, 3), 3);
        assert_eq!(parent(9, 3), 0);
    }
}
