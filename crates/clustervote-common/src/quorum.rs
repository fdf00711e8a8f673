//! Quorum threshold math — a pure function, deliberately kept tiny and
//! dependency-free since both the Controller's membership gate and the
//! Election Manager's vote tally key off the same number.

/// Compute the quorum threshold for a membership of `n` nodes: a strict
/// majority, `floor(n / 2) + 1`. This is the formula the worked boundary
/// table uses (the original source's `ceil(n/2)` variant over-counts for
/// even `n`; see DESIGN.md).
pub fn threshold(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values() {
        assert_eq!(threshold(1), 1);
        assert_eq!(threshold(2), 2);
        assert_eq!(threshold(3), 2);
        assert_eq!(threshold(4), 3);
        assert_eq!(threshold(5), 3);
        assert_eq!(threshold(6), 4);
    }

    #[test]
    fn always_strictly_more_than_half() {
        for n in 1..200usize {
            let t = threshold(n);
            assert!(t * 2 > n, "threshold({n}) = {t} is not a strict majority");
        }
    }
}
