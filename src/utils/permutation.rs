//! Random permutations applied to rows and sample columns before data leaves a party.

use rand::Rng;

/// Returns a uniformly random permutation of `0..n` (Fisher-Yates).
///
/// `(0 1 2 3) -> (2 3 0 1)`
pub fn gen_permute_pattern(n: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut pattern: Vec<usize> = (0..n).collect();
    for i in 0..n.saturating_sub(1) {
        let j = rng.random_range(i..n);
        pattern.swap(i, j);
    }
    pattern
}

/// Moves `items[i]` to position `permutation[i]`.
///
/// # Example
///
/// ```
/// use privas::utils::permutation::permute;
/// let v = permute(&[2, 1, 0], vec!['a', 'b', 'c']);
/// assert_eq!(v, vec!['c', 'b', 'a']);
/// ```
pub fn permute<T>(permutation: &[usize], items: Vec<T>) -> Vec<T> {
    debug_assert_eq!(permutation.len(), items.len());
    let mut output: Vec<Option<T>> = (0..items.len()).map(|_| None).collect();
    for (item, &target) in items.into_iter().zip(permutation) {
        output[target] = Some(item);
    }
    output.into_iter().flatten().collect()
}

/// Reverts [`permute`]: moves `items[permutation[i]]` back to position `i`.
pub fn undo_permute<T>(permutation: &[usize], items: Vec<T>) -> Vec<T> {
    debug_assert_eq!(permutation.len(), items.len());
    let mut items: Vec<Option<T>> = items.into_iter().map(Some).collect();
    permutation
        .iter()
        .filter_map(|&source| items[source].take())
        .collect()
}

/// Applies `permutation` to a slice of copyable values, e.g. one row of genotype calls.
pub fn permute_copied<T: Copy + Default>(permutation: &[usize], items: &[T]) -> Vec<T> {
    let mut output = vec![T::default(); items.len()];
    for (item, &target) in items.iter().zip(permutation) {
        output[target] = *item;
    }
    output
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn pattern_is_a_permutation() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for n in [0, 1, 2, 17, 1000] {
            let mut pattern = gen_permute_pattern(n, &mut rng);
            pattern.sort_unstable();
            assert_eq!(pattern, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn same_seed_same_pattern() {
        let a = gen_permute_pattern(50, &mut ChaCha20Rng::seed_from_u64(1));
        let b = gen_permute_pattern(50, &mut ChaCha20Rng::seed_from_u64(1));
        let c = gen_permute_pattern(50, &mut ChaCha20Rng::seed_from_u64(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn undo_reverts_permute() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let items: Vec<String> = (0..20).map(|i| format!("row{i}")).collect();
        let pattern = gen_permute_pattern(items.len(), &mut rng);
        let shuffled = permute(&pattern, items.clone());
        assert_ne!(shuffled, items);
        assert_eq!(undo_permute(&pattern, shuffled), items);
        let copied = permute_copied(&pattern, &(0..20).collect::<Vec<i32>>());
        assert_eq!(
            copied,
            permute(&pattern, (0..20).collect::<Vec<i32>>())
        );
    }
}
