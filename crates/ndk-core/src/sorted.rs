//! Sorted-list primitives used for every deterministic collection.
//!
//! All collections yielded to callers are sorted by a documented key (URIs
//! lexicographically, relations by unique id, chunks by index path). These
//! helpers keep `Vec`s ordered and deduplicated by a caller-supplied key
//! function instead of reaching for `BTreeMap`, which preserves the cheap
//! append fast-path for already-sorted inputs.

/// What to do when inserting an element whose key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Keep the existing element; the new one is discarded.
    Keep,
    /// Replace the existing element with the new one.
    Replace,
}

/// Find the element with key `k` in a list sorted by `key`.
pub fn sorted_find<'a, T, K, F>(xs: &'a [T], k: &K, key: F) -> Option<&'a T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    match xs.binary_search_by(|x| key(x).cmp(k)) {
        Ok(index) => Some(&xs[index]),
        Err(_) => None,
    }
}

/// Insert `x` into `xs` at the correct index, sorted by `key`.
///
/// Returns the displaced element on conflict (`Replace`) or the rejected new
/// element (`Keep`); `None` when the element was inserted fresh.
pub fn sorted_insert<T, K, F>(xs: &mut Vec<T>, x: T, key: F, on_conflict: OnConflict) -> Option<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    // Since insertion is often applied to already-sorted inputs, first check
    // whether the element fits at the end.
    let key_x = key(&x);
    if xs.last().is_none_or(|last| key(last) < key_x) {
        xs.push(x);
        return None;
    }

    match xs.binary_search_by(|e| key(e).cmp(&key_x)) {
        Err(index) => {
            xs.insert(index, x);
            None
        },
        Ok(index) => match on_conflict {
            OnConflict::Keep => Some(x),
            OnConflict::Replace => Some(std::mem::replace(&mut xs[index], x)),
        },
    }
}

/// Return a copy of the input, sorted and deduplicated by `key`.
pub fn sorted_make<T, K, F, I>(xs: I, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
    I: IntoIterator<Item = T>,
{
    let mut result: Vec<T> = Vec::new();
    for x in xs {
        sorted_insert(&mut result, x, &key, OnConflict::Replace);
    }
    result
}

/// Return a copy of `xs` where all of `ys` were inserted.
///
/// The input `xs` must already be sorted and deduplicated by `key`.
pub fn sorted_union<T, K, F>(xs: &[T], ys: Vec<T>, key: F, on_conflict: OnConflict) -> Vec<T>
where
    T: Clone,
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut result = xs.to_vec();
    for y in ys {
        sorted_insert(&mut result, y, &key, on_conflict);
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_insert_keeps_order() {
        // Given: elements inserted out of order
        let mut xs: Vec<u32> = Vec::new();
        for x in [5, 1, 3, 2, 4] {
            sorted_insert(&mut xs, x, |x| *x, OnConflict::Replace);
        }

        // Then: the list is sorted
        assert_eq!(xs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sorted_insert_append_fast_path() {
        let mut xs = vec![1, 2, 3];
        assert!(sorted_insert(&mut xs, 4, |x| *x, OnConflict::Replace).is_none());
        assert_eq!(xs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sorted_insert_conflict_replace() {
        let mut xs = vec![("a", 1), ("b", 1)];
        let displaced = sorted_insert(&mut xs, ("a", 2), |(k, _)| *k, OnConflict::Replace);
        assert_eq!(displaced, Some(("a", 1)));
        assert_eq!(xs, vec![("a", 2), ("b", 1)]);
    }

    #[test]
    fn test_sorted_insert_conflict_keep() {
        let mut xs = vec![("a", 1), ("b", 1)];
        let rejected = sorted_insert(&mut xs, ("a", 2), |(k, _)| *k, OnConflict::Keep);
        assert_eq!(rejected, Some(("a", 2)));
        assert_eq!(xs, vec![("a", 1), ("b", 1)]);
    }

    #[test]
    fn test_sorted_find() {
        let xs = vec!["alpha", "beta", "gamma"];
        assert_eq!(sorted_find(&xs, &"beta", |x| *x), Some(&"beta"));
        assert_eq!(sorted_find(&xs, &"delta", |x| *x), None);
        assert_eq!(sorted_find::<&str, _, _>(&[], &"beta", |x| *x), None);
    }

    #[test]
    fn test_sorted_make_deduplicates() {
        let xs = sorted_make(vec![3, 1, 3, 2, 1], |x| *x);
        assert_eq!(xs, vec![1, 2, 3]);
    }

    #[test]
    fn test_sorted_union() {
        let xs = vec![1, 3, 5];
        let merged = sorted_union(&xs, vec![2, 3, 6], |x| *x, OnConflict::Replace);
        assert_eq!(merged, vec![1, 2, 3, 5, 6]);
        // The original list is untouched.
        assert_eq!(xs, vec![1, 3, 5]);
    }

    proptest::proptest! {
        #[test]
        fn test_sorted_make_is_sorted_and_unique(xs in proptest::collection::vec(0u32..100, 0..50)) {
            let made = sorted_make(xs, |x| *x);
            proptest::prop_assert!(made.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
