use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{cmp::Ordering, fmt::Debug, ops::Index};

/// A map that maintains entries in sorted order, optimized for small
/// collections.
///
/// The engine keys almost everything by symbol, and a session tracks a few
/// dozen symbols at most, so a sorted `SmallVec` beats a `HashMap` on cache
/// locality while giving deterministic iteration order. For larger
/// collections, use `BTreeMap` instead.
///
/// # Type Parameters
///
/// - `N`: Inline capacity (default: 8). Entries stored on the stack before
///   heap allocation.
///
/// # Ordering Guarantees
///
/// - Keys are always maintained in sorted order by their `Ord` implementation
/// - Iteration order is deterministic and corresponds to key sort order
/// - Duplicate keys are deduplicated (last write wins)
///
/// # Examples
///
/// ```rust
/// # use simdesk::sorted_vec_map::SortedVecMap;
/// let mut map = SortedVecMap::new();
/// map.insert("MSFT", 2);
/// map.insert("AAPL", 1);
///
/// let keys: Vec<_> = map.keys().copied().collect();
/// assert_eq!(keys, vec!["AAPL", "MSFT"]);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortedVecMap<K, V, const N: usize = 8> {
    inner: SmallVec<[(K, V); N]>,
}

impl<K, V, const N: usize> Default for SortedVecMap<K, V, N> {
    #[inline]
    fn default() -> Self {
        Self {
            inner: SmallVec::new(),
        }
    }
}

impl<K: Ord, V> SortedVecMap<K, V> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            inner: SmallVec::new_const(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: SmallVec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.iter().any(|(k, _)| k == key)
    }

    #[inline]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[inline]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Inserts a key-value pair, maintaining sorted order.
    ///
    /// Returns the previous value if the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        for (i, (k, v)) in self.inner.iter_mut().enumerate() {
            match key.cmp(k) {
                Ordering::Less => {
                    self.inner.insert(i, (key, value));
                    return None;
                }
                Ordering::Equal => {
                    return Some(std::mem::replace(v, value));
                }
                Ordering::Greater => continue,
            }
        }
        // Key is greater than all existing keys
        self.inner.push((key, value));
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner
            .iter()
            .position(|(k, _)| k == key)
            .map(|pos| self.inner.remove(pos).1)
    }

    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.retain_mut(|(k, v)| f(k, v));
    }

    /// Returns a mutable reference to the value for `key`, inserting the
    /// result of `default` if absent.
    pub fn get_or_insert_with<F>(&mut self, key: K, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let pos = match self.inner.iter().position(|(k, _)| *k == key) {
            Some(pos) => pos,
            None => {
                let pos = self
                    .inner
                    .iter()
                    .position(|(k, _)| *k > key)
                    .unwrap_or(self.inner.len());
                self.inner.insert(pos, (key, default()));
                pos
            }
        };
        &mut self.inner[pos].1
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.iter_mut().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, v)| (k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut().map(|(k, v)| (&*k, v))
    }
}

impl<K: Ord, V> Index<&K> for SortedVecMap<K, V> {
    type Output = V;

    fn index(&self, key: &K) -> &Self::Output {
        self.get(key).expect("no entry found for key")
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for SortedVecMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<K, V, const N: usize> IntoIterator for SortedVecMap<K, V, N> {
    type Item = (K, V);
    type IntoIter = smallvec::IntoIter<[(K, V); N]>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_keeps_sorted_order() {
        let mut map = SortedVecMap::new();
        map.insert(3, "c");
        map.insert(1, "a");
        map.insert(2, "b");
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn insert_replaces_existing() {
        let mut map = SortedVecMap::new();
        assert_eq!(map.insert(1, "a"), None);
        assert_eq!(map.insert(1, "b"), Some("a"));
        assert_eq!(map.get(&1), Some(&"b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_and_contains() {
        let mut map = SortedVecMap::new();
        map.insert(1, "a");
        assert!(map.contains_key(&1));
        assert_eq!(map.remove(&1), Some("a"));
        assert!(!map.contains_key(&1));
        assert_eq!(map.remove(&1), None);
    }

    #[test]
    fn get_or_insert_with_respects_order() {
        let mut map = SortedVecMap::new();
        map.insert(1, 10);
        map.insert(3, 30);
        *map.get_or_insert_with(2, || 0) += 20;
        let entries: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(entries, vec![(1, 10), (2, 20), (3, 30)]);
        // Existing key is not overwritten.
        assert_eq!(*map.get_or_insert_with(1, || 99), 10);
    }

    #[test]
    fn retain_filters_in_place() {
        let mut map: SortedVecMap<i32, i32> = (0..6).map(|i| (i, i * 10)).collect();
        map.retain(|k, _| k % 2 == 0);
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![0, 2, 4]);
    }
}
