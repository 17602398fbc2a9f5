//! Signed-multiplicity multisets, the payload of every difference stream.
//!
//! A [`MultiSet`] is an unordered bag of `(value, multiplicity)` pairs. A
//! positive multiplicity means "n copies present", a negative one means "n
//! copies removed". Entries are **not** merged on insertion; only
//! [`MultiSet::consolidate`] collapses entries with equal content hash,
//! summing multiplicities and dropping zeros. Every other operation
//! preserves `(value, m)` pairs untouched.

use crate::value::{ContentHash, Data};
use fnv::FnvHashMap;

/// An unordered collection of `(value, multiplicity)` pairs.
#[derive(Clone, Debug)]
pub struct MultiSet<T> {
    entries: Vec<(T, isize)>,
}

impl<T> Default for MultiSet<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> MultiSet<T> {
    /// An empty multiset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries (not the sum of multiplicities).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a single `(value, multiplicity)` pair.
    pub fn push(&mut self, value: T, multiplicity: isize) {
        self.entries.push((value, multiplicity));
    }

    /// Append all entries of `other`.
    pub fn extend(&mut self, other: MultiSet<T>) {
        self.entries.extend(other.entries);
    }

    /// Iterate over `(value, multiplicity)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = &(T, isize)> {
        self.entries.iter()
    }

    /// Consume into the underlying entries.
    pub fn into_entries(self) -> Vec<(T, isize)> {
        self.entries
    }
}

impl<T: Data> MultiSet<T> {
    /// Transform each value, preserving multiplicities.
    pub fn map<O: Data>(&self, f: impl Fn(&T) -> O) -> MultiSet<O> {
        MultiSet {
            entries: self.entries.iter().map(|(v, m)| (f(v), *m)).collect(),
        }
    }

    /// Keep entries whose value passes the predicate; multiplicities are
    /// unchanged.
    pub fn filter(&self, p: impl Fn(&T) -> bool) -> MultiSet<T> {
        MultiSet {
            entries: self.entries.iter().filter(|(v, _)| p(v)).cloned().collect(),
        }
    }

    /// Negate every multiplicity.
    pub fn negate(&self) -> MultiSet<T> {
        MultiSet {
            entries: self.entries.iter().map(|(v, m)| (v.clone(), -m)).collect(),
        }
    }
}

impl<T: Data + ContentHash> MultiSet<T> {
    /// Collapse entries with equal content hash, summing multiplicities and
    /// dropping entries whose sum is zero. Output preserves first-occurrence
    /// order, so consolidation is deterministic.
    pub fn consolidate(self) -> MultiSet<T> {
        let mut order: Vec<(T, isize)> = Vec::with_capacity(self.entries.len());
        let mut slots: FnvHashMap<u64, usize> = FnvHashMap::default();
        for (v, m) in self.entries {
            let h = v.content_hash();
            match slots.get(&h) {
                Some(&i) => order[i].1 += m,
                None => {
                    slots.insert(h, order.len());
                    order.push((v, m));
                }
            }
        }
        MultiSet {
            entries: order.into_iter().filter(|(_, m)| *m != 0).collect(),
        }
    }
}

impl<T> FromIterator<(T, isize)> for MultiSet<T> {
    fn from_iter<I: IntoIterator<Item = (T, isize)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

impl<T> IntoIterator for MultiSet<T> {
    type Item = (T, isize);
    type IntoIter = std::vec::IntoIter<(T, isize)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(entries: &[(&str, isize)]) -> MultiSet<String> {
        entries.iter().map(|(v, m)| (v.to_string(), *m)).collect()
    }

    #[test]
    fn consolidate_sums_and_drops_zeros() {
        let s = ms(&[("a", 1), ("b", 2), ("a", 2), ("b", -2), ("c", 0)]);
        let c = s.consolidate();
        assert_eq!(c.into_entries(), vec![("a".to_string(), 3)]);
    }

    #[test]
    fn consolidate_is_idempotent() {
        let s = ms(&[("a", 1), ("a", 1), ("b", -1)]);
        let once = s.clone().consolidate();
        let twice = once.clone().consolidate();
        assert_eq!(once.into_entries(), twice.into_entries());
    }

    #[test]
    fn map_and_filter_preserve_multiplicities() {
        let s = ms(&[("a", 2), ("bb", -1)]);
        let mapped = s.map(|v| v.len());
        assert_eq!(mapped.into_entries(), vec![(1, 2), (2, -1)]);

        let s = ms(&[("a", 2), ("bb", -1)]);
        let kept = s.filter(|v| v.len() == 2);
        assert_eq!(kept.into_entries(), vec![("bb".to_string(), -1)]);
    }

    #[test]
    fn negate_then_extend_cancels() {
        let s = ms(&[("a", 1), ("b", 2)]);
        let mut sum = s.clone();
        sum.extend(s.negate());
        assert!(sum.consolidate().is_empty());
    }
}
