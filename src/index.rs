//! The hybrid keyed index backing join and reduce operators.
//!
//! A [`KeyedIndex`] stores, per key, the set of live `(value, multiplicity)`
//! pairs, split across two tables:
//!
//! - the **value table** (`K → (V, m)`), used while a key holds exactly one
//!   distinct value — the overwhelmingly common case; and
//! - the **hash table** (`K → (hash(V) → (V, m))`), used once a key holds
//!   two or more distinct values.
//!
//! The two tables always have disjoint keysets. Adding a second distinct
//! value to a value-table key *promotes* it to the hash table; removing a
//! value from a hash-table key so that one remains *demotes* it back. This
//! keeps iteration over the (static) majority of keys free of per-value
//! hashing.
//!
//! A key appearing in both tables is a hard invariant violation and aborts.

use crate::multiset::MultiSet;
use crate::value::{ContentHash, Data};
use fnv::FnvHashMap;
use smallvec::SmallVec;
use std::hash::Hash;

/// Key bound for the hybrid index.
pub trait IndexKey: Data + Eq + Hash {}
impl<K> IndexKey for K where K: Data + Eq + Hash {}

/// Per-key `(value, multiplicity)` store with a single-value fast path.
#[derive(Clone, Debug)]
pub struct KeyedIndex<K, V> {
    value: FnvHashMap<K, (V, isize)>,
    hashed: FnvHashMap<K, FnvHashMap<u64, (V, isize)>>,
}

impl<K, V> Default for KeyedIndex<K, V> {
    fn default() -> Self {
        Self { value: FnvHashMap::default(), hashed: FnvHashMap::default() }
    }
}

impl<K: IndexKey, V: Data + ContentHash> KeyedIndex<K, V> {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys present.
    pub fn size(&self) -> usize {
        self.value.len() + self.hashed.len()
    }

    /// True if the key holds at least one live value.
    pub fn has(&self, key: &K) -> bool {
        self.value.contains_key(key) || self.hashed.contains_key(key)
    }

    /// All live `(value, multiplicity)` pairs for `key`.
    pub fn get(&self, key: &K) -> SmallVec<[(V, isize); 1]> {
        if let Some((v, m)) = self.value.get(key) {
            let mut out = SmallVec::new();
            out.push((v.clone(), *m));
            return out;
        }
        match self.hashed.get(key) {
            Some(map) => map.values().cloned().collect(),
            None => SmallVec::new(),
        }
    }

    /// The multiplicity of `value` under `key` (0 if absent).
    pub fn get_multiplicity(&self, key: &K, value: &V) -> isize {
        let h = value.content_hash();
        if let Some((v, m)) = self.value.get(key) {
            return if v.content_hash() == h { *m } else { 0 };
        }
        self.hashed
            .get(key)
            .and_then(|map| map.get(&h))
            .map(|(_, m)| *m)
            .unwrap_or(0)
    }

    /// Iterate over the keys of the index.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.value.keys().chain(self.hashed.keys())
    }

    /// Visit each live `(value, multiplicity)` pair under `key` without
    /// materializing a list.
    pub fn for_each_value(&self, key: &K, mut f: impl FnMut(&V, isize)) {
        if let Some((v, m)) = self.value.get(key) {
            f(v, *m);
        } else if let Some(map) = self.hashed.get(key) {
            for (v, m) in map.values() {
                f(v, *m);
            }
        }
    }

    /// Add `(value, multiplicity)` under `key`, maintaining the
    /// promotion/demotion invariant. A zero multiplicity is a no-op.
    pub fn add(&mut self, key: K, value: V, multiplicity: isize) {
        if multiplicity == 0 {
            return;
        }
        let h = value.content_hash();

        if let Some(map) = self.hashed.get_mut(&key) {
            if self.value.contains_key(&key) {
                panic!("hybrid index: key present in both tables");
            }
            let entry = map.entry(h).or_insert_with(|| (value, 0));
            entry.1 += multiplicity;
            if entry.1 == 0 {
                map.remove(&h);
            }
            match map.len() {
                0 => {
                    self.hashed.remove(&key);
                }
                1 => {
                    // Demote back to the single-value table.
                    let map = self.hashed.remove(&key).expect("hash entry present");
                    let (v, m) = map.into_values().next().expect("one live value");
                    self.value.insert(key, (v, m));
                }
                _ => {}
            }
            return;
        }

        if let Some((existing, m)) = self.value.get_mut(&key) {
            if existing.content_hash() == h {
                *m += multiplicity;
                if *m == 0 {
                    self.value.remove(&key);
                }
            } else {
                // Second distinct value: promote to the hash table.
                let (v0, m0) = self.value.remove(&key).expect("value entry present");
                let mut map = FnvHashMap::default();
                map.insert(v0.content_hash(), (v0, m0));
                map.insert(h, (value, multiplicity));
                self.hashed.insert(key, map);
            }
            return;
        }

        self.value.insert(key, (value, multiplicity));
    }

    /// Bulk-merge all entries of `other` into `self`.
    pub fn append(&mut self, other: KeyedIndex<K, V>) {
        for (k, (v, m)) in other.value {
            self.add(k, v, m);
        }
        for (k, map) in other.hashed {
            for (_, (v, m)) in map {
                self.add(k.clone(), v, m);
            }
        }
    }

    /// Build an index directly from keyed delta entries.
    pub fn from_entries(entries: impl IntoIterator<Item = ((K, V), isize)>) -> Self {
        let mut index = Self::new();
        for ((k, v), m) in entries {
            index.add(k, v, m);
        }
        index
    }

    /// Symmetric keyed join: for each key present on both sides, emit
    /// `((key, (v1, v2)), m1 * m2)` for every pair of live values.
    ///
    /// The smaller side (by key count) is iterated with the per-key value
    /// visitor; the larger side is only probed, so unchanged keys on the
    /// large side are never hashed.
    pub fn join<V2: Data + ContentHash>(&self, other: &KeyedIndex<K, V2>) -> MultiSet<(K, (V, V2))> {
        let mut out = MultiSet::new();
        if self.size() <= other.size() {
            for key in self.keys() {
                if !other.has(key) {
                    continue;
                }
                self.for_each_value(key, |v1, m1| {
                    other.for_each_value(key, |v2, m2| {
                        if m1 != 0 && m2 != 0 {
                            out.push((key.clone(), (v1.clone(), v2.clone())), m1 * m2);
                        }
                    });
                });
            }
        } else {
            for key in other.keys() {
                if !self.has(key) {
                    continue;
                }
                other.for_each_value(key, |v2, m2| {
                    self.for_each_value(key, |v1, m1| {
                        if m1 != 0 && m2 != 0 {
                            out.push((key.clone(), (v1.clone(), v2.clone())), m1 * m2);
                        }
                    });
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Idx = KeyedIndex<String, String>;

    fn k(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn single_value_key_stays_in_value_table() {
        let mut idx = Idx::new();
        idx.add(k("a"), k("x"), 1);
        idx.add(k("a"), k("x"), 2);
        assert_eq!(idx.get_multiplicity(&k("a"), &k("x")), 3);
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.get(&k("a")).len(), 1);
    }

    #[test]
    fn promotion_and_demotion_round_trip() {
        let mut idx = Idx::new();
        idx.add(k("a"), k("x"), 1);
        idx.add(k("a"), k("y"), 1);
        assert_eq!(idx.get(&k("a")).len(), 2);

        // Removing one value demotes the key back to the fast path.
        idx.add(k("a"), k("x"), -1);
        let vals = idx.get(&k("a"));
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0], (k("y"), 1));

        // And the key can promote again afterwards.
        idx.add(k("a"), k("z"), 4);
        assert_eq!(idx.get(&k("a")).len(), 2);
    }

    #[test]
    fn zero_multiplicity_add_is_a_noop() {
        let mut idx = Idx::new();
        idx.add(k("a"), k("x"), 0);
        assert!(!idx.has(&k("a")));
    }

    #[test]
    fn removal_to_zero_clears_the_key() {
        let mut idx = Idx::new();
        idx.add(k("a"), k("x"), 2);
        idx.add(k("a"), k("x"), -2);
        assert!(!idx.has(&k("a")));
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn join_multiplies_multiplicities() {
        let mut left = Idx::new();
        left.add(k("a"), k("l1"), 2);
        left.add(k("b"), k("l2"), 1);
        let mut right = Idx::new();
        right.add(k("a"), k("r1"), 3);
        right.add(k("c"), k("r2"), 1);

        let out = left.join(&right).consolidate();
        let entries = out.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], ((k("a"), (k("l1"), k("r1"))), 6));
    }

    #[test]
    fn join_emits_all_value_pairs() {
        let mut left = Idx::new();
        left.add(k("a"), k("l1"), 1);
        left.add(k("a"), k("l2"), 1);
        let mut right = Idx::new();
        right.add(k("a"), k("r1"), 1);
        right.add(k("a"), k("r2"), 1);
        // Pad the right side so the left side is the iterated one.
        right.add(k("z"), k("pad"), 1);

        let out = left.join(&right).consolidate();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn append_merges_entries() {
        let mut a = Idx::new();
        a.add(k("a"), k("x"), 1);
        let mut b = Idx::new();
        b.add(k("a"), k("x"), -1);
        b.add(k("b"), k("y"), 1);
        a.append(b);
        assert!(!a.has(&k("a")));
        assert!(a.has(&k("b")));
    }
}
