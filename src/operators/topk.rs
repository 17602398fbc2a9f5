//! Ordered-window maintenance with fractional indices.
//!
//! [`OrderByOperator`] keeps, over its input stream, a per-element net
//! multiplicity and the ordered sequence of live elements (net multiplicity
//! positive). The window `[offset, offset+limit)` of that sequence is
//! emitted downstream, each element paired with a fractional index string.
//!
//! When the window shifts, elements that keep their relative order keep
//! their fractional index; everything else is retracted and re-emitted with
//! a fresh index generated between its neighbors, so a window move touches
//! only the rows that actually moved.
//!
//! The optional size callback is invoked once, at construction, with a probe
//! returning the live window size; the coordinator uses it to decide how
//! many more rows an index-backed subscription must load.

use crate::fractional::key_between;
use crate::graph::{Operator, OperatorId};
use crate::multiset::MultiSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::value::{mix, ContentHash, Data};
use fnv::FnvHashMap;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

/// Comparator over stream values.
pub type Comparator<V> = Arc<dyn Fn(&V, &V) -> Ordering + Send + Sync>;

/// Probe returning the current number of elements in the window.
pub type WindowSizeProbe = Arc<dyn Fn() -> usize + Send + Sync>;

/// Invoked once with the window-size probe.
pub type SizeCallback = Box<dyn FnOnce(WindowSizeProbe) + Send>;

/// Options for [`DiffStream::order_by_with_fractional_index`](crate::stream::DiffStream::order_by_with_fractional_index).
pub struct OrderByOptions<V> {
    /// Window length; `None` means unbounded.
    pub limit: Option<usize>,
    /// Number of leading elements skipped.
    pub offset: usize,
    /// Total order over values.
    pub comparator: Comparator<V>,
    /// Receives the window-size probe at construction.
    pub size_callback: Option<SizeCallback>,
}

struct Entry<K, V> {
    key: K,
    value: V,
    mult: isize,
}

pub struct OrderByOperator<K, V> {
    id: OperatorId,
    input: StreamReader<(K, V)>,
    output: StreamWriter<(K, (V, String))>,
    comparator: Comparator<V>,
    offset: usize,
    limit: usize,
    /// Element hash → entry; `mult` may be non-positive transiently.
    counts: FnvHashMap<u64, Entry<K, V>>,
    /// Hashes of live elements, sorted by `(comparator, hash)`.
    ordered: Vec<u64>,
    /// Window members as last emitted: hash → (key, value, fractional index).
    assigned: FnvHashMap<u64, (K, V, String)>,
    window_size: Arc<Mutex<usize>>,
}

impl<K, V> OrderByOperator<K, V>
where
    K: Data + ContentHash,
    V: Data + ContentHash,
{
    pub(crate) fn new(
        id: OperatorId,
        input: StreamReader<(K, V)>,
        output: StreamWriter<(K, (V, String))>,
        options: OrderByOptions<V>,
    ) -> Self {
        let window_size = Arc::new(Mutex::new(0usize));
        if let Some(callback) = options.size_callback {
            let shared = Arc::clone(&window_size);
            callback(Arc::new(move || *shared.lock().unwrap()));
        }
        Self {
            id,
            input,
            output,
            comparator: options.comparator,
            offset: options.offset,
            limit: options.limit.unwrap_or(usize::MAX),
            counts: FnvHashMap::default(),
            ordered: Vec::new(),
            assigned: FnvHashMap::default(),
            window_size,
        }
    }

    // Position of `(value, hash)` in the live ordering.
    fn search(&self, value: &V, hash: u64) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.ordered.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let candidate = self.ordered[mid];
            let entry = &self.counts[&candidate];
            match (self.comparator)(&entry.value, value).then(candidate.cmp(&hash)) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn apply_delta(&mut self, hash: u64, key: K, value: V, delta: isize) {
        let old_mult = self.counts.get(&hash).map(|e| e.mult).unwrap_or(0);
        let new_mult = old_mult + delta;

        if old_mult > 0 && new_mult <= 0 {
            if let Ok(idx) = self.search(&value, hash) {
                self.ordered.remove(idx);
            }
        }
        if new_mult == 0 {
            self.counts.remove(&hash);
        } else {
            self.counts.insert(hash, Entry { key, value: value.clone(), mult: new_mult });
        }
        if old_mult <= 0 && new_mult > 0 {
            if let Err(idx) = self.search(&value, hash) {
                self.ordered.insert(idx, hash);
            }
        }
    }
}

impl<K, V> Operator for OrderByOperator<K, V>
where
    K: Data + ContentHash,
    V: Data + ContentHash,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        // Net the batch per element before touching the ordering.
        let mut deltas: FnvHashMap<u64, (K, V, isize)> = FnvHashMap::default();
        let mut order: Vec<u64> = Vec::new();
        for message in self.input.drain() {
            for ((k, v), m) in message {
                let h = mix(k.content_hash(), v.content_hash());
                match deltas.get_mut(&h) {
                    Some(slot) => slot.2 += m,
                    None => {
                        deltas.insert(h, (k, v, m));
                        order.push(h);
                    }
                }
            }
        }
        if deltas.is_empty() {
            return;
        }
        for h in order {
            let (k, v, dm) = deltas.remove(&h).expect("delta recorded");
            if dm != 0 {
                self.apply_delta(h, k, v, dm);
            }
        }

        // Current window of the live ordering.
        let len = self.ordered.len();
        let start = self.offset.min(len);
        let end = self.offset.saturating_add(self.limit).min(len);
        let window: Vec<u64> = self.ordered[start..end].to_vec();
        *self.window_size.lock().unwrap() = window.len();

        // Keep the fractional indices that still form an increasing run.
        let mut keep: FnvHashMap<u64, String> = FnvHashMap::default();
        let mut last_kept: Option<String> = None;
        for h in &window {
            if let Some((_, _, fi)) = self.assigned.get(h) {
                if last_kept.as_deref().map(|prev| prev < fi.as_str()).unwrap_or(true) {
                    keep.insert(*h, fi.clone());
                    last_kept = Some(fi.clone());
                }
            }
        }

        // Upper bound for regenerated indices: the next kept index after
        // each position.
        let mut next_kept: Vec<Option<String>> = vec![None; window.len() + 1];
        for i in (0..window.len()).rev() {
            next_kept[i] = match keep.get(&window[i]) {
                Some(fi) => Some(fi.clone()),
                None => next_kept[i + 1].clone(),
            };
        }

        let mut fresh: FnvHashMap<u64, (K, V, String)> = FnvHashMap::default();
        let mut prev: Option<String> = None;
        for (i, h) in window.iter().enumerate() {
            let entry = &self.counts[h];
            let fi = match keep.get(h) {
                Some(fi) => fi.clone(),
                None => key_between(prev.as_deref(), next_kept[i + 1].as_deref()),
            };
            fresh.insert(*h, (entry.key.clone(), entry.value.clone(), fi.clone()));
            prev = Some(fi);
        }

        // Retract departures and moves, assert arrivals and moves.
        let mut out = MultiSet::new();
        for (h, (k, v, fi)) in &self.assigned {
            match fresh.get(h) {
                Some((_, _, nfi)) if nfi == fi => {}
                _ => out.push((k.clone(), (v.clone(), fi.clone())), -1),
            }
        }
        for (h, (k, v, fi)) in &fresh {
            match self.assigned.get(h) {
                Some((_, _, ofi)) if ofi == fi => {}
                _ => out.push((k.clone(), (v.clone(), fi.clone())), 1),
            }
        }
        self.assigned = fresh;

        if !out.is_empty() {
            self.output.send(out);
        }
    }
}
