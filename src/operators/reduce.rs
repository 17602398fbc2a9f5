//! The reduce operator: per-key folds with incremental retraction.

use crate::graph::{Operator, OperatorId};
use crate::index::{IndexKey, KeyedIndex};
use crate::multiset::MultiSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::value::{ContentHash, Data};
use fnv::FnvHashSet;

/// Groups input by key in a hybrid index and applies a user fold over the
/// key's `(value, multiplicity)` list. On each delta batch only affected
/// keys are re-folded; the difference against the previously emitted rows
/// for that key is pushed downstream, so consumers see retractions and
/// assertions rather than recomputed snapshots.
pub struct ReduceOperator<K, V, R, F> {
    id: OperatorId,
    input: StreamReader<(K, V)>,
    output: StreamWriter<(K, R)>,
    index: KeyedIndex<K, V>,
    emitted: KeyedIndex<K, R>,
    fold: F,
}

impl<K, V, R, F> ReduceOperator<K, V, R, F>
where
    K: IndexKey + ContentHash,
    V: Data + ContentHash,
    R: Data + ContentHash,
    F: Fn(&[(V, isize)]) -> Vec<(R, isize)> + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: OperatorId,
        input: StreamReader<(K, V)>,
        output: StreamWriter<(K, R)>,
        fold: F,
    ) -> Self {
        Self {
            id,
            input,
            output,
            index: KeyedIndex::new(),
            emitted: KeyedIndex::new(),
            fold,
        }
    }
}

impl<K, V, R, F> Operator for ReduceOperator<K, V, R, F>
where
    K: IndexKey + ContentHash,
    V: Data + ContentHash,
    R: Data + ContentHash,
    F: Fn(&[(V, isize)]) -> Vec<(R, isize)> + Send + Sync + 'static,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.input.has_pending()
    }

    fn run(&mut self) {
        let mut delta = KeyedIndex::new();
        for message in self.input.drain() {
            for ((k, v), m) in message {
                delta.add(k, v, m);
            }
        }
        if delta.size() == 0 {
            return;
        }

        let affected: FnvHashSet<K> = delta.keys().cloned().collect();
        self.index.append(delta);

        let mut out = MultiSet::new();
        for key in affected {
            let inputs: Vec<(V, isize)> = self.index.get(&key).into_vec();
            let fresh = if inputs.is_empty() { Vec::new() } else { (self.fold)(&inputs) };

            // Difference against what was last emitted for this key.
            let mut diff = MultiSet::new();
            for (r, m) in fresh {
                diff.push(r, m);
            }
            self.emitted.for_each_value(&key, |r, m| {
                diff.push(r.clone(), -m);
            });

            for (r, m) in diff.consolidate() {
                self.emitted.add(key.clone(), r.clone(), m);
                out.push((key.clone(), r), m);
            }
        }

        if !out.is_empty() {
            self.output.send(out);
        }
    }
}
