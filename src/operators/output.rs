//! The terminal output operator.
//!
//! Accumulates per-key deltas into a hybrid index and, for each affected
//! key, compares the key's live value against what was last reported,
//! emitting insert/update/delete events. The sink — installed by the
//! live-query coordinator — receives one batch per run.

use crate::graph::{Operator, OperatorId};
use crate::index::{IndexKey, KeyedIndex};
use crate::stream::StreamReader;
use crate::value::{ContentHash, Data};
use fnv::{FnvHashMap, FnvHashSet};

/// A keyed change produced by the output operator.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent<K, V> {
    Insert { key: K, value: V },
    Update { key: K, value: V, previous: V },
    Delete { key: K, value: V },
}

impl<K, V> OutputEvent<K, V> {
    /// The key this event applies to.
    pub fn key(&self) -> &K {
        match self {
            OutputEvent::Insert { key, .. }
            | OutputEvent::Update { key, .. }
            | OutputEvent::Delete { key, .. } => key,
        }
    }
}

pub struct OutputOperator<K, V, F> {
    id: OperatorId,
    input: StreamReader<(K, V)>,
    state: KeyedIndex<K, V>,
    reported: FnvHashMap<K, V>,
    sink: F,
}

impl<K, V, F> OutputOperator<K, V, F>
where
    K: IndexKey + ContentHash,
    V: Data + ContentHash,
    F: Fn(Vec<OutputEvent<K, V>>) + Send + Sync + 'static,
{
    pub(crate) fn new(id: OperatorId, input: StreamReader<(K, V)>, sink: F) -> Self {
        Self {
            id,
            input,
            state: KeyedIndex::new(),
            reported: FnvHashMap::default(),
            sink,
        }
    }
}

impl<K, V, F> Operator for OutputOperator<K, V, F>
where
    K: IndexKey + ContentHash,
    V: Data + ContentHash,
    F: Fn(Vec<OutputEvent<K, V>>) + Send + Sync + 'static,
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
        self.state.append(delta);

        let mut events = Vec::new();
        for key in affected {
            // The key's live value: highest multiplicity wins, hash breaks
            // ties, so the choice is deterministic.
            let mut best: Option<(V, isize, u64)> = None;
            self.state.for_each_value(&key, |v, m| {
                if m > 0 {
                    let h = v.content_hash();
                    let better = match &best {
                        None => true,
                        Some((_, bm, bh)) => m > *bm || (m == *bm && h > *bh),
                    };
                    if better {
                        best = Some((v.clone(), m, h));
                    }
                }
            });

            match (self.reported.get(&key).cloned(), best) {
                (None, Some((value, _, _))) => {
                    self.reported.insert(key.clone(), value.clone());
                    events.push(OutputEvent::Insert { key, value });
                }
                (Some(previous), None) => {
                    self.reported.remove(&key);
                    events.push(OutputEvent::Delete { key, value: previous });
                }
                (Some(previous), Some((value, _, _))) => {
                    if previous.content_hash() != value.content_hash() {
                        self.reported.insert(key.clone(), value.clone());
                        events.push(OutputEvent::Update { key, value, previous });
                    }
                }
                (None, None) => {}
            }
        }

        if !events.is_empty() {
            (self.sink)(events);
        }
    }
}
