//! The keyed join operator.
//!
//! The operator maintains a hybrid index per side. For each batch of input
//! deltas it computes the matched part bilinearly — delta-left against the
//! old right index, then the updated left index against delta-right — and
//! the outer-kind null-padded part as the difference between the padding
//! before and after the deltas are applied to the affected keys.
//!
//! Output rows are `(key, (Option<left>, Option<right>))` with `None` slots
//! only for the outer kinds, and are pre-consolidation: a consolidate
//! operator is expected downstream.

use crate::graph::{Operator, OperatorId};
use crate::index::{IndexKey, KeyedIndex};
use crate::multiset::MultiSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::value::{ContentHash, Data};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};

/// Supported join kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    /// True if unmatched left rows are emitted with a `None` right slot.
    pub fn keeps_left(&self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Full)
    }

    /// True if unmatched right rows are emitted with a `None` left slot.
    pub fn keeps_right(&self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Full)
    }
}

type JoinOutput<K, V1, V2> = MultiSet<(K, (Option<V1>, Option<V2>))>;

pub struct JoinOperator<K, V1, V2> {
    id: OperatorId,
    kind: JoinKind,
    left: StreamReader<(K, V1)>,
    right: StreamReader<(K, V2)>,
    index_left: KeyedIndex<K, V1>,
    index_right: KeyedIndex<K, V2>,
    output: StreamWriter<(K, (Option<V1>, Option<V2>))>,
}

impl<K, V1, V2> JoinOperator<K, V1, V2>
where
    K: IndexKey + ContentHash,
    V1: Data + ContentHash,
    V2: Data + ContentHash,
{
    pub(crate) fn new(
        id: OperatorId,
        kind: JoinKind,
        left: StreamReader<(K, V1)>,
        right: StreamReader<(K, V2)>,
        output: StreamWriter<(K, (Option<V1>, Option<V2>))>,
    ) -> Self {
        Self {
            id,
            kind,
            left,
            right,
            index_left: KeyedIndex::new(),
            index_right: KeyedIndex::new(),
            output,
        }
    }

    // Null-padded rows for one key under the current index state: left rows
    // with no right match, right rows with no left match.
    fn null_padding(&self, key: &K, out: &mut JoinOutput<K, V1, V2>, negate: bool) {
        let sign = if negate { -1 } else { 1 };
        if self.kind.keeps_left() && !self.index_right.has(key) {
            self.index_left.for_each_value(key, |v, m| {
                out.push((key.clone(), (Some(v.clone()), None)), sign * m);
            });
        }
        if self.kind.keeps_right() && !self.index_left.has(key) {
            self.index_right.for_each_value(key, |v, m| {
                out.push((key.clone(), (None, Some(v.clone()))), sign * m);
            });
        }
    }
}

impl<K, V1, V2> Operator for JoinOperator<K, V1, V2>
where
    K: IndexKey + ContentHash,
    V1: Data + ContentHash,
    V2: Data + ContentHash,
{
    fn id(&self) -> OperatorId {
        self.id
    }

    fn pending_work(&self) -> bool {
        self.left.has_pending() || self.right.has_pending()
    }

    fn run(&mut self) {
        let mut delta_left = KeyedIndex::new();
        for message in self.left.drain() {
            for ((k, v), m) in message {
                delta_left.add(k, v, m);
            }
        }
        let mut delta_right = KeyedIndex::new();
        for message in self.right.drain() {
            for ((k, v), m) in message {
                delta_right.add(k, v, m);
            }
        }
        if delta_left.size() == 0 && delta_right.size() == 0 {
            return;
        }

        let affected: FnvHashSet<K> =
            delta_left.keys().chain(delta_right.keys()).cloned().collect();

        let mut out = MultiSet::new();

        // Retract the null padding of affected keys as it stood before.
        if self.kind != JoinKind::Inner {
            for key in &affected {
                self.null_padding(key, &mut out, true);
            }
        }

        // Matched part: ΔL ⋈ R_old, then L_new ⋈ ΔR.
        out.extend(
            delta_left
                .join(&self.index_right)
                .map(|(k, (v1, v2))| (k.clone(), (Some(v1.clone()), Some(v2.clone())))),
        );
        self.index_left.append(delta_left);
        out.extend(
            self.index_left
                .join(&delta_right)
                .map(|(k, (v1, v2))| (k.clone(), (Some(v1.clone()), Some(v2.clone())))),
        );
        self.index_right.append(delta_right);

        // Assert the null padding of affected keys as it stands now.
        if self.kind != JoinKind::Inner {
            for key in &affected {
                self.null_padding(key, &mut out, false);
            }
        }

        if !out.is_empty() {
            self.output.send(out);
        }
    }
}
