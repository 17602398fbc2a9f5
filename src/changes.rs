//! Change messages exchanged with source collections and result consumers.

use crate::value::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a keyed change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One keyed change on a source collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceChange {
    pub kind: ChangeKind,
    pub key: KeyValue,
    pub value: Value,
    /// The value being replaced, present on updates when known.
    pub previous: Option<Value>,
}

impl SourceChange {
    pub fn insert(key: impl Into<KeyValue>, value: Value) -> Self {
        Self { kind: ChangeKind::Insert, key: key.into(), value, previous: None }
    }

    pub fn update(key: impl Into<KeyValue>, value: Value, previous: Option<Value>) -> Self {
        Self { kind: ChangeKind::Update, key: key.into(), value, previous }
    }

    pub fn delete(key: impl Into<KeyValue>, value: Value) -> Self {
        Self { kind: ChangeKind::Delete, key: key.into(), value, previous: None }
    }
}

/// A batch of source changes, tagged with the transaction context that
/// produced it (if any). All changes of one transaction flush arrive in one
/// batch per collection.
#[derive(Clone, Debug)]
pub struct ChangeBatch {
    pub changes: Vec<SourceChange>,
    /// Transaction context id; batches carrying one are buffered and run
    /// via the transaction-scoped scheduler.
    pub context: Option<u64>,
}

/// One keyed change on a live-query result collection.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultChange {
    pub kind: ChangeKind,
    pub key: KeyValue,
    pub value: Value,
    /// The replaced value on updates and deletes.
    pub previous: Option<Value>,
    /// Fractional index for ordered queries.
    pub order_key: Option<String>,
}
