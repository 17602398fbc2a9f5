//! The outward surface the engine consumes from source collections.
//!
//! The IVM core treats every source as an abstract keyed change stream plus
//! a handful of capabilities: current-state snapshots, demand-driven subset
//! loading, queryable field indexes, and status events. Anything that
//! implements [`SourceCollection`] can feed a live query; the in-memory
//! reference implementation lives in [`local`](crate::local).

use crate::changes::{ChangeBatch, SourceChange};
use crate::expr::Expr;
use crate::ir::Direction;
use crate::scheduler::TransactionScheduler;
use crate::status::{CollectionStatus, StatusChange};
use crate::value::KeyValue;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Callback receiving change batches.
pub type ChangeCallback = Arc<dyn Fn(ChangeBatch) + Send + Sync>;

/// Callback receiving status transitions.
pub type StatusCallback = Arc<dyn Fn(StatusChange) + Send + Sync>;

/// Releases a subscription when invoked.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Options for [`SourceCollection::subscribe_changes`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Deliver the current state as inserts before live changes.
    pub include_initial_state: bool,
    /// Root-relative filter applied to the delivered initial state.
    pub where_expression: Option<Expr>,
}

/// A demand-driven load request.
#[derive(Clone, Default)]
pub struct LoadSubsetRequest {
    /// Root-relative filter over records.
    pub where_expression: Option<Expr>,
    pub limit: Option<usize>,
    /// Field path and direction to load in order.
    pub order_by: Option<(Vec<String>, Direction)>,
}

/// Result of [`SourceCollection::load_subset`]: either the data is already
/// present (or not needed), or a handle that settles when it lands.
pub enum LoadSubset {
    Loaded,
    Pending(PendingHandle),
}

/// Comparison operators a field index may support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

/// A queryable index over one field path of a source collection.
pub trait FieldIndex: Send + Sync {
    /// The indexed field path.
    fn field_path(&self) -> &[String];

    /// Whether `op` lookups are supported.
    fn supports(&self, op: IndexOp) -> bool;

    /// Keys whose indexed value satisfies `op value`.
    fn lookup(&self, op: IndexOp, value: &Value) -> Vec<KeyValue>;

    /// Up to `n` `(indexed value, key)` pairs in ascending value order,
    /// starting strictly after `from_exclusive`, keeping only keys passing
    /// `filter`.
    fn take(
        &self,
        n: usize,
        from_exclusive: Option<&Value>,
        filter: Option<&(dyn Fn(&KeyValue) -> bool)>,
    ) -> Vec<(Value, KeyValue)>;
}

/// The abstract keyed change stream the engine consumes.
pub trait SourceCollection: Send + Sync {
    /// Stable collection id.
    fn id(&self) -> String;

    /// Number of items currently synced.
    fn size(&self) -> usize;

    /// Current lifecycle status.
    fn status(&self) -> CollectionStatus;

    /// Convenience: `status() == Ready`.
    fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    /// Look up an item by key.
    fn get(&self, key: &KeyValue) -> Option<Value>;

    /// True if the key is present.
    fn has(&self, key: &KeyValue) -> bool {
        self.get(key).is_some()
    }

    /// Extract the key of an item.
    fn key_of(&self, item: &Value) -> Option<KeyValue>;

    /// Subscribe to change batches.
    fn subscribe_changes(&self, cb: ChangeCallback, options: SubscribeOptions) -> Unsubscribe;

    /// The current state as insert changes, filtered by the where clause.
    /// `None` signals that no suitable index exists for this clause and the
    /// caller should fall back to an unfiltered subscription.
    fn current_state_as_changes(&self, where_expression: Option<&Expr>) -> Option<Vec<SourceChange>>;

    /// Ask the source to materialize more data.
    fn load_subset(&self, request: LoadSubsetRequest) -> LoadSubset;

    /// The index over `path`, if one exists.
    fn index_for_field(&self, path: &[String]) -> Option<Arc<dyn FieldIndex>>;

    /// Hint that an index over `path` would be useful; collections
    /// configured for auto-indexing create it (possibly asynchronously).
    fn ensure_index_for_field(&self, path: &[String]);

    /// Subscribe to `status:change` events.
    fn on_status_change(&self, cb: StatusCallback) -> Unsubscribe;

    /// A handle that resolves once the collection is ready.
    fn preload(&self) -> PendingHandle;

    /// The transaction scheduler this source's transactions flush through.
    fn transaction_scheduler(&self) -> TransactionScheduler {
        TransactionScheduler::global().clone()
    }
}

// |------------------|
// | Pending handles  |
// |------------------|

type SettleCallback = Box<dyn FnOnce(&Result<(), String>) + Send>;

struct PendingState {
    settled: Option<Result<(), String>>,
    callbacks: Vec<SettleCallback>,
}

/// Completion handle for asynchronous boundary operations (`load_subset`,
/// `preload`). Settles at most once; callbacks registered after settlement
/// fire immediately. Cancellation is cooperative — a dropped handle that
/// never settles simply stops mattering.
#[derive(Clone)]
pub struct PendingHandle {
    inner: Arc<Mutex<PendingState>>,
}

impl Default for PendingHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingHandle {
    /// A fresh, unsettled handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PendingState { settled: None, callbacks: Vec::new() })),
        }
    }

    /// An already-resolved handle.
    pub fn resolved() -> Self {
        let handle = Self::new();
        handle.resolve();
        handle
    }

    /// Settle successfully. Later settle calls are no-ops.
    pub fn resolve(&self) {
        self.settle(Ok(()));
    }

    /// Settle with a failure message.
    pub fn fail(&self, message: impl Into<String>) {
        self.settle(Err(message.into()));
    }

    fn settle(&self, result: Result<(), String>) {
        let callbacks = {
            let mut state = self.inner.lock().unwrap();
            if state.settled.is_some() {
                return;
            }
            state.settled = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        for cb in callbacks {
            cb(&result);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().unwrap().settled.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.lock().unwrap().settled, Some(Ok(())))
    }

    /// Run `cb` when the handle settles (immediately if it already has).
    pub fn on_settle(&self, cb: impl FnOnce(&Result<(), String>) + Send + 'static) {
        let settled = {
            let mut state = self.inner.lock().unwrap();
            match &state.settled {
                Some(result) => Some(result.clone()),
                None => {
                    state.callbacks.push(Box::new(cb));
                    return;
                }
            }
        };
        if let Some(result) = settled {
            cb(&result);
        }
    }
}
