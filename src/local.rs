//! In-memory reference source collection.
//!
//! [`LocalCollection`] is the keyed, transactional, indexable backend the
//! test-suite and embedders without a sync layer use. It implements the
//! full [`SourceCollection`] surface: change subscriptions with optional
//! initial state, current-state snapshots, `load_subset` (trivially
//! satisfied — everything is in memory), sorted field indexes over the
//! total value order, and lifecycle status with `status:change` events.
//!
//! Mutations go through [`Transaction`]: a transaction stages operations
//! against any number of collections, applies and emits them per collection
//! on commit — tagged with the transaction's context id — and then flushes
//! the transaction scheduler once, so live queries over several of the
//! collections run their graphs exactly once. The single-op convenience
//! methods (`insert`, `update`, `delete`) wrap one-shot transactions.
//!
//! A truncate staged mid-transaction first emits deletes for every
//! previously synced key, then the operations staged after it, preserving
//! arrival order.

use crate::changes::{ChangeBatch, SourceChange};
use crate::expr::Expr;
use crate::scheduler::TransactionScheduler;
use crate::source::{
    ChangeCallback, FieldIndex, IndexOp, LoadSubset, LoadSubsetRequest, PendingHandle,
    SourceCollection, StatusCallback, SubscribeOptions, Unsubscribe,
};
use crate::status::{transition, CollectionStatus, StatusChange};
use crate::value::{value_compare, KeyValue, OrdValue};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Configuration for a [`LocalCollection`].
#[derive(Clone, Debug)]
pub struct LocalCollectionConfig {
    /// Stable collection id.
    pub id: String,
    /// Field path the key is extracted from.
    pub key_path: Vec<String>,
    /// Create field indexes on demand when the compiler hints at them.
    pub auto_index: bool,
}

impl LocalCollectionConfig {
    /// A collection keyed by the top-level `id` field, with auto-indexing.
    pub fn keyed_by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key_path: vec!["id".to_string()],
            auto_index: true,
        }
    }
}

// |---------------|
// | Field indexes |
// |---------------|

struct IndexData {
    map: BTreeMap<OrdValue, BTreeSet<KeyValue>>,
}

/// A sorted index over one field path, shared between the collection (which
/// maintains it) and subscriptions (which query it).
#[derive(Clone)]
pub struct LocalFieldIndex {
    path: Vec<String>,
    data: Arc<Mutex<IndexData>>,
}

fn walk_record<'a>(record: &'a Value, path: &[String]) -> &'a Value {
    let mut v = record;
    for segment in path {
        match v.get(segment) {
            Some(next) => v = next,
            None => return &Value::Null,
        }
    }
    v
}

impl LocalFieldIndex {
    fn new(path: Vec<String>) -> Self {
        Self { path, data: Arc::new(Mutex::new(IndexData { map: BTreeMap::new() })) }
    }

    fn add(&self, record: &Value, key: &KeyValue) {
        let value = walk_record(record, &self.path).clone();
        let mut data = self.data.lock().unwrap();
        data.map.entry(OrdValue(value)).or_default().insert(key.clone());
    }

    fn remove(&self, record: &Value, key: &KeyValue) {
        let value = walk_record(record, &self.path).clone();
        let mut data = self.data.lock().unwrap();
        if let Some(keys) = data.map.get_mut(&OrdValue(value.clone())) {
            keys.remove(key);
            if keys.is_empty() {
                data.map.remove(&OrdValue(value));
            }
        }
    }

    fn clear(&self) {
        self.data.lock().unwrap().map.clear();
    }
}

impl FieldIndex for LocalFieldIndex {
    fn field_path(&self) -> &[String] {
        &self.path
    }

    fn supports(&self, _op: IndexOp) -> bool {
        true
    }

    fn lookup(&self, op: IndexOp, value: &Value) -> Vec<KeyValue> {
        let data = self.data.lock().unwrap();
        let mut out = Vec::new();
        match op {
            IndexOp::Eq => {
                if let Some(keys) = data.map.get(&OrdValue(value.clone())) {
                    out.extend(keys.iter().cloned());
                }
            }
            IndexOp::In => {
                if let Value::Array(items) = value {
                    for item in items {
                        if let Some(keys) = data.map.get(&OrdValue(item.clone())) {
                            out.extend(keys.iter().cloned());
                        }
                    }
                }
            }
            IndexOp::Gt | IndexOp::Gte | IndexOp::Lt | IndexOp::Lte => {
                for (candidate, keys) in data.map.iter() {
                    let ord = value_compare(&candidate.0, value);
                    let keep = match op {
                        IndexOp::Gt => ord == std::cmp::Ordering::Greater,
                        IndexOp::Gte => ord != std::cmp::Ordering::Less,
                        IndexOp::Lt => ord == std::cmp::Ordering::Less,
                        IndexOp::Lte => ord != std::cmp::Ordering::Greater,
                        _ => unreachable!(),
                    };
                    if keep {
                        out.extend(keys.iter().cloned());
                    }
                }
            }
        }
        out
    }

    fn take(
        &self,
        n: usize,
        from_exclusive: Option<&Value>,
        filter: Option<&(dyn Fn(&KeyValue) -> bool)>,
    ) -> Vec<(Value, KeyValue)> {
        let data = self.data.lock().unwrap();
        let mut out = Vec::new();
        for (value, keys) in data.map.iter() {
            if let Some(from) = from_exclusive {
                if value_compare(&value.0, from) != std::cmp::Ordering::Greater {
                    continue;
                }
            }
            for key in keys {
                if let Some(filter) = filter {
                    if !filter(key) {
                        continue;
                    }
                }
                out.push((value.0.clone(), key.clone()));
                if out.len() == n {
                    return out;
                }
            }
        }
        out
    }
}

// |------------------|
// | Local collection |
// |------------------|

struct LocalInner {
    config: LocalCollectionConfig,
    items: BTreeMap<KeyValue, Value>,
    status: CollectionStatus,
    next_subscriber: u64,
    subscribers: HashMap<u64, ChangeCallback>,
    status_subscribers: HashMap<u64, StatusCallback>,
    indexes: HashMap<String, LocalFieldIndex>,
    ready_waiters: Vec<PendingHandle>,
    scheduler: TransactionScheduler,
}

/// An in-memory, transactional keyed source collection.
#[derive(Clone)]
pub struct LocalCollection {
    inner: Arc<Mutex<LocalInner>>,
}

enum StagedOp {
    Insert(Value),
    Update(KeyValue, Value),
    Delete(KeyValue),
    Truncate,
}

impl LocalCollection {
    /// Create a collection using the process-wide transaction scheduler.
    pub fn new(config: LocalCollectionConfig) -> Self {
        Self::with_scheduler(config, TransactionScheduler::global().clone())
    }

    /// Create a collection flushing through a specific scheduler.
    pub fn with_scheduler(config: LocalCollectionConfig, scheduler: TransactionScheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LocalInner {
                config,
                items: BTreeMap::new(),
                status: CollectionStatus::Idle,
                next_subscriber: 0,
                subscribers: HashMap::new(),
                status_subscribers: HashMap::new(),
                indexes: HashMap::new(),
                ready_waiters: Vec::new(),
                scheduler,
            })),
        }
    }

    /// Insert a single item (one-shot transaction).
    pub fn insert(&self, value: Value) -> Result<()> {
        let mut tx = Transaction::begin();
        tx.insert(self, value)?;
        tx.commit();
        Ok(())
    }

    /// Replace the item stored under `key` (one-shot transaction).
    pub fn update(&self, key: impl Into<KeyValue>, value: Value) {
        let mut tx = Transaction::begin();
        tx.update(self, key, value);
        tx.commit();
    }

    /// Delete the item stored under `key` (one-shot transaction).
    pub fn delete(&self, key: impl Into<KeyValue>) {
        let mut tx = Transaction::begin();
        tx.delete(self, key);
        tx.commit();
    }

    /// Mark the collection ready, resolving preload handles. Walks the
    /// legal status path (idle → loading → ready).
    pub fn mark_ready(&self) {
        let waiters;
        let events;
        {
            let mut inner = self.inner.lock().unwrap();
            events = advance_status(&mut inner.status, CollectionStatus::Ready);
            waiters = std::mem::take(&mut inner.ready_waiters);
        }
        self.emit_status(events);
        for waiter in waiters {
            waiter.resolve();
        }
    }

    /// Put the collection into the error state.
    pub fn mark_error(&self) {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            advance_status(&mut inner.status, CollectionStatus::Error)
        };
        self.emit_status(events);
    }

    /// Tear the collection down: drop synced data and indexes and move to
    /// cleaned-up. Live dependents observe the transition and error out.
    pub fn cleanup(&self) {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            inner.items.clear();
            for index in inner.indexes.values() {
                index.clear();
            }
            advance_status(&mut inner.status, CollectionStatus::CleanedUp)
        };
        self.emit_status(events);
    }

    /// Create the index over `path` if it does not exist yet.
    pub fn create_index(&self, path: &[String]) -> Arc<dyn FieldIndex> {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            let dotted = path.join(".");
            if let Some(existing) = inner.indexes.get(&dotted) {
                existing.clone()
            } else {
                let index = LocalFieldIndex::new(path.to_vec());
                for (key, record) in inner.items.iter() {
                    index.add(record, key);
                }
                inner.indexes.insert(dotted, index.clone());
                index
            }
        };
        Arc::new(index)
    }

    fn emit_status(&self, events: Vec<StatusChange>) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<StatusCallback> = {
            let inner = self.inner.lock().unwrap();
            inner.status_subscribers.values().cloned().collect()
        };
        for event in events {
            for cb in &callbacks {
                cb(event);
            }
        }
    }

    // Apply staged operations under the lock, returning the emitted changes.
    fn apply(&self, ops: Vec<StagedOp>) -> Vec<SourceChange> {
        let mut inner = self.inner.lock().unwrap();
        let mut changes = Vec::new();
        for op in ops {
            match op {
                StagedOp::Insert(value) => {
                    let key = key_of_record(&inner.config.key_path, &value)
                        .expect("validated at staging time");
                    apply_one(&mut inner, &mut changes, key, Some(value));
                }
                StagedOp::Update(key, value) => {
                    apply_one(&mut inner, &mut changes, key, Some(value));
                }
                StagedOp::Delete(key) => {
                    apply_one(&mut inner, &mut changes, key, None);
                }
                StagedOp::Truncate => {
                    let keys: Vec<KeyValue> = inner.items.keys().cloned().collect();
                    for key in keys {
                        apply_one(&mut inner, &mut changes, key, None);
                    }
                }
            }
        }
        changes
    }

    fn notify(&self, changes: Vec<SourceChange>, context: Option<u64>) {
        if changes.is_empty() {
            return;
        }
        let callbacks: Vec<ChangeCallback> = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.values().cloned().collect()
        };
        let batch = ChangeBatch { changes, context };
        for cb in callbacks {
            cb(batch.clone());
        }
    }
}

fn key_of_record(key_path: &[String], record: &Value) -> Option<KeyValue> {
    KeyValue::from_value(walk_record(record, key_path))
}

// Upsert/delete one key, maintaining indexes and recording the change.
fn apply_one(
    inner: &mut LocalInner,
    changes: &mut Vec<SourceChange>,
    key: KeyValue,
    value: Option<Value>,
) {
    let previous = inner.items.get(&key).cloned();
    match (previous, value) {
        (None, Some(value)) => {
            for index in inner.indexes.values() {
                index.add(&value, &key);
            }
            inner.items.insert(key.clone(), value.clone());
            changes.push(SourceChange::insert(key, value));
        }
        (Some(previous), Some(value)) => {
            for index in inner.indexes.values() {
                index.remove(&previous, &key);
                index.add(&value, &key);
            }
            inner.items.insert(key.clone(), value.clone());
            changes.push(SourceChange::update(key, value, Some(previous)));
        }
        (Some(previous), None) => {
            for index in inner.indexes.values() {
                index.remove(&previous, &key);
            }
            inner.items.remove(&key);
            changes.push(SourceChange::delete(key, previous));
        }
        (None, None) => {}
    }
}

// Walk the legal transition path towards `target`, collecting each step.
fn advance_status(status: &mut CollectionStatus, target: CollectionStatus) -> Vec<StatusChange> {
    let mut events = Vec::new();
    let mut step = |status: &mut CollectionStatus, next: CollectionStatus| {
        if *status != next {
            if let Ok(previous) = transition(status, next) {
                events.push(StatusChange { status: next, previous_status: previous });
            }
        }
    };
    match target {
        CollectionStatus::Ready => {
            if *status == CollectionStatus::Error {
                step(status, CollectionStatus::Idle);
            }
            if *status == CollectionStatus::Idle || *status == CollectionStatus::CleanedUp {
                step(status, CollectionStatus::Loading);
            }
            step(status, CollectionStatus::Ready);
        }
        other => step(status, other),
    }
    events
}

impl SourceCollection for LocalCollection {
    fn id(&self) -> String {
        self.inner.lock().unwrap().config.id.clone()
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    fn status(&self) -> CollectionStatus {
        self.inner.lock().unwrap().status
    }

    fn get(&self, key: &KeyValue) -> Option<Value> {
        self.inner.lock().unwrap().items.get(key).cloned()
    }

    fn key_of(&self, item: &Value) -> Option<KeyValue> {
        let inner = self.inner.lock().unwrap();
        key_of_record(&inner.config.key_path, item)
    }

    fn subscribe_changes(&self, cb: ChangeCallback, options: SubscribeOptions) -> Unsubscribe {
        let initial = if options.include_initial_state {
            self.current_state_as_changes(options.where_expression.as_ref())
        } else {
            None
        };
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(id, cb.clone());
            id
        };
        if let Some(changes) = initial {
            if !changes.is_empty() {
                cb(ChangeBatch { changes, context: None });
            }
        }
        let shared = Arc::clone(&self.inner);
        Box::new(move || {
            shared.lock().unwrap().subscribers.remove(&id);
        })
    }

    fn current_state_as_changes(&self, where_expression: Option<&Expr>) -> Option<Vec<SourceChange>> {
        let inner = self.inner.lock().unwrap();
        let changes = inner
            .items
            .iter()
            .filter(|(_, record)| {
                where_expression.map(|e| e.eval_truthy(record)).unwrap_or(true)
            })
            .map(|(key, record)| SourceChange::insert(key.clone(), record.clone()))
            .collect();
        Some(changes)
    }

    fn load_subset(&self, _request: LoadSubsetRequest) -> LoadSubset {
        // Everything is synced already.
        LoadSubset::Loaded
    }

    fn index_for_field(&self, path: &[String]) -> Option<Arc<dyn FieldIndex>> {
        let inner = self.inner.lock().unwrap();
        inner
            .indexes
            .get(&path.join("."))
            .map(|index| Arc::new(index.clone()) as Arc<dyn FieldIndex>)
    }

    fn ensure_index_for_field(&self, path: &[String]) {
        let auto = self.inner.lock().unwrap().config.auto_index;
        if auto {
            let _ = self.create_index(path);
        }
    }

    fn on_status_change(&self, cb: StatusCallback) -> Unsubscribe {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.status_subscribers.insert(id, cb);
            id
        };
        let shared = Arc::clone(&self.inner);
        Box::new(move || {
            shared.lock().unwrap().status_subscribers.remove(&id);
        })
    }

    fn preload(&self) -> PendingHandle {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == CollectionStatus::Ready {
            PendingHandle::resolved()
        } else {
            let handle = PendingHandle::new();
            inner.ready_waiters.push(handle.clone());
            handle
        }
    }

    fn transaction_scheduler(&self) -> TransactionScheduler {
        self.inner.lock().unwrap().scheduler.clone()
    }
}

// |--------------|
// | Transactions |
// |--------------|

/// A multi-collection transaction.
///
/// Operations are staged in call order and applied on [`Transaction::commit`]:
/// each participating collection applies its operations, emits one change
/// batch tagged with the transaction context, and the scheduler is flushed
/// once at the end. Dropping an uncommitted transaction rolls it back —
/// nothing was emitted, so no scheduled work remains for the context.
pub struct Transaction {
    context: Option<u64>,
    scheduler: Option<TransactionScheduler>,
    ops: Vec<(LocalCollection, StagedOp)>,
    finished: bool,
}

impl Transaction {
    /// Start an empty transaction. The scheduler (and context id) come from
    /// the first collection touched.
    pub fn begin() -> Self {
        Self { context: None, scheduler: None, ops: Vec::new(), finished: false }
    }

    /// The transaction's opaque context id, once a collection participates.
    pub fn context(&self) -> Option<u64> {
        self.context
    }

    fn touch(&mut self, collection: &LocalCollection) {
        if self.scheduler.is_none() {
            let scheduler = collection.transaction_scheduler();
            self.context = Some(scheduler.allocate_context());
            self.scheduler = Some(scheduler);
        }
    }

    /// Stage an insert. Fails if no key can be extracted from the value.
    pub fn insert(&mut self, collection: &LocalCollection, value: Value) -> Result<()> {
        self.touch(collection);
        collection
            .key_of(&value)
            .ok_or_else(|| anyhow!("collection {}: value has no extractable key", collection.id()))?;
        self.ops.push((collection.clone(), StagedOp::Insert(value)));
        Ok(())
    }

    /// Stage a replacement of the item under `key`.
    pub fn update(&mut self, collection: &LocalCollection, key: impl Into<KeyValue>, value: Value) {
        self.touch(collection);
        self.ops.push((collection.clone(), StagedOp::Update(key.into(), value)));
    }

    /// Stage a delete of the item under `key`.
    pub fn delete(&mut self, collection: &LocalCollection, key: impl Into<KeyValue>) {
        self.touch(collection);
        self.ops.push((collection.clone(), StagedOp::Delete(key.into())));
    }

    /// Stage a truncation: on commit, deletes for every previously synced
    /// key are emitted before any operation staged after this point.
    pub fn truncate(&mut self, collection: &LocalCollection) {
        self.touch(collection);
        self.ops.push((collection.clone(), StagedOp::Truncate));
    }

    /// Apply all staged operations, emit per-collection change batches, and
    /// flush the scheduler once.
    pub fn commit(mut self) {
        self.finished = true;
        let Some(scheduler) = self.scheduler.take() else {
            return;
        };
        let context = self.context.expect("context allocated with scheduler");

        // Group staged ops per collection, preserving both the order of
        // collections and the order of ops within each.
        let mut order: Vec<LocalCollection> = Vec::new();
        let mut grouped: Vec<Vec<StagedOp>> = Vec::new();
        for (collection, op) in self.ops.drain(..) {
            match order.iter().position(|c| Arc::ptr_eq(&c.inner, &collection.inner)) {
                Some(i) => grouped[i].push(op),
                None => {
                    order.push(collection);
                    grouped.push(vec![op]);
                }
            }
        }

        // All deltas reach the input buffers before any graph runs.
        for (collection, ops) in order.iter().zip(grouped) {
            let changes = collection.apply(ops);
            collection.notify(changes, Some(context));
        }
        scheduler.flush(context);
    }

    /// Drop all staged operations; no work remains scheduled.
    pub fn rollback(mut self) {
        self.finished = true;
        if let (Some(scheduler), Some(context)) = (self.scheduler.take(), self.context) {
            scheduler.discard(context);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            if let (Some(scheduler), Some(context)) = (self.scheduler.take(), self.context) {
                scheduler.discard(context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> LocalCollection {
        LocalCollection::new(LocalCollectionConfig::keyed_by_id("users-local-test"))
    }

    #[test]
    fn insert_update_delete_round_trip() {
        let col = users();
        col.insert(json!({"id": 1, "name": "Alice"})).unwrap();
        assert_eq!(col.size(), 1);
        assert_eq!(col.get(&KeyValue::Int(1)).unwrap()["name"], json!("Alice"));

        col.update(1i64, json!({"id": 1, "name": "Alicia"}));
        assert_eq!(col.get(&KeyValue::Int(1)).unwrap()["name"], json!("Alicia"));

        col.delete(1i64);
        assert_eq!(col.size(), 0);
    }

    #[test]
    fn insert_without_key_fails_at_staging() {
        let col = users();
        let mut tx = Transaction::begin();
        assert!(tx.insert(&col, json!({"name": "no id"})).is_err());
        tx.rollback();
    }

    #[test]
    fn truncate_emits_deletes_before_later_ops() {
        let col = users();
        col.insert(json!({"id": 1, "name": "a"})).unwrap();
        col.insert(json!({"id": 2, "name": "b"})).unwrap();

        let seen: Arc<Mutex<Vec<SourceChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _unsub = col.subscribe_changes(
            Arc::new(move |batch| sink.lock().unwrap().extend(batch.changes)),
            SubscribeOptions::default(),
        );

        let mut tx = Transaction::begin();
        tx.truncate(&col);
        tx.insert(&col, json!({"id": 3, "name": "c"})).unwrap();
        tx.commit();

        let seen = seen.lock().unwrap();
        use crate::changes::ChangeKind::*;
        let kinds: Vec<_> = seen.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![Delete, Delete, Insert]);
        assert_eq!(col.size(), 1);
    }

    #[test]
    fn index_lookup_and_take() {
        let col = users();
        for (id, age) in [(1, 30), (2, 20), (3, 40), (4, 20)] {
            col.insert(json!({"id": id, "age": age})).unwrap();
        }
        let index = col.create_index(&["age".to_string()]);
        assert_eq!(index.lookup(IndexOp::Eq, &json!(20)).len(), 2);
        assert_eq!(index.lookup(IndexOp::Gte, &json!(30)).len(), 2);

        let first_two = index.take(2, None, None);
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].0, json!(20));

        let rest = index.take(10, Some(&json!(20)), None);
        assert_eq!(rest.iter().map(|(v, _)| v.clone()).collect::<Vec<_>>(), vec![json!(30), json!(40)]);
    }

    #[test]
    fn indexes_follow_mutations() {
        let col = users();
        col.insert(json!({"id": 1, "age": 30})).unwrap();
        let index = col.create_index(&["age".to_string()]);
        col.update(1i64, json!({"id": 1, "age": 31}));
        assert!(index.lookup(IndexOp::Eq, &json!(30)).is_empty());
        assert_eq!(index.lookup(IndexOp::Eq, &json!(31)).len(), 1);
        col.delete(1i64);
        assert!(index.lookup(IndexOp::Eq, &json!(31)).is_empty());
    }

    #[test]
    fn preload_resolves_on_mark_ready() {
        let col = users();
        let handle = col.preload();
        assert!(!handle.is_settled());
        col.mark_ready();
        assert!(handle.is_resolved());
        assert!(col.preload().is_resolved());
    }
}
