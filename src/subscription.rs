//! Per-alias subscriptions: the bridge from source collections to graph
//! inputs.
//!
//! Each alias of a compiled query gets one subscription that converts
//! change batches into signed deltas on the alias's input stream. Three
//! flavors exist:
//!
//! - **All-changes** — initial state plus live changes, optionally filtered
//!   by a pushed-down where clause.
//! - **Matching-changes (lazy)** — sends nothing until asked via
//!   [`AliasSubscription::load_keys`] (index probe) or
//!   [`AliasSubscription::load_initial_state`] (one-shot deoptimization).
//! - **Ordered (windowed)** — loads the first `offset+limit` keys through a
//!   range index and fetches the next batch past the biggest observed value
//!   whenever the ordered window reports a shortfall.
//!
//! All flavors share the same normalizer: the subscription remembers the
//! last value it forwarded per key, so updates for unseen keys become
//! inserts, deletes for unseen keys are dropped, and an update that stops
//! matching the pushed filter becomes a delete of exactly what the graph
//! saw. Batches tagged with a transaction context are deposited into the
//! input buffer and a run job is queued on the transaction scheduler;
//! untagged batches run the graph immediately.

use crate::changes::{ChangeBatch, ChangeKind, SourceChange};
use crate::compiler::{LazyAliasInfo, OrderByOptimizationInfo};
use crate::expr::Expr;
use crate::multiset::MultiSet;
use crate::scheduler::Job;
use crate::source::{
    IndexOp, LoadSubset, LoadSubsetRequest, SourceCollection, SubscribeOptions, Unsubscribe,
};
use crate::stream::InputWriter;
use crate::value::{value_compare, ContentHash, KeyValue};
use fnv::{FnvHashMap, FnvHashSet};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

/// Which loading strategy the alias uses.
pub enum SubscriptionFlavor {
    AllChanges,
    Lazy(LazyAliasInfo),
    Ordered(OrderByOptimizationInfo),
}

struct SubscriptionState {
    /// Last value forwarded to the graph, per key.
    sent: FnvHashMap<KeyValue, Value>,
    /// Root-relative pushed-down filter, if the source could serve it.
    filter: Option<Expr>,
    /// Lazy: the whole source state has been requested.
    loaded_full: bool,
    /// Lazy: join-key values already requested.
    requested_values: FnvHashSet<u64>,
    /// Ordered: biggest index value loaded so far.
    last_ordered_value: Option<Value>,
    /// Ordered: the index has no further rows.
    exhausted: bool,
    /// Outstanding `load_subset` handles.
    pending_loads: usize,
    /// Most recent load failure, if any.
    last_load_error: Option<String>,
}

/// One alias's subscription to its source collection.
pub struct AliasSubscription {
    alias: String,
    source: Arc<dyn SourceCollection>,
    input: InputWriter<(KeyValue, Value)>,
    flavor: SubscriptionFlavor,
    state: Arc<Mutex<SubscriptionState>>,
    unsubscribe: Mutex<Option<Unsubscribe>>,
}

impl AliasSubscription {
    pub fn new(
        alias: String,
        source: Arc<dyn SourceCollection>,
        input: InputWriter<(KeyValue, Value)>,
        flavor: SubscriptionFlavor,
        pushed_where: Option<Expr>,
    ) -> Self {
        Self {
            alias,
            source,
            input,
            flavor,
            state: Arc::new(Mutex::new(SubscriptionState {
                sent: FnvHashMap::default(),
                filter: pushed_where,
                loaded_full: false,
                requested_values: FnvHashSet::default(),
                last_ordered_value: None,
                exhausted: false,
                pending_loads: 0,
                last_load_error: None,
            })),
            unsubscribe: Mutex::new(None),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// True while `load_subset` handles are outstanding.
    pub fn is_loading_subset(&self) -> bool {
        self.state.lock().unwrap().pending_loads > 0
    }

    /// The most recent load failure, if any. Failures do not corrupt the
    /// graph; the next arrived data is authoritative.
    pub fn last_load_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_load_error.clone()
    }

    /// Subscribe to the source and deliver the flavor's initial state.
    /// `runner` is invoked for untagged batches; tagged batches queue it on
    /// the source's transaction scheduler under `job_id`.
    pub fn start(&self, job_id: String, runner: Job) {
        let state = Arc::clone(&self.state);
        let input = self.input.clone();
        let field_path = self.admission_field_path();
        let scheduler = self.source.transaction_scheduler();

        let callback_state = Arc::clone(&state);
        let cb = Arc::new(move |batch: ChangeBatch| {
            let deltas = {
                let mut st = callback_state.lock().unwrap();
                normalize_batch(&mut st, &field_path, &batch.changes)
            };
            if !deltas.is_empty() {
                input.send(deltas);
            }
            match batch.context {
                Some(context) => scheduler.schedule(context, &job_id, Arc::clone(&runner)),
                None => runner(),
            }
        });

        let unsubscribe = self.source.subscribe_changes(
            cb,
            SubscribeOptions { include_initial_state: false, where_expression: None },
        );
        *self.unsubscribe.lock().unwrap() = Some(unsubscribe);

        self.deliver_initial_state();
    }

    // Field path used for admission decisions (join key for lazy aliases,
    // order-by column for ordered ones).
    fn admission_field_path(&self) -> Option<Vec<String>> {
        match &self.flavor {
            SubscriptionFlavor::AllChanges => None,
            SubscriptionFlavor::Lazy(info) => Some(info.field_path.clone()),
            SubscriptionFlavor::Ordered(info) => Some(info.field_path.clone()),
        }
    }

    fn deliver_initial_state(&self) {
        match &self.flavor {
            SubscriptionFlavor::AllChanges => {
                let filter = self.state.lock().unwrap().filter.clone();
                let changes = match self.source.current_state_as_changes(filter.as_ref()) {
                    Some(changes) => changes,
                    None => {
                        // No suitable index for the pushed clause: fall back
                        // to the full state and let the graph filter.
                        self.state.lock().unwrap().filter = None;
                        self.source.current_state_as_changes(None).unwrap_or_default()
                    }
                };
                self.forward(&changes);
                self.state.lock().unwrap().loaded_full = true;
            }
            SubscriptionFlavor::Lazy(_) => {
                // Nothing until asked.
            }
            SubscriptionFlavor::Ordered(info) => {
                let info = info.clone();
                self.load_ordered_batch(info.offset + info.limit);
            }
        }
    }

    fn forward(&self, changes: &[SourceChange]) -> bool {
        let field_path = self.admission_field_path();
        let deltas = {
            let mut st = self.state.lock().unwrap();
            normalize_batch(&mut st, &field_path, changes)
        };
        let any = !deltas.is_empty();
        if any {
            self.input.send(deltas);
        }
        any
    }

    /// Lazy flavor: materialize the keys whose join field equals one of
    /// `values`. Probes the source index when one exists; otherwise loads
    /// the full state once (deoptimization). Returns true if data flowed.
    pub fn load_keys(&self, values: &[Value]) -> bool {
        let SubscriptionFlavor::Lazy(info) = &self.flavor else {
            return false;
        };
        // Index presence is only known at runtime: indexes are built after
        // the source's initial sync.
        let Some(index) = self.source.index_for_field(&info.field_path) else {
            return self.load_initial_state();
        };
        if !index.supports(IndexOp::Eq) {
            return self.load_initial_state();
        }

        let mut changes = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            for value in values {
                if !st.requested_values.insert(value.content_hash()) {
                    continue;
                }
                for key in index.lookup(IndexOp::Eq, value) {
                    if let Some(record) = self.source.get(&key) {
                        changes.push(SourceChange::insert(key, record));
                    }
                }
            }
        }
        let sent = self.forward(&changes);

        // Ask the source for rows it has not synced yet.
        let field = crate::expr::col(info.field_path.clone());
        for value in values {
            let request = LoadSubsetRequest {
                where_expression: Some(crate::expr::eq(field.clone(), crate::expr::val(value.clone()))),
                limit: None,
                order_by: None,
            };
            self.track_load(self.source.load_subset(request));
        }
        sent
    }

    /// Lazy flavor: give up on per-key loading and take everything, once.
    pub fn load_initial_state(&self) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            if st.loaded_full {
                return false;
            }
            st.loaded_full = true;
        }
        let changes = self.source.current_state_as_changes(None).unwrap_or_default();
        self.forward(&changes)
    }

    /// Ordered flavor: fetch the next `n` rows past the biggest observed
    /// value. Returns true if any progress was made — rows were read from
    /// the index even if the pushed filter dropped them all, so the
    /// refill loop keeps going until the window fills or the index ends.
    pub fn load_more(&self, n: usize) -> bool {
        if n == 0 {
            return false;
        }
        self.load_ordered_batch(n)
    }

    /// Ordered flavor: true once the index has been read to its end.
    pub fn is_exhausted(&self) -> bool {
        self.state.lock().unwrap().exhausted
    }

    fn load_ordered_batch(&self, n: usize) -> bool {
        let SubscriptionFlavor::Ordered(info) = &self.flavor else {
            return false;
        };
        let Some(index) = self.source.index_for_field(&info.field_path) else {
            // No range index after all: degrade to a full scan.
            let changes = self.source.current_state_as_changes(None).unwrap_or_default();
            {
                let mut st = self.state.lock().unwrap();
                st.exhausted = true;
                st.loaded_full = true;
            }
            return self.forward(&changes);
        };

        let from = self.state.lock().unwrap().last_ordered_value.clone();
        let batch = index.take(n, from.as_ref(), None);
        let got = batch.len();
        let mut changes = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            for (value, key) in batch {
                st.last_ordered_value = Some(value);
                if let Some(record) = self.source.get(&key) {
                    changes.push(SourceChange::insert(key, record));
                }
            }
            if got < n {
                st.exhausted = true;
            }
        }
        let sent = self.forward(&changes);

        let request = LoadSubsetRequest {
            where_expression: None,
            limit: Some(n),
            order_by: Some((info.field_path.clone(), crate::ir::Direction::Asc)),
        };
        self.track_load(self.source.load_subset(request));
        sent || got > 0
    }

    fn track_load(&self, result: LoadSubset) {
        if let LoadSubset::Pending(handle) = result {
            self.state.lock().unwrap().pending_loads += 1;
            let state = Arc::clone(&self.state);
            handle.on_settle(move |outcome| {
                let mut st = state.lock().unwrap();
                st.pending_loads = st.pending_loads.saturating_sub(1);
                if let Err(message) = outcome {
                    // Forget the failed range; whatever arrives next is
                    // authoritative.
                    st.last_load_error = Some(message.clone());
                }
            });
        }
    }

    /// Release the source subscription.
    pub fn stop(&self) {
        if let Some(unsubscribe) = self.unsubscribe.lock().unwrap().take() {
            unsubscribe();
        }
    }
}

impl Drop for AliasSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

// |---------------|
// | Normalization |
// |---------------|

fn walk_field<'a>(record: &'a Value, path: &[String]) -> &'a Value {
    let mut v = record;
    for segment in path {
        match v.get(segment) {
            Some(next) => v = next,
            None => return &Value::Null,
        }
    }
    v
}

// Whether an unseen key may be admitted right now.
fn admits(state: &SubscriptionState, field_path: &Option<Vec<String>>, record: &Value) -> bool {
    if state.loaded_full {
        return true;
    }
    let Some(path) = field_path else {
        return true;
    };
    let field = walk_field(record, path);
    if !state.requested_values.is_empty() && state.requested_values.contains(&field.content_hash())
    {
        return true;
    }
    if state.exhausted {
        return true;
    }
    match &state.last_ordered_value {
        Some(last) => value_compare(field, last) != Ordering::Greater,
        None => false,
    }
}

// Convert a change batch into graph deltas, tracking exactly what the
// graph has seen per key.
fn normalize_batch(
    state: &mut SubscriptionState,
    field_path: &Option<Vec<String>>,
    changes: &[SourceChange],
) -> MultiSet<(KeyValue, Value)> {
    let mut deltas = MultiSet::new();
    for change in changes {
        let seen = state.sent.get(&change.key).cloned();
        let matches = state
            .filter
            .as_ref()
            .map(|f| f.eval_truthy(&change.value))
            .unwrap_or(true);

        match (change.kind, seen) {
            (ChangeKind::Insert, None) | (ChangeKind::Update, None) => {
                if matches && admits(state, field_path, &change.value) {
                    state.sent.insert(change.key.clone(), change.value.clone());
                    deltas.push((change.key.clone(), change.value.clone()), 1);
                }
            }
            (ChangeKind::Insert, Some(old)) | (ChangeKind::Update, Some(old)) => {
                // A row that stops matching the pushed filter, or moves
                // outside the loaded range (past the windowed frontier, or
                // off the requested join keys), leaves the mirrored subset:
                // retract exactly what the graph saw. A later load can
                // re-admit it.
                if matches && admits(state, field_path, &change.value) {
                    if old.content_hash() != change.value.content_hash() {
                        state.sent.insert(change.key.clone(), change.value.clone());
                        deltas.push((change.key.clone(), old), -1);
                        deltas.push((change.key.clone(), change.value.clone()), 1);
                    }
                } else {
                    state.sent.remove(&change.key);
                    deltas.push((change.key.clone(), old), -1);
                }
            }
            (ChangeKind::Delete, Some(old)) => {
                state.sent.remove(&change.key);
                deltas.push((change.key.clone(), old), -1);
            }
            (ChangeKind::Delete, None) => {
                // Never seen: nothing to retract.
            }
        }
    }
    deltas
}
