//! The live-query coordinator and result collection.
//!
//! A [`LiveQueryCollection`] owns one compiled dataflow graph per active
//! subscription period. Construction validates the query (compile errors
//! surface synchronously); starting compiles a fresh graph, subscribes
//! every alias to its source collection with the flavor the compiler chose,
//! and runs the graph to fixed point — re-running after each batch of lazy
//! key loads and after each windowed-subscription refill, until nothing is
//! pending.
//!
//! Status follows the validated transition table: the collection loads
//! until every source is ready, performs its initial commit (a single
//! coalesced batch, possibly empty), and then streams one batch of
//! insert/update/delete changes per graph run to subscribers. Any source
//! entering the error state — or being cleaned up while depended upon —
//! moves the live query to `Error`. When the last subscriber leaves, a GC
//! timer fires after `gc_time_ms` and tears everything down; a later
//! subscription compiles a fresh graph (finalized graphs are single-shot).

use crate::changes::{ChangeKind, ResultChange};
use crate::compiler::{compile, LazyRequest, OrderByOptimizationInfo, OutputRow};
use crate::graph::Graph;
use crate::ir::QueryIr;
use crate::operators::topk::WindowSizeProbe;
use crate::operators::OutputEvent;
use crate::scheduler::Job;
use crate::source::{PendingHandle, SourceCollection, StatusCallback, Unsubscribe};
use crate::status::{transition, CollectionStatus, StatusChange};
use crate::subscription::{AliasSubscription, SubscriptionFlavor};
use crate::value::KeyValue;
use anyhow::{anyhow, Context, Result};
use fnv::FnvHashMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static LIVE_QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Callback receiving result change batches.
pub type ResultCallback = Arc<dyn Fn(&[ResultChange]) + Send + Sync>;

/// Opaque mutation hook, passed through to embedders untouched.
pub type MutationHook = Arc<dyn Fn(&ResultChange) + Send + Sync>;

/// Configuration for a live query collection.
#[derive(Clone)]
pub struct LiveQueryConfig {
    /// Collection id; `live-query-N` is generated when omitted.
    pub id: Option<String>,
    /// The query to maintain.
    pub query: QueryIr,
    /// Override for result keys; defaults to the pipeline's stable keys.
    pub get_key: Option<Arc<dyn Fn(&Value) -> KeyValue + Send + Sync>>,
    /// Idle milliseconds before auto-cleanup once the last subscriber
    /// leaves.
    pub gc_time_ms: u64,
    /// Start syncing at construction instead of on first subscription.
    pub start_sync: bool,
    /// Total order for snapshots; defaults to fractional-index order for
    /// ordered queries and key order otherwise.
    pub compare: Option<Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>>,
    pub on_insert: Option<MutationHook>,
    pub on_update: Option<MutationHook>,
    pub on_delete: Option<MutationHook>,
}

impl LiveQueryConfig {
    pub fn new(query: QueryIr) -> Self {
        Self {
            id: None,
            query,
            get_key: None,
            gc_time_ms: 5000,
            start_sync: false,
            compare: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn gc_time_ms(mut self, ms: u64) -> Self {
        self.gc_time_ms = ms;
        self
    }

    pub fn start_sync(mut self, start: bool) -> Self {
        self.start_sync = start;
        self
    }

    pub fn get_key(mut self, f: impl Fn(&Value) -> KeyValue + Send + Sync + 'static) -> Self {
        self.get_key = Some(Arc::new(f));
        self
    }

    pub fn compare(mut self, f: impl Fn(&Value, &Value) -> Ordering + Send + Sync + 'static) -> Self {
        self.compare = Some(Arc::new(f));
        self
    }

    pub fn on_insert(mut self, hook: MutationHook) -> Self {
        self.on_insert = Some(hook);
        self
    }

    pub fn on_update(mut self, hook: MutationHook) -> Self {
        self.on_update = Some(hook);
        self
    }

    pub fn on_delete(mut self, hook: MutationHook) -> Self {
        self.on_delete = Some(hook);
        self
    }
}

/// One row of a result snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
    pub key: KeyValue,
    pub value: Value,
    pub order_key: Option<String>,
}

struct ResultEntry {
    value: Value,
    order_key: Option<String>,
}

struct ActivePipeline {
    graph: Graph,
    subscriptions: Vec<Arc<AliasSubscription>>,
    lazy_requests: Arc<Mutex<Vec<LazyRequest>>>,
    window_probe: Arc<Mutex<Option<WindowSizeProbe>>>,
    order_info: Option<OrderByOptimizationInfo>,
    status_unsubs: Vec<Unsubscribe>,
    pending_output: Arc<Mutex<Vec<OutputEvent<KeyValue, OutputRow>>>>,
}

impl Drop for ActivePipeline {
    fn drop(&mut self) {
        for unsubscribe in self.status_unsubs.drain(..) {
            unsubscribe();
        }
        for subscription in &self.subscriptions {
            subscription.stop();
        }
    }
}

struct LiveInner {
    id: String,
    config: LiveQueryConfig,
    sources: HashMap<String, Arc<dyn SourceCollection>>,
    required: BTreeSet<String>,
    status: CollectionStatus,
    results: BTreeMap<KeyValue, ResultEntry>,
    /// Pipeline key → result key (differs when `get_key` is configured).
    pipeline_keys: FnvHashMap<KeyValue, KeyValue>,
    subscribers: HashMap<u64, ResultCallback>,
    status_subscribers: HashMap<u64, StatusCallback>,
    next_subscriber: u64,
    run_count: u64,
    active: Option<ActivePipeline>,
    /// GC epoch; bumping it cancels in-flight timers.
    generation: u64,
    ready_waiters: Vec<PendingHandle>,
    error_message: Option<String>,
}

/// A result collection kept in sync by the IVM engine.
#[derive(Clone)]
pub struct LiveQueryCollection {
    inner: Arc<Mutex<LiveInner>>,
}

/// Guard for a result subscription; unsubscribes on drop.
pub struct LiveSubscription {
    collection: LiveQueryCollection,
    id: Option<u64>,
}

impl LiveSubscription {
    /// Explicitly release the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(id) = self.id.take() {
            self.collection.remove_subscriber(id);
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.collection.remove_subscriber(id);
        }
    }
}

/// Test-facing utilities of a live query collection.
pub struct LiveQueryUtils {
    collection: LiveQueryCollection,
}

impl LiveQueryUtils {
    /// Number of graph runs that found work.
    pub fn run_count(&self) -> u64 {
        self.collection.inner.lock().unwrap().run_count
    }
}

impl LiveQueryCollection {
    /// Validate and create a live query over the given sources. Compile
    /// errors surface here, synchronously.
    pub fn new(
        config: LiveQueryConfig,
        sources: impl IntoIterator<Item = Arc<dyn SourceCollection>>,
    ) -> Result<Self> {
        let id = config.id.clone().unwrap_or_else(|| {
            format!("live-query-{}", LIVE_QUERY_COUNTER.fetch_add(1, AtomicOrdering::SeqCst) + 1)
        });

        let mut map: HashMap<String, Arc<dyn SourceCollection>> = HashMap::new();
        for source in sources {
            map.insert(source.id(), source);
        }
        let required = config.query.collection_ids();
        for collection_id in &required {
            if !map.contains_key(collection_id) {
                return Err(anyhow!(
                    "live query '{id}': source collection '{collection_id}' not provided"
                ));
            }
        }

        // The base pipeline is compiled once upfront so every compile-time
        // error is reported before anything subscribes.
        compile(&config.query, &map).with_context(|| format!("live query '{id}'"))?;

        let start_sync = config.start_sync;
        let collection = Self {
            inner: Arc::new(Mutex::new(LiveInner {
                id,
                config,
                sources: map,
                required,
                status: CollectionStatus::Idle,
                results: BTreeMap::new(),
                pipeline_keys: FnvHashMap::default(),
                subscribers: HashMap::new(),
                status_subscribers: HashMap::new(),
                next_subscriber: 0,
                run_count: 0,
                active: None,
                generation: 0,
                ready_waiters: Vec::new(),
                error_message: None,
            })),
        };
        if start_sync {
            collection.start();
        }
        Ok(collection)
    }

    /// Collection id.
    pub fn id(&self) -> String {
        self.inner.lock().unwrap().id.clone()
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.lock().unwrap().status
    }

    /// The error that moved the collection into `Error`, if any.
    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().unwrap().error_message.clone()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().results.len()
    }

    pub fn get(&self, key: &KeyValue) -> Option<Value> {
        self.inner.lock().unwrap().results.get(key).map(|entry| entry.value.clone())
    }

    /// Current rows, ordered by the configured comparator, else by
    /// fractional index for ordered queries, else by key.
    pub fn snapshot(&self) -> Vec<ResultRow> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ResultRow> = inner
            .results
            .iter()
            .map(|(key, entry)| ResultRow {
                key: key.clone(),
                value: entry.value.clone(),
                order_key: entry.order_key.clone(),
            })
            .collect();
        if let Some(compare) = &inner.config.compare {
            rows.sort_by(|a, b| compare(&a.value, &b.value));
        } else if rows.iter().any(|row| row.order_key.is_some()) {
            rows.sort_by(|a, b| a.order_key.cmp(&b.order_key));
        }
        rows
    }

    /// Current row values in snapshot order.
    pub fn values(&self) -> Vec<Value> {
        self.snapshot().into_iter().map(|row| row.value).collect()
    }

    /// Test-facing utilities.
    pub fn utils(&self) -> LiveQueryUtils {
        LiveQueryUtils { collection: self.clone() }
    }

    /// The configured mutation hooks, untouched by the engine.
    pub fn mutation_hooks(&self) -> (Option<MutationHook>, Option<MutationHook>, Option<MutationHook>) {
        let inner = self.inner.lock().unwrap();
        (
            inner.config.on_insert.clone(),
            inner.config.on_update.clone(),
            inner.config.on_delete.clone(),
        )
    }

    /// Subscribe to result change batches. Starts syncing if idle; the
    /// subscriber immediately receives the current state as inserts when
    /// the collection is already ready.
    pub fn subscribe_changes(
        &self,
        cb: impl Fn(&[ResultChange]) + Send + Sync + 'static,
    ) -> LiveSubscription {
        let cb: ResultCallback = Arc::new(cb);
        let needs_start = {
            let inner = self.inner.lock().unwrap();
            inner.active.is_none()
        };
        if needs_start {
            self.start();
        }

        let (id, initial) = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1; // cancel any pending GC
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(id, cb.clone());
            let initial = if inner.status == CollectionStatus::Ready {
                Some(snapshot_as_inserts(&inner))
            } else {
                None
            };
            (id, initial)
        };
        if let Some(initial) = initial {
            if !initial.is_empty() {
                cb(&initial);
            }
        }
        LiveSubscription { collection: self.clone(), id: Some(id) }
    }

    /// Subscribe to status transitions.
    pub fn on_status_change(&self, cb: StatusCallback) -> Unsubscribe {
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

    /// A handle resolving when the collection reaches `Ready`. Starts
    /// syncing if idle.
    pub fn preload(&self) -> PendingHandle {
        let needs_start = {
            let inner = self.inner.lock().unwrap();
            inner.active.is_none() && inner.status != CollectionStatus::Error
        };
        if needs_start {
            self.start();
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.status {
            CollectionStatus::Ready => PendingHandle::resolved(),
            CollectionStatus::Error => {
                let handle = PendingHandle::new();
                handle.fail(inner.error_message.clone().unwrap_or_else(|| "error".to_string()));
                handle
            }
            _ => {
                let handle = PendingHandle::new();
                inner.ready_waiters.push(handle.clone());
                handle
            }
        }
    }

    /// Tear everything down: unsubscribe from all sources, discard the
    /// graph and results, and transition to cleaned-up. A later
    /// `subscribe_changes` compiles a fresh graph.
    pub fn cleanup(&self) {
        let (active, events) = {
            let mut inner = self.inner.lock().unwrap();
            let active = inner.active.take();
            inner.results.clear();
            inner.pipeline_keys.clear();
            inner.generation += 1;
            let events = advance_status(&mut inner.status, CollectionStatus::CleanedUp);
            (active, events)
        };
        drop(active);
        self.emit_status(events);
    }

    // |----------------|
    // | Internal drive |
    // |----------------|

    fn start(&self) {
        let (query, sources, id) = {
            let inner = self.inner.lock().unwrap();
            if inner.active.is_some() {
                return;
            }
            (inner.config.query.clone(), inner.sources.clone(), inner.id.clone())
        };

        let loading_events = {
            let mut inner = self.inner.lock().unwrap();
            advance_status(&mut inner.status, CollectionStatus::Loading)
        };
        self.emit_status(loading_events);

        let pipeline = match compile(&query, &sources) {
            Ok(pipeline) => pipeline,
            Err(error) => {
                self.set_error(error.to_string());
                return;
            }
        };
        #[cfg(feature = "metrics")]
        crate::metrics::counters().record_compilation();

        // Terminal sink: buffer output events; they are applied after each
        // run, outside the graph.
        let pending_output: Arc<Mutex<Vec<OutputEvent<KeyValue, OutputRow>>>> =
            Arc::new(Mutex::new(Vec::new()));
        {
            let buffer = Arc::clone(&pending_output);
            pipeline.result.output(move |events| {
                buffer.lock().unwrap().extend(events);
            });
        }
        let graph = pipeline.graph.finalize();

        let runner: Job = {
            let handle = self.clone();
            Arc::new(move || handle.run_to_fixed_point())
        };

        // One subscription per alias, flavored per the compiler's plan.
        let mut subscriptions = Vec::new();
        for (alias, input) in &pipeline.inputs {
            let Some(collection_id) = pipeline.alias_collections.get(alias) else {
                self.set_error(format!("alias '{alias}' has an input stream but no collection"));
                return;
            };
            let Some(source) = sources.get(collection_id) else {
                self.set_error(format!("alias '{alias}' resolves to missing collection '{collection_id}'"));
                return;
            };
            let flavor = if let Some(info) = pipeline.lazy_aliases.get(alias) {
                SubscriptionFlavor::Lazy(info.clone())
            } else if let Some(info) = pipeline
                .order_by_optimization
                .as_ref()
                .filter(|info| info.alias == *alias)
            {
                SubscriptionFlavor::Ordered(info.clone())
            } else {
                SubscriptionFlavor::AllChanges
            };
            subscriptions.push(Arc::new(AliasSubscription::new(
                alias.clone(),
                Arc::clone(source),
                input.clone(),
                flavor,
                pipeline.pushed_where.get(alias).cloned(),
            )));
        }

        // Watch every depended-upon source's lifecycle.
        let required: BTreeSet<String> = self.inner.lock().unwrap().required.clone();
        let mut status_unsubs = Vec::new();
        for collection_id in &required {
            if let Some(source) = sources.get(collection_id) {
                let handle = self.clone();
                status_unsubs.push(source.on_status_change(Arc::new(move |change| {
                    handle.on_source_status(change);
                })));
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.active = Some(ActivePipeline {
                graph,
                subscriptions: subscriptions.clone(),
                lazy_requests: pipeline.lazy_requests,
                window_probe: pipeline.window_probe,
                order_info: pipeline.order_by_optimization,
                status_unsubs,
                pending_output,
            });
        }

        for subscription in &subscriptions {
            subscription.start(id.clone(), Arc::clone(&runner));
        }

        self.run_to_fixed_point();
        self.maybe_finalize_initial();
    }

    // Run the graph, apply its output, serve lazy-load requests and window
    // refills, and repeat until nothing remains. The whole cycle counts as
    // one graph run: a transaction flush bumps the run count once no
    // matter how many lazy-load passes it takes.
    fn run_to_fixed_point(&self) {
        let mut did_work = false;
        loop {
            let Some((graph, lazy_requests, window_probe, order_info, subscriptions)) = ({
                let inner = self.inner.lock().unwrap();
                inner.active.as_ref().map(|active| {
                    (
                        active.graph.clone(),
                        Arc::clone(&active.lazy_requests),
                        Arc::clone(&active.window_probe),
                        active.order_info.clone(),
                        active.subscriptions.clone(),
                    )
                })
            }) else {
                return;
            };

            if graph.pending_work() && graph.run() {
                did_work = true;
            }
            self.flush_output();

            let mut data_arrived = false;

            // Lazy key loading requested by join taps during the run.
            let requests: Vec<LazyRequest> = {
                let mut pending = lazy_requests.lock().unwrap();
                pending.drain(..).collect()
            };
            for request in requests {
                match subscriptions.iter().find(|s| s.alias() == request.alias) {
                    Some(subscription) => {
                        data_arrived |= subscription.load_keys(&[request.value]);
                    }
                    None => {
                        self.set_error(format!(
                            "missing lazy-load callback for alias '{}'",
                            request.alias
                        ));
                        return;
                    }
                }
            }

            // Windowed subscription refill: ask for however many rows the
            // ordered window is short.
            if let Some(info) = &order_info {
                let window_size = window_probe.lock().unwrap().as_ref().map(|probe| probe());
                if let Some(size) = window_size {
                    if size < info.limit {
                        if let Some(subscription) =
                            subscriptions.iter().find(|s| s.alias() == info.alias)
                        {
                            if !subscription.is_exhausted() {
                                data_arrived |= subscription.load_more(info.limit - size);
                            }
                        }
                    }
                }
            }

            if !data_arrived && !graph.pending_work() {
                break;
            }
        }
        if did_work {
            self.inner.lock().unwrap().run_count += 1;
            #[cfg(feature = "metrics")]
            crate::metrics::counters().record_graph_run();
        }
    }

    // Apply buffered output events to the result map; notify subscribers
    // once the collection is past its initial commit.
    fn flush_output(&self) {
        let Some(pending) = ({
            let inner = self.inner.lock().unwrap();
            inner.active.as_ref().map(|active| Arc::clone(&active.pending_output))
        }) else {
            return;
        };
        let events: Vec<OutputEvent<KeyValue, OutputRow>> = {
            let mut buffer = pending.lock().unwrap();
            buffer.drain(..).collect()
        };
        if events.is_empty() {
            return;
        }

        let (batch, callbacks, ready) = {
            let mut inner = self.inner.lock().unwrap();
            let mut batch = Vec::new();
            for event in events {
                apply_output_event(&mut inner, event, &mut batch);
            }
            batch.sort_by(|a, b| a.key.cmp(&b.key));
            let callbacks: Vec<ResultCallback> = inner.subscribers.values().cloned().collect();
            (batch, callbacks, inner.status == CollectionStatus::Ready)
        };

        if ready && !batch.is_empty() {
            #[cfg(feature = "metrics")]
            crate::metrics::counters().record_result_batch();
            for cb in callbacks {
                cb(&batch);
            }
        }
    }

    fn on_source_status(&self, change: StatusChange) {
        match change.status {
            CollectionStatus::Error => {
                self.set_error("a source collection entered the error state".to_string());
            }
            CollectionStatus::CleanedUp => {
                let dependent = self.inner.lock().unwrap().active.is_some();
                if dependent {
                    self.set_error("a source collection was cleaned up while in use".to_string());
                }
            }
            CollectionStatus::Ready => {
                self.maybe_finalize_initial();
            }
            _ => {}
        }
    }

    // All sources ready → initial commit → ready, with one coalesced batch
    // to subscribers (empty if no data flowed).
    fn maybe_finalize_initial(&self) {
        let (events, waiters, callbacks, snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.status != CollectionStatus::Loading || inner.active.is_none() {
                return;
            }
            let all_ready = inner
                .required
                .iter()
                .all(|id| inner.sources.get(id).map(|s| s.is_ready()).unwrap_or(false));
            if !all_ready {
                return;
            }
            let mut events = advance_status(&mut inner.status, CollectionStatus::InitialCommit);
            events.extend(advance_status(&mut inner.status, CollectionStatus::Ready));
            let waiters = std::mem::take(&mut inner.ready_waiters);
            let callbacks: Vec<ResultCallback> = inner.subscribers.values().cloned().collect();
            let snapshot = snapshot_as_inserts(&inner);
            (events, waiters, callbacks, snapshot)
        };

        self.emit_status(events);
        for waiter in waiters {
            waiter.resolve();
        }
        for cb in callbacks {
            cb(&snapshot);
        }
    }

    fn set_error(&self, message: String) {
        let (active, events, waiters) = {
            let mut inner = self.inner.lock().unwrap();
            inner.error_message = Some(message.clone());
            let events = advance_status(&mut inner.status, CollectionStatus::Error);
            let active = inner.active.take();
            let waiters = std::mem::take(&mut inner.ready_waiters);
            (active, events, waiters)
        };
        drop(active);
        self.emit_status(events);
        for waiter in waiters {
            waiter.fail(message.clone());
        }
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

    fn remove_subscriber(&self, id: u64) {
        let arm = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.remove(&id);
            inner.subscribers.is_empty() && inner.active.is_some()
        };
        if arm {
            self.arm_gc();
        }
    }

    // Schedule cleanup after the idle period unless a new subscriber (or a
    // restart) bumps the generation first.
    fn arm_gc(&self) {
        let (generation, gc_ms) = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            (inner.generation, inner.config.gc_time_ms)
        };
        let handle = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(gc_ms));
            let due = {
                let inner = handle.inner.lock().unwrap();
                inner.generation == generation && inner.subscribers.is_empty()
            };
            if due {
                handle.cleanup();
            }
        });
    }
}

fn snapshot_as_inserts(inner: &LiveInner) -> Vec<ResultChange> {
    inner
        .results
        .iter()
        .map(|(key, entry)| ResultChange {
            kind: ChangeKind::Insert,
            key: key.clone(),
            value: entry.value.clone(),
            previous: None,
            order_key: entry.order_key.clone(),
        })
        .collect()
}

fn result_key(inner: &LiveInner, pipeline_key: &KeyValue, value: &Value) -> KeyValue {
    match &inner.config.get_key {
        Some(get_key) => get_key(value),
        None => pipeline_key.clone(),
    }
}

fn apply_output_event(
    inner: &mut LiveInner,
    event: OutputEvent<KeyValue, OutputRow>,
    batch: &mut Vec<ResultChange>,
) {
    match event {
        OutputEvent::Insert { key, value: out } => {
            let rkey = result_key(inner, &key, &out.value);
            inner.pipeline_keys.insert(key, rkey.clone());
            inner.results.insert(
                rkey.clone(),
                ResultEntry { value: out.value.clone(), order_key: out.order_key.clone() },
            );
            batch.push(ResultChange {
                kind: ChangeKind::Insert,
                key: rkey,
                value: out.value,
                previous: None,
                order_key: out.order_key,
            });
        }
        OutputEvent::Update { key, value: out, previous } => {
            let old_rkey = inner
                .pipeline_keys
                .get(&key)
                .cloned()
                .unwrap_or_else(|| result_key(inner, &key, &previous.value));
            let new_rkey = result_key(inner, &key, &out.value);
            if new_rkey == old_rkey {
                let replaced = inner.results.insert(
                    new_rkey.clone(),
                    ResultEntry { value: out.value.clone(), order_key: out.order_key.clone() },
                );
                batch.push(ResultChange {
                    kind: ChangeKind::Update,
                    key: new_rkey,
                    value: out.value,
                    previous: replaced.map(|entry| entry.value).or(Some(previous.value)),
                    order_key: out.order_key,
                });
            } else {
                // The configured key extractor moved the row.
                if let Some(removed) = inner.results.remove(&old_rkey) {
                    batch.push(ResultChange {
                        kind: ChangeKind::Delete,
                        key: old_rkey,
                        value: removed.value,
                        previous: None,
                        order_key: removed.order_key,
                    });
                }
                inner.pipeline_keys.insert(key, new_rkey.clone());
                inner.results.insert(
                    new_rkey.clone(),
                    ResultEntry { value: out.value.clone(), order_key: out.order_key.clone() },
                );
                batch.push(ResultChange {
                    kind: ChangeKind::Insert,
                    key: new_rkey,
                    value: out.value,
                    previous: None,
                    order_key: out.order_key,
                });
            }
        }
        OutputEvent::Delete { key, value: out } => {
            let rkey = inner
                .pipeline_keys
                .remove(&key)
                .unwrap_or_else(|| result_key(inner, &key, &out.value));
            let removed = inner.results.remove(&rkey);
            batch.push(ResultChange {
                kind: ChangeKind::Delete,
                key: rkey,
                value: removed.map(|entry| entry.value).unwrap_or(out.value),
                previous: None,
                order_key: out.order_key,
            });
        }
    }
}

// Walk the legal transition path towards `target`, collecting each step.
fn advance_status(status: &mut CollectionStatus, target: CollectionStatus) -> Vec<StatusChange> {
    let mut events = Vec::new();
    if *status == target {
        return events;
    }
    let mut step = |status: &mut CollectionStatus, next: CollectionStatus| {
        if *status != next {
            if let Ok(previous) = transition(status, next) {
                events.push(StatusChange { status: next, previous_status: previous });
            }
        }
    };
    match target {
        CollectionStatus::Loading => {
            if *status == CollectionStatus::Error {
                step(status, CollectionStatus::Idle);
            }
            step(status, CollectionStatus::Loading);
        }
        CollectionStatus::Ready => {
            step(status, CollectionStatus::Ready);
        }
        other => step(status, other),
    }
    events
}
