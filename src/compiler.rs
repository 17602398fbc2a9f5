//! The query compiler: IR → dataflow graph.
//!
//! [`compile`] turns a [`QueryIr`] into a wired pipeline: per-alias input
//! streams, namespacing maps, filters, joins (with active/lazy planning and
//! tap-driven lazy key loading), grouping reduces, the ordered window, and
//! the terminal result stream. All validation happens here, so every error
//! in the compile-time taxonomy surfaces synchronously at live-query
//! construction.
//!
//! ## Join planning
//!
//! For each join one side is **active** (iterated; fed by an all-changes
//! subscription) and the other **lazy** (probed; fed by a matching-changes
//! subscription that stays empty until asked for keys):
//!
//! - `left`  → main active, joined lazy
//! - `right` → joined active, main lazy
//! - `inner` → smaller collection active, larger lazy
//! - `full`  → both active
//!
//! Lazy optimization is disabled for self-joins (the lazy side would be the
//! collection already iterated), for subquery sides, and when the lazy-side
//! join key is not a direct column reference. A `tap` on the active side
//! records each join-key value observed; the coordinator drains these
//! requests after every run and either probes the lazy collection's index
//! or falls back to loading its full state once.

use crate::expr::Expr;
use crate::graph::GraphBuilder;
use crate::ir::{Direction, JoinClause, OrderBySpec, QueryIr, SourceRef};
use crate::operators::topk::{OrderByOptions, WindowSizeProbe};
use crate::operators::JoinKind;
use crate::source::SourceCollection;
use crate::stream::{DiffStream, InputWriter};
use crate::value::{mix, value_compare, ContentHash, KeyValue};
use fnv::FnvHashSet;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

// |--------|
// | Errors |
// |--------|

/// Compile-time query errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    MissingFrom,
    UnknownCollection(String),
    DuplicateAlias(String),
    UnknownAlias(String),
    EmptyReferencePath,
    JoinSameAlias(String),
    InvalidJoinCondition(String),
    DistinctWithoutSelect,
    HavingWithoutGroupBy,
    LimitWithoutOrderBy,
    OffsetWithoutOrderBy,
    AggregateOutsideGroupBy(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::MissingFrom => write!(f, "query has no from clause"),
            CompileError::UnknownCollection(id) => write!(f, "unknown collection '{id}'"),
            CompileError::DuplicateAlias(alias) => write!(f, "alias '{alias}' is bound twice"),
            CompileError::UnknownAlias(alias) => write!(f, "reference to unknown alias '{alias}'"),
            CompileError::EmptyReferencePath => write!(f, "empty reference path"),
            CompileError::JoinSameAlias(alias) => {
                write!(f, "join condition references alias '{alias}' on both sides")
            }
            CompileError::InvalidJoinCondition(reason) => {
                write!(f, "invalid join condition: {reason}")
            }
            CompileError::DistinctWithoutSelect => write!(f, "distinct requires a select clause"),
            CompileError::HavingWithoutGroupBy => write!(f, "having requires a groupBy clause"),
            CompileError::LimitWithoutOrderBy => write!(f, "limit requires an orderBy clause"),
            CompileError::OffsetWithoutOrderBy => write!(f, "offset requires an orderBy clause"),
            CompileError::AggregateOutsideGroupBy(context) => {
                write!(f, "aggregate used outside groupBy (in {context})")
            }
        }
    }
}

impl std::error::Error for CompileError {}

// |---------------|
// | Pipeline rows |
// |---------------|

/// A terminal pipeline row: the projected record plus its fractional index
/// when the query is ordered.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRow {
    pub value: Value,
    pub order_key: Option<String>,
}

impl ContentHash for OutputRow {
    fn content_hash(&self) -> u64 {
        mix(self.value.content_hash(), self.order_key.content_hash())
    }
}

// |-----------------|
// | Compile results |
// |-----------------|

/// A request recorded by a lazy-load tap: the active side of a join
/// observed `value` as a join key and the lazy `alias` should materialize
/// the matching keys.
#[derive(Clone, Debug)]
pub struct LazyRequest {
    pub alias: String,
    pub value: Value,
}

/// Per-alias information for lazily subscribed collections.
#[derive(Clone, Debug)]
pub struct LazyAliasInfo {
    /// Root-relative field path of the join key on the lazy side.
    pub field_path: Vec<String>,
}

/// Recorded when a `limit` + single-column order-by can be served from a
/// range index on the root collection.
#[derive(Clone, Debug)]
pub struct OrderByOptimizationInfo {
    pub alias: String,
    /// Root-relative field path of the order-by column.
    pub field_path: Vec<String>,
    pub offset: usize,
    pub limit: usize,
}

/// Everything the coordinator needs to drive a compiled query.
pub struct CompiledPipeline {
    pub graph: GraphBuilder,
    /// Graph input per alias (including aliases introduced by subqueries).
    pub inputs: HashMap<String, InputWriter<(KeyValue, Value)>>,
    /// Single-alias where clauses, rewritten root-relative, that may be
    /// pushed into the alias's subscription. The graph retains its own
    /// filters, so sources without a suitable index can ignore these.
    pub pushed_where: HashMap<String, Expr>,
    /// Alias → collection id (self-joins map two aliases to one id).
    pub alias_collections: HashMap<String, String>,
    /// Aliases that subscribe lazily (matching-changes).
    pub lazy_aliases: HashMap<String, LazyAliasInfo>,
    /// Join-key values observed by taps, drained by the coordinator.
    pub lazy_requests: Arc<Mutex<Vec<LazyRequest>>>,
    /// Windowed-subscription opportunity, when detected.
    pub order_by_optimization: Option<OrderByOptimizationInfo>,
    /// Probe for the ordered window's current size, when ordered.
    pub window_probe: Arc<Mutex<Option<WindowSizeProbe>>>,
    /// The terminal stream; the coordinator attaches the output sink.
    pub result: DiffStream<(KeyValue, OutputRow)>,
}

type RowStream = DiffStream<(KeyValue, Value)>;

struct CompileContext<'a> {
    graph: GraphBuilder,
    sources: &'a HashMap<String, Arc<dyn SourceCollection>>,
    inputs: HashMap<String, InputWriter<(KeyValue, Value)>>,
    pushed_where: HashMap<String, Expr>,
    alias_collections: HashMap<String, String>,
    lazy_aliases: HashMap<String, LazyAliasInfo>,
    lazy_requests: Arc<Mutex<Vec<LazyRequest>>>,
    window_probe: Arc<Mutex<Option<WindowSizeProbe>>>,
    order_by_optimization: Option<OrderByOptimizationInfo>,
    /// Subquery IR identity → compiled output, so repeated references to
    /// the same subquery share one operator subtree.
    subquery_cache: HashMap<usize, RowStream>,
}

/// Compile a query against the given sources (keyed by collection id).
pub fn compile(
    ir: &QueryIr,
    sources: &HashMap<String, Arc<dyn SourceCollection>>,
) -> Result<CompiledPipeline, CompileError> {
    let graph = GraphBuilder::new();
    let mut ctx = CompileContext {
        graph: graph.clone(),
        sources,
        inputs: HashMap::new(),
        pushed_where: HashMap::new(),
        alias_collections: HashMap::new(),
        lazy_aliases: HashMap::new(),
        lazy_requests: Arc::new(Mutex::new(Vec::new())),
        window_probe: Arc::new(Mutex::new(None)),
        order_by_optimization: None,
        subquery_cache: HashMap::new(),
    };

    let result = compile_query(ir, &mut ctx, true)?;

    Ok(CompiledPipeline {
        graph,
        inputs: ctx.inputs,
        pushed_where: ctx.pushed_where,
        alias_collections: ctx.alias_collections,
        lazy_aliases: ctx.lazy_aliases,
        lazy_requests: ctx.lazy_requests,
        order_by_optimization: ctx.order_by_optimization,
        window_probe: ctx.window_probe,
        result,
    })
}

// |------------|
// | Validation |
// |------------|

fn validate_expr(expr: &Expr, known: &BTreeSet<String>) -> Result<(), CompileError> {
    match expr {
        Expr::Ref(path) => {
            let alias = path.first().ok_or(CompileError::EmptyReferencePath)?;
            if !known.contains(alias) {
                return Err(CompileError::UnknownAlias(alias.clone()));
            }
            Ok(())
        }
        Expr::Val(_) => Ok(()),
        Expr::Func { args, .. } | Expr::Agg { args, .. } => {
            for arg in args {
                validate_expr(arg, known)?;
            }
            Ok(())
        }
    }
}

fn reject_aggregates(expr: &Expr, context: &str) -> Result<(), CompileError> {
    if expr.contains_aggregate() {
        return Err(CompileError::AggregateOutsideGroupBy(context.to_string()));
    }
    Ok(())
}

fn validate_clauses(ir: &QueryIr, known: &BTreeSet<String>) -> Result<(), CompileError> {
    for clause in &ir.where_clauses {
        validate_expr(clause, known)?;
        reject_aggregates(clause, "where clause")?;
    }
    for spec in &ir.order_by {
        // Grouped queries order by output columns; skip alias validation
        // for them (the record is flat at that point).
        if ir.group_by.is_empty() {
            validate_expr(&spec.expr, known)?;
        }
        reject_aggregates(&spec.expr, "orderBy")?;
    }
    for expr in &ir.group_by {
        validate_expr(expr, known)?;
        reject_aggregates(expr, "groupBy key")?;
    }
    if let Some(select) = &ir.select {
        for (_, expr) in select {
            validate_expr(expr, known)?;
            if ir.group_by.is_empty() {
                reject_aggregates(expr, "select")?;
            }
        }
    }
    for clause in &ir.having {
        validate_expr(clause, known)?;
    }
    if !ir.having.is_empty() && ir.group_by.is_empty() {
        return Err(CompileError::HavingWithoutGroupBy);
    }
    if ir.distinct && ir.select.is_none() {
        return Err(CompileError::DistinctWithoutSelect);
    }
    if ir.order_by.is_empty() {
        if ir.limit.is_some() {
            return Err(CompileError::LimitWithoutOrderBy);
        }
        if ir.offset.is_some() {
            return Err(CompileError::OffsetWithoutOrderBy);
        }
    }
    Ok(())
}

// |------------------|
// | Source streams   |
// |------------------|

// Wrap a raw (key, record) input as namespaced rows `{alias: record}`.
fn namespaced(input: &RowStream, alias: &str) -> RowStream {
    let alias = alias.to_string();
    input.map(move |(key, record)| {
        let mut row = serde_json::Map::new();
        row.insert(alias.clone(), record.clone());
        (key.clone(), Value::Object(row))
    })
}

fn compile_source(
    source: &SourceRef,
    ctx: &mut CompileContext<'_>,
) -> Result<RowStream, CompileError> {
    match source {
        SourceRef::Collection { collection, alias } => {
            if !ctx.sources.contains_key(collection) {
                return Err(CompileError::UnknownCollection(collection.clone()));
            }
            if ctx.inputs.contains_key(alias) {
                return Err(CompileError::DuplicateAlias(alias.clone()));
            }
            let (writer, stream) = ctx.graph.new_input::<(KeyValue, Value)>();
            ctx.inputs.insert(alias.clone(), writer);
            ctx.alias_collections.insert(alias.clone(), collection.clone());
            Ok(namespaced(&stream, alias))
        }
        SourceRef::Query { query, alias } => {
            if ctx.inputs.contains_key(alias) || ctx.alias_collections.contains_key(alias) {
                return Err(CompileError::DuplicateAlias(alias.clone()));
            }
            let identity = Arc::as_ptr(query) as usize;
            let inner = match ctx.subquery_cache.get(&identity) {
                Some(cached) => cached.clone(),
                None => {
                    let compiled = compile_query(query, ctx, false)?;
                    // Subquery consumers see plain records; the fractional
                    // index (if any) only mattered for the window itself.
                    let records = compiled.map(|(key, row)| (key.clone(), row.value.clone()));
                    ctx.subquery_cache.insert(identity, records.clone());
                    records
                }
            };
            ctx.alias_collections
                .insert(alias.clone(), format!("query:{identity:x}"));
            Ok(namespaced(&inner, alias))
        }
    }
}

// |-------|
// | Joins |
// |-------|

struct JoinPlan {
    /// Expression over the existing pipeline aliases.
    main_expr: Expr,
    /// Expression over the joined alias.
    joined_expr: Expr,
    /// Alias to subscribe lazily, with its probe field, if any.
    lazy: Option<(String, LazyAliasInfo, Expr)>,
}

// Classify the join condition sides and decide the active/lazy split.
fn plan_join(
    join: &JoinClause,
    ir: &QueryIr,
    join_index: usize,
    known: &BTreeSet<String>,
    ctx: &CompileContext<'_>,
) -> Result<JoinPlan, CompileError> {
    let new_alias = join.source.alias().to_string();

    let left_aliases = join.left.aliases();
    let right_aliases = join.right.aliases();
    for side in [&left_aliases, &right_aliases] {
        if side.len() != 1 {
            return Err(CompileError::InvalidJoinCondition(
                "each side must reference exactly one alias".to_string(),
            ));
        }
    }
    let left_alias = left_aliases.iter().next().unwrap().clone();
    let right_alias = right_aliases.iter().next().unwrap().clone();
    if left_alias == right_alias {
        return Err(CompileError::JoinSameAlias(left_alias));
    }

    let (main_expr, joined_expr) = if right_alias == new_alias && known.contains(&left_alias) {
        (join.left.clone(), join.right.clone())
    } else if left_alias == new_alias && known.contains(&right_alias) {
        (join.right.clone(), join.left.clone())
    } else {
        return Err(CompileError::InvalidJoinCondition(format!(
            "condition must equate the joined alias '{new_alias}' with an existing alias"
        )));
    };
    validate_expr(&main_expr, known)?;
    reject_aggregates(&main_expr, "join condition")?;
    reject_aggregates(&joined_expr, "join condition")?;

    // Index hints for direct-column join keys.
    for expr in [&main_expr, &joined_expr] {
        if let Some((alias, path)) = expr.as_direct_ref() {
            if let Some(id) = lookup_collection(ir, alias) {
                if let Some(source) = ctx.sources.get(&id) {
                    source.ensure_index_for_field(path);
                }
            }
        }
    }

    // Active/lazy split.
    let joined_is_collection = matches!(join.source, SourceRef::Collection { .. });
    let main_is_bare_root = join_index == 0
        && matches!(ir.from, Some(SourceRef::Collection { .. }))
        && known.len() == 1;

    let main_collection = ir.from.as_ref().and_then(|f| match f {
        SourceRef::Collection { collection, .. } => Some(collection.clone()),
        _ => None,
    });
    let joined_collection = match &join.source {
        SourceRef::Collection { collection, .. } => Some(collection.clone()),
        _ => None,
    };
    let self_join = main_collection.is_some() && main_collection == joined_collection;

    let lazy_side = match join.kind {
        JoinKind::Left => Some(LazySide::Joined),
        JoinKind::Right => Some(LazySide::Main),
        JoinKind::Inner => {
            match (&main_collection, &joined_collection) {
                (Some(main_id), Some(joined_id)) => {
                    let main_size =
                        ctx.sources.get(main_id).map(|s| s.size()).unwrap_or(0);
                    let joined_size =
                        ctx.sources.get(joined_id).map(|s| s.size()).unwrap_or(0);
                    // The smaller collection is iterated; the larger is
                    // only probed by key.
                    if main_size <= joined_size {
                        Some(LazySide::Joined)
                    } else {
                        Some(LazySide::Main)
                    }
                }
                _ => None,
            }
        }
        JoinKind::Full => None,
    };

    let lazy = match lazy_side {
        _ if self_join => None,
        Some(LazySide::Joined) if joined_is_collection => {
            joined_expr.as_direct_ref().map(|(_, path)| {
                (
                    new_alias.clone(),
                    LazyAliasInfo { field_path: path.to_vec() },
                    main_expr.clone(),
                )
            })
        }
        Some(LazySide::Main) if main_is_bare_root => {
            // The root alias can be lazy only while it is still a bare
            // collection scan.
            let root_alias = ir.from.as_ref().map(|f| f.alias().to_string()).unwrap();
            main_expr.as_direct_ref().map(|(_, path)| {
                (
                    root_alias,
                    LazyAliasInfo { field_path: path.to_vec() },
                    joined_expr.clone(),
                )
            })
        }
        _ => None,
    };

    // A join against a windowed subquery must not be lazy-optimized on
    // either side: indexes cover the full source, not the windowed subset.
    let lazy = if subquery_windowed(&join.source) { None } else { lazy };

    Ok(JoinPlan { main_expr, joined_expr, lazy })
}

enum LazySide {
    Main,
    Joined,
}

fn subquery_windowed(source: &SourceRef) -> bool {
    match source {
        SourceRef::Query { query, .. } => query.limit.is_some() || query.offset.is_some(),
        SourceRef::Collection { .. } => false,
    }
}

fn lookup_collection(ir: &QueryIr, alias: &str) -> Option<String> {
    let mut pairs = Vec::new();
    ir.collection_aliases(&mut pairs);
    pairs.into_iter().find(|(a, _)| a == alias).map(|(_, id)| id)
}

// Key a namespaced stream by the join expression's value hash, carrying the
// original (key, row) as payload.
fn keyed_by_join_expr(stream: &RowStream, expr: Expr) -> DiffStream<(u64, (KeyValue, Value))> {
    stream.map(move |(key, row)| {
        let join_value = expr.eval(row);
        (join_value.content_hash(), (key.clone(), row.clone()))
    })
}

fn merge_rows(left: Option<&Value>, right: Option<&Value>) -> Value {
    let mut merged = serde_json::Map::new();
    for side in [left, right].into_iter().flatten() {
        if let Value::Object(map) = side {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(merged)
}

fn join_key_part(side: Option<&(KeyValue, Value)>) -> KeyValue {
    side.map(|(key, _)| key.clone()).unwrap_or(KeyValue::Str("null".to_string()))
}

fn apply_join(
    main: &RowStream,
    join: &JoinClause,
    plan: &JoinPlan,
    joined: &RowStream,
    ctx: &mut CompileContext<'_>,
) -> RowStream {
    // Install the lazy-load tap on the active side before keying.
    let (main, joined) = match &plan.lazy {
        None => (main.clone(), joined.clone()),
        Some((lazy_alias, info, active_expr)) => {
            ctx.lazy_aliases.insert(lazy_alias.clone(), info.clone());
            let requests = Arc::clone(&ctx.lazy_requests);
            let seen: Arc<Mutex<FnvHashSet<u64>>> = Arc::new(Mutex::new(FnvHashSet::default()));
            let expr = active_expr.clone();
            let alias = lazy_alias.clone();
            let tap = move |message: &crate::multiset::MultiSet<(KeyValue, Value)>| {
                let mut seen = seen.lock().unwrap();
                let mut requests = requests.lock().unwrap();
                for ((_, row), _) in message.iter() {
                    let value = expr.eval(row);
                    if seen.insert(value.content_hash()) {
                        requests.push(LazyRequest { alias: alias.clone(), value: value.clone() });
                    }
                }
            };
            // The tap sits on whichever side is active (the opposite of
            // the lazy alias).
            if *lazy_alias == join.source.alias() {
                (main.tap(tap), joined.clone())
            } else {
                (main.clone(), joined.tap(tap))
            }
        }
    };

    let keyed_main = keyed_by_join_expr(&main, plan.main_expr.clone());
    let keyed_joined = keyed_by_join_expr(&joined, plan.joined_expr.clone());

    let joined_stream = keyed_main.join(&keyed_joined, join.kind).consolidate();

    // Reassemble: composite key "[main_key,joined_key]" and merged row.
    joined_stream.map(|(_, (left, right))| {
        let key = KeyValue::composite(&[join_key_part(left.as_ref()), join_key_part(right.as_ref())]);
        let row = merge_rows(
            left.as_ref().map(|(_, row)| row),
            right.as_ref().map(|(_, row)| row),
        );
        (key, row)
    })
}

// |-----------------|
// | Query pipeline  |
// |-----------------|

fn compile_query(
    ir: &QueryIr,
    ctx: &mut CompileContext<'_>,
    top_level: bool,
) -> Result<DiffStream<(KeyValue, OutputRow)>, CompileError> {
    let from = ir.from.as_ref().ok_or(CompileError::MissingFrom)?;

    let mut known: BTreeSet<String> = BTreeSet::new();
    known.insert(from.alias().to_string());
    let mut stream = compile_source(from, ctx)?;

    // Joins, in declaration order.
    for (index, join) in ir.joins.iter().enumerate() {
        let new_alias = join.source.alias().to_string();
        if known.contains(&new_alias) {
            return Err(CompileError::DuplicateAlias(new_alias));
        }
        let plan = plan_join(join, ir, index, &known, ctx)?;
        let joined = compile_source(&join.source, ctx)?;
        stream = apply_join(&stream, join, &plan, &joined, ctx);
        known.insert(new_alias);
    }

    validate_clauses(ir, &known)?;

    // Aliases that can be null-padded by an outer join. Pushing a filter
    // below the join for those would change outer-join semantics (the
    // post-join predicate sees nulls; the pushed one never would), so only
    // non-nullable aliases are push-down candidates.
    let mut nullable: BTreeSet<String> = BTreeSet::new();
    {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        if let Some(from) = &ir.from {
            seen.insert(from.alias().to_string());
        }
        for join in &ir.joins {
            let joined = join.source.alias().to_string();
            match join.kind {
                JoinKind::Inner => {}
                JoinKind::Left => {
                    nullable.insert(joined.clone());
                }
                JoinKind::Right => {
                    nullable.extend(seen.iter().cloned());
                }
                JoinKind::Full => {
                    nullable.insert(joined.clone());
                    nullable.extend(seen.iter().cloned());
                }
            }
            seen.insert(joined);
        }
    }

    // Filters. Single-alias clauses over collection sources are also
    // recorded for subscription push-down.
    for clause in &ir.where_clauses {
        let aliases = clause.aliases();
        if aliases.len() == 1 {
            let alias = aliases.iter().next().unwrap();
            let pushable = ctx.alias_collections.contains_key(alias)
                && !ctx.lazy_aliases.contains_key(alias)
                && !nullable.contains(alias)
                && ctx.inputs.contains_key(alias);
            if pushable {
                let stripped = clause.strip_alias();
                ctx.pushed_where
                    .entry(alias.clone())
                    .and_modify(|existing| {
                        *existing = crate::expr::and([existing.clone(), stripped.clone()]);
                    })
                    .or_insert(stripped);
            }
        }
        let predicate = clause.clone();
        stream = stream.filter(move |(_, row)| predicate.eval_truthy(row));
    }

    // Grouping (with having folded into the reduce) or plain projection.
    let mut aliases_for_projection = known.clone();
    let grouped = !ir.group_by.is_empty();
    if grouped {
        let group_exprs = ir.group_by.clone();
        let keyed = stream.map(move |(_, row)| {
            let key_values: Vec<Value> = group_exprs.iter().map(|e| e.eval(row)).collect();
            let rendered = serde_json::to_string(&key_values).unwrap_or_default();
            (KeyValue::Str(rendered), row.clone())
        });

        let effective_select: Vec<(String, Expr)> = match &ir.select {
            Some(entries) => entries.clone(),
            None => ir
                .group_by
                .iter()
                .enumerate()
                .map(|(i, expr)| {
                    let name = expr
                        .as_direct_ref()
                        .and_then(|(_, path)| path.last().cloned())
                        .unwrap_or_else(|| format!("key_{i}"));
                    (name, expr.clone())
                })
                .collect(),
        };
        let having = ir.having.clone();

        stream = keyed.reduce(move |entries: &[(Value, isize)]| {
            let total: isize = entries.iter().map(|(_, m)| *m).sum();
            if total <= 0 {
                return Vec::new();
            }
            let Some((representative, _)) = entries.iter().find(|(_, m)| *m > 0) else {
                return Vec::new();
            };
            for clause in &having {
                if clause.eval_with_group(representative, entries) != Value::Bool(true) {
                    return Vec::new();
                }
            }
            let mut record = serde_json::Map::new();
            for (name, expr) in &effective_select {
                record.insert(name.clone(), expr.eval_with_group(representative, entries));
            }
            vec![(Value::Object(record), 1)]
        });
        aliases_for_projection.clear();
    }

    // Projection to output records. Ordering happens on pre-projection
    // rows so order-by columns survive a narrowing select; grouped queries
    // are already projected and order by output columns.
    let select = if grouped { None } else { ir.select.clone() };
    let single_alias = if aliases_for_projection.len() == 1 {
        aliases_for_projection.iter().next().cloned()
    } else {
        None
    };
    let project: Arc<dyn Fn(&Value) -> Value + Send + Sync> = Arc::new(move |row: &Value| {
        match (&select, &single_alias) {
            (Some(entries), _) => {
                let mut record = serde_json::Map::new();
                for (name, expr) in entries {
                    record.insert(name.clone(), expr.eval(row));
                }
                Value::Object(record)
            }
            (None, Some(alias)) => row.get(alias).cloned().unwrap_or(Value::Null),
            (None, None) => row.clone(),
        }
    });

    let mut result: DiffStream<(KeyValue, OutputRow)> = if ir.order_by.is_empty() {
        let project = Arc::clone(&project);
        stream.map(move |(key, row)| {
            (key.clone(), OutputRow { value: project(row), order_key: None })
        })
    } else {
        let specs: Vec<OrderBySpec> = ir.order_by.clone();
        let comparator = Arc::new(move |a: &Value, b: &Value| -> Ordering {
            for spec in &specs {
                let va = spec.expr.eval(a);
                let vb = spec.expr.eval(b);
                let ord = match spec.direction {
                    Direction::Asc => value_compare(&va, &vb),
                    Direction::Desc => value_compare(&vb, &va),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let probe_slot = Arc::clone(&ctx.window_probe);
        let size_callback: Option<crate::operators::topk::SizeCallback> = if top_level {
            Some(Box::new(move |probe: WindowSizeProbe| {
                *probe_slot.lock().unwrap() = Some(probe);
            }))
        } else {
            None
        };

        if top_level {
            ctx.order_by_optimization = detect_order_by_index(ir, ctx);
        }

        let project = Arc::clone(&project);
        stream
            .consolidate()
            .order_by_with_fractional_index(OrderByOptions {
                limit: ir.limit,
                offset: ir.offset.unwrap_or(0),
                comparator,
                size_callback,
            })
            .map(move |(key, (row, index))| {
                (
                    key.clone(),
                    OutputRow { value: project(row), order_key: Some(index.clone()) },
                )
            })
    };

    // Distinct: re-key by the content of the selected record, collapse to a
    // single copy.
    if ir.distinct {
        let rekeyed = result.map(|(_, out)| {
            let key = KeyValue::Str(format!("{:016x}", out.value.content_hash()));
            (key, out.clone())
        });
        result = rekeyed.reduce(|entries: &[(OutputRow, isize)]| {
            let total: isize = entries.iter().map(|(_, m)| *m).sum();
            if total > 0 {
                vec![(entries[0].0.clone(), 1)]
            } else {
                Vec::new()
            }
        });
    }

    Ok(result)
}

// Order-by-by-index: limit present, exactly one ascending order-by entry
// that is a direct column reference on the root collection alias, and no
// grouping or distinct in the way.
fn detect_order_by_index(
    ir: &QueryIr,
    ctx: &CompileContext<'_>,
) -> Option<OrderByOptimizationInfo> {
    let limit = ir.limit?;
    if ir.order_by.len() != 1 || !ir.group_by.is_empty() || ir.distinct {
        return None;
    }
    let spec = &ir.order_by[0];
    if spec.direction != Direction::Asc {
        return None;
    }
    let (alias, path) = spec.expr.as_direct_ref()?;
    let root = ir.from.as_ref()?;
    let root_collection = match root {
        SourceRef::Collection { collection, alias: root_alias } if root_alias == alias => {
            collection.clone()
        }
        _ => return None,
    };
    // Windowed loading pairs with an all-changes-style subscription; a lazy
    // root would fight over who feeds the input.
    if ctx.lazy_aliases.contains_key(alias) {
        return None;
    }
    let source = ctx.sources.get(&root_collection)?;
    source.ensure_index_for_field(path);
    Some(OrderByOptimizationInfo {
        alias: alias.to_string(),
        field_path: path.to_vec(),
        offset: ir.offset.unwrap_or(0),
        limit,
    })
}
