//! # Liveflow
//!
//! An **incremental view maintenance engine** for Rust: declare SQL-like
//! queries (from/where/join/group-by/order-by/limit) over keyed source
//! collections, and get a result collection that stays synchronized as the
//! sources change — emitting minimal per-change deltas instead of
//! recomputing.
//!
//! ## Key Features
//!
//! - **Differential multiset dataflow** - signed multiplicities flowing
//!   through a graph of map/filter/join/reduce/consolidate operators
//! - **Hybrid keyed index** - a single-value fast path with a hashed
//!   multi-value fallback, so unchanged keys are never rehashed
//! - **Query compiler** - IR → dataflow wiring with active/lazy join
//!   planning, lazy key loading, and order-by-by-index detection
//! - **Live-query coordinator** - per-alias subscriptions, validated
//!   lifecycle status, GC, and re-subscription with a fresh graph
//! - **Windowed ordering** - range-index-backed top-K with fractional
//!   index strings that never require renumbering
//! - **Transaction-scoped scheduling** - an N-collection transaction
//!   triggers exactly one graph run per live query
//!
//! ## Quick Start
//!
//! ```no_run
//! use liveflow::expr::{col, eq, val};
//! use liveflow::testing::{collection, AsSource};
//! use liveflow::{LiveQueryCollection, LiveQueryConfig, QueryIr};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! // A keyed source collection.
//! let users = collection("users")
//!     .rows([
//!         json!({"id": 1, "name": "Alice", "active": true}),
//!         json!({"id": 2, "name": "Bob", "active": false}),
//!     ])
//!     .ready()
//!     .build();
//!
//! // A live query over it.
//! let query = QueryIr::from_collection("users", "u")
//!     .where_clause(eq(col(["u", "active"]), val(true)));
//! let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
//!
//! // Subscribing starts synchronization; changes arrive as batches.
//! let sub = live.subscribe_changes(|batch| {
//!     for change in batch {
//!         println!("{:?} {}", change.kind, change.key);
//!     }
//! });
//!
//! users.insert(json!({"id": 3, "name": "Carol", "active": true}))?;
//! assert_eq!(live.size(), 2);
//! sub.unsubscribe();
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Difference streams
//!
//! Every edge of the dataflow graph carries [`MultiSet`] deltas: bags of
//! `(value, signed multiplicity)` pairs. `+n` asserts n copies, `-n`
//! retracts them; [`MultiSet::consolidate`] nets entries out by content
//! hash and drops zeros. Operators transform deltas, never snapshots.
//!
//! ### The graph
//!
//! A [`GraphBuilder`] hands out typed [`DiffStream`] handles whose methods
//! (`map`, `filter`, `join`, `reduce`, `order_by_with_fractional_index`,
//! `output`, ...) insert stateful operators. `finalize()` seals the graph;
//! [`Graph::run`] executes operators in dependency order until no input
//! message is pending.
//!
//! ### Queries
//!
//! A [`QueryIr`] describes what to maintain; [`compiler::compile`] wires it
//! into a graph. Expressions ([`expr`]) are tagged variants evaluated over
//! namespaced rows (`{"alias": {record}}`).
//!
//! ### Live queries
//!
//! [`LiveQueryCollection`] owns the compiled graph, subscribes each query
//! alias to its source with the flavor the compiler chose (all-changes,
//! lazy matching-changes, or ordered/windowed), runs the graph to fixed
//! point after every flush, and exposes the result set plus
//! insert/update/delete batches to subscribers.
//!
//! ### Sources
//!
//! Anything implementing [`SourceCollection`] can feed a live query. The
//! crate ships [`LocalCollection`], an in-memory transactional reference
//! implementation with sorted field indexes, used heavily by the test
//! suite.
//!
//! ## Module Overview
//!
//! - [`multiset`] - signed-multiplicity bags
//! - [`index`] - the hybrid keyed index behind joins and reduces
//! - [`graph`] / [`stream`] - operator registry and typed difference streams
//! - [`operators`] - map, filter, tap, consolidate, join, reduce, top-K,
//!   output
//! - [`fractional`] - fractional index generation
//! - [`expr`] / [`ir`] - expression language and query IR
//! - [`compiler`] - IR → graph, join planning, lazy loading, order-by
//!   optimization
//! - [`source`] / [`local`] - the source-collection surface and its
//!   in-memory implementation
//! - [`subscription`] - all-changes / lazy / windowed alias subscriptions
//! - [`scheduler`] - transaction-scoped run coalescing
//! - [`live`] - the coordinator and result collection
//! - [`status`] / [`changes`] - lifecycle states and change messages
//! - [`testing`] - assertions, builders, fixtures
//! - [`metrics`] - execution statistics (feature: `metrics`)

pub mod changes;
pub mod compiler;
pub mod expr;
pub mod fractional;
pub mod graph;
pub mod index;
pub mod ir;
pub mod live;
pub mod local;
pub mod multiset;
pub mod operators;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod stream;
pub mod subscription;
pub mod testing;
pub mod value;

#[cfg(feature = "metrics")]
pub mod metrics;

// General re-exports
pub use changes::{ChangeKind, ResultChange, SourceChange};
pub use compiler::{compile, CompileError, CompiledPipeline, OutputRow};
pub use graph::{Graph, GraphBuilder, Operator, OperatorId};
pub use index::KeyedIndex;
pub use ir::{Direction, JoinClause, OrderBySpec, QueryIr, SourceRef};
pub use live::{LiveQueryCollection, LiveQueryConfig, LiveSubscription, ResultRow};
pub use local::{LocalCollection, LocalCollectionConfig, Transaction};
pub use multiset::MultiSet;
pub use operators::{JoinKind, OutputEvent};
pub use scheduler::TransactionScheduler;
pub use source::{FieldIndex, IndexOp, LoadSubset, PendingHandle, SourceCollection};
pub use status::{CollectionStatus, StatusChange, StatusError};
pub use stream::{DiffStream, InputWriter};
pub use value::{value_compare, value_eq, ContentHash, KeyValue};
