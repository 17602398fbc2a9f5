//! Testing utilities for live queries.
//!
//! This module provides the pieces the integration suite (and embedders'
//! tests) lean on:
//!
//! - **Assertions**: order-insensitive row comparisons and status checks.
//! - **Builders**: fluently construct ready [`LocalCollection`]s from rows.
//! - **Fixtures**: small datasets used across scenario tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use liveflow::testing::*;
//! use liveflow::{expr::*, LiveQueryCollection, LiveQueryConfig, QueryIr};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let users = collection("users")
//!     .rows([json!({"id": 1, "name": "Alice", "active": true})])
//!     .ready()
//!     .build();
//!
//! let query = QueryIr::from_collection("users", "u")
//!     .where_clause(eq(col(["u", "active"]), val(true)));
//! let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
//! let _sub = live.subscribe_changes(|_| {});
//! assert_values_unordered_equal(live.values(), vec![json!({"id": 1, "name": "Alice", "active": true})]);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;

pub use assertions::*;
pub use builders::*;
pub use fixtures::*;
