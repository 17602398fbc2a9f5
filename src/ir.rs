//! The query IR: the declarative description a live query is compiled from.
//!
//! A [`QueryIr`] names a root source (`from`), optional joins, filters,
//! grouping, ordering and windowing. Sources are tagged variants — a keyed
//! collection reference or a nested subquery. The builder methods here are
//! thin and only assemble the IR; all validation happens in the compiler so
//! errors surface at live-query construction.

use crate::expr::Expr;
use crate::operators::JoinKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A query source: a collection reference or a subquery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRef {
    /// A keyed source collection, referenced by id and bound to an alias.
    Collection { collection: String, alias: String },
    /// A nested subquery bound to an alias. Subqueries are shared by
    /// reference; the compiler memoizes compiled subtrees by identity.
    Query { query: Arc<QueryIr>, alias: String },
}

impl SourceRef {
    /// The alias this source is bound to.
    pub fn alias(&self) -> &str {
        match self {
            SourceRef::Collection { alias, .. } | SourceRef::Query { alias, .. } => alias,
        }
    }
}

/// One join clause: the joined source, the join kind, and the equality
/// condition `left = right` over the participating aliases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinClause {
    pub source: SourceRef,
    pub kind: JoinKind,
    pub left: Expr,
    pub right: Expr,
}

/// Sort direction for an order-by entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One order-by entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderBySpec {
    pub expr: Expr,
    pub direction: Direction,
}

/// A complete query description.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryIr {
    pub from: Option<SourceRef>,
    pub joins: Vec<JoinClause>,
    pub where_clauses: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    /// Output columns: `(name, expression)`. `None` keeps source rows.
    pub select: Option<Vec<(String, Expr)>>,
    pub order_by: Vec<OrderBySpec>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    pub single_result: bool,
}

impl QueryIr {
    /// Start a query over a source collection.
    pub fn from_collection(collection: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            from: Some(SourceRef::Collection {
                collection: collection.into(),
                alias: alias.into(),
            }),
            ..Self::default()
        }
    }

    /// Start a query over a subquery.
    pub fn from_query(query: Arc<QueryIr>, alias: impl Into<String>) -> Self {
        Self {
            from: Some(SourceRef::Query { query, alias: alias.into() }),
            ..Self::default()
        }
    }

    /// Join a source collection on `left = right`.
    pub fn join_collection(
        mut self,
        kind: JoinKind,
        collection: impl Into<String>,
        alias: impl Into<String>,
        left: Expr,
        right: Expr,
    ) -> Self {
        self.joins.push(JoinClause {
            source: SourceRef::Collection {
                collection: collection.into(),
                alias: alias.into(),
            },
            kind,
            left,
            right,
        });
        self
    }

    /// Join a subquery on `left = right`.
    pub fn join_query(
        mut self,
        kind: JoinKind,
        query: Arc<QueryIr>,
        alias: impl Into<String>,
        left: Expr,
        right: Expr,
    ) -> Self {
        self.joins.push(JoinClause {
            source: SourceRef::Query { query, alias: alias.into() },
            kind,
            left,
            right,
        });
        self
    }

    /// Add a filter clause; multiple clauses are conjoined.
    pub fn where_clause(mut self, expr: Expr) -> Self {
        self.where_clauses.push(expr);
        self
    }

    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.group_by.extend(exprs);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having.push(expr);
        self
    }

    /// Set the output columns.
    pub fn select<S: Into<String>>(mut self, entries: impl IntoIterator<Item = (S, Expr)>) -> Self {
        self.select = Some(entries.into_iter().map(|(n, e)| (n.into(), e)).collect());
        self
    }

    pub fn order_by(mut self, expr: Expr, direction: Direction) -> Self {
        self.order_by.push(OrderBySpec { expr, direction });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Mark the query as expecting at most one row.
    pub fn single_result(mut self) -> Self {
        self.single_result = true;
        self
    }

    /// Collect `(alias, collection id)` pairs for every collection the
    /// query depends on, including aliases introduced by subqueries. Two
    /// aliases may name the same collection (self-joins).
    pub fn collection_aliases(&self, out: &mut Vec<(String, String)>) {
        let mut visit = |source: &SourceRef| match source {
            SourceRef::Collection { collection, alias } => {
                out.push((alias.clone(), collection.clone()));
            }
            SourceRef::Query { query, .. } => query.collection_aliases(out),
        };
        if let Some(from) = &self.from {
            visit(from);
        }
        for join in &self.joins {
            visit(&join.source);
        }
    }

    /// The distinct collection ids the query depends on.
    pub fn collection_ids(&self) -> BTreeSet<String> {
        let mut pairs = Vec::new();
        self.collection_aliases(&mut pairs);
        pairs.into_iter().map(|(_, id)| id).collect()
    }
}
