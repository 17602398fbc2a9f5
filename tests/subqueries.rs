// Subqueries: nesting, identity memoization, windowed-subquery planning.

use liveflow::expr::*;
use liveflow::testing::*;
use liveflow::{
    compile, Direction, JoinKind, LiveQueryCollection, LiveQueryConfig, QueryIr, SourceCollection,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[test]
fn from_subquery_composes_filters() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let active = Arc::new(
        QueryIr::from_collection("users", "u")
            .where_clause(eq(col(["u", "active"]), val(true))),
    );
    let query = QueryIr::from_query(active, "au")
        .where_clause(gte(col(["au", "age"]), val(30)))
        .select([("name", col(["au", "name"]))]);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    // Active AND at least 30: only Alice.
    assert_result_set(&live, vec![json!({"name": "Alice"})]);

    users.update(2i64, json!({"id": 2, "name": "Bob", "active": true, "age": 31}));
    assert_result_set(&live, vec![json!({"name": "Alice"}), json!({"name": "Bob"})]);
    Ok(())
}

#[test]
fn join_against_subquery() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let orders = collection("orders").rows(sample_orders()).ready().build();

    let big_orders = Arc::new(
        QueryIr::from_collection("orders", "o")
            .where_clause(gte(col(["o", "total"]), val(40))),
    );
    let query = QueryIr::from_collection("users", "u").join_query(
        JoinKind::Inner,
        big_orders,
        "big",
        col(["u", "id"]),
        col(["big", "user_id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [users.as_source(), orders.as_source()],
    )?;
    let _sub = live.subscribe_changes(|_| {});

    // Orders 101 (50) and 103 (40) pass; 102 and 104 do not match.
    assert_eq!(live.size(), 2);
    let totals: Vec<i64> = live
        .values()
        .iter()
        .map(|row| row["big"]["total"].as_i64().unwrap())
        .collect();
    assert_eq!(sorted_values(totals.iter().map(|t| json!(t)).collect()), vec![json!(40), json!(50)]);
    Ok(())
}

#[test]
fn shared_subquery_compiles_one_subtree() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let mut sources: HashMap<String, Arc<dyn SourceCollection>> = HashMap::new();
    sources.insert("users".to_string(), users.as_source());

    let shared = Arc::new(QueryIr::from_collection("users", "u"));
    let shared_twice = QueryIr::from_query(Arc::clone(&shared), "x").join_query(
        JoinKind::Inner,
        Arc::clone(&shared),
        "y",
        col(["x", "id"]),
        col(["y", "id"]),
    );

    let first = Arc::new(QueryIr::from_collection("users", "u"));
    let second = Arc::new(QueryIr::from_collection("users", "u2"));
    let duplicated = QueryIr::from_query(first, "x").join_query(
        JoinKind::Inner,
        second,
        "y",
        col(["x", "id"]),
        col(["y", "id"]),
    );

    let shared_pipeline = compile(&shared_twice, &sources).map_err(anyhow::Error::from)?;
    let duplicated_pipeline = compile(&duplicated, &sources).map_err(anyhow::Error::from)?;

    // The memoized subquery contributes its operators once; the two
    // distinct (if identical) subqueries pay twice.
    assert!(
        shared_pipeline.graph.operator_count() < duplicated_pipeline.graph.operator_count(),
        "{} !< {}",
        shared_pipeline.graph.operator_count(),
        duplicated_pipeline.graph.operator_count()
    );
    // And only one input stream exists for the shared inner alias.
    assert_eq!(shared_pipeline.inputs.len(), 1);
    assert_eq!(duplicated_pipeline.inputs.len(), 2);
    Ok(())
}

#[test]
fn windowed_subquery_disables_lazy_join_optimization() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let orders = collection("orders").rows(sample_orders()).ready().build();
    let mut sources: HashMap<String, Arc<dyn SourceCollection>> = HashMap::new();
    sources.insert("users".to_string(), users.as_source());
    sources.insert("orders".to_string(), orders.as_source());

    let top_orders = Arc::new(
        QueryIr::from_collection("orders", "o")
            .order_by(col(["o", "total"]), Direction::Desc)
            .limit(2),
    );
    let windowed = QueryIr::from_collection("users", "u").join_query(
        JoinKind::Left,
        Arc::clone(&top_orders),
        "top",
        col(["u", "id"]),
        col(["top", "user_id"]),
    );
    let pipeline = compile(&windowed, &sources).map_err(anyhow::Error::from)?;
    assert!(pipeline.lazy_aliases.is_empty());

    // The same join against a plain collection does get a lazy side.
    let plain = QueryIr::from_collection("users", "u").join_collection(
        JoinKind::Left,
        "orders",
        "o",
        col(["u", "id"]),
        col(["o", "user_id"]),
    );
    let pipeline = compile(&plain, &sources).map_err(anyhow::Error::from)?;
    assert_eq!(pipeline.lazy_aliases.len(), 1);
    assert!(pipeline.lazy_aliases.contains_key("o"));
    Ok(())
}

#[test]
fn subquery_with_window_feeds_outer_query() -> anyhow::Result<()> {
    let scores = collection("scores").rows(sample_scores(10)).ready().build();
    let top3 = Arc::new(
        QueryIr::from_collection("scores", "s")
            .order_by(col(["s", "score"]), Direction::Desc)
            .limit(3),
    );
    let query = QueryIr::from_query(top3, "t")
        .where_clause(gte(col(["t", "score"]), val(90)))
        .select([("score", col(["t", "score"]))]);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [scores.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    // Top three scores are 96, 85, 74; only 96 clears the outer filter.
    assert_result_set(&live, vec![json!({"score": 96})]);
    Ok(())
}
