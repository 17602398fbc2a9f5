// Transaction-scoped scheduling: batching, rollback, truncation.

use liveflow::expr::*;
use liveflow::testing::*;
use liveflow::{
    ChangeKind, LiveQueryCollection, LiveQueryConfig, QueryIr, ResultChange, SourceCollection,
    Transaction, TransactionScheduler,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

type Batches = Arc<Mutex<Vec<Vec<ResultChange>>>>;

#[test]
fn one_transaction_one_batch_one_run() -> anyhow::Result<()> {
    let items = collection("items").ready().build();
    let query = QueryIr::from_collection("items", "i");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [items.as_source()])?;

    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let _sub = live.subscribe_changes(move |batch| sink.lock().unwrap().push(batch.to_vec()));
    let runs_before = live.utils().run_count();

    let mut tx = Transaction::begin();
    tx.insert(&items, json!({"id": 1, "v": "a"}))?;
    tx.insert(&items, json!({"id": 2, "v": "b"}))?;
    tx.insert(&items, json!({"id": 3, "v": "c"}))?;
    tx.commit();

    assert_eq!(live.utils().run_count(), runs_before + 1);
    assert_eq!(live.size(), 3);
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0].iter().all(|c| c.kind == ChangeKind::Insert));
    Ok(())
}

#[test]
fn transaction_spanning_collections_runs_each_query_once() -> anyhow::Result<()> {
    let left = collection("left").ready().build();
    let right = collection("right").ready().build();

    let live_left = LiveQueryCollection::new(
        LiveQueryConfig::new(QueryIr::from_collection("left", "l")),
        [left.as_source()],
    )?;
    let live_right = LiveQueryCollection::new(
        LiveQueryConfig::new(QueryIr::from_collection("right", "r")),
        [right.as_source()],
    )?;
    let _sub_l = live_left.subscribe_changes(|_| {});
    let _sub_r = live_right.subscribe_changes(|_| {});
    let runs_l = live_left.utils().run_count();
    let runs_r = live_right.utils().run_count();

    let mut tx = Transaction::begin();
    tx.insert(&left, json!({"id": 1}))?;
    tx.insert(&right, json!({"id": 2}))?;
    tx.commit();

    assert_eq!(live_left.utils().run_count(), runs_l + 1);
    assert_eq!(live_right.utils().run_count(), runs_r + 1);
    assert_eq!(live_left.size(), 1);
    assert_eq!(live_right.size(), 1);
    Ok(())
}

#[test]
fn rollback_leaves_no_state_and_no_scheduled_work() -> anyhow::Result<()> {
    let scheduler = TransactionScheduler::new();
    let items = collection("items").scheduler(scheduler.clone()).ready().build();
    let query = QueryIr::from_collection("items", "i");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [items.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    let mut tx = Transaction::begin();
    tx.insert(&items, json!({"id": 1, "v": "ghost"}))?;
    let context = tx.context().expect("context allocated");
    tx.rollback();

    assert!(!scheduler.has_pending_jobs(context));
    assert_eq!(items.size(), 0);
    assert_eq!(live.size(), 0);

    // The context can still be flushed harmlessly.
    scheduler.flush(context);
    assert_eq!(live.size(), 0);
    Ok(())
}

#[test]
fn dropping_an_uncommitted_transaction_rolls_back() -> anyhow::Result<()> {
    let items = collection("items").ready().build();
    {
        let mut tx = Transaction::begin();
        tx.insert(&items, json!({"id": 1}))?;
        // dropped without commit
    }
    assert_eq!(items.size(), 0);
    Ok(())
}

#[test]
fn truncate_mid_transaction_preserves_operation_order() -> anyhow::Result<()> {
    let items = collection("items")
        .rows([json!({"id": 1, "v": "old1"}), json!({"id": 2, "v": "old2"})])
        .ready()
        .build();
    let query = QueryIr::from_collection("items", "i");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [items.as_source()])?;

    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let _sub = live.subscribe_changes(move |batch| sink.lock().unwrap().push(batch.to_vec()));
    batches.lock().unwrap().clear();

    let mut tx = Transaction::begin();
    tx.truncate(&items);
    tx.insert(&items, json!({"id": 3, "v": "fresh"}))?;
    tx.commit();

    // One coherent batch: the old rows deleted, the new row inserted.
    assert_result_set(&live, vec![json!({"id": 3, "v": "fresh"})]);
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    let kinds: Vec<ChangeKind> = batches[0].iter().map(|c| c.kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Delete).count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Insert).count(), 1);
    Ok(())
}

#[test]
fn filtered_query_sees_consistent_transaction_snapshot() -> anyhow::Result<()> {
    let items = collection("items").ready().build();
    let query = QueryIr::from_collection("items", "i")
        .where_clause(eq(col(["i", "keep"]), val(true)));
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [items.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    // Insert and immediately delete within the same transaction: the query
    // never observes the row.
    let mut tx = Transaction::begin();
    tx.insert(&items, json!({"id": 1, "keep": true}))?;
    tx.delete(&items, 1i64);
    tx.insert(&items, json!({"id": 2, "keep": true}))?;
    tx.commit();

    assert_result_set(&live, vec![json!({"id": 2, "keep": true})]);
    Ok(())
}
