// Core live-query scenarios: filtering, projection, updates, status.

use liveflow::expr::*;
use liveflow::testing::*;
use liveflow::{
    ChangeKind, CollectionStatus, KeyValue, LiveQueryCollection, LiveQueryConfig, QueryIr,
    ResultChange,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type Batches = Arc<Mutex<Vec<Vec<ResultChange>>>>;

fn batch_collector() -> (Batches, impl Fn(&[ResultChange]) + Send + Sync + 'static) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    (batches, move |batch: &[ResultChange]| {
        sink.lock().unwrap().push(batch.to_vec())
    })
}

#[test]
fn filters_active_users() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u")
        .where_clause(eq(col(["u", "active"]), val(true)));
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;

    let _sub = live.subscribe_changes(|_| {});
    assert_status(&live, CollectionStatus::Ready);
    assert_eq!(live.size(), 2);
    let ids: Vec<i64> = live.values().iter().map(|v| v["id"].as_i64().unwrap()).collect();
    assert_eq!(sorted_values(ids.iter().map(|i| json!(i)).collect()), vec![json!(1), json!(2)]);
    Ok(())
}

#[test]
fn empty_source_reaches_ready_via_synthetic_commit() -> anyhow::Result<()> {
    let empty = collection("empty").build(); // not ready yet
    let query = QueryIr::from_collection("empty", "e");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [empty.as_source()])?;

    let statuses: Arc<Mutex<Vec<CollectionStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let _status_sub = live.on_status_change(Arc::new(move |change| {
        sink.lock().unwrap().push(change.status);
    }));

    let _sub = live.subscribe_changes(|_| {});
    assert_status(&live, CollectionStatus::Loading);

    empty.mark_ready();
    assert_status(&live, CollectionStatus::Ready);
    assert_eq!(live.size(), 0);

    let statuses = statuses.lock().unwrap();
    assert_eq!(
        *statuses,
        vec![
            CollectionStatus::Loading,
            CollectionStatus::InitialCommit,
            CollectionStatus::Ready,
        ]
    );
    Ok(())
}

#[test]
fn update_emits_single_update_not_delete_insert_pair() -> anyhow::Result<()> {
    let items = collection("items")
        .rows([json!({"id": 1, "duration": 100})])
        .ready()
        .build();
    let query = QueryIr::from_collection("items", "i");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [items.as_source()])?;

    let (batches, sink) = batch_collector();
    let _sub = live.subscribe_changes(sink);
    batches.lock().unwrap().clear();

    items.update(1i64, json!({"id": 1, "duration": 250}));

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    let change = &batches[0][0];
    assert_eq!(change.kind, ChangeKind::Update);
    assert_eq!(change.value, json!({"id": 1, "duration": 250}));
    assert_eq!(change.previous, Some(json!({"id": 1, "duration": 100})));
    assert_eq!(live.get(&KeyValue::Int(1)), Some(json!({"id": 1, "duration": 250})));
    Ok(())
}

#[test]
fn insert_then_delete_restores_previous_output() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    let before = live.values();
    users.insert(json!({"id": 99, "name": "Temp", "active": true, "age": 1}))?;
    assert_eq!(live.size(), before.len() + 1);
    users.delete(99i64);
    assert_values_unordered_equal(live.values(), before);
    Ok(())
}

#[test]
fn select_projects_rows_through_expressions() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u")
        .where_clause(eq(col(["u", "id"]), val(1)))
        .select([
            ("name", col(["u", "name"])),
            ("loud", upper(col(["u", "name"]))),
            ("next_age", add(col(["u", "age"]), val(1))),
        ]);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    assert_result_set(
        &live,
        vec![json!({"name": "Alice", "loud": "ALICE", "next_age": 31})],
    );
    Ok(())
}

#[test]
fn string_functions_and_membership() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u")
        .where_clause(or([
            like(col(["u", "name"]), val("Ali%")),
            in_list(col(["u", "id"]), val(json!([3]))),
        ]))
        .select([("name", col(["u", "name"]))]);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    assert_result_set(
        &live,
        vec![json!({"name": "Alice"}), json!({"name": "Charlie"})],
    );
    Ok(())
}

#[test]
fn where_clause_tracks_rows_moving_in_and_out() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u")
        .where_clause(eq(col(["u", "active"]), val(true)));
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});
    assert_eq!(live.size(), 2);

    // Charlie becomes active.
    users.update(3i64, json!({"id": 3, "name": "Charlie", "active": true, "age": 35}));
    assert_eq!(live.size(), 3);

    // Alice becomes inactive.
    users.update(1i64, json!({"id": 1, "name": "Alice", "active": false, "age": 30}));
    assert_eq!(live.size(), 2);
    assert!(live.get(&KeyValue::Int(1)).is_none());
    Ok(())
}

#[test]
fn get_key_override_rekeys_results() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u");
    let config = LiveQueryConfig::new(query).get_key(|value: &Value| {
        KeyValue::Str(value["name"].as_str().unwrap_or("?").to_string())
    });
    let live = LiveQueryCollection::new(config, [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    assert!(live.get(&KeyValue::Str("Alice".to_string())).is_some());
    assert!(live.get(&KeyValue::Int(1)).is_none());
    Ok(())
}

#[test]
fn compile_errors_surface_at_construction() {
    let users = collection("users").ready().build();
    let source = users.as_source();

    let cases: Vec<QueryIr> = vec![
        // limit without order-by
        QueryIr::from_collection("users", "u").limit(5),
        // offset without order-by
        QueryIr::from_collection("users", "u").offset(5),
        // distinct without select
        QueryIr::from_collection("users", "u").distinct(),
        // having without group-by
        QueryIr::from_collection("users", "u").having(gt(count(col(["u", "id"])), val(1))),
        // aggregate outside group-by
        QueryIr::from_collection("users", "u").select([("n", count(col(["u", "id"])))]),
        // unknown alias in where
        QueryIr::from_collection("users", "u").where_clause(eq(col(["x", "id"]), val(1))),
        // unknown collection
        QueryIr::from_collection("missing", "m"),
    ];
    for query in cases {
        let result = LiveQueryCollection::new(LiveQueryConfig::new(query), [Arc::clone(&source)]);
        assert!(result.is_err());
    }
}

#[test]
fn run_count_increments_once_per_mutation() -> anyhow::Result<()> {
    let users = collection("users").rows(sample_users()).ready().build();
    let query = QueryIr::from_collection("users", "u");
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [users.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    let before = live.utils().run_count();
    users.insert(json!({"id": 50, "name": "Dave", "active": true, "age": 40}))?;
    assert_eq!(live.utils().run_count(), before + 1);
    users.delete(50i64);
    assert_eq!(live.utils().run_count(), before + 2);
    Ok(())
}
