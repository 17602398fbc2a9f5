// Live joins: lazy key loading, outer kinds, transaction races, self-joins.

use liveflow::expr::*;
use liveflow::testing::*;
use liveflow::{
    JoinKind, KeyValue, LiveQueryCollection, LiveQueryConfig, QueryIr, ResultChange, Transaction,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn users_orders() -> (liveflow::LocalCollection, liveflow::LocalCollection) {
    let users = collection("users").rows(sample_users()).ready().build();
    let orders = collection("orders").rows(sample_orders()).ready().build();
    (users, orders)
}

#[test]
fn left_join_pads_unmatched_main_rows() -> anyhow::Result<()> {
    let (users, orders) = users_orders();
    let query = QueryIr::from_collection("users", "u").join_collection(
        JoinKind::Left,
        "orders",
        "o",
        col(["u", "id"]),
        col(["o", "user_id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [users.as_source(), orders.as_source()],
    )?;
    let _sub = live.subscribe_changes(|_| {});

    assert_eq!(live.size(), 4);

    // Charlie has no orders: his row carries only the user namespace.
    let charlie = live.get(&KeyValue::Str("[3,null]".to_string())).unwrap();
    assert_eq!(charlie["u"]["name"], json!("Charlie"));
    assert!(charlie.get("o").is_none());

    // Alice's orders joined through.
    let matched = live.get(&KeyValue::Str("[1,101]".to_string())).unwrap();
    assert_eq!(matched["u"]["name"], json!("Alice"));
    assert_eq!(matched["o"]["total"], json!(50));

    // Order 104 references a nonexistent user; a left join drops it.
    assert!(live.values().iter().all(|row| row["o"]["id"] != json!(104)));
    Ok(())
}

#[test]
fn right_join_keeps_unmatched_joined_rows() -> anyhow::Result<()> {
    let (users, orders) = users_orders();
    let query = QueryIr::from_collection("users", "u").join_collection(
        JoinKind::Right,
        "orders",
        "o",
        col(["u", "id"]),
        col(["o", "user_id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [users.as_source(), orders.as_source()],
    )?;
    let _sub = live.subscribe_changes(|_| {});

    assert_eq!(live.size(), 4);
    let orphan = live.get(&KeyValue::Str("[null,104]".to_string())).unwrap();
    assert_eq!(orphan["o"]["id"], json!(104));
    assert!(orphan.get("u").is_none());

    // Charlie never matches and right joins do not keep the main side.
    assert!(live.values().iter().all(|row| row
        .get("u")
        .map(|u| u["name"] != json!("Charlie"))
        .unwrap_or(true)));
    Ok(())
}

#[test]
fn full_join_keeps_both_unmatched_sides() -> anyhow::Result<()> {
    let (users, orders) = users_orders();
    let query = QueryIr::from_collection("users", "u").join_collection(
        JoinKind::Full,
        "orders",
        "o",
        col(["u", "id"]),
        col(["o", "user_id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [users.as_source(), orders.as_source()],
    )?;
    let _sub = live.subscribe_changes(|_| {});

    // 3 matched pairs + Charlie + orphan order.
    assert_eq!(live.size(), 5);
    assert!(live.get(&KeyValue::Str("[3,null]".to_string())).is_some());
    assert!(live.get(&KeyValue::Str("[null,104]".to_string())).is_some());
    Ok(())
}

#[test]
fn transaction_join_race_emits_once_with_one_run() -> anyhow::Result<()> {
    let a = collection("a_col").ready().build();
    let b = collection("b_col").ready().build();
    let query = QueryIr::from_collection("a_col", "a").join_collection(
        JoinKind::Inner,
        "b_col",
        "b",
        col(["a", "id"]),
        col(["b", "id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [a.as_source(), b.as_source()],
    )?;

    let batches: Arc<Mutex<Vec<Vec<ResultChange>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let _sub = live.subscribe_changes(move |batch| sink.lock().unwrap().push(batch.to_vec()));
    let runs_before = live.utils().run_count();

    // B first, then A, in one transaction.
    let mut tx = Transaction::begin();
    tx.insert(&b, json!({"id": 42, "side": "right"}))?;
    tx.insert(&a, json!({"id": 42, "side": "left"}))?;
    tx.commit();

    assert_eq!(live.utils().run_count(), runs_before + 1);
    assert_eq!(live.size(), 1);
    let row = live.get(&KeyValue::Str("[42,42]".to_string())).unwrap();
    assert_eq!(row["a"]["side"], json!("left"));
    assert_eq!(row["b"]["side"], json!("right"));

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].kind, liveflow::ChangeKind::Insert);
    Ok(())
}

#[test]
fn three_way_left_join_during_initial_load_commits_once() -> anyhow::Result<()> {
    let player = collection("player").build();
    let challenge1 = collection("challenge1").build();
    let challenge2 = collection("challenge2").build();

    let query = QueryIr::from_collection("player", "p")
        .join_collection(
            JoinKind::Left,
            "challenge1",
            "c1",
            col(["p", "id"]),
            col(["c1", "player_id"]),
        )
        .join_collection(
            JoinKind::Left,
            "challenge2",
            "c2",
            col(["p", "id"]),
            col(["c2", "player_id"]),
        );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [player.as_source(), challenge1.as_source(), challenge2.as_source()],
    )?;

    let batches: Arc<Mutex<Vec<Vec<ResultChange>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let _sub = live.subscribe_changes(move |batch| sink.lock().unwrap().push(batch.to_vec()));

    // Writes land while everything is still loading.
    player.insert(json!({"id": 1, "name": "P1"}))?;
    challenge1.insert(json!({"id": 10, "player_id": 1, "score": 3}))?;
    challenge2.insert(json!({"id": 20, "player_id": 1, "score": 7}))?;

    player.mark_ready();
    challenge1.mark_ready();
    challenge2.mark_ready();

    // Exactly one combined row, delivered as one initial batch; no
    // intermediate unjoined row ever reached the subscriber.
    assert_eq!(live.size(), 1);
    let row = live.values().remove(0);
    assert_eq!(row["p"]["name"], json!("P1"));
    assert_eq!(row["c1"]["score"], json!(3));
    assert_eq!(row["c2"]["score"], json!(7));

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    Ok(())
}

#[test]
fn self_join_resolves_managers() -> anyhow::Result<()> {
    let staff = collection("staff")
        .rows([
            json!({"id": 1, "name": "Root", "manager_id": null}),
            json!({"id": 2, "name": "Middle", "manager_id": 1}),
            json!({"id": 3, "name": "Leaf", "manager_id": 2}),
        ])
        .ready()
        .build();
    let query = QueryIr::from_collection("staff", "e")
        .join_collection(
            JoinKind::Inner,
            "staff",
            "m",
            col(["e", "manager_id"]),
            col(["m", "id"]),
        )
        .select([
            ("name", col(["e", "name"])),
            ("manager", col(["m", "name"])),
        ]);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [staff.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    assert_result_set(
        &live,
        vec![
            json!({"name": "Middle", "manager": "Root"}),
            json!({"name": "Leaf", "manager": "Middle"}),
        ],
    );
    Ok(())
}

#[test]
fn join_updates_flow_incrementally() -> anyhow::Result<()> {
    let (users, orders) = users_orders();
    let query = QueryIr::from_collection("users", "u").join_collection(
        JoinKind::Inner,
        "orders",
        "o",
        col(["u", "id"]),
        col(["o", "user_id"]),
    );
    let live = LiveQueryCollection::new(
        LiveQueryConfig::new(query),
        [users.as_source(), orders.as_source()],
    )?;
    let _sub = live.subscribe_changes(|_| {});
    assert_eq!(live.size(), 3);

    // A new order for Bob joins immediately.
    orders.insert(json!({"id": 105, "user_id": 2, "total": 70}))?;
    assert_eq!(live.size(), 4);
    let row = live.get(&KeyValue::Str("[2,105]".to_string())).unwrap();
    assert_eq!(row["o"]["total"], json!(70));

    // Deleting the user retracts all of their joined rows.
    users.delete(1i64);
    assert_eq!(live.size(), 2);
    assert!(live.values().iter().all(|r: &Value| r["u"]["id"] != json!(1)));
    Ok(())
}
