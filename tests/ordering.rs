// Ordered queries: windows, fractional indices, index-backed loading.

use liveflow::expr::*;
use liveflow::testing::*;
use liveflow::{Direction, LiveQueryCollection, LiveQueryConfig, QueryIr};
use serde_json::json;

// Scores generated by the fixture: (i * 37) % 100 for i in 0..n.
fn scores_live(n: usize, query: QueryIr) -> anyhow::Result<(liveflow::LocalCollection, LiveQueryCollection)> {
    let scores = collection("scores").rows(sample_scores(n)).ready().build();
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [scores.as_source()])?;
    Ok((scores, live))
}

fn result_scores(live: &LiveQueryCollection) -> Vec<i64> {
    live.values().iter().map(|v| v["score"].as_i64().unwrap()).collect()
}

#[test]
fn ascending_limit_window() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(3);
    let (_scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});

    assert_eq!(result_scores(&live), vec![0, 11, 22]);
    Ok(())
}

#[test]
fn fractional_indices_are_strictly_monotonic() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(5);
    let (_scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});

    let rows = live.snapshot();
    assert_eq!(rows.len(), 5);
    for pair in rows.windows(2) {
        let a = pair[0].order_key.as_ref().expect("ordered row has an index");
        let b = pair[1].order_key.as_ref().expect("ordered row has an index");
        assert!(a < b, "{a} !< {b}");
    }
    Ok(())
}

#[test]
fn window_shifts_when_smaller_value_arrives() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(3);
    let (scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});
    assert_eq!(result_scores(&live), vec![0, 11, 22]);

    scores.insert(json!({"id": 11, "score": 5}))?;
    assert_eq!(result_scores(&live), vec![0, 5, 11]);
    Ok(())
}

#[test]
fn where_filter_refills_window_from_index() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .where_clause(gte(col(["s", "score"]), val(30)))
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(3);
    let (_scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});

    // The first index batch is entirely below the filter; the refill loop
    // keeps reading until the window fills.
    assert_eq!(result_scores(&live), vec![33, 37, 48]);
    Ok(())
}

#[test]
fn offset_skips_leading_rows() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .offset(2)
        .limit(2);
    let (_scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});

    assert_eq!(result_scores(&live), vec![22, 33]);
    Ok(())
}

#[test]
fn descending_order_uses_general_path() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Desc)
        .limit(2);
    let (_scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});

    assert_eq!(result_scores(&live), vec![96, 85]);
    Ok(())
}

#[test]
fn update_moving_row_past_loaded_range_is_replaced() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(3);
    let (scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});
    assert_eq!(result_scores(&live), vec![0, 11, 22]);

    // The smallest row jumps past everything loaded so far; the window
    // must backfill from the index rather than keep the moved row.
    scores.update(1i64, json!({"id": 1, "score": 50}));
    assert_eq!(result_scores(&live), vec![11, 22, 33]);
    Ok(())
}

#[test]
fn deletes_backfill_the_window() -> anyhow::Result<()> {
    let query = QueryIr::from_collection("scores", "s")
        .order_by(col(["s", "score"]), Direction::Asc)
        .limit(3);
    let (scores, live) = scores_live(10, query)?;
    let _sub = live.subscribe_changes(|_| {});
    assert_eq!(result_scores(&live), vec![0, 11, 22]);

    scores.delete(1i64); // the score-0 row
    assert_eq!(result_scores(&live), vec![11, 22, 33]);
    Ok(())
}

#[test]
fn multi_column_order_by_breaks_ties() -> anyhow::Result<()> {
    let rows = collection("rows")
        .rows([
            json!({"id": 1, "grp": "b", "rank": 2}),
            json!({"id": 2, "grp": "a", "rank": 2}),
            json!({"id": 3, "grp": "a", "rank": 1}),
        ])
        .ready()
        .build();
    let query = QueryIr::from_collection("rows", "r")
        .order_by(col(["r", "rank"]), Direction::Asc)
        .order_by(col(["r", "grp"]), Direction::Asc);
    let live = LiveQueryCollection::new(LiveQueryConfig::new(query), [rows.as_source()])?;
    let _sub = live.subscribe_changes(|_| {});

    let ids: Vec<i64> = live.values().iter().map(|v| v["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    Ok(())
}
