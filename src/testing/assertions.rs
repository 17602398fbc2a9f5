//! Assertion helpers for comparing query results.

use crate::live::LiveQueryCollection;
use crate::status::CollectionStatus;
use serde_json::Value;

fn canonical(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

/// Sort values by canonical JSON text, for order-insensitive comparison.
pub fn sorted_values(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by_key(|v| canonical(v));
    values
}

/// Assert two row sets are equal regardless of order.
pub fn assert_values_unordered_equal(actual: Vec<Value>, expected: Vec<Value>) {
    let actual = sorted_values(actual);
    let expected = sorted_values(expected);
    assert_eq!(
        actual, expected,
        "row sets differ\n  actual:   {actual:?}\n  expected: {expected:?}"
    );
}

/// Assert two row sequences are equal in order.
pub fn assert_values_equal(actual: Vec<Value>, expected: Vec<Value>) {
    assert_eq!(
        actual, expected,
        "row sequences differ\n  actual:   {actual:?}\n  expected: {expected:?}"
    );
}

/// Assert a live query's current status.
pub fn assert_status(live: &LiveQueryCollection, expected: CollectionStatus) {
    let actual = live.status();
    assert_eq!(actual, expected, "expected status {expected}, found {actual}");
}

/// Assert the live query holds exactly `expected` rows (order-insensitive).
pub fn assert_result_set(live: &LiveQueryCollection, expected: Vec<Value>) {
    assert_values_unordered_equal(live.values(), expected);
}

/// Assert the live query holds exactly `expected` rows in snapshot order.
pub fn assert_result_sequence(live: &LiveQueryCollection, expected: Vec<Value>) {
    assert_values_equal(live.values(), expected);
}
