//! Pre-built datasets for scenario tests.

use serde_json::{json, Value};

/// Three users, two of them active.
pub fn sample_users() -> Vec<Value> {
    vec![
        json!({"id": 1, "name": "Alice", "active": true, "age": 30}),
        json!({"id": 2, "name": "Bob", "active": true, "age": 25}),
        json!({"id": 3, "name": "Charlie", "active": false, "age": 35}),
    ]
}

/// Orders referencing the sample users by `user_id`.
pub fn sample_orders() -> Vec<Value> {
    vec![
        json!({"id": 101, "user_id": 1, "total": 50}),
        json!({"id": 102, "user_id": 1, "total": 25}),
        json!({"id": 103, "user_id": 2, "total": 40}),
        json!({"id": 104, "user_id": 4, "total": 10}),
    ]
}

/// Scores spread over a value range, for order-by windows.
pub fn sample_scores(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"id": i as i64 + 1, "score": ((i * 37) % 100) as i64}))
        .collect()
}
