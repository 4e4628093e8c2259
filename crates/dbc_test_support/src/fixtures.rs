use dbc_core::Value;

use crate::fake_driver::FakeRows;

/// Two-column `users` fixture used across contract tests.
pub fn users_rows() -> FakeRows {
    FakeRows::new(
        &["id", "name"],
        vec![
            vec![Value::Int(1), Value::Varchar("alice".into())],
            vec![Value::Int(2), Value::Varchar("bob".into())],
            vec![Value::Int(3), Value::Null],
        ],
    )
}

/// A single-cell result, the shape of a `SELECT 1` validation probe.
pub fn select_one() -> FakeRows {
    FakeRows::new(&["1"], vec![vec![Value::Int(1)]])
}
