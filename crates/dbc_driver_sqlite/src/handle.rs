//! Owner of one prepared statement and, optionally, its open row cursor.
//!
//! Statements and cursors step row-by-row against the connection handle, so
//! they live in the connection's state map and every touch happens under
//! the connection mutex. `rusqlite`'s `Statement` and `Rows` borrow the
//! connection and the statement respectively; `StmtHandle` is the one
//! place those lifetimes are erased so the pair can be stored next to the
//! connection that backs them.
//!
//! The erasure is sound under three invariants the connection state
//! enforces:
//! - the `rusqlite::Connection` is heap-allocated and dropped only after
//!   the statement and cursor maps have been cleared;
//! - `rows` is dropped or replaced before `stmt` is used again (`open`,
//!   `execute`, and `close_cursor` are the only entry points);
//! - nothing here is reachable outside the connection mutex, which also
//!   covers the `Send` claim.

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Rows, Statement, ToSql};

use dbc_core::{Blob, BoundParam, DbError, Value};

use crate::driver::map_rusqlite_err;

pub(crate) struct StmtHandle {
    /// Open cursor over `stmt`. Declared first so it always drops first.
    rows: Option<Rows<'static>>,
    stmt: Box<Statement<'static>>,
    columns: Vec<String>,
    param_count: usize,
}

// Only ever touched with the owning connection's mutex held.
unsafe impl Send for StmtHandle {}

impl StmtHandle {
    pub fn prepare(conn: &rusqlite::Connection, sql: &str) -> Result<Self, DbError> {
        let stmt = conn.prepare(sql).map_err(|e| map_rusqlite_err(&e))?;
        let columns = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let param_count = stmt.parameter_count();

        // SAFETY: the statement borrows the heap-allocated connection held
        // in the same state map; teardown clears this handle before the
        // connection drops (see module docs).
        let stmt: Statement<'static> = unsafe { std::mem::transmute(stmt) };

        Ok(Self {
            rows: None,
            stmt: Box::new(stmt),
            columns,
            param_count,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Bind a fully populated slot table and open the row cursor,
    /// discarding any previous one.
    pub fn open(&mut self, params: &[BoundParam]) -> Result<(), DbError> {
        self.rows = None;
        let rows = self
            .stmt
            .query(params_from_iter(params.iter().map(BindValue)))
            .map_err(|e| map_rusqlite_err(&e))?;

        // SAFETY: the cursor borrows the boxed statement above it; it is
        // dropped before the statement is touched again (see module docs).
        let rows: Rows<'static> = unsafe { std::mem::transmute(rows) };
        self.rows = Some(rows);
        Ok(())
    }

    /// Advance the open cursor one row. `Ok(None)` at the end of the rows
    /// (or when no cursor is open); the cursor closes itself on both end
    /// and error.
    pub fn step(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        match rows.next() {
            Ok(Some(row)) => Ok(Some(row_values(row, self.columns.len()))),
            Ok(None) => {
                self.rows = None;
                Ok(None)
            }
            Err(e) => {
                let err = map_rusqlite_err(&e);
                self.rows = None;
                Err(err)
            }
        }
    }

    /// Run a non-row-returning form with the given binds; returns the
    /// affected row count.
    pub fn execute(&mut self, params: &[BoundParam]) -> Result<u64, DbError> {
        self.rows = None;
        let affected = self
            .stmt
            .execute(params_from_iter(params.iter().map(BindValue)))
            .map_err(|e| map_rusqlite_err(&e))?;
        Ok(affected as u64)
    }

    /// Drop the open cursor, resetting the statement.
    pub fn close_cursor(&mut self) {
        self.rows = None;
    }
}

/// Bound parameter as a `rusqlite` bind value.
struct BindValue<'a>(&'a BoundParam);

impl ToSql for BindValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match &self.0.value {
            Value::Null => SqlValue::Null,
            Value::Int(v) => SqlValue::Integer(i64::from(*v)),
            Value::Long(v) => SqlValue::Integer(*v),
            Value::Float(v) => SqlValue::Real(f64::from(*v)),
            Value::Double(v) => SqlValue::Real(*v),
            Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
            Value::Varchar(s) => SqlValue::Text(s.clone()),
            Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(t) => SqlValue::Text(t.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Blob(blob) => {
                let bytes = blob
                    .bytes()
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                SqlValue::Blob(bytes.to_vec())
            }
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Copy every column of the current row out of the cursor.
fn row_values(row: &rusqlite::Row, count: usize) -> Vec<Value> {
    (0..count).map(|i| column_value(row, i)).collect()
}

fn column_value(row: &rusqlite::Row, idx: usize) -> Value {
    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Integer(i)) => Value::Long(i),
        Ok(ValueRef::Real(f)) => Value::Double(f),
        Ok(ValueRef::Text(t)) => Value::Varchar(String::from_utf8_lossy(t).into_owned()),
        Ok(ValueRef::Blob(b)) => Value::Blob(Blob::from_bytes(b.to_vec())),
        Err(_) => Value::Null,
    }
}
