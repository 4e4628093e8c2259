use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dbc_core::{
    BindTable, Blob, BoundParam, DbError, PreparedStatement, ResultSet, Value, ValueType,
};
use rsfbclient::prelude::*;
use rsfbclient::{FbError, Row, SimpleConnection, SqlType};

use crate::driver::{lock_state, map_fb_err, FbConnState};

/// Per-statement state, owned by the connection's state map.
pub(crate) struct FbStmtSlot {
    pub(crate) sql: String,
    pub(crate) bind: BindTable,
    pub(crate) batch: Vec<Vec<BoundParam>>,
}

impl FbStmtSlot {
    pub(crate) fn new(sql: String, param_count: usize) -> Self {
        Self {
            sql,
            bind: BindTable::new(param_count),
            batch: Vec::new(),
        }
    }
}

/// Count `?` placeholders outside string literals.
pub(crate) fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut in_string = false;
    for c in sql.chars() {
        match c {
            '\'' => in_string = !in_string,
            '?' if !in_string => count += 1,
            _ => {}
        }
    }
    count
}

fn to_fb_params(params: &[BoundParam]) -> Result<Vec<SqlType>, DbError> {
    params.iter().map(to_fb_param).collect()
}

fn to_fb_param(param: &BoundParam) -> Result<SqlType, DbError> {
    Ok(match &param.value {
        Value::Null => SqlType::Null,
        Value::Int(v) => SqlType::Integer(i64::from(*v)),
        Value::Long(v) => SqlType::Integer(*v),
        Value::Float(v) => SqlType::Floating(f64::from(*v)),
        Value::Double(v) => SqlType::Floating(*v),
        Value::Varchar(s) => SqlType::Text(s.clone()),
        Value::Bool(v) => SqlType::Boolean(*v),
        Value::Date(d) => SqlType::Timestamp(
            d.and_hms_opt(0, 0, 0)
                .ok_or_else(|| DbError::parameter("date out of range"))?,
        ),
        Value::Timestamp(t) => SqlType::Timestamp(*t),
        Value::Blob(blob) => SqlType::Binary(blob.bytes()?.to_vec()),
    })
}

fn from_fb_value(value: &SqlType) -> Value {
    match value {
        SqlType::Text(s) => Value::Varchar(s.clone()),
        SqlType::Integer(v) => Value::Long(*v),
        SqlType::Floating(v) => Value::Double(*v),
        SqlType::Timestamp(t) => Value::Timestamp(*t),
        SqlType::Boolean(v) => Value::Bool(*v),
        SqlType::Binary(b) => Value::Blob(Blob::from_bytes(b.clone())),
        SqlType::Null => Value::Null,
        _ => Value::Null,
    }
}

fn row_columns(row: &Row) -> Vec<String> {
    row.cols.iter().map(|c| c.name.clone()).collect()
}

fn row_values(row: &Row) -> Vec<Value> {
    row.cols.iter().map(|c| from_fb_value(&c.value)).collect()
}

/// The live wire cursor of an open result set; borrows the connection it
/// was opened on.
///
/// The wire client's streaming iterator borrows the `SimpleConnection`
/// that lives in the same state map, so this is the one place that borrow
/// is erased. Sound under the invariants the connection state enforces:
///
/// - at most one `FbRowIter` exists per connection (`open_cursor`), and
///   every operation that touches the connection drops it first
///   (`release_open_cursor`), so the erased borrow is never aliased;
/// - cursors are cleared before the connection itself is dropped;
/// - nothing here is reachable outside the connection mutex, which also
///   covers the `Send` claim.
pub(crate) struct FbRowIter(Box<dyn Iterator<Item = Result<Row, FbError>>>);

unsafe impl Send for FbRowIter {}

impl FbRowIter {
    /// SAFETY: caller must register the value as the connection's single
    /// open cursor so the invariants above hold.
    unsafe fn erase<'a>(iter: Box<dyn Iterator<Item = Result<Row, FbError>> + 'a>) -> Self {
        Self(std::mem::transmute::<
            Box<dyn Iterator<Item = Result<Row, FbError>> + 'a>,
            Box<dyn Iterator<Item = Result<Row, FbError>> + 'static>,
        >(iter))
    }
}

/// An open server-side cursor plus one row of lookahead.
///
/// The lookahead exists so column names are known as soon as the statement
/// executes; every delivered row triggers a wire fetch for the one behind
/// it, so `next()` genuinely advances the live cursor.
pub(crate) struct FbCursor {
    pub(crate) iter: Option<FbRowIter>,
    pending: Option<Vec<Value>>,
    pending_error: Option<DbError>,
    current: Option<Vec<Value>>,
    position: u64,
    done: bool,
    invalidated: bool,
}

impl FbCursor {
    pub(crate) fn invalidate(&mut self) {
        self.iter = None;
        if !self.done {
            self.invalidated = true;
            self.pending = None;
            self.pending_error = None;
            self.current = None;
        }
    }
}

/// Execute a row-returning statement and register its cursor as the
/// connection's open one. Runs with the connection lock held.
pub(crate) fn open_query_cursor(
    state: &mut FbConnState,
    shared: &Arc<Mutex<FbConnState>>,
    sql: &str,
    params: Vec<SqlType>,
) -> Result<Box<dyn ResultSet>, DbError> {
    // A new statement takes over the wire session; any previous result set
    // loses its cursor.
    state.release_open_cursor();
    state.ensure_transaction()?;

    let conn: &mut SimpleConnection = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
    log::debug!("executing firebird query: {sql}");

    let iter = conn.query_iter(sql, params).map_err(|e| map_fb_err(&e))?;
    let mut boxed: Box<dyn Iterator<Item = Result<Row, FbError>> + '_> = Box::new(iter);

    // One-row lookahead so the column list is known up front.
    let (columns, pending, live) = match boxed.next() {
        Some(Ok(row)) => (row_columns(&row), Some(row_values(&row)), true),
        Some(Err(e)) => return Err(map_fb_err(&e)),
        None => (Vec::new(), None, false),
    };

    let iter = if live {
        // SAFETY: registered as the single open cursor right below;
        // see `FbRowIter` for the invariants.
        Some(unsafe { FbRowIter::erase(boxed) })
    } else {
        // The wire cursor is already exhausted; release its borrow on the
        // connection before the state is touched again.
        drop(boxed);
        None
    };

    let id = state.alloc_id();
    state.cursors.insert(
        id,
        FbCursor {
            iter,
            pending,
            pending_error: None,
            current: None,
            position: 0,
            done: false,
            invalidated: false,
        },
    );
    if live {
        state.open_cursor = Some(id);
    }

    Ok(Box::new(FbResultSet {
        state: shared.clone(),
        cursor_id: id,
        columns,
        closed: false,
    }))
}

/// Advance `cursor_id` by one row, fetching the next one from the wire.
/// Runs with the connection lock held.
fn step_cursor(state: &mut FbConnState, cursor_id: u64) -> Result<bool, DbError> {
    let FbConnState {
        cursors,
        open_cursor,
        ..
    } = state;
    let cursor = cursors
        .get_mut(&cursor_id)
        .ok_or_else(|| DbError::result_exhausted("result set is closed"))?;

    if cursor.invalidated {
        return Err(DbError::result_exhausted(
            "result set was invalidated by later activity on its connection",
        ));
    }
    if cursor.done {
        return Ok(false);
    }
    if let Some(err) = cursor.pending_error.take() {
        cursor.iter = None;
        cursor.done = true;
        cursor.current = None;
        if *open_cursor == Some(cursor_id) {
            *open_cursor = None;
        }
        return Err(err);
    }

    match cursor.pending.take() {
        Some(row) => {
            cursor.current = Some(row);
            cursor.position += 1;
            // Refill the lookahead from the live cursor.
            if let Some(iter) = cursor.iter.as_mut() {
                match iter.0.next() {
                    Some(Ok(row)) => cursor.pending = Some(row_values(&row)),
                    Some(Err(e)) => cursor.pending_error = Some(map_fb_err(&e)),
                    None => {
                        cursor.iter = None;
                        if *open_cursor == Some(cursor_id) {
                            *open_cursor = None;
                        }
                    }
                }
            }
            Ok(true)
        }
        None => {
            cursor.iter = None;
            cursor.done = true;
            cursor.current = None;
            if *open_cursor == Some(cursor_id) {
                *open_cursor = None;
            }
            Ok(false)
        }
    }
}

/// Prepared statement over one Firebird connection.
///
/// Bind state lives in the connection's state map, so every operation
/// serializes on the connection lock, and teardown happens there.
pub struct FbPreparedStatement {
    state: Arc<Mutex<FbConnState>>,
    id: u64,
    param_count: usize,
    closed: AtomicBool,
}

impl FbPreparedStatement {
    pub(crate) fn new(state: Arc<Mutex<FbConnState>>, id: u64, param_count: usize) -> Self {
        Self {
            state,
            id,
            param_count,
            closed: AtomicBool::new(false),
        }
    }
}

impl PreparedStatement for FbPreparedStatement {
    fn parameter_count(&self) -> usize {
        self.param_count
    }

    fn set_value(&self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        let slot = state
            .stmts
            .get_mut(&self.id)
            .ok_or(DbError::ConnectionClosed)?;
        slot.bind.set(index, ty, value)
    }

    fn execute_query(&self) -> Result<Box<dyn ResultSet>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let (sql, params) = {
            let slot = state
                .stmts
                .get(&self.id)
                .ok_or(DbError::ConnectionClosed)?;
            (slot.sql.clone(), to_fb_params(&slot.bind.snapshot()?)?)
        };
        open_query_cursor(state, &self.state, &sql, params)
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let (sql, params) = {
            let slot = state
                .stmts
                .get(&self.id)
                .ok_or(DbError::ConnectionClosed)?;
            (slot.sql.clone(), to_fb_params(&slot.bind.snapshot()?)?)
        };
        state.release_open_cursor();
        state.ensure_transaction()?;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing firebird update: {sql}");
        let affected = conn.execute(&sql, params).map_err(|e| map_fb_err(&e))?;
        Ok(affected as u64)
    }

    fn execute(&self) -> Result<bool, DbError> {
        let sql = {
            let guard = lock_state(&self.state);
            guard
                .stmts
                .get(&self.id)
                .ok_or(DbError::ConnectionClosed)?
                .sql
                .clone()
        };
        // The statement kind is not statically known here; treat leading
        // SELECT as row-returning and let the backend arbitrate the rest.
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            let mut rs = self.execute_query()?;
            rs.close();
            Ok(true)
        } else {
            self.execute_update()?;
            Ok(false)
        }
    }

    fn add_batch(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let slot = guard
            .stmts
            .get_mut(&self.id)
            .ok_or(DbError::ConnectionClosed)?;
        let snapshot = slot.bind.snapshot()?;
        slot.batch.push(snapshot);
        Ok(())
    }

    fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let (sql, entries) = {
            let slot = state
                .stmts
                .get_mut(&self.id)
                .ok_or(DbError::ConnectionClosed)?;
            (slot.sql.clone(), std::mem::take(&mut slot.batch))
        };
        state.release_open_cursor();
        state.ensure_transaction()?;

        let mut counts = Vec::with_capacity(entries.len());
        for entry in entries {
            let params = to_fb_params(&entry)?;
            let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
            let affected = conn.execute(&sql, params).map_err(|e| map_fb_err(&e))?;
            counts.push(affected as u64);
        }
        Ok(counts)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = lock_state(&self.state);
        guard.stmts.remove(&self.id);
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let guard = lock_state(&self.state);
        guard.conn.is_none() || !guard.stmts.contains_key(&self.id)
    }
}

impl Drop for FbPreparedStatement {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cursor-fetch result set: a view onto the open wire cursor held by the
/// connection. Every call synchronizes on the connection lock; the view is
/// invalidated when the connection closes or a later statement takes over
/// the session.
pub struct FbResultSet {
    state: Arc<Mutex<FbConnState>>,
    cursor_id: u64,
    columns: Vec<String>,
    closed: bool,
}

impl FbResultSet {
    fn with_cursor<T>(
        &self,
        read: impl FnOnce(&FbCursor) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("result set is closed"));
        }
        let guard = lock_state(&self.state);
        if guard.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        let cursor = guard
            .cursors
            .get(&self.cursor_id)
            .ok_or_else(|| DbError::result_exhausted("result set is closed"))?;
        if cursor.invalidated {
            return Err(DbError::result_exhausted(
                "result set was invalidated by later activity on its connection",
            ));
        }
        read(cursor)
    }
}

impl ResultSet for FbResultSet {
    fn next(&mut self) -> Result<bool, DbError> {
        if self.closed {
            return Err(DbError::result_exhausted("result set is closed"));
        }
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        step_cursor(state, self.cursor_id)
    }

    fn is_before_first(&self) -> bool {
        if self.closed {
            return false;
        }
        let guard = lock_state(&self.state);
        guard
            .cursors
            .get(&self.cursor_id)
            .is_some_and(|c| c.position == 0 && !c.done && !c.invalidated)
    }

    fn is_after_last(&self) -> bool {
        if self.closed {
            return false;
        }
        let guard = lock_state(&self.state);
        guard
            .cursors
            .get(&self.cursor_id)
            .is_some_and(|c| c.done && c.position > 0)
    }

    fn row(&self) -> u64 {
        if self.closed {
            return 0;
        }
        let guard = lock_state(&self.state);
        guard
            .cursors
            .get(&self.cursor_id)
            .filter(|c| c.current.is_some())
            .map_or(0, |c| c.position)
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_index(&self, name: &str) -> Result<u32, DbError> {
        self.columns
            .iter()
            .position(|c| c == name || c.eq_ignore_ascii_case(name))
            .map(|i| (i + 1) as u32)
            .ok_or_else(|| DbError::column_not_found(name.to_string()))
    }

    fn get_value(&self, column: u32) -> Result<Value, DbError> {
        self.with_cursor(|cursor| {
            let row = cursor.current.as_ref().ok_or_else(|| {
                if cursor.done {
                    DbError::result_exhausted("cursor is after the last row")
                } else {
                    DbError::result_exhausted("cursor is before the first row")
                }
            })?;
            if column == 0 || column as usize > row.len() {
                return Err(DbError::column_not_found(format!(
                    "column index {column} out of range 1..={}",
                    row.len()
                )));
            }
            Ok(row[column as usize - 1].clone())
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.open_cursor == Some(self.cursor_id) {
            state.open_cursor = None;
        }
        state.cursors.remove(&self.cursor_id);
    }
}

impl Drop for FbResultSet {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::count_placeholders;

    #[test]
    fn placeholders_inside_literals_are_ignored() {
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?, ?, 'a?b')"), 2);
        assert_eq!(count_placeholders("SELECT 1"), 0);
        assert_eq!(count_placeholders("UPDATE t SET a=? WHERE b='it''s?' AND c=?"), 2);
    }
}
