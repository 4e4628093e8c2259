use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dbc_core::{
    BindTable, BoundParam, DbError, PreparedStatement, ResultSet, Value, ValueType,
};

use crate::driver::{lock_state, ConnState};
use crate::handle::StmtHandle;

/// Per-statement state, owned by the connection's state map.
pub(crate) struct StmtSlot {
    pub(crate) handle: StmtHandle,
    pub(crate) sql: String,
    pub(crate) bind: BindTable,
    pub(crate) batch: Vec<Vec<BoundParam>>,
    /// Open cursor over this statement's handle, if any.
    pub(crate) cursor: Option<u64>,
}

impl StmtSlot {
    pub(crate) fn new(handle: StmtHandle, sql: String) -> Self {
        let bind = BindTable::new(handle.param_count());
        Self {
            handle,
            sql,
            bind,
            batch: Vec::new(),
            cursor: None,
        }
    }
}

pub(crate) enum CursorSource {
    /// Ad-hoc query: the cursor owns its statement handle.
    Adhoc(StmtHandle),
    /// Cursor over a prepared statement's handle, by statement id.
    Stmt(u64),
}

/// An open stepwise cursor. `current` is the copied-out row after a
/// successful step, so accessors never touch the sqlite handle.
pub(crate) struct Cursor {
    pub(crate) source: CursorSource,
    pub(crate) position: u64,
    pub(crate) done: bool,
    pub(crate) current: Option<Vec<Value>>,
}

impl Cursor {
    pub(crate) fn new(source: CursorSource) -> Self {
        Self {
            source,
            position: 0,
            done: false,
            current: None,
        }
    }
}

/// Advance `cursor_id` by one row. Runs with the connection lock held.
fn step_cursor(state: &mut ConnState, cursor_id: u64) -> Result<bool, DbError> {
    let ConnState { cursors, stmts, .. } = state;
    let cursor = cursors
        .get_mut(&cursor_id)
        .ok_or_else(|| DbError::result_exhausted("result set is closed"))?;

    if cursor.done {
        return Ok(false);
    }

    let handle: &mut StmtHandle = match &mut cursor.source {
        CursorSource::Adhoc(handle) => handle,
        CursorSource::Stmt(stmt_id) => {
            &mut stmts
                .get_mut(stmt_id)
                .ok_or_else(|| DbError::result_exhausted("statement was closed"))?
                .handle
        }
    };

    match handle.step()? {
        Some(values) => {
            cursor.current = Some(values);
            cursor.position += 1;
            Ok(true)
        }
        None => {
            cursor.current = None;
            cursor.done = true;
            Ok(false)
        }
    }
}

/// Prepared statement over one SQLite connection.
///
/// Every operation acquires the connection's mutex: the statement handle is
/// library state on the same session, and closing it must never race with
/// other threads using the connection.
pub struct SqlitePreparedStatement {
    state: Arc<Mutex<ConnState>>,
    id: u64,
    param_count: usize,
    closed: AtomicBool,
}

impl SqlitePreparedStatement {
    pub(crate) fn new(state: Arc<Mutex<ConnState>>, id: u64, param_count: usize) -> Self {
        Self {
            state,
            id,
            param_count,
            closed: AtomicBool::new(false),
        }
    }
}

impl PreparedStatement for SqlitePreparedStatement {
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
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        let slot = state
            .stmts
            .get_mut(&self.id)
            .ok_or(DbError::ConnectionClosed)?;

        if slot.handle.column_count() == 0 {
            return Err(DbError::sql("statement does not return rows"));
        }
        let params = slot.bind.snapshot()?;
        slot.handle.open(&params)?;
        log::debug!("executing query statement #{}: {}", self.id, slot.sql);

        // Re-execution closes the statement's previous result set.
        let stale = slot.cursor.take();
        let columns = slot.handle.columns().to_vec();
        if let Some(old) = stale {
            state.cursors.remove(&old);
        }

        let cursor_id = state.alloc_id();
        state
            .cursors
            .insert(cursor_id, Cursor::new(CursorSource::Stmt(self.id)));
        if let Some(slot) = state.stmts.get_mut(&self.id) {
            slot.cursor = Some(cursor_id);
        }

        Ok(Box::new(SqliteResultSet::new(
            self.state.clone(),
            cursor_id,
            columns,
        )))
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }

        let stale = {
            let slot = state
                .stmts
                .get_mut(&self.id)
                .ok_or(DbError::ConnectionClosed)?;
            if slot.handle.column_count() > 0 {
                return Err(DbError::sql(
                    "statement returns rows; use executeQuery instead",
                ));
            }
            slot.cursor.take()
        };
        if let Some(old) = stale {
            state.cursors.remove(&old);
        }

        let slot = state
            .stmts
            .get_mut(&self.id)
            .ok_or(DbError::ConnectionClosed)?;
        let params = slot.bind.snapshot()?;
        log::debug!("executing update statement #{}: {}", self.id, slot.sql);
        slot.handle.execute(&params)
    }

    fn execute(&self) -> Result<bool, DbError> {
        let returns_rows = {
            let guard = lock_state(&self.state);
            if guard.conn.is_none() {
                return Err(DbError::ConnectionClosed);
            }
            let slot = guard.stmts.get(&self.id).ok_or(DbError::ConnectionClosed)?;
            slot.handle.column_count() > 0
        };
        if returns_rows {
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
        let state = &mut *guard;
        let slot = state
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
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        let slot = state
            .stmts
            .get_mut(&self.id)
            .ok_or(DbError::ConnectionClosed)?;
        if slot.handle.column_count() > 0 {
            return Err(DbError::sql("batch execution requires an update statement"));
        }

        let entries = std::mem::take(&mut slot.batch);
        let mut counts = Vec::with_capacity(entries.len());
        for entry in entries {
            counts.push(slot.handle.execute(&entry)?);
        }
        Ok(counts)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if let Some(slot) = state.stmts.remove(&self.id) {
            if let Some(cursor_id) = slot.cursor {
                state.cursors.remove(&cursor_id);
            }
        }
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let guard = lock_state(&self.state);
        guard.conn.is_none() || !guard.stmts.contains_key(&self.id)
    }
}

impl Drop for SqlitePreparedStatement {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cursor-fetch result set: a view onto an open cursor held by the
/// connection. Every call synchronizes on the connection lock; the view is
/// invalidated when the connection closes or the statement re-executes.
pub struct SqliteResultSet {
    state: Arc<Mutex<ConnState>>,
    cursor_id: u64,
    columns: Vec<String>,
    closed: bool,
}

impl SqliteResultSet {
    pub(crate) fn new(state: Arc<Mutex<ConnState>>, cursor_id: u64, columns: Vec<String>) -> Self {
        Self {
            state,
            cursor_id,
            columns,
            closed: false,
        }
    }
}

impl ResultSet for SqliteResultSet {
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
            .is_some_and(|c| c.position == 0 && !c.done)
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
            .position(|c| c == name)
            .map(|i| (i + 1) as u32)
            .ok_or_else(|| DbError::column_not_found(name.to_string()))
    }

    fn get_value(&self, column: u32) -> Result<Value, DbError> {
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
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if let Some(cursor) = state.cursors.remove(&self.cursor_id) {
            if let CursorSource::Stmt(stmt_id) = cursor.source {
                if let Some(slot) = state.stmts.get_mut(&stmt_id) {
                    if slot.cursor == Some(self.cursor_id) {
                        slot.cursor = None;
                    }
                    slot.handle.close_cursor();
                }
            }
        }
    }
}

impl Drop for SqliteResultSet {
    fn drop(&mut self) {
        self.close();
    }
}
