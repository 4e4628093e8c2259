use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dbc_core::{
    DbError, DbUrl, Driver, DriverConnection, IsolationLevel, PreparedStatement,
    RelationalConnection, ResultSet,
};
use rusqlite::InterruptHandle;

use crate::handle::StmtHandle;
use crate::statement::{Cursor, CursorSource, SqlitePreparedStatement, SqliteResultSet, StmtSlot};

pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SqliteDriver {
    fn scheme(&self) -> &'static str {
        "sqlite"
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn connect(
        &self,
        url: &DbUrl,
        _user: &str,
        _password: &str,
    ) -> Result<DriverConnection, DbError> {
        let path = url.database().ok_or_else(|| {
            DbError::InvalidUrl("sqlite URL is missing a database path".to_string())
        })?;

        let conn = rusqlite::Connection::open(path)
            .map_err(|e| DbError::connection_failure(e.to_string()))?;
        let interrupt = conn.get_interrupt_handle();

        log::info!("opened sqlite database at {path}");

        Ok(DriverConnection::Relational(Arc::new(SqliteConnection {
            state: Arc::new(Mutex::new(ConnState {
                cursors: HashMap::new(),
                stmts: HashMap::new(),
                conn: Some(Box::new(conn)),
                next_id: 1,
                auto_commit: true,
                txn_active: false,
                isolation: IsolationLevel::Serializable,
                pooled: false,
            })),
            interrupt,
            url: url.as_str().to_string(),
        })))
    }
}

/// All mutable connection state, guarded by one mutex.
///
/// Statements and cursors live here rather than in their public handles so
/// that every library-held statement is finalized under this lock before
/// the connection handle drops. The connection is boxed so its address is
/// stable for the statements that reference it, and field order matters:
/// cursors and statements must drop before `conn`.
pub(crate) struct ConnState {
    pub(crate) cursors: HashMap<u64, Cursor>,
    pub(crate) stmts: HashMap<u64, StmtSlot>,
    pub(crate) conn: Option<Box<rusqlite::Connection>>,
    pub(crate) next_id: u64,
    pub(crate) auto_commit: bool,
    pub(crate) txn_active: bool,
    pub(crate) isolation: IsolationLevel,
    pub(crate) pooled: bool,
}

impl ConnState {
    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// A connection to one SQLite database file.
///
/// Statements and result sets issued by this connection share its mutex:
/// their teardown talks to the library-held connection handle, so it must
/// serialize with all other traffic on the same session.
pub struct SqliteConnection {
    state: Arc<Mutex<ConnState>>,
    interrupt: InterruptHandle,
    url: String,
}

pub(crate) fn lock_state(state: &Mutex<ConnState>) -> MutexGuard<'_, ConnState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn map_rusqlite_err(e: &rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(err, msg) = e {
        if err.code == rusqlite::ErrorCode::OperationInterrupted {
            return DbError::ConnectionClosed;
        }
        let message = msg
            .clone()
            .unwrap_or_else(|| format!("{:?} ({})", err.code, err.extended_code));
        return DbError::sql(message);
    }
    DbError::sql(e.to_string())
}

/// Roll back if needed, finalize every live statement and cursor, release
/// the library handle. Runs with the connection lock held.
fn close_locked(state: &mut ConnState) {
    if state.txn_active {
        if let Some(conn) = state.conn.as_ref() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                log::error!("rollback during close failed: {e}");
            }
        }
        state.txn_active = false;
    }
    state.cursors.clear();
    state.stmts.clear();
    state.conn = None;
}

fn reset_for_pool_locked(state: &mut ConnState) -> Result<(), DbError> {
    if state.txn_active {
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        conn.execute_batch("ROLLBACK").map_err(|e| map_rusqlite_err(&e))?;
        state.txn_active = false;
    }
    state.cursors.clear();
    state.stmts.clear();

    let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
    conn.execute_batch("PRAGMA read_uncommitted = 0")
        .map_err(|e| map_rusqlite_err(&e))?;
    state.auto_commit = true;
    state.isolation = IsolationLevel::Serializable;
    Ok(())
}

impl RelationalConnection for SqliteConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_deref().ok_or(DbError::ConnectionClosed)?;

        let handle = StmtHandle::prepare(conn, sql)?;
        let id = state.alloc_id();
        log::debug!("prepared statement #{id}: {sql}");

        let stmt = SqlitePreparedStatement::new(self.state.clone(), id, handle.param_count());
        state.stmts.insert(id, StmtSlot::new(handle, sql.to_string()));
        Ok(Arc::new(stmt))
    }

    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_deref().ok_or(DbError::ConnectionClosed)?;

        let mut handle = StmtHandle::prepare(conn, sql)?;
        if handle.column_count() == 0 {
            return Err(DbError::sql("statement does not return rows"));
        }
        handle.open(&[])?;
        let columns = handle.columns().to_vec();
        let id = state.alloc_id();
        state
            .cursors
            .insert(id, Cursor::new(CursorSource::Adhoc(handle)));
        log::debug!("opened ad-hoc cursor #{id}: {sql}");

        Ok(Box::new(SqliteResultSet::new(
            self.state.clone(),
            id,
            columns,
        )))
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let guard = lock_state(&self.state);
        let conn = guard.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        let affected = conn.execute(sql, []).map_err(|e| map_rusqlite_err(&e))?;
        Ok(affected as u64)
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;

        if enabled && state.txn_active {
            // Turning autocommit back on commits the open transaction.
            conn.execute_batch("COMMIT").map_err(|e| map_rusqlite_err(&e))?;
            state.txn_active = false;
        }
        // SQLite is always in autocommit outside an explicit transaction;
        // only the flag changes here.
        state.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        lock_state(&self.state).auto_commit
    }

    fn begin_transaction(&self) -> Result<bool, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;

        if state.auto_commit {
            return Err(DbError::transaction(
                "cannot begin a transaction while autocommit is enabled",
            ));
        }
        if state.txn_active {
            return Ok(false);
        }
        conn.execute_batch("BEGIN").map_err(|e| map_rusqlite_err(&e))?;
        state.txn_active = true;
        Ok(true)
    }

    fn transaction_active(&self) -> bool {
        lock_state(&self.state).txn_active
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to commit"));
        }
        conn.execute_batch("COMMIT").map_err(|e| map_rusqlite_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to roll back"));
        }
        conn.execute_batch("ROLLBACK").map_err(|e| map_rusqlite_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(DbError::ConnectionClosed)?;

        if state.txn_active {
            return Err(DbError::transaction(
                "cannot change isolation level inside a transaction",
            ));
        }
        match level {
            IsolationLevel::Serializable => {
                conn.execute_batch("PRAGMA read_uncommitted = 0")
                    .map_err(|e| map_rusqlite_err(&e))?;
            }
            IsolationLevel::ReadUncommitted => {
                conn.execute_batch("PRAGMA read_uncommitted = 1")
                    .map_err(|e| map_rusqlite_err(&e))?;
            }
            other => {
                return Err(DbError::unsupported(format!(
                    "SQLite does not support {other}"
                )));
            }
        }
        state.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        lock_state(&self.state).isolation
    }

    fn close(&self) {
        // Abort any statement currently blocked on this session before
        // queueing on its lock.
        self.interrupt.interrupt();

        let mut guard = lock_state(&self.state);
        if guard.conn.is_none() {
            return;
        }
        log::info!("closing sqlite connection to {}", self.url);
        close_locked(&mut guard);
    }

    fn is_closed(&self) -> bool {
        lock_state(&self.state).conn.is_none()
    }

    fn return_to_pool(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Ok(());
        }
        match reset_for_pool_locked(state) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("pool reset failed, closing connection: {e}");
                close_locked(state);
                Err(e)
            }
        }
    }

    fn is_pooled(&self) -> bool {
        lock_state(&self.state).pooled
    }

    fn mark_pooled(&self, pooled: bool) {
        lock_state(&self.state).pooled = pooled;
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        self.close();
    }
}
