use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dbc_core::{
    DbError, DbUrl, Driver, DriverConnection, IsolationLevel, PreparedStatement,
    RelationalConnection, ResultSet,
};
use rsfbclient::prelude::*;
use rsfbclient::SimpleConnection;

use crate::statement::{
    count_placeholders, open_query_cursor, FbCursor, FbPreparedStatement, FbStmtSlot,
};

pub const DEFAULT_PORT: u16 = 3050;

pub struct FirebirdDriver;

impl FirebirdDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FirebirdDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FirebirdDriver {
    fn scheme(&self) -> &'static str {
        "firebird"
    }

    fn name(&self) -> &'static str {
        "Firebird"
    }

    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let database = url.database().ok_or_else(|| {
            DbError::InvalidUrl("firebird URL is missing a database path".to_string())
        })?;

        let conn = rsfbclient::builder_pure_rust()
            .host(url.host())
            .port(url.port_or(DEFAULT_PORT))
            .db_name(database)
            .user(user)
            .pass(password)
            .connect()
            .map_err(|e| DbError::connection_failure(e.to_string()))?;
        let conn: SimpleConnection = conn.into();

        log::info!(
            "connected to firebird at {}:{} ({database})",
            url.host(),
            url.port_or(DEFAULT_PORT)
        );

        Ok(DriverConnection::Relational(Arc::new(FirebirdConnection {
            state: Arc::new(Mutex::new(FbConnState {
                cursors: HashMap::new(),
                stmts: HashMap::new(),
                conn: Some(conn),
                open_cursor: None,
                next_id: 1,
                auto_commit: true,
                txn_active: false,
                isolation: IsolationLevel::RepeatableRead,
                pooled: false,
            })),
            url: url.as_str().to_string(),
        })))
    }
}

/// All mutable connection state, guarded by one mutex.
///
/// Cursors borrow the wire session, so they live here and are cleared
/// before the session itself goes away; field order matters, `cursors`
/// must drop before `conn`. At most one cursor is open on the wire at a
/// time (`open_cursor`): any later statement on the connection takes over
/// the session and invalidates it.
pub(crate) struct FbConnState {
    pub(crate) cursors: HashMap<u64, FbCursor>,
    pub(crate) stmts: HashMap<u64, FbStmtSlot>,
    pub(crate) conn: Option<SimpleConnection>,
    pub(crate) open_cursor: Option<u64>,
    pub(crate) next_id: u64,
    pub(crate) auto_commit: bool,
    pub(crate) txn_active: bool,
    pub(crate) isolation: IsolationLevel,
    pub(crate) pooled: bool,
}

impl FbConnState {
    pub(crate) fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Drop the live wire cursor, if any, before the connection is used
    /// for anything else. The owning result set sees itself invalidated.
    pub(crate) fn release_open_cursor(&mut self) {
        if let Some(id) = self.open_cursor.take() {
            if let Some(cursor) = self.cursors.get_mut(&id) {
                cursor.invalidate();
            }
        }
    }

    /// Firebird contract: with autocommit off and no transaction open, the
    /// next data statement starts one.
    pub(crate) fn ensure_transaction(&mut self) -> Result<(), DbError> {
        if self.auto_commit || self.txn_active {
            return Ok(());
        }
        let conn = self.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        conn.begin_transaction().map_err(|e| map_fb_err(&e))?;
        self.txn_active = true;
        Ok(())
    }
}

/// A connection to one Firebird database.
///
/// Statements and result sets issued here share this connection's lock:
/// their fetches and teardown talk to the wire session, so they serialize
/// with all other traffic. Result sets are invalidated when the connection
/// closes or when a later statement takes over the session.
pub struct FirebirdConnection {
    state: Arc<Mutex<FbConnState>>,
    url: String,
}

pub(crate) fn lock_state(state: &Mutex<FbConnState>) -> MutexGuard<'_, FbConnState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn map_fb_err(e: &rsfbclient::FbError) -> DbError {
    DbError::sql(e.to_string())
}

fn close_locked(state: &mut FbConnState) {
    // Cursors borrow the wire session: they go first.
    state.open_cursor = None;
    state.cursors.clear();
    state.stmts.clear();
    if state.txn_active {
        if let Some(conn) = state.conn.as_mut() {
            if let Err(e) = conn.rollback() {
                log::error!("rollback during close failed: {e}");
            }
        }
        state.txn_active = false;
    }
    state.conn = None;
}

fn reset_for_pool_locked(state: &mut FbConnState) -> Result<(), DbError> {
    state.open_cursor = None;
    state.cursors.clear();
    state.stmts.clear();
    if state.txn_active {
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        conn.rollback().map_err(|e| map_fb_err(&e))?;
        state.txn_active = false;
    }
    state.auto_commit = true;
    state.isolation = IsolationLevel::RepeatableRead;
    Ok(())
}

impl RelationalConnection for FirebirdConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }

        let param_count = count_placeholders(sql);
        let id = state.alloc_id();
        state.stmts.insert(id, FbStmtSlot::new(sql.to_string(), param_count));
        log::debug!("prepared firebird statement #{id} ({param_count} params): {sql}");

        Ok(Arc::new(FbPreparedStatement::new(
            self.state.clone(),
            id,
            param_count,
        )))
    }

    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        open_query_cursor(state, &self.state, sql, Vec::new())
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        state.release_open_cursor();
        state.ensure_transaction()?;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        let affected = conn
            .execute(sql, ())
            .map_err(|e| map_fb_err(&e))?;
        Ok(affected as u64)
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        if enabled && state.txn_active {
            state.release_open_cursor();
            let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
            conn.commit().map_err(|e| map_fb_err(&e))?;
            state.txn_active = false;
        }
        state.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        lock_state(&self.state).auto_commit
    }

    fn begin_transaction(&self) -> Result<bool, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        if state.auto_commit {
            return Err(DbError::transaction(
                "cannot begin a transaction while autocommit is enabled",
            ));
        }
        if state.txn_active {
            return Ok(false);
        }
        state.release_open_cursor();
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        conn.begin_transaction().map_err(|e| map_fb_err(&e))?;
        state.txn_active = true;
        Ok(true)
    }

    fn transaction_active(&self) -> bool {
        lock_state(&self.state).txn_active
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to commit"));
        }
        state.release_open_cursor();
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        conn.commit().map_err(|e| map_fb_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to roll back"));
        }
        state.release_open_cursor();
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        conn.rollback().map_err(|e| map_fb_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.conn.is_none() {
            return Err(DbError::ConnectionClosed);
        }
        if state.txn_active {
            return Err(DbError::transaction(
                "cannot change isolation level inside a transaction",
            ));
        }
        if level == IsolationLevel::ReadUncommitted {
            return Err(DbError::unsupported("Firebird does not support READ UNCOMMITTED"));
        }
        // Applied to transactions started after this call.
        state.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        lock_state(&self.state).isolation
    }

    fn close(&self) {
        let mut guard = lock_state(&self.state);
        if guard.conn.is_none() {
            return;
        }
        log::info!("closing firebird connection to {}", self.url);
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

impl Drop for FirebirdConnection {
    fn drop(&mut self) {
        self.close();
    }
}
