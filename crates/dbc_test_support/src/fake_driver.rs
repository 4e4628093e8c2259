use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use dbc_core::{
    BindTable, BufferedResultSet, DbError, DbUrl, Driver, DriverConnection, IsolationLevel,
    PreparedStatement, RelationalConnection, ResultSet, Value, ValueType,
};

/// Canned rows for one SQL string: column names plus row values.
#[derive(Debug, Clone, Default)]
pub struct FakeRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl FakeRows {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDriverStats {
    pub executed: Vec<String>,
    pub connect_calls: usize,
    pub close_calls: usize,
    pub commit_calls: usize,
    pub rollback_calls: usize,
    pub pool_returns: usize,
}

#[derive(Default)]
struct FakeDriverState {
    connect_error: RwLock<Option<String>>,
    fail_pool_reset: RwLock<bool>,
    query_errors: RwLock<HashMap<String, String>>,
    query_rows: RwLock<HashMap<String, FakeRows>>,
    update_counts: RwLock<HashMap<String, u64>>,
    executed: Mutex<Vec<String>>,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    rollback_calls: AtomicUsize,
    pool_returns: AtomicUsize,
}

/// Deterministic in-memory relational driver.
///
/// Implements the full connection/statement/result-set contracts — the
/// transaction state machine is real, query outcomes are canned — so
/// registry, pool, and contract tests run without a server.
#[derive(Clone)]
pub struct FakeDriver {
    scheme: &'static str,
    state: Arc<FakeDriverState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_scheme("fakesql")
    }

    pub fn with_scheme(scheme: &'static str) -> Self {
        Self {
            scheme,
            state: Arc::new(FakeDriverState::default()),
        }
    }

    pub fn with_query_rows(self, sql: impl Into<String>, rows: FakeRows) -> Self {
        rwlock_write(&self.state.query_rows).insert(sql.into(), rows);
        self
    }

    pub fn with_update_count(self, sql: impl Into<String>, count: u64) -> Self {
        rwlock_write(&self.state.update_counts).insert(sql.into(), count);
        self
    }

    pub fn with_query_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.set_query_error(sql, message);
        self
    }

    /// Make `sql` fail from now on; applies to live connections too.
    pub fn set_query_error(&self, sql: impl Into<String>, message: impl Into<String>) {
        rwlock_write(&self.state.query_errors).insert(sql.into(), message.into());
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.connect_error) = Some(message.into());
        self
    }

    /// Make the next pool reset fail, to exercise the force-close path.
    pub fn fail_pool_reset(&self, fail: bool) {
        *rwlock_write(&self.state.fail_pool_reset) = fail;
    }

    pub fn stats(&self) -> FakeDriverStats {
        FakeDriverStats {
            executed: mutex_lock(&self.state.executed).clone(),
            connect_calls: self.state.connect_calls.load(Ordering::Relaxed),
            close_calls: self.state.close_calls.load(Ordering::Relaxed),
            commit_calls: self.state.commit_calls.load(Ordering::Relaxed),
            rollback_calls: self.state.rollback_calls.load(Ordering::Relaxed),
            pool_returns: self.state.pool_returns.load(Ordering::Relaxed),
        }
    }

    pub fn as_driver_arc(self) -> Arc<dyn Driver> {
        Arc::new(self)
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FakeDriver {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn name(&self) -> &'static str {
        "Fake relational driver"
    }

    fn connect(
        &self,
        url: &DbUrl,
        _user: &str,
        _password: &str,
    ) -> Result<DriverConnection, DbError> {
        self.state.connect_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = rwlock_read(&self.state.connect_error).clone() {
            return Err(DbError::connection_failure(message));
        }
        Ok(DriverConnection::Relational(Arc::new(FakeConnection {
            driver: self.state.clone(),
            state: Mutex::new(FakeConnState::default()),
            url: url.as_str().to_string(),
        })))
    }
}

struct FakeConnState {
    closed: bool,
    auto_commit: bool,
    txn_active: bool,
    isolation: IsolationLevel,
    pooled: bool,
    statements: Vec<Weak<FakeStatement>>,
}

impl Default for FakeConnState {
    fn default() -> Self {
        Self {
            closed: false,
            auto_commit: true,
            txn_active: false,
            isolation: IsolationLevel::ReadCommitted,
            pooled: false,
            statements: Vec::new(),
        }
    }
}

pub struct FakeConnection {
    driver: Arc<FakeDriverState>,
    state: Mutex<FakeConnState>,
    url: String,
}

impl FakeConnection {
    fn lock(&self) -> MutexGuard<'_, FakeConnState> {
        mutex_lock(&self.state)
    }

    fn record(&self, sql: &str) {
        mutex_lock(&self.driver.executed).push(sql.to_string());
    }

    fn run_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        self.record(sql);
        if let Some(message) = rwlock_read(&self.driver.query_errors).get(sql) {
            return Err(DbError::sql(message.clone()));
        }
        let canned = rwlock_read(&self.driver.query_rows)
            .get(sql)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(BufferedResultSet::new(canned.columns, canned.rows)))
    }

    fn run_update(&self, sql: &str) -> Result<u64, DbError> {
        self.record(sql);
        Ok(rwlock_read(&self.driver.update_counts)
            .get(sql)
            .copied()
            .unwrap_or(0))
    }
}

impl RelationalConnection for FakeConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DbError::ConnectionClosed);
        }
        let param_count = sql.matches('?').count();
        let stmt = Arc::new(FakeStatement {
            driver: self.driver.clone(),
            sql: sql.to_string(),
            bind: Mutex::new(BindTable::new(param_count)),
            closed: Mutex::new(false),
        });
        state.statements.push(Arc::downgrade(&stmt));
        Ok(stmt)
    }

    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        if self.lock().closed {
            return Err(DbError::ConnectionClosed);
        }
        self.run_query(sql)
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        if self.lock().closed {
            return Err(DbError::ConnectionClosed);
        }
        self.run_update(sql)
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DbError::ConnectionClosed);
        }
        if enabled && state.txn_active {
            self.driver.commit_calls.fetch_add(1, Ordering::Relaxed);
            state.txn_active = false;
        }
        state.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.lock().auto_commit
    }

    fn begin_transaction(&self) -> Result<bool, DbError> {
        let mut state = self.lock();
        if state.closed {
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
        state.txn_active = true;
        Ok(true)
    }

    fn transaction_active(&self) -> bool {
        self.lock().txn_active
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DbError::ConnectionClosed);
        }
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to commit"));
        }
        self.driver.commit_calls.fetch_add(1, Ordering::Relaxed);
        state.txn_active = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DbError::ConnectionClosed);
        }
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to roll back"));
        }
        self.driver.rollback_calls.fetch_add(1, Ordering::Relaxed);
        state.txn_active = false;
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DbError::ConnectionClosed);
        }
        if state.txn_active {
            return Err(DbError::transaction(
                "cannot change isolation level inside a transaction",
            ));
        }
        state.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        self.lock().isolation
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        for stmt in state.statements.drain(..) {
            if let Some(stmt) = stmt.upgrade() {
                stmt.mark_closed();
            }
        }
        if state.txn_active {
            self.driver.rollback_calls.fetch_add(1, Ordering::Relaxed);
            state.txn_active = false;
        }
        state.closed = true;
        self.driver.close_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn return_to_pool(&self) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        self.driver.pool_returns.fetch_add(1, Ordering::Relaxed);

        if *rwlock_read(&self.driver.fail_pool_reset) {
            // Reset failure forces the connection closed.
            for stmt in state.statements.drain(..) {
                if let Some(stmt) = stmt.upgrade() {
                    stmt.mark_closed();
                }
            }
            state.txn_active = false;
            state.closed = true;
            self.driver.close_calls.fetch_add(1, Ordering::Relaxed);
            return Err(DbError::protocol("simulated pool reset failure"));
        }

        for stmt in state.statements.drain(..) {
            if let Some(stmt) = stmt.upgrade() {
                stmt.mark_closed();
            }
        }
        if state.txn_active {
            self.driver.rollback_calls.fetch_add(1, Ordering::Relaxed);
            state.txn_active = false;
        }
        state.auto_commit = true;
        state.isolation = IsolationLevel::ReadCommitted;
        Ok(())
    }

    fn is_pooled(&self) -> bool {
        self.lock().pooled
    }

    fn mark_pooled(&self, pooled: bool) {
        self.lock().pooled = pooled;
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

pub struct FakeStatement {
    driver: Arc<FakeDriverState>,
    sql: String,
    bind: Mutex<BindTable>,
    closed: Mutex<bool>,
}

impl FakeStatement {
    fn mark_closed(&self) {
        *mutex_lock(&self.closed) = true;
    }

    fn check_open(&self) -> Result<(), DbError> {
        if *mutex_lock(&self.closed) {
            return Err(DbError::ConnectionClosed);
        }
        Ok(())
    }
}

impl PreparedStatement for FakeStatement {
    fn parameter_count(&self) -> usize {
        mutex_lock(&self.bind).len()
    }

    fn set_value(&self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError> {
        self.check_open()?;
        mutex_lock(&self.bind).set(index, ty, value)
    }

    fn execute_query(&self) -> Result<Box<dyn ResultSet>, DbError> {
        self.check_open()?;
        mutex_lock(&self.bind).require_complete()?;
        mutex_lock(&self.driver.executed).push(self.sql.clone());
        if let Some(message) = rwlock_read(&self.driver.query_errors).get(&self.sql) {
            return Err(DbError::sql(message.clone()));
        }
        let canned = rwlock_read(&self.driver.query_rows)
            .get(&self.sql)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(BufferedResultSet::new(canned.columns, canned.rows)))
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        self.check_open()?;
        mutex_lock(&self.bind).require_complete()?;
        mutex_lock(&self.driver.executed).push(self.sql.clone());
        Ok(rwlock_read(&self.driver.update_counts)
            .get(&self.sql)
            .copied()
            .unwrap_or(0))
    }

    fn execute(&self) -> Result<bool, DbError> {
        self.check_open()?;
        let has_rows = rwlock_read(&self.driver.query_rows).contains_key(&self.sql);
        if has_rows {
            let mut rs = self.execute_query()?;
            rs.close();
            Ok(true)
        } else {
            self.execute_update()?;
            Ok(false)
        }
    }

    fn add_batch(&self) -> Result<(), DbError> {
        self.check_open()?;
        mutex_lock(&self.bind).require_complete()?;
        Ok(())
    }

    fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        self.check_open()?;
        Ok(Vec::new())
    }

    fn close(&self) {
        self.mark_closed();
    }

    fn is_closed(&self) -> bool {
        *mutex_lock(&self.closed)
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
