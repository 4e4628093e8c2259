//! Connection pool over the relational borrow/return contract.
//!
//! The pool owns its connections; callers hold a guard that dereferences to
//! the connection and returns it on drop. Returning runs the connection's
//! own reset (rollback if a transaction is open, finalize statements,
//! restore defaults); a connection whose reset fails is discarded instead
//! of being reused.

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use dbc_core::{DbError, DriverManager, RelationalConnection, ResultSet};

type Dialer = dyn Fn() -> Result<Arc<dyn RelationalConnection>, DbError> + Send + Sync;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live connections; borrowers block at the cap.
    pub max_size: usize,
    /// Probe idle connections with `validation_query` before handing them out.
    pub validate_on_borrow: bool,
    pub validation_query: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            validate_on_borrow: false,
            validation_query: "SELECT 1".to_string(),
        }
    }
}

struct PoolState {
    idle: Vec<Arc<dyn RelationalConnection>>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    dial: Box<Dialer>,
    state: Mutex<PoolState>,
    available: Condvar,
}

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait<'a>(cv: &Condvar, guard: MutexGuard<'a, PoolState>) -> MutexGuard<'a, PoolState> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConnectionPool {
    /// Pool dialing through the process-wide driver registry.
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        config: PoolConfig,
    ) -> Self {
        let url = url.into();
        let user = user.into();
        let password = password.into();
        Self::with_dialer(config, move || {
            DriverManager::global().relational(&url, &user, &password)
        })
    }

    /// Pool over a custom dial function; used by tests and embedders that
    /// keep a private registry.
    pub fn with_dialer(
        config: PoolConfig,
        dial: impl Fn() -> Result<Arc<dyn RelationalConnection>, DbError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                dial: Box::new(dial),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Borrow a connection, dialing a new one while below capacity and
    /// blocking once the cap is reached.
    pub fn borrow(&self) -> Result<PooledConnection, DbError> {
        loop {
            let candidate = {
                let mut state = lock(&self.inner.state);
                loop {
                    if state.closed {
                        return Err(DbError::ConnectionClosed);
                    }
                    if let Some(conn) = state.idle.pop() {
                        break Some(conn);
                    }
                    if state.total < self.inner.config.max_size {
                        state.total += 1;
                        break None;
                    }
                    state = wait(&self.inner.available, state);
                }
            };

            match candidate {
                Some(conn) => {
                    if self.inner.config.validate_on_borrow && !self.validate(&conn) {
                        log::warn!("discarding pooled connection that failed validation");
                        conn.close();
                        let mut state = lock(&self.inner.state);
                        state.total -= 1;
                        self.inner.available.notify_one();
                        continue;
                    }
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        inner: self.inner.clone(),
                    });
                }
                None => match (self.inner.dial)() {
                    Ok(conn) => {
                        conn.mark_pooled(true);
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            inner: self.inner.clone(),
                        });
                    }
                    Err(e) => {
                        let mut state = lock(&self.inner.state);
                        state.total -= 1;
                        self.inner.available.notify_one();
                        return Err(e);
                    }
                },
            }
        }
    }

    fn validate(&self, conn: &Arc<dyn RelationalConnection>) -> bool {
        match conn.execute_query(&self.inner.config.validation_query) {
            Ok(mut rs) => {
                let alive = rs.next().is_ok();
                rs.close();
                alive
            }
            Err(e) => {
                log::debug!("validation probe failed: {e}");
                false
            }
        }
    }

    /// Number of connections resident in the pool right now.
    pub fn idle_count(&self) -> usize {
        lock(&self.inner.state).idle.len()
    }

    /// Number of live connections, lent out or resident.
    pub fn size(&self) -> usize {
        lock(&self.inner.state).total
    }

    /// Close every resident connection and refuse further borrows.
    /// Lent-out connections are closed as they come back.
    pub fn close(&self) {
        let drained = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        for conn in drained {
            conn.close();
        }
        self.inner.available.notify_all();
    }
}

impl PoolInner {
    fn give_back(&self, conn: Arc<dyn RelationalConnection>) {
        match conn.return_to_pool() {
            Ok(()) => {
                let mut state = lock(&self.state);
                if state.closed || conn.is_closed() {
                    drop(state);
                    conn.close();
                    lock(&self.state).total -= 1;
                } else {
                    state.idle.push(conn);
                }
            }
            Err(e) => {
                // The connection forced itself closed; drop it from the pool.
                log::warn!("pool return failed, discarding connection: {e}");
                lock(&self.state).total -= 1;
            }
        }
        self.available.notify_one();
    }
}

/// Borrowed connection; dereferences to the connection and returns it to
/// the pool on drop.
pub struct PooledConnection {
    conn: Option<Arc<dyn RelationalConnection>>,
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn RelationalConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.give_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionPool, PoolConfig};
    use dbc_core::{DbError, Driver, RelationalConnection};
    use dbc_test_support::{fixtures, FakeDriver};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pool_over(driver: &FakeDriver, config: PoolConfig) -> ConnectionPool {
        let driver = driver.clone();
        ConnectionPool::with_dialer(config, move || {
            let url = dbc_core::DbUrl::parse("cpp_dbc:fakesql://pool:1/db")?;
            driver.connect(&url, "u", "p")?.into_relational()
        })
    }

    #[test]
    fn borrow_marks_pooled_and_drop_returns() {
        let driver = FakeDriver::new();
        let pool = pool_over(&driver, PoolConfig::default());

        {
            let conn = pool.borrow().expect("borrow");
            assert!(conn.is_pooled());
            assert_eq!(pool.idle_count(), 0);
            assert_eq!(pool.size(), 1);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(driver.stats().pool_returns, 1);

        // The same connection is reused, not redialed.
        let _conn = pool.borrow().expect("borrow again");
        assert_eq!(driver.stats().connect_calls, 1);
    }

    #[test]
    fn return_with_active_transaction_rolls_back_and_resets() {
        let driver = FakeDriver::new();
        let pool = pool_over(&driver, PoolConfig::default());

        {
            let conn = pool.borrow().expect("borrow");
            conn.set_auto_commit(false).expect("autocommit off");
            conn.begin_transaction().expect("begin");
            assert!(conn.transaction_active());
        }

        let conn = pool.borrow().expect("borrow reused");
        assert!(!conn.transaction_active());
        assert!(conn.auto_commit());
        assert_eq!(driver.stats().rollback_calls, 1);
    }

    #[test]
    fn failed_reset_discards_the_connection() {
        let driver = FakeDriver::new();
        let pool = pool_over(&driver, PoolConfig::default());

        {
            let conn = pool.borrow().expect("borrow");
            driver.fail_pool_reset(true);
            let _ = conn;
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.size(), 0);

        driver.fail_pool_reset(false);
        let conn = pool.borrow().expect("fresh dial");
        assert!(!conn.is_closed());
        assert_eq!(driver.stats().connect_calls, 2);
    }

    #[test]
    fn validation_failure_discards_and_redials() {
        let driver = FakeDriver::new().with_query_rows("SELECT 1", fixtures::select_one());
        let config = PoolConfig {
            validate_on_borrow: true,
            ..PoolConfig::default()
        };
        let pool = pool_over(&driver, config);

        drop(pool.borrow().expect("borrow"));
        assert_eq!(pool.idle_count(), 1);

        // The connection dies while idle; the probe must catch it.
        driver.set_query_error("SELECT 1", "server has gone away");

        let conn = pool.borrow().expect("borrow dials fresh");
        assert!(!conn.is_closed());
        assert_eq!(driver.stats().connect_calls, 2);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn capacity_blocks_until_a_connection_returns() {
        let driver = FakeDriver::new();
        let pool = Arc::new(pool_over(
            &driver,
            PoolConfig {
                max_size: 1,
                ..PoolConfig::default()
            },
        ));

        let first = pool.borrow().expect("borrow");

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let conn = pool.borrow().expect("borrow after return");
                assert!(!conn.is_closed());
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(first);
        waiter.join().expect("waiter thread");
        assert_eq!(driver.stats().connect_calls, 1);
    }

    #[test]
    fn connect_failure_surfaces_and_frees_the_slot() {
        let driver = FakeDriver::new().with_connect_error("backend down");
        let pool = pool_over(
            &driver,
            PoolConfig {
                max_size: 1,
                ..PoolConfig::default()
            },
        );

        let err = pool.borrow().expect_err("dial fails");
        assert!(matches!(err, DbError::ConnectionFailure(_)));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn closed_pool_refuses_borrows_and_closes_idles() {
        let driver = FakeDriver::new();
        let pool = pool_over(&driver, PoolConfig::default());

        drop(pool.borrow().expect("borrow"));
        assert_eq!(pool.idle_count(), 1);

        pool.close();
        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.borrow(), Err(DbError::ConnectionClosed)));
        assert_eq!(driver.stats().close_calls, 1);
    }
}
