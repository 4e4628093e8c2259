use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dbc_core::{
    Blob, BufferedResultSet, DbError, DbUrl, Driver, DriverConnection, IsolationLevel,
    PreparedStatement, RelationalConnection, ResultSet, Value,
};
use postgres::types::Type;
use postgres::{CancelToken, Client, NoTls};

use crate::statement::PostgresPreparedStatement;

pub const DEFAULT_PORT: u16 = 5432;

pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for PostgresDriver {
    fn scheme(&self) -> &'static str {
        "postgresql"
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let mut config = postgres::Config::new();
        config
            .host(url.host())
            .port(url.port_or(DEFAULT_PORT))
            .user(user)
            .password(password);
        if let Some(database) = url.database() {
            config.dbname(database);
        }

        let client = config
            .connect(NoTls)
            .map_err(|e| DbError::connection_failure(e.to_string()))?;
        let cancel = client.cancel_token();

        log::info!(
            "connected to postgresql at {}:{}",
            url.host(),
            url.port_or(DEFAULT_PORT)
        );

        Ok(DriverConnection::Relational(Arc::new(PostgresConnection {
            state: Arc::new(Mutex::new(PgConnState {
                client: Some(client),
                statements: Vec::new(),
                auto_commit: true,
                txn_active: false,
                isolation: IsolationLevel::ReadCommitted,
                pooled: false,
            })),
            cancel,
            url: url.as_str().to_string(),
        })))
    }
}

pub(crate) struct PgConnState {
    pub(crate) client: Option<Client>,
    pub(crate) statements: Vec<Weak<PostgresPreparedStatement>>,
    pub(crate) auto_commit: bool,
    pub(crate) txn_active: bool,
    pub(crate) isolation: IsolationLevel,
    pub(crate) pooled: bool,
}

/// A connection to one PostgreSQL session.
///
/// Stored-result model: rows materialize into client memory at execute
/// time, so result sets never touch the connection again. Statements are
/// prepared server-side with `$n` placeholders.
pub struct PostgresConnection {
    state: Arc<Mutex<PgConnState>>,
    cancel: CancelToken,
    url: String,
}

pub(crate) fn lock_state(state: &Mutex<PgConnState>) -> MutexGuard<'_, PgConnState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn map_pg_err(e: &postgres::Error) -> DbError {
    if let Some(db) = e.as_db_error() {
        DbError::sql(format!("{}: {}", db.code().code(), db.message()))
    } else if e.is_closed() {
        DbError::ConnectionClosed
    } else {
        DbError::protocol(e.to_string())
    }
}

/// Convert one materialized row by its declared column types.
pub(crate) fn pg_row_values(row: &postgres::Row) -> Result<Vec<Value>, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        values.push(pg_value(row, i, column.type_())?);
    }
    Ok(values)
}

fn pg_value(row: &postgres::Row, i: usize, ty: &Type) -> Result<Value, DbError> {
    fn get<'a, T: postgres::types::FromSql<'a>>(
        row: &'a postgres::Row,
        i: usize,
    ) -> Result<Option<T>, DbError> {
        row.try_get(i).map_err(|e| map_pg_err(&e))
    }

    let value = if *ty == Type::BOOL {
        get::<bool>(row, i)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        get::<i16>(row, i)?.map(|v| Value::Int(i32::from(v)))
    } else if *ty == Type::INT4 {
        get::<i32>(row, i)?.map(Value::Int)
    } else if *ty == Type::INT8 {
        get::<i64>(row, i)?.map(Value::Long)
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, i)?.map(Value::Float)
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, i)?.map(Value::Double)
    } else if *ty == Type::DATE {
        get::<NaiveDate>(row, i)?.map(Value::Date)
    } else if *ty == Type::TIMESTAMP {
        get::<NaiveDateTime>(row, i)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        get::<DateTime<Utc>>(row, i)?.map(|v| Value::Timestamp(v.naive_utc()))
    } else if *ty == Type::BYTEA {
        get::<Vec<u8>>(row, i)?.map(|v| Value::Blob(Blob::from_bytes(v)))
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
    {
        get::<String>(row, i)?.map(Value::Varchar)
    } else {
        // Anything else that has a textual representation still surfaces.
        match row.try_get::<_, Option<String>>(i) {
            Ok(text) => text.map(Value::Varchar),
            Err(_) => {
                return Err(DbError::protocol(format!(
                    "unsupported column type {ty} at column {}",
                    i + 1
                )));
            }
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

fn close_all_statements(state: &mut PgConnState) {
    for stmt in state.statements.drain(..) {
        if let Some(stmt) = stmt.upgrade() {
            stmt.mark_closed();
        }
    }
}

fn close_locked(state: &mut PgConnState) {
    close_all_statements(state);
    if state.txn_active {
        if let Some(client) = state.client.as_mut() {
            if let Err(e) = client.batch_execute("ROLLBACK") {
                log::error!("rollback during close failed: {e}");
            }
        }
        state.txn_active = false;
    }
    state.client = None;
}

fn reset_for_pool_locked(state: &mut PgConnState) -> Result<(), DbError> {
    close_all_statements(state);

    let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;
    if state.txn_active {
        client.batch_execute("ROLLBACK").map_err(|e| map_pg_err(&e))?;
        state.txn_active = false;
    }
    client
        .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ COMMITTED")
        .map_err(|e| map_pg_err(&e))?;
    state.auto_commit = true;
    state.isolation = IsolationLevel::ReadCommitted;
    Ok(())
}

impl RelationalConnection for PostgresConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        let prepared = client.prepare(sql).map_err(|e| map_pg_err(&e))?;
        let param_count = prepared.params().len();
        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        log::debug!("prepared postgresql statement ({param_count} params): {sql}");

        let stmt = Arc::new(PostgresPreparedStatement::new(
            self.state.clone(),
            prepared,
            sql.to_string(),
            param_count,
            columns,
        ));
        state.statements.push(Arc::downgrade(&stmt));
        Ok(stmt)
    }

    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        let mut guard = lock_state(&self.state);
        let client = guard.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        let prepared = client.prepare(sql).map_err(|e| map_pg_err(&e))?;
        if prepared.columns().is_empty() {
            return Err(DbError::sql("statement does not return rows"));
        }
        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = client.query(&prepared, &[]).map_err(|e| map_pg_err(&e))?;
        let mut converted = Vec::with_capacity(rows.len());
        for row in &rows {
            converted.push(pg_row_values(row)?);
        }
        Ok(Box::new(BufferedResultSet::new(columns, converted)))
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let mut guard = lock_state(&self.state);
        let client = guard.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        let prepared = client.prepare(sql).map_err(|e| map_pg_err(&e))?;
        if !prepared.columns().is_empty() {
            return Err(DbError::sql(
                "statement returns rows; use executeQuery instead",
            ));
        }
        client.execute(&prepared, &[]).map_err(|e| map_pg_err(&e))
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        if enabled && state.txn_active {
            client.batch_execute("COMMIT").map_err(|e| map_pg_err(&e))?;
            state.txn_active = false;
        }
        // PostgreSQL has no session autocommit switch: autocommit-off means
        // this layer opens explicit transactions.
        state.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        lock_state(&self.state).auto_commit
    }

    fn begin_transaction(&self) -> Result<bool, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        if state.auto_commit {
            return Err(DbError::transaction(
                "cannot begin a transaction while autocommit is enabled",
            ));
        }
        if state.txn_active {
            return Ok(false);
        }
        client.batch_execute("BEGIN").map_err(|e| map_pg_err(&e))?;
        state.txn_active = true;
        Ok(true)
    }

    fn transaction_active(&self) -> bool {
        lock_state(&self.state).txn_active
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to commit"));
        }
        client.batch_execute("COMMIT").map_err(|e| map_pg_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to roll back"));
        }
        client.batch_execute("ROLLBACK").map_err(|e| map_pg_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let client = state.client.as_mut().ok_or(DbError::ConnectionClosed)?;

        if state.txn_active {
            return Err(DbError::transaction(
                "cannot change isolation level inside a transaction",
            ));
        }
        client
            .batch_execute(&format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                level.as_sql()
            ))
            .map_err(|e| map_pg_err(&e))?;
        state.isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> IsolationLevel {
        lock_state(&self.state).isolation
    }

    fn close(&self) {
        // Best-effort kill of whatever is in flight, then tear down under
        // the lock.
        if let Err(e) = self.cancel.cancel_query(NoTls) {
            log::debug!("cancel request during close failed: {e}");
        }

        let mut guard = lock_state(&self.state);
        if guard.client.is_none() {
            return;
        }
        log::info!("closing postgresql connection to {}", self.url);
        close_locked(&mut guard);
    }

    fn is_closed(&self) -> bool {
        lock_state(&self.state).client.is_none()
    }

    fn return_to_pool(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        if state.client.is_none() {
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

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        self.close();
    }
}
