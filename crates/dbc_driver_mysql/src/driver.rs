use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dbc_core::{
    BufferedResultSet, DbError, DbUrl, Driver, DriverConnection, IsolationLevel,
    PreparedStatement, RelationalConnection, ResultSet, Value,
};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};

use crate::statement::MysqlPreparedStatement;

pub const DEFAULT_PORT: u16 = 3306;

pub struct MysqlDriver;

impl MysqlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MysqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MysqlDriver {
    fn scheme(&self) -> &'static str {
        "mysql"
    }

    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(url.host().to_string()))
            .tcp_port(url.port_or(DEFAULT_PORT))
            .user(Some(user.to_string()))
            .pass(Some(password.to_string()))
            .db_name(url.database().map(str::to_string))
            .prefer_socket(false);

        let mut conn =
            Conn::new(opts).map_err(|e| DbError::connection_failure(e.to_string()))?;

        // Match the JDBC initial state explicitly rather than trusting the
        // server default.
        conn.query_drop("SET autocommit=1")
            .map_err(|e| DbError::connection_failure(e.to_string()))?;

        log::info!("connected to mysql at {}:{}", url.host(), url.port_or(DEFAULT_PORT));

        Ok(DriverConnection::Relational(Arc::new(MysqlConnection {
            state: Arc::new(Mutex::new(MysqlConnState {
                conn: Some(conn),
                statements: Vec::new(),
                auto_commit: true,
                txn_active: false,
                isolation: IsolationLevel::RepeatableRead,
                pooled: false,
            })),
            url: url.as_str().to_string(),
        })))
    }
}

pub(crate) struct MysqlConnState {
    pub(crate) conn: Option<Conn>,
    pub(crate) statements: Vec<Weak<MysqlPreparedStatement>>,
    pub(crate) auto_commit: bool,
    pub(crate) txn_active: bool,
    pub(crate) isolation: IsolationLevel,
    pub(crate) pooled: bool,
}

/// A connection to one MySQL session.
///
/// Stored-result model: query execution materializes rows into client
/// memory, so result sets detach from this connection and stay valid after
/// it closes. Statements are validated server-side at prepare time and
/// executed over the text protocol with bound parameters substituted as
/// quote-escaped literals.
pub struct MysqlConnection {
    state: Arc<Mutex<MysqlConnState>>,
    url: String,
}

pub(crate) fn lock_state(state: &Mutex<MysqlConnState>) -> MutexGuard<'_, MysqlConnState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn map_mysql_err(e: &mysql::Error) -> DbError {
    match e {
        mysql::Error::MySqlError(server) => DbError::sql(server.message.clone()),
        mysql::Error::IoError(io) => DbError::protocol(io.to_string()),
        other => DbError::protocol(other.to_string()),
    }
}

pub(crate) fn mysql_value_to_value(value: mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Varchar(text),
            Err(e) => Value::Blob(dbc_core::Blob::from_bytes(e.into_bytes())),
        },
        mysql::Value::Int(v) => Value::Long(v),
        mysql::Value::UInt(v) => match i64::try_from(v) {
            Ok(v) => Value::Long(v),
            Err(_) => Value::Double(v as f64),
        },
        mysql::Value::Float(v) => Value::Float(v),
        mysql::Value::Double(v) => Value::Double(v),
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = chrono::NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day));
            match date {
                Some(date) if hour == 0 && minute == 0 && second == 0 && micros == 0 => {
                    Value::Date(date)
                }
                Some(date) => date
                    .and_hms_micro_opt(
                        u32::from(hour),
                        u32::from(minute),
                        u32::from(second),
                        micros,
                    )
                    .map(Value::Timestamp)
                    .unwrap_or(Value::Null),
                None => Value::Null,
            }
        }
        mysql::Value::Time(negative, days, hours, minutes, seconds, _micros) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(hours);
            Value::Varchar(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
        }
    }
}

/// Materialize a text-protocol query into a buffered result set.
pub(crate) fn run_stored_query(
    conn: &mut Conn,
    sql: &str,
    prepared_columns: Option<&[String]>,
) -> Result<BufferedResultSet, DbError> {
    let result = conn.query_iter(sql).map_err(|e| map_mysql_err(&e))?;

    let mut columns: Vec<String> = result
        .columns()
        .as_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    if columns.is_empty() {
        if let Some(prepared) = prepared_columns {
            columns = prepared.to_vec();
        }
    }

    let mut rows = Vec::new();
    for row in result {
        let row = row.map_err(|e| map_mysql_err(&e))?;
        rows.push(row.unwrap().into_iter().map(mysql_value_to_value).collect());
    }

    Ok(BufferedResultSet::new(columns, rows))
}

fn close_all_statements(state: &mut MysqlConnState) {
    for stmt in state.statements.drain(..) {
        if let Some(stmt) = stmt.upgrade() {
            stmt.mark_closed();
        }
    }
}

fn close_locked(state: &mut MysqlConnState) {
    close_all_statements(state);
    if state.txn_active {
        if let Some(conn) = state.conn.as_mut() {
            if let Err(e) = conn.query_drop("ROLLBACK") {
                log::error!("rollback during close failed: {e}");
            }
        }
        state.txn_active = false;
    }
    state.conn = None;
}

fn reset_for_pool_locked(state: &mut MysqlConnState) -> Result<(), DbError> {
    close_all_statements(state);

    let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
    if state.txn_active {
        conn.query_drop("ROLLBACK").map_err(|e| map_mysql_err(&e))?;
        state.txn_active = false;
    }
    conn.query_drop("SET autocommit=1")
        .map_err(|e| map_mysql_err(&e))?;
    conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .map_err(|e| map_mysql_err(&e))?;
    state.auto_commit = true;
    state.isolation = IsolationLevel::RepeatableRead;
    Ok(())
}

impl RelationalConnection for MysqlConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;

        // Server-side prepare validates the SQL and yields the placeholder
        // count and column shape; execution itself runs over the text
        // protocol with substituted literals.
        let prepared = conn.prep(sql).map_err(|e| map_mysql_err(&e))?;
        let param_count = usize::from(prepared.num_params());
        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        conn.close(prepared).map_err(|e| map_mysql_err(&e))?;
        log::debug!("prepared mysql statement ({param_count} params): {sql}");

        let stmt = Arc::new(MysqlPreparedStatement::new(
            self.state.clone(),
            sql.to_string(),
            param_count,
            columns,
        ));
        state.statements.push(Arc::downgrade(&stmt));
        Ok(stmt)
    }

    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        let mut guard = lock_state(&self.state);
        let conn = guard.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        let result = run_stored_query(conn, sql, None)?;
        if result.column_count() == 0 {
            return Err(DbError::sql("statement does not return rows"));
        }
        Ok(Box::new(result))
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let mut guard = lock_state(&self.state);
        let conn = guard.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        let result = conn.query_iter(sql).map_err(|e| map_mysql_err(&e))?;
        Ok(result.affected_rows())
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;

        if enabled && state.txn_active {
            conn.query_drop("COMMIT").map_err(|e| map_mysql_err(&e))?;
            state.txn_active = false;
        }
        let directive = if enabled { "SET autocommit=1" } else { "SET autocommit=0" };
        conn.query_drop(directive).map_err(|e| map_mysql_err(&e))?;
        state.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        lock_state(&self.state).auto_commit
    }

    fn begin_transaction(&self) -> Result<bool, DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;

        if state.auto_commit {
            return Err(DbError::transaction(
                "cannot begin a transaction while autocommit is enabled",
            ));
        }
        if state.txn_active {
            return Ok(false);
        }
        conn.query_drop("START TRANSACTION")
            .map_err(|e| map_mysql_err(&e))?;
        state.txn_active = true;
        Ok(true)
    }

    fn transaction_active(&self) -> bool {
        lock_state(&self.state).txn_active
    }

    fn commit(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to commit"));
        }
        conn.query_drop("COMMIT").map_err(|e| map_mysql_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        if !state.txn_active {
            return Err(DbError::transaction("no active transaction to roll back"));
        }
        conn.query_drop("ROLLBACK").map_err(|e| map_mysql_err(&e))?;
        state.txn_active = false;
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let conn = state.conn.as_mut().ok_or(DbError::ConnectionClosed)?;

        if state.txn_active {
            return Err(DbError::transaction(
                "cannot change isolation level inside a transaction",
            ));
        }
        conn.query_drop(format!(
            "SET SESSION TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))
        .map_err(|e| map_mysql_err(&e))?;
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
        log::info!("closing mysql connection to {}", self.url);
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

impl Drop for MysqlConnection {
    fn drop(&mut self) {
        self.close();
    }
}
