use std::sync::{Arc, Mutex};

use dbc_core::{
    BindTable, BoundParam, BufferedResultSet, DbError, PreparedStatement, ResultSet, Value,
    ValueType,
};
use postgres::types::ToSql;

use crate::driver::{lock_state, map_pg_err, pg_row_values, PgConnState};

/// Prepared statement over one PostgreSQL session.
///
/// Holds the server-prepared handle; binds travel as typed `$n` parameters.
/// Statement close is purely local to this handle, so the statement keeps
/// its own locks and never shares the connection's.
pub struct PostgresPreparedStatement {
    conn: Arc<Mutex<PgConnState>>,
    prepared: Mutex<Option<postgres::Statement>>,
    sql: String,
    param_count: usize,
    columns: Vec<String>,
    bind: Mutex<BindTable>,
    batch: Mutex<Vec<Vec<BoundParam>>>,
}

impl PostgresPreparedStatement {
    pub(crate) fn new(
        conn: Arc<Mutex<PgConnState>>,
        prepared: postgres::Statement,
        sql: String,
        param_count: usize,
        columns: Vec<String>,
    ) -> Self {
        Self {
            conn,
            prepared: Mutex::new(Some(prepared)),
            sql,
            param_count,
            columns,
            bind: Mutex::new(BindTable::new(param_count)),
            batch: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn mark_closed(&self) {
        *lock(&self.prepared) = None;
    }

    fn handle(&self) -> Result<postgres::Statement, DbError> {
        lock(&self.prepared).clone().ok_or(DbError::ConnectionClosed)
    }

    fn run_update(&self, params: &[BoundParam]) -> Result<u64, DbError> {
        let prepared = self.handle()?;
        let boxed = to_sql_params(params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(AsRef::as_ref).collect();

        let mut guard = lock_state(&self.conn);
        let client = guard.client.as_mut().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing postgresql update: {}", self.sql);
        client.execute(&prepared, &refs).map_err(|e| map_pg_err(&e))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PreparedStatement for PostgresPreparedStatement {
    fn parameter_count(&self) -> usize {
        self.param_count
    }

    fn set_value(&self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError> {
        if lock(&self.prepared).is_none() {
            return Err(DbError::ConnectionClosed);
        }
        lock(&self.bind).set(index, ty, value)
    }

    fn execute_query(&self) -> Result<Box<dyn ResultSet>, DbError> {
        if self.columns.is_empty() {
            return Err(DbError::sql("statement does not return rows"));
        }
        let prepared = self.handle()?;
        let params = lock(&self.bind).snapshot()?;
        let boxed = to_sql_params(&params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(AsRef::as_ref).collect();

        let mut guard = lock_state(&self.conn);
        let client = guard.client.as_mut().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing postgresql query: {}", self.sql);
        let rows = client.query(&prepared, &refs).map_err(|e| map_pg_err(&e))?;

        let mut converted = Vec::with_capacity(rows.len());
        for row in &rows {
            converted.push(pg_row_values(row)?);
        }
        Ok(Box::new(BufferedResultSet::new(
            self.columns.clone(),
            converted,
        )))
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        if !self.columns.is_empty() {
            return Err(DbError::sql(
                "statement returns rows; use executeQuery instead",
            ));
        }
        let params = lock(&self.bind).snapshot()?;
        self.run_update(&params)
    }

    fn execute(&self) -> Result<bool, DbError> {
        if self.columns.is_empty() {
            self.execute_update()?;
            Ok(false)
        } else {
            let mut rs = self.execute_query()?;
            rs.close();
            Ok(true)
        }
    }

    fn add_batch(&self) -> Result<(), DbError> {
        if lock(&self.prepared).is_none() {
            return Err(DbError::ConnectionClosed);
        }
        let snapshot = lock(&self.bind).snapshot()?;
        lock(&self.batch).push(snapshot);
        Ok(())
    }

    fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        if !self.columns.is_empty() {
            return Err(DbError::sql("batch execution requires an update statement"));
        }
        let entries = std::mem::take(&mut *lock(&self.batch));
        let mut counts = Vec::with_capacity(entries.len());
        for entry in entries {
            counts.push(self.run_update(&entry)?);
        }
        Ok(counts)
    }

    fn close(&self) {
        self.mark_closed();
    }

    fn is_closed(&self) -> bool {
        lock(&self.prepared).is_none()
    }
}

fn to_sql_params(params: &[BoundParam]) -> Result<Vec<Box<dyn ToSql + Sync>>, DbError> {
    params.iter().map(to_sql_value).collect()
}

fn to_sql_value(param: &BoundParam) -> Result<Box<dyn ToSql + Sync>, DbError> {
    Ok(match &param.value {
        Value::Null => null_with_hint(param.ty),
        Value::Int(v) => Box::new(*v),
        Value::Long(v) => Box::new(*v),
        Value::Float(v) => Box::new(*v),
        Value::Double(v) => Box::new(*v),
        Value::Varchar(s) => Box::new(s.clone()),
        Value::Bool(v) => Box::new(*v),
        Value::Date(d) => Box::new(*d),
        Value::Timestamp(t) => Box::new(*t),
        Value::Blob(blob) => Box::new(blob.bytes()?.to_vec()),
    })
}

/// A typed NULL so the wire value matches the slot's type hint.
fn null_with_hint(ty: ValueType) -> Box<dyn ToSql + Sync> {
    match ty {
        ValueType::Integer => Box::new(None::<i32>),
        ValueType::Long => Box::new(None::<i64>),
        ValueType::Float => Box::new(None::<f32>),
        ValueType::Double => Box::new(None::<f64>),
        ValueType::Boolean => Box::new(None::<bool>),
        ValueType::Date => Box::new(None::<chrono::NaiveDate>),
        ValueType::Timestamp => Box::new(None::<chrono::NaiveDateTime>),
        ValueType::Blob => Box::new(None::<Vec<u8>>),
        ValueType::Varchar | ValueType::Null => Box::new(None::<String>),
    }
}
