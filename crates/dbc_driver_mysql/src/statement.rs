use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dbc_core::{
    BindTable, BoundParam, DbError, PreparedStatement, ResultSet, Value, ValueType,
};
use mysql::prelude::Queryable;

use crate::driver::{lock_state, map_mysql_err, run_stored_query, MysqlConnState};

/// Prepared statement over one MySQL session.
///
/// The SQL was validated by a server-side prepare; execution substitutes
/// bound parameters into the text as quote-and-escape-safe literals and
/// runs over the regular query interface, which keeps the connection free
/// of half-consumed binary-protocol result state between commands.
pub struct MysqlPreparedStatement {
    conn: Arc<Mutex<MysqlConnState>>,
    sql: String,
    param_count: usize,
    columns: Vec<String>,
    bind: Mutex<BindTable>,
    batch: Mutex<Vec<Vec<BoundParam>>>,
    closed: AtomicBool,
}

impl MysqlPreparedStatement {
    pub(crate) fn new(
        conn: Arc<Mutex<MysqlConnState>>,
        sql: String,
        param_count: usize,
        columns: Vec<String>,
    ) -> Self {
        Self {
            conn,
            sql,
            param_count,
            columns,
            bind: Mutex::new(BindTable::new(param_count)),
            batch: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionClosed);
        }
        Ok(())
    }

    fn bind_lock(&self) -> std::sync::MutexGuard<'_, BindTable> {
        match self.bind.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn batch_lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<BoundParam>>> {
        match self.batch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn render(&self, params: &[BoundParam]) -> Result<String, DbError> {
        substitute_placeholders(&self.sql, params)
    }

    fn run_update(&self, params: &[BoundParam]) -> Result<u64, DbError> {
        let sql = self.render(params)?;
        let mut guard = lock_state(&self.conn);
        let conn = guard.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing mysql update: {sql}");
        let result = conn.query_iter(&sql).map_err(|e| map_mysql_err(&e))?;
        Ok(result.affected_rows())
    }
}

impl PreparedStatement for MysqlPreparedStatement {
    fn parameter_count(&self) -> usize {
        self.param_count
    }

    fn set_value(&self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError> {
        self.check_open()?;
        self.bind_lock().set(index, ty, value)
    }

    fn execute_query(&self) -> Result<Box<dyn ResultSet>, DbError> {
        self.check_open()?;
        if self.columns.is_empty() {
            return Err(DbError::sql("statement does not return rows"));
        }
        let params = self.bind_lock().snapshot()?;
        let sql = self.render(&params)?;

        let mut guard = lock_state(&self.conn);
        let conn = guard.conn.as_mut().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing mysql query: {sql}");
        let result = run_stored_query(conn, &sql, Some(&self.columns))?;
        Ok(Box::new(result))
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        self.check_open()?;
        if !self.columns.is_empty() {
            return Err(DbError::sql(
                "statement returns rows; use executeQuery instead",
            ));
        }
        let params = self.bind_lock().snapshot()?;
        self.run_update(&params)
    }

    fn execute(&self) -> Result<bool, DbError> {
        self.check_open()?;
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
        self.check_open()?;
        let snapshot = self.bind_lock().snapshot()?;
        self.batch_lock().push(snapshot);
        Ok(())
    }

    fn execute_batch(&self) -> Result<Vec<u64>, DbError> {
        self.check_open()?;
        if !self.columns.is_empty() {
            return Err(DbError::sql("batch execution requires an update statement"));
        }
        let entries = std::mem::take(&mut *self.batch_lock());
        let mut counts = Vec::with_capacity(entries.len());
        for entry in entries {
            counts.push(self.run_update(&entry)?);
        }
        Ok(counts)
    }

    fn close(&self) {
        // No server-side handle survives the prepare step, so closing a
        // statement is purely local.
        self.mark_closed();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Replace each `?` placeholder outside string literals with the rendered
/// literal of its bound parameter.
fn substitute_placeholders(sql: &str, params: &[BoundParam]) -> Result<String, DbError> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next_param = params.iter();

    #[derive(PartialEq)]
    enum Mode {
        Normal,
        Single,
        Double,
        Backtick,
    }
    let mut mode = Mode::Normal;
    let mut chars = sql.chars();

    while let Some(c) = chars.next() {
        match mode {
            Mode::Normal => match c {
                '?' => {
                    let param = next_param.next().ok_or_else(|| {
                        DbError::parameter("more placeholders than bound parameters")
                    })?;
                    out.push_str(&render_literal(param)?);
                    continue;
                }
                '\'' => mode = Mode::Single,
                '"' => mode = Mode::Double,
                '`' => mode = Mode::Backtick,
                _ => {}
            },
            Mode::Single => match c {
                '\\' => {
                    out.push(c);
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                    continue;
                }
                '\'' => mode = Mode::Normal,
                _ => {}
            },
            Mode::Double => match c {
                '\\' => {
                    out.push(c);
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                    continue;
                }
                '"' => mode = Mode::Normal,
                _ => {}
            },
            Mode::Backtick => {
                if c == '`' {
                    mode = Mode::Normal;
                }
            }
        }
        out.push(c);
    }

    if next_param.next().is_some() {
        return Err(DbError::parameter("more bound parameters than placeholders"));
    }
    Ok(out)
}

/// Render one bound parameter as a standalone SQL literal.
fn render_literal(param: &BoundParam) -> Result<String, DbError> {
    let literal = match &param.value {
        Value::Null => "NULL".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Float(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                "NULL".to_string()
            }
        }
        Value::Double(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                "NULL".to_string()
            }
        }
        Value::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        Value::Varchar(s) => format!("'{}'", escape_string(s)),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Timestamp(t) => format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.f")),
        Value::Blob(blob) => format!("X'{}'", hex::encode(blob.bytes()?)),
    };
    Ok(literal)
}

/// Escape a string for a single-quoted MySQL literal. Backslashes are
/// doubled and quotes escaped by doubling; assumes the server's default
/// backslash-escape mode.
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::{render_literal, substitute_placeholders};
    use dbc_core::{Blob, BoundParam, Value, ValueType};

    fn param(value: Value) -> BoundParam {
        BoundParam {
            ty: value.value_type(),
            value,
        }
    }

    #[test]
    fn substitutes_in_order_and_skips_literals() {
        let sql = "INSERT INTO t(a, b) VALUES (?, 'keep?this') -- ?";
        let out = substitute_placeholders(
            sql,
            &[param(Value::Int(7)), param(Value::Varchar("x".into()))],
        );
        // The trailing '?' sits outside a string literal, so it consumes the
        // second parameter.
        assert_eq!(out.unwrap(), "INSERT INTO t(a, b) VALUES (7, 'keep?this') -- 'x'");
    }

    #[test]
    fn placeholder_count_mismatch_is_a_parameter_error() {
        let err = substitute_placeholders("SELECT ?", &[]).unwrap_err();
        assert_eq!(err.code(), "0x0202");

        let err = substitute_placeholders("SELECT 1", &[param(Value::Int(1))]).unwrap_err();
        assert_eq!(err.code(), "0x0202");
    }

    #[test]
    fn quotes_and_backslashes_are_escaped() {
        let rendered = render_literal(&param(Value::Varchar("O'Brien \\ co".into()))).unwrap();
        assert_eq!(rendered, "'O''Brien \\\\ co'");
    }

    #[test]
    fn escaped_quote_inside_literal_does_not_end_it() {
        let sql = "SELECT 'it\\'s ? fine', ?";
        let out = substitute_placeholders(sql, &[param(Value::Int(1))]).unwrap();
        assert_eq!(out, "SELECT 'it\\'s ? fine', 1");
    }

    #[test]
    fn typed_literals_render() {
        assert_eq!(render_literal(&param(Value::Null)).unwrap(), "NULL");
        assert_eq!(render_literal(&param(Value::Bool(true))).unwrap(), "1");
        assert_eq!(
            render_literal(&param(Value::Blob(Blob::from_bytes(vec![0xAB, 0xCD])))).unwrap(),
            "X'abcd'"
        );
        let null_hint = BoundParam {
            ty: ValueType::Varchar,
            value: Value::Null,
        };
        assert_eq!(render_literal(&null_hint).unwrap(), "NULL");
    }
}
