//! ScyllaDB driver: the wide-column family.
//!
//! A blocking facade over the async session: the driver owns a private
//! runtime and every call blocks on it. Rows surface through the shared
//! result-set contract; CQL uses `?` parameters.

use std::sync::{Arc, Mutex, MutexGuard};

use dbc_core::{
    Blob, BufferedResultSet, ColumnarConnection, DbError, DbUrl, Driver, DriverConnection,
    ResultSet, Value,
};
use scylla::frame::response::result::CqlValue;
use scylla::{Session, SessionBuilder};
use tokio::runtime::Runtime;

pub const DEFAULT_PORT: u16 = 9042;

pub struct ScyllaDriver;

impl ScyllaDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScyllaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ScyllaDriver {
    fn scheme(&self) -> &'static str {
        "scylladb"
    }

    fn name(&self) -> &'static str {
        "ScyllaDB"
    }

    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let runtime = Runtime::new().map_err(DbError::Io)?;
        let node = format!("{}:{}", url.host(), url.port_or(DEFAULT_PORT));

        let mut builder = SessionBuilder::new().known_node(&node);
        if !user.is_empty() {
            builder = builder.user(user, password);
        }

        let session = runtime
            .block_on(builder.build())
            .map_err(|e| DbError::connection_failure(e.to_string()))?;

        if let Some(keyspace) = url.database() {
            runtime
                .block_on(session.use_keyspace(keyspace, false))
                .map_err(|e| DbError::connection_failure(e.to_string()))?;
        }

        log::info!("connected to scylladb at {node}");

        Ok(DriverConnection::Columnar(Arc::new(ScyllaConnection {
            session: Mutex::new(Some(session)),
            runtime,
            url: url.as_str().to_string(),
        })))
    }
}

pub struct ScyllaConnection {
    // Declared before the runtime so the session drops first.
    session: Mutex<Option<Session>>,
    runtime: Runtime,
    url: String,
}

impl ScyllaConnection {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run(&self, cql: &str) -> Result<scylla::QueryResult, DbError> {
        let guard = self.lock();
        let session = guard.as_ref().ok_or(DbError::ConnectionClosed)?;
        log::debug!("executing cql: {cql}");
        self.runtime
            .block_on(session.query(cql, ()))
            .map_err(|e| DbError::sql(e.to_string()))
    }
}

fn cql_to_value(value: Option<&CqlValue>) -> Value {
    let Some(value) = value else {
        return Value::Null;
    };
    match value {
        CqlValue::TinyInt(v) => Value::Int(i32::from(*v)),
        CqlValue::SmallInt(v) => Value::Int(i32::from(*v)),
        CqlValue::Int(v) => Value::Int(*v),
        CqlValue::BigInt(v) => Value::Long(*v),
        CqlValue::Float(v) => Value::Float(*v),
        CqlValue::Double(v) => Value::Double(*v),
        CqlValue::Text(s) => Value::Varchar(s.clone()),
        CqlValue::Ascii(s) => Value::Varchar(s.clone()),
        CqlValue::Boolean(v) => Value::Bool(*v),
        CqlValue::Blob(b) => Value::Blob(Blob::from_bytes(b.clone())),
        other => Value::Varchar(format!("{other:?}")),
    }
}

impl ColumnarConnection for ScyllaConnection {
    fn execute(&self, cql: &str) -> Result<u64, DbError> {
        self.run(cql)?;
        // CQL does not report affected-row counts.
        Ok(0)
    }

    fn query(&self, cql: &str) -> Result<Box<dyn ResultSet>, DbError> {
        let result = self.run(cql)?;

        let columns: Vec<String> = result
            .col_specs
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        let rows: Vec<Vec<Value>> = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.columns
                    .iter()
                    .map(|v| cql_to_value(v.as_ref()))
                    .collect()
            })
            .collect();

        Ok(Box::new(BufferedResultSet::new(columns, rows)))
    }

    fn close(&self) {
        let mut guard = self.lock();
        if guard.is_some() {
            log::info!("closing scylladb connection to {}", self.url);
            *guard = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::ScyllaDriver;
    use dbc_core::Driver;

    #[test]
    fn accepts_only_scylladb_urls() {
        let driver = ScyllaDriver::new();
        assert!(driver.accepts_url("cpp_dbc:scylladb://host:9042/ks"));
        assert!(!driver.accepts_url("cpp_dbc:postgresql://host:5432/db"));
    }
}
