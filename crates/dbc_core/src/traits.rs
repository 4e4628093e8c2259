use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;

use crate::blob::{Blob, InputStream};
use crate::error::DbError;
use crate::url::DbUrl;
use crate::value::{IsolationLevel, Value, ValueType};

/// Factory for backend connections, selected by URL scheme.
///
/// Drivers are process-lifetime singletons registered once with the
/// `DriverManager`; registration order decides dispatch on ties.
pub trait Driver: Send + Sync {
    /// The URL scheme token this driver claims (e.g. `"mysql"`).
    fn scheme(&self) -> &'static str;

    /// Human-readable driver name for logs.
    fn name(&self) -> &'static str;

    /// Whether this driver handles `url`. The default matches the scheme
    /// token without a full parse.
    fn accepts_url(&self, url: &str) -> bool {
        DbUrl::scheme_of(url).is_some_and(|scheme| scheme == self.scheme())
    }

    /// Open a live session. Relational drivers take credentials from the
    /// `user`/`password` arguments and ignore a credential block in the URL;
    /// document and key-value drivers prefer URL credentials when present.
    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError>;
}

/// A live connection of whichever family the driver implements.
pub enum DriverConnection {
    Relational(Arc<dyn RelationalConnection>),
    Columnar(Arc<dyn ColumnarConnection>),
    Document(Arc<dyn DocumentConnection>),
    KeyValue(Arc<dyn KeyValueConnection>),
}

impl std::fmt::Debug for DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(self.family()).finish()
    }
}

impl DriverConnection {
    pub fn close(&self) {
        match self {
            Self::Relational(c) => c.close(),
            Self::Columnar(c) => c.close(),
            Self::Document(c) => c.close(),
            Self::KeyValue(c) => c.close(),
        }
    }

    pub fn into_relational(self) -> Result<Arc<dyn RelationalConnection>, DbError> {
        match self {
            Self::Relational(c) => Ok(c),
            other => Err(family_mismatch("relational", &other)),
        }
    }

    pub fn into_columnar(self) -> Result<Arc<dyn ColumnarConnection>, DbError> {
        match self {
            Self::Columnar(c) => Ok(c),
            other => Err(family_mismatch("columnar", &other)),
        }
    }

    pub fn into_document(self) -> Result<Arc<dyn DocumentConnection>, DbError> {
        match self {
            Self::Document(c) => Ok(c),
            other => Err(family_mismatch("document", &other)),
        }
    }

    pub fn into_key_value(self) -> Result<Arc<dyn KeyValueConnection>, DbError> {
        match self {
            Self::KeyValue(c) => Ok(c),
            other => Err(family_mismatch("key-value", &other)),
        }
    }

    fn family(&self) -> &'static str {
        match self {
            Self::Relational(_) => "relational",
            Self::Columnar(_) => "columnar",
            Self::Document(_) => "document",
            Self::KeyValue(_) => "key-value",
        }
    }
}

fn family_mismatch(wanted: &str, got: &DriverConnection) -> DbError {
    DbError::unsupported(format!(
        "driver produced a {} connection, expected {wanted}",
        got.family()
    ))
}

/// One live session to a relational backend.
///
/// Implementations serialize every public operation through a per-connection
/// lock: a connection is never a concurrent object, and at most one logical
/// operation is in flight at a time. Closing a connection from another
/// thread is permitted and causes operations blocked on it to fail with
/// `ConnectionClosed` rather than corrupt state.
pub trait RelationalConnection: Send + Sync {
    /// Parse and plan `sql`, returning a statement whose lifetime is bounded
    /// by this connection.
    fn prepare_statement(&self, sql: &str) -> Result<Arc<dyn PreparedStatement>, DbError>;

    /// Ad-hoc row-returning execution, no parameter binding.
    fn execute_query(&self, sql: &str) -> Result<Box<dyn ResultSet>, DbError>;

    /// Ad-hoc non-row-returning execution; returns the affected row count.
    fn execute_update(&self, sql: &str) -> Result<u64, DbError>;

    fn set_auto_commit(&self, enabled: bool) -> Result<(), DbError>;

    /// The last autocommit value set, regardless of transaction state.
    fn auto_commit(&self) -> bool;

    /// Start an explicit transaction. Returns `true` if a new transaction
    /// began, `false` if one was already active. Fails with a transaction
    /// error while autocommit is on.
    fn begin_transaction(&self) -> Result<bool, DbError>;

    /// True exactly while an explicit (or implicit) transaction is open.
    fn transaction_active(&self) -> bool;

    fn commit(&self) -> Result<(), DbError>;

    fn rollback(&self) -> Result<(), DbError>;

    /// Change the isolation level. Rejected mid-transaction on backends that
    /// forbid the change.
    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError>;

    /// The current level; immediately after connect this reports the
    /// backend's actual default.
    fn transaction_isolation(&self) -> IsolationLevel;

    /// Tear down: roll back if a transaction is active, finalize every live
    /// statement this connection issued, then release the backend handle.
    /// Idempotent; teardown errors are logged and swallowed.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Reset for reuse: rollback if active, finalize live statements, restore
    /// pool defaults (autocommit on, backend default isolation), and mark the
    /// connection resident. A reset failure forces the connection closed and
    /// surfaces the error. No-op on an already-closed connection.
    fn return_to_pool(&self) -> Result<(), DbError>;

    /// Whether a pool owns this connection.
    fn is_pooled(&self) -> bool;

    /// Pool-side ownership flag; called by the owning pool, not by clients.
    fn mark_pooled(&self, pooled: bool);

    /// The URL this connection was produced from.
    fn url(&self) -> String;
}

/// A prepared statement owned by exactly one connection.
///
/// Slots are 1-based. The typed setters are sugar over `set_value`; binding
/// copies variable-size payloads, and streams are consumed at execution time.
/// Placeholder syntax is not normalised across backends: MySQL, SQLite and
/// Firebird use `?`, PostgreSQL uses `$1..$N`.
pub trait PreparedStatement: Send + Sync {
    /// Number of placeholders, recorded at prepare time.
    fn parameter_count(&self) -> usize;

    /// Store a typed copy of `value` in slot `index`.
    fn set_value(&self, index: u32, ty: ValueType, value: Value) -> Result<(), DbError>;

    /// Clear slot `index` and mark it NULL with a type hint.
    fn set_null(&self, index: u32, ty: ValueType) -> Result<(), DbError> {
        self.set_value(index, ty, Value::Null)
    }

    fn set_int(&self, index: u32, value: i32) -> Result<(), DbError> {
        self.set_value(index, ValueType::Integer, Value::Int(value))
    }

    fn set_long(&self, index: u32, value: i64) -> Result<(), DbError> {
        self.set_value(index, ValueType::Long, Value::Long(value))
    }

    fn set_float(&self, index: u32, value: f32) -> Result<(), DbError> {
        self.set_value(index, ValueType::Float, Value::Float(value))
    }

    fn set_double(&self, index: u32, value: f64) -> Result<(), DbError> {
        self.set_value(index, ValueType::Double, Value::Double(value))
    }

    fn set_string(&self, index: u32, value: &str) -> Result<(), DbError> {
        self.set_value(index, ValueType::Varchar, Value::Varchar(value.to_string()))
    }

    fn set_boolean(&self, index: u32, value: bool) -> Result<(), DbError> {
        self.set_value(index, ValueType::Boolean, Value::Bool(value))
    }

    fn set_date(&self, index: u32, value: NaiveDate) -> Result<(), DbError> {
        self.set_value(index, ValueType::Date, Value::Date(value))
    }

    fn set_timestamp(&self, index: u32, value: NaiveDateTime) -> Result<(), DbError> {
        self.set_value(index, ValueType::Timestamp, Value::Timestamp(value))
    }

    fn set_bytes(&self, index: u32, value: &[u8]) -> Result<(), DbError> {
        self.set_value(
            index,
            ValueType::Blob,
            Value::Blob(Blob::from_bytes(value.to_vec())),
        )
    }

    fn set_blob(&self, index: u32, value: Blob) -> Result<(), DbError> {
        self.set_value(index, ValueType::Blob, Value::Blob(value))
    }

    fn set_binary_stream(&self, index: u32, stream: Box<dyn InputStream>) -> Result<(), DbError> {
        self.set_value(
            index,
            ValueType::Blob,
            Value::Blob(Blob::from_stream(stream)),
        )
    }

    /// Execute a row-returning form.
    fn execute_query(&self) -> Result<Box<dyn ResultSet>, DbError>;

    /// Execute a non-row-returning form; returns the affected row count.
    fn execute_update(&self) -> Result<u64, DbError>;

    /// Execute either form; returns whether a result set was produced.
    fn execute(&self) -> Result<bool, DbError>;

    /// Snapshot the fully bound slot table onto the batch.
    fn add_batch(&self) -> Result<(), DbError>;

    /// Run every accumulated batch entry as an update, in order, returning
    /// per-entry affected counts. The batch is cleared afterwards.
    fn execute_batch(&self) -> Result<Vec<u64>, DbError>;

    /// Finalize the backend handle. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Positional row cursor over a statement's results.
///
/// Two physical kinds implement this one contract. Stored-result sets carry
/// their own buffer, never touch the connection again, and stay valid after
/// it closes. Cursor-fetch sets are views onto an open cursor: they share
/// the connection's lock and die with it.
pub trait ResultSet: Send {
    /// Advance one row. Returns `true` while a row is current, `false` at
    /// the end; fails once closed.
    fn next(&mut self) -> Result<bool, DbError>;

    /// True only before any successful `next()`.
    fn is_before_first(&self) -> bool;

    /// True only after the row past the last has been requested.
    fn is_after_last(&self) -> bool;

    /// 1-based index of the current row; 0 when not in range.
    fn row(&self) -> u64;

    /// Column names, static after prepare and stable across `next()`.
    fn column_names(&self) -> Vec<String>;

    fn column_count(&self) -> usize;

    /// 1-based index of a named column.
    fn column_index(&self, name: &str) -> Result<u32, DbError>;

    /// The raw value of a column of the current row, 1-based.
    fn get_value(&self, column: u32) -> Result<Value, DbError>;

    /// Idempotent: frees the buffer (stored) or closes the cursor (fetch).
    fn close(&mut self);

    /// Distinguishes NULL from the type's zero value.
    fn is_null(&self, column: u32) -> Result<bool, DbError> {
        Ok(self.get_value(column)?.is_null())
    }

    fn get_int(&self, column: u32) -> Result<i32, DbError> {
        self.get_value(column)?.as_i32()
    }

    fn get_long(&self, column: u32) -> Result<i64, DbError> {
        self.get_value(column)?.as_i64()
    }

    fn get_float(&self, column: u32) -> Result<f32, DbError> {
        self.get_value(column)?.as_f32()
    }

    fn get_double(&self, column: u32) -> Result<f64, DbError> {
        self.get_value(column)?.as_f64()
    }

    fn get_string(&self, column: u32) -> Result<String, DbError> {
        self.get_value(column)?.as_string()
    }

    fn get_boolean(&self, column: u32) -> Result<bool, DbError> {
        self.get_value(column)?.as_bool()
    }

    fn get_date(&self, column: u32) -> Result<Option<NaiveDate>, DbError> {
        self.get_value(column)?.as_date()
    }

    fn get_timestamp(&self, column: u32) -> Result<Option<NaiveDateTime>, DbError> {
        self.get_value(column)?.as_timestamp()
    }

    fn get_blob(&self, column: u32) -> Result<Option<Blob>, DbError> {
        self.get_value(column)?.as_blob()
    }

    fn get_bytes(&self, column: u32) -> Result<Option<Vec<u8>>, DbError> {
        match self.get_blob(column)? {
            Some(blob) => Ok(Some(blob.bytes()?.to_vec())),
            None => Ok(None),
        }
    }

    fn get_binary_stream(&self, column: u32) -> Result<Option<Box<dyn InputStream>>, DbError> {
        match self.get_blob(column)? {
            Some(blob) => Ok(Some(blob.stream()?)),
            None => Ok(None),
        }
    }

    fn is_null_named(&self, name: &str) -> Result<bool, DbError> {
        let column = self.column_index(name)?;
        self.is_null(column)
    }

    fn get_int_named(&self, name: &str) -> Result<i32, DbError> {
        let column = self.column_index(name)?;
        self.get_int(column)
    }

    fn get_long_named(&self, name: &str) -> Result<i64, DbError> {
        let column = self.column_index(name)?;
        self.get_long(column)
    }

    fn get_double_named(&self, name: &str) -> Result<f64, DbError> {
        let column = self.column_index(name)?;
        self.get_double(column)
    }

    fn get_string_named(&self, name: &str) -> Result<String, DbError> {
        let column = self.column_index(name)?;
        self.get_string(column)
    }

    fn get_boolean_named(&self, name: &str) -> Result<bool, DbError> {
        let column = self.column_index(name)?;
        self.get_boolean(column)
    }

    fn get_date_named(&self, name: &str) -> Result<Option<NaiveDate>, DbError> {
        let column = self.column_index(name)?;
        self.get_date(column)
    }

    fn get_timestamp_named(&self, name: &str) -> Result<Option<NaiveDateTime>, DbError> {
        let column = self.column_index(name)?;
        self.get_timestamp(column)
    }

    fn get_blob_named(&self, name: &str) -> Result<Option<Blob>, DbError> {
        let column = self.column_index(name)?;
        self.get_blob(column)
    }

    fn get_bytes_named(&self, name: &str) -> Result<Option<Vec<u8>>, DbError> {
        let column = self.column_index(name)?;
        self.get_bytes(column)
    }
}

/// One live session to a wide-column backend. Rows surface through the same
/// `ResultSet` contract as the relational family; parameters use `?`.
pub trait ColumnarConnection: Send + Sync {
    fn execute(&self, cql: &str) -> Result<u64, DbError>;

    fn query(&self, cql: &str) -> Result<Box<dyn ResultSet>, DbError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn url(&self) -> String;
}

/// One live session to a document store.
pub trait DocumentConnection: Send + Sync + std::fmt::Debug {
    /// Handle onto a named collection in the connection's database.
    fn collection(&self, name: &str) -> Result<Box<dyn DocumentCollection>, DbError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn url(&self) -> String;
}

/// Operations on one collection. Filters and documents cross this boundary
/// as raw JSON text; the backend client library performs its own escaping,
/// this layer never parses or rewrites the JSON.
pub trait DocumentCollection: Send {
    fn insert(&self, document_json: &str) -> Result<(), DbError>;

    fn find(&self, filter_json: &str) -> Result<Box<dyn DocumentCursor>, DbError>;

    /// Update documents matching the filter; returns the modified count.
    fn update(&self, filter_json: &str, update_json: &str) -> Result<u64, DbError>;

    /// Delete documents matching the filter; returns the deleted count.
    fn delete(&self, filter_json: &str) -> Result<u64, DbError>;

    fn count(&self, filter_json: &str) -> Result<u64, DbError>;
}

/// Forward-only cursor over matching documents, yielded as JSON text.
pub trait DocumentCursor: Send + std::fmt::Debug {
    fn next(&mut self) -> Result<Option<String>, DbError>;
}

/// One live session to a key-value store.
pub trait KeyValueConnection: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, DbError>;

    fn set(&self, key: &str, value: &str) -> Result<(), DbError>;

    /// Returns `true` if a key was removed.
    fn delete(&self, key: &str) -> Result<bool, DbError>;

    fn exists(&self, key: &str) -> Result<bool, DbError>;

    /// Set a time-to-live; returns `true` when the expiry was applied.
    fn expire(&self, key: &str, seconds: u64) -> Result<bool, DbError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    fn url(&self) -> String;
}
