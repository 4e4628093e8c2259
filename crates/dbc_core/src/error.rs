use thiserror::Error;

/// Database operation errors.
///
/// Every layer of the library reports failures through this single type.
/// Each variant carries a human-readable message for logs; `code()` returns
/// a short stable token that callers and tests match on instead of parsing
/// messages.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to establish a session: network, handshake, or auth rejection.
    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    /// Operation attempted on a connection that has been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// No registered driver accepts the URL scheme.
    #[error("no registered driver accepts scheme '{0}'")]
    DriverNotFound(String),

    /// URL does not match the expected grammar.
    #[error("invalid connection URL: {0}")]
    InvalidUrl(String),

    /// The backend rejected a statement (syntax, schema, constraint).
    #[error("{0}")]
    Sql(String),

    /// Bind index out of range or a type mismatch rejected before send.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Transaction control misuse: commit/rollback without an active
    /// transaction, or an isolation change rejected mid-transaction.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Result-set accessor used while not positioned on a row, or after close.
    #[error("result set error: {0}")]
    ResultExhausted(String),

    /// Named accessor with an unknown column, or an index out of range.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// Malformed backend response or a client-library failure that does not
    /// reduce to any other variant.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Stable short code for this error kind.
    ///
    /// Codes are opaque tokens: match them for equality, never parse them.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailure(_) => "0x0101",
            Self::ConnectionClosed => "0x0102",
            Self::DriverNotFound(_) => "0x0103",
            Self::InvalidUrl(_) => "0x0104",
            Self::Sql(_) => "0x0201",
            Self::Parameter(_) => "0x0202",
            Self::Transaction(_) => "0x0203",
            Self::ResultExhausted(_) => "0x0301",
            Self::ColumnNotFound(_) => "0x0302",
            Self::Protocol(_) => "0x0401",
            Self::Unsupported(_) => "0x0402",
            Self::Io(_) => "0x0403",
        }
    }

    pub fn connection_failure(msg: impl Into<String>) -> Self {
        Self::ConnectionFailure(msg.into())
    }

    pub fn sql(msg: impl Into<String>) -> Self {
        Self::Sql(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    pub fn result_exhausted(msg: impl Into<String>) -> Self {
        Self::ResultExhausted(msg.into())
    }

    pub fn column_not_found(msg: impl Into<String>) -> Self {
        Self::ColumnNotFound(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::DbError;

    #[test]
    fn codes_are_stable_and_distinct() {
        let errors = [
            DbError::ConnectionFailure("x".into()),
            DbError::ConnectionClosed,
            DbError::DriverNotFound("x".into()),
            DbError::InvalidUrl("x".into()),
            DbError::Sql("x".into()),
            DbError::Parameter("x".into()),
            DbError::Transaction("x".into()),
            DbError::ResultExhausted("x".into()),
            DbError::ColumnNotFound("x".into()),
            DbError::Protocol("x".into()),
            DbError::Unsupported("x".into()),
        ];

        let mut seen = std::collections::HashSet::new();
        for err in &errors {
            assert!(seen.insert(err.code()), "duplicate code {}", err.code());
        }

        assert_eq!(DbError::ConnectionClosed.code(), "0x0102");
        assert_eq!(DbError::DriverNotFound("mongodb".into()).code(), "0x0103");
    }

    #[test]
    fn driver_not_found_names_the_scheme() {
        let err = DbError::DriverNotFound("mongodb".into());
        assert!(err.to_string().contains("mongodb"));
    }
}
