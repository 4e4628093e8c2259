//! A JDBC-style database connectivity layer.
//!
//! Client code targets the abstract contracts in [`dbc_core`] — connections,
//! prepared statements, result sets, collections, key/value operations — and
//! selects a concrete backend by URL scheme:
//!
//! ```no_run
//! use dbc::{DriverManager, RelationalConnection, ResultSet};
//!
//! dbc::register_builtin_drivers();
//!
//! let conn = DriverManager::global()
//!     .relational("cpp_dbc:sqlite:///var/lib/app/state.db", "", "")?;
//! let mut rows = conn.execute_query("SELECT id, name FROM users")?;
//! while rows.next()? {
//!     println!("{} {}", rows.get_int_named("id")?, rows.get_string_named("name")?);
//! }
//! # Ok::<(), dbc::DbError>(())
//! ```
//!
//! Backends are compiled in through cargo features (`sqlite`, `postgres`,
//! `mysql`, `firebird`, `mongodb`, `redis`, `scylladb`), all on by default.

use std::sync::Once;

pub use dbc_core::*;
pub use dbc_pool::{ConnectionPool, PoolConfig, PooledConnection};

#[cfg(feature = "firebird")]
pub use dbc_driver_firebird::FirebirdDriver;
#[cfg(feature = "mongodb")]
pub use dbc_driver_mongodb::MongoDriver;
#[cfg(feature = "mysql")]
pub use dbc_driver_mysql::MysqlDriver;
#[cfg(feature = "postgres")]
pub use dbc_driver_postgres::PostgresDriver;
#[cfg(feature = "redis")]
pub use dbc_driver_redis::RedisDriver;
#[cfg(feature = "scylladb")]
pub use dbc_driver_scylladb::ScyllaDriver;
#[cfg(feature = "sqlite")]
pub use dbc_driver_sqlite::SqliteDriver;

static REGISTER: Once = Once::new();

/// Register every compiled-in driver with the process-wide registry.
///
/// Safe to call from multiple places; registration happens once.
pub fn register_builtin_drivers() {
    REGISTER.call_once(|| {
        let manager = DriverManager::global();
        #[cfg(feature = "sqlite")]
        manager.register(std::sync::Arc::new(SqliteDriver::new()));
        #[cfg(feature = "postgres")]
        manager.register(std::sync::Arc::new(PostgresDriver::new()));
        #[cfg(feature = "mysql")]
        manager.register(std::sync::Arc::new(MysqlDriver::new()));
        #[cfg(feature = "firebird")]
        manager.register(std::sync::Arc::new(FirebirdDriver::new()));
        #[cfg(feature = "mongodb")]
        manager.register(std::sync::Arc::new(MongoDriver::new()));
        #[cfg(feature = "redis")]
        manager.register(std::sync::Arc::new(RedisDriver::new()));
        #[cfg(feature = "scylladb")]
        manager.register(std::sync::Arc::new(ScyllaDriver::new()));
    });
}
