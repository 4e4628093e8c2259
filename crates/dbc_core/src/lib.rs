//! Core contracts of the `dbc` connectivity layer: the error and value
//! model, the URL grammar, the per-family driver traits, and the
//! process-wide driver registry. Backend crates implement these contracts;
//! client code should not need anything below this surface.

pub mod blob;
pub mod config;
pub mod error;
pub mod params;
pub mod registry;
pub mod resultset;
pub mod traits;
pub mod url;
pub mod value;

pub use blob::{Blob, InputStream, MemoryInputStream};
pub use config::{DatabaseConfig, DatabasesFile};
pub use error::DbError;
pub use params::{BindTable, BoundParam};
pub use registry::DriverManager;
pub use resultset::BufferedResultSet;
pub use traits::{
    ColumnarConnection, DocumentCollection, DocumentConnection, DocumentCursor, Driver,
    DriverConnection, KeyValueConnection, PreparedStatement, RelationalConnection, ResultSet,
};
pub use url::{DbUrl, URL_PREFIX};
pub use value::{IsolationLevel, Value, ValueType};
