//! SQLite driver: cursor-fetch execution model.
//!
//! Each `next()` on a result set steps the library-held statement against
//! the connection handle, so statements and result sets share the
//! connection's lock and are invalidated when it closes.

mod driver;
mod handle;
mod statement;

pub use driver::{SqliteConnection, SqliteDriver};
pub use statement::{SqlitePreparedStatement, SqliteResultSet};
