//! PostgreSQL driver: stored-result execution model.
//!
//! Statements are prepared server-side with `$1..$N` placeholders and rows
//! materialize on the client at execute time, detaching result sets from
//! the connection.

mod driver;
mod statement;

pub use driver::{PostgresConnection, PostgresDriver};
pub use statement::PostgresPreparedStatement;
