//! MySQL driver: stored-result execution model.
//!
//! Queries fully materialize on the client, so result sets detach from the
//! connection. Prepared statements are validated server-side, then executed
//! over the text protocol with parameters substituted as escaped literals.

mod driver;
mod statement;

pub use driver::{MysqlConnection, MysqlDriver};
pub use statement::MysqlPreparedStatement;
