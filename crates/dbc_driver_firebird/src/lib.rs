//! Firebird driver: cursor-fetch execution model.
//!
//! Runs over the pure-Rust Firebird wire client. Each `next()` on a result
//! set fetches from the live wire cursor, so statements and result sets
//! share the connection's lock and die with it. One cursor is open on the
//! session at a time: a later statement takes over and invalidates it.
//! With autocommit off, the first data statement implicitly begins a
//! transaction.

mod driver;
mod statement;

pub use driver::{FirebirdConnection, FirebirdDriver};
pub use statement::{FbPreparedStatement, FbResultSet};
