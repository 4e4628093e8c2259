//! Tests against a live Firebird server.
//!
//! Set `DBC_FIREBIRD_URL`
//! (e.g. `cpp_dbc:firebird://127.0.0.1:3050//var/lib/firebird/data/test.fdb`)
//! plus `DBC_FIREBIRD_USER` / `DBC_FIREBIRD_PASSWORD`, then run with
//! `--ignored`.

use std::sync::Arc;

use dbc_core::{
    DbError, DbUrl, Driver, IsolationLevel, PreparedStatement, RelationalConnection, ResultSet,
};
use dbc_driver_firebird::FirebirdDriver;

fn connect_firebird() -> Arc<dyn RelationalConnection> {
    let url = std::env::var("DBC_FIREBIRD_URL").expect("DBC_FIREBIRD_URL must be set");
    let user = std::env::var("DBC_FIREBIRD_USER").unwrap_or_else(|_| "SYSDBA".to_string());
    let password = std::env::var("DBC_FIREBIRD_PASSWORD").unwrap_or_else(|_| "masterkey".to_string());

    let url = DbUrl::parse(&url).expect("URL should parse");
    FirebirdDriver::new()
        .connect(&url, &user, &password)
        .expect("connect should succeed")
        .into_relational()
        .expect("firebird driver is relational")
}

#[test]
#[ignore = "requires a running Firebird server"]
fn insert_and_read_back_rows() {
    let conn = connect_firebird();
    let _ = conn.execute_update("DROP TABLE DBC_LIVE_T");
    conn.execute_update("CREATE TABLE DBC_LIVE_T(ID INTEGER NOT NULL PRIMARY KEY, NAME VARCHAR(32))")
        .expect("create table");

    let insert = conn
        .prepare_statement("INSERT INTO DBC_LIVE_T(ID, NAME) VALUES (?, ?)")
        .expect("prepare insert");
    assert_eq!(insert.parameter_count(), 2);

    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        insert.set_int(1, id).expect("bind id");
        insert.set_string(2, name).expect("bind name");
        insert.execute_update().expect("insert row");
    }

    let mut rs = conn
        .execute_query("SELECT ID, NAME FROM DBC_LIVE_T ORDER BY ID")
        .expect("select");
    let mut rows = Vec::new();
    while rs.next().expect("next") {
        rows.push((
            rs.get_int_named("ID").expect("id"),
            rs.get_string_named("NAME").expect("name"),
        ));
    }
    assert_eq!(
        rows,
        vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
    );

    conn.execute_update("DROP TABLE DBC_LIVE_T").expect("drop");
}

#[test]
#[ignore = "requires a running Firebird server"]
fn implicit_transaction_starts_on_first_data_statement() {
    let conn = connect_firebird();
    let _ = conn.execute_update("DROP TABLE DBC_LIVE_I");
    conn.execute_update("CREATE TABLE DBC_LIVE_I(ID INTEGER)").expect("create");

    assert_eq!(conn.transaction_isolation(), IsolationLevel::RepeatableRead);

    conn.set_auto_commit(false).expect("autocommit off");
    assert!(!conn.transaction_active());

    // No explicit begin: the first data statement opens the transaction.
    conn.execute_update("INSERT INTO DBC_LIVE_I(ID) VALUES (1)").expect("insert");
    assert!(conn.transaction_active());

    conn.rollback().expect("rollback");
    assert!(!conn.transaction_active());

    conn.set_auto_commit(true).expect("autocommit on");
    let mut rs = conn
        .execute_query("SELECT COUNT(*) FROM DBC_LIVE_I")
        .expect("count");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_long(1).expect("count"), 0);

    conn.execute_update("DROP TABLE DBC_LIVE_I").expect("drop");
}

#[test]
#[ignore = "requires a running Firebird server"]
fn later_statement_invalidates_the_open_result_set() {
    let conn = connect_firebird();
    let _ = conn.execute_update("DROP TABLE DBC_LIVE_V");
    conn.execute_update("CREATE TABLE DBC_LIVE_V(ID INTEGER)").expect("create");
    for id in 1..=3 {
        conn.execute_update(&format!("INSERT INTO DBC_LIVE_V(ID) VALUES ({id})"))
            .expect("insert");
    }

    let mut rs = conn
        .execute_query("SELECT ID FROM DBC_LIVE_V ORDER BY ID")
        .expect("select");
    assert!(rs.next().expect("first row"));

    // A later statement takes over the wire session; the open cursor dies.
    conn.execute_update("INSERT INTO DBC_LIVE_V(ID) VALUES (99)").expect("insert");
    assert!(matches!(rs.next(), Err(DbError::ResultExhausted(_))));
    assert!(matches!(rs.get_int(1), Err(DbError::ResultExhausted(_))));

    conn.execute_update("DROP TABLE DBC_LIVE_V").expect("drop");
}

#[test]
#[ignore = "requires a running Firebird server"]
fn result_set_dies_with_the_connection() {
    let conn = connect_firebird();
    let mut rs = conn
        .execute_query("SELECT 1 FROM RDB$DATABASE")
        .expect("select");
    assert!(rs.next().expect("next"));

    conn.close();
    assert!(matches!(rs.get_int(1), Err(DbError::ConnectionClosed)));
    assert!(matches!(rs.next(), Err(DbError::ConnectionClosed)));
}

#[test]
#[ignore = "requires a running Firebird server"]
fn wrong_password_is_a_connection_failure() {
    let url = std::env::var("DBC_FIREBIRD_URL").expect("DBC_FIREBIRD_URL must be set");
    let url = DbUrl::parse(&url).expect("URL should parse");

    let err = FirebirdDriver::new()
        .connect(&url, "SYSDBA", "definitely_wrong_password")
        .expect_err("must fail");
    assert_eq!(err.code(), "0x0101");
}
