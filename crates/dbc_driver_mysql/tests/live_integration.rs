//! Tests against a live MySQL server.
//!
//! Set `DBC_MYSQL_URL` (e.g. `cpp_dbc:mysql://127.0.0.1:3306/test`) plus
//! `DBC_MYSQL_USER` / `DBC_MYSQL_PASSWORD`, then run with `--ignored`.

use std::sync::Arc;

use dbc_core::{
    DbError, DbUrl, Driver, IsolationLevel, PreparedStatement, RelationalConnection, ResultSet,
};
use dbc_driver_mysql::MysqlDriver;

fn connect_mysql() -> Arc<dyn RelationalConnection> {
    let url = std::env::var("DBC_MYSQL_URL").expect("DBC_MYSQL_URL must be set");
    let user = std::env::var("DBC_MYSQL_USER").unwrap_or_else(|_| "root".to_string());
    let password = std::env::var("DBC_MYSQL_PASSWORD").unwrap_or_default();

    let url = DbUrl::parse(&url).expect("URL should parse");
    MysqlDriver::new()
        .connect(&url, &user, &password)
        .expect("connect should succeed")
        .into_relational()
        .expect("mysql driver is relational")
}

#[test]
#[ignore = "requires a running MySQL server"]
fn create_insert_and_read_back_three_rows() {
    let conn = connect_mysql();
    conn.execute_update("DROP TABLE IF EXISTS dbc_live_t").expect("drop");
    conn.execute_update("CREATE TABLE dbc_live_t(id INTEGER PRIMARY KEY, name VARCHAR(32))")
        .expect("create table");

    let insert = conn
        .prepare_statement("INSERT INTO dbc_live_t(id, name) VALUES (?, ?)")
        .expect("prepare insert");
    assert_eq!(insert.parameter_count(), 2);

    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        insert.set_int(1, id).expect("bind id");
        insert.set_string(2, name).expect("bind name");
        assert_eq!(insert.execute_update().expect("insert row"), 1);
    }

    let mut rs = conn
        .execute_query("SELECT id, name FROM dbc_live_t ORDER BY id")
        .expect("select");
    let mut rows = Vec::new();
    while rs.next().expect("next") {
        rows.push((
            rs.get_int_named("id").expect("id"),
            rs.get_string_named("name").expect("name"),
        ));
    }
    assert_eq!(
        rows,
        vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
    );
    assert!(rs.is_after_last());

    conn.execute_update("DROP TABLE dbc_live_t").expect("drop");
}

#[test]
#[ignore = "requires a running MySQL server"]
fn stored_result_survives_connection_close() {
    let conn = connect_mysql();
    let mut rs = conn.execute_query("SELECT 1 AS one").expect("select");
    conn.close();

    assert!(rs.next().expect("buffered rows outlive the connection"));
    assert_eq!(rs.get_int_named("one").expect("one"), 1);
}

#[test]
#[ignore = "requires a running MySQL server"]
fn quoting_survives_substitution() {
    let conn = connect_mysql();
    conn.execute_update("DROP TABLE IF EXISTS dbc_live_q").expect("drop");
    conn.execute_update("CREATE TABLE dbc_live_q(v VARCHAR(64))").expect("create");

    let tricky = "O'Brien \\ \"quoted\" ?";
    let insert = conn
        .prepare_statement("INSERT INTO dbc_live_q(v) VALUES (?)")
        .expect("prepare");
    insert.set_string(1, tricky).expect("bind");
    insert.execute_update().expect("insert");

    let mut rs = conn.execute_query("SELECT v FROM dbc_live_q").expect("select");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_string(1).expect("v"), tricky);

    conn.execute_update("DROP TABLE dbc_live_q").expect("drop");
}

#[test]
#[ignore = "requires a running MySQL server"]
fn transactions_commit_and_roll_back() {
    let conn = connect_mysql();
    conn.execute_update("DROP TABLE IF EXISTS dbc_live_tx").expect("drop");
    conn.execute_update("CREATE TABLE dbc_live_tx(id INTEGER)").expect("create");

    assert_eq!(conn.transaction_isolation(), IsolationLevel::RepeatableRead);

    conn.set_auto_commit(false).expect("autocommit off");
    assert!(conn.begin_transaction().expect("begin"));
    conn.execute_update("INSERT INTO dbc_live_tx(id) VALUES (1)").expect("insert");
    conn.rollback().expect("rollback");

    conn.begin_transaction().expect("begin again");
    conn.execute_update("INSERT INTO dbc_live_tx(id) VALUES (2)").expect("insert");
    conn.commit().expect("commit");

    let other = connect_mysql();
    let mut rs = other
        .execute_query("SELECT id FROM dbc_live_tx")
        .expect("select");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_int(1).expect("id"), 2);
    assert!(!rs.next().expect("only the committed row"));

    conn.execute_update("DROP TABLE dbc_live_tx").expect("drop");
}

#[test]
#[ignore = "requires a running MySQL server"]
fn wrong_password_is_a_connection_failure() {
    let url = std::env::var("DBC_MYSQL_URL").expect("DBC_MYSQL_URL must be set");
    let url = DbUrl::parse(&url).expect("URL should parse");

    let err = MysqlDriver::new()
        .connect(&url, "definitely_wrong_user", "definitely_wrong_password")
        .expect_err("must fail");
    assert_eq!(err.code(), "0x0101");
    assert!(matches!(err, DbError::ConnectionFailure(_)));
}
