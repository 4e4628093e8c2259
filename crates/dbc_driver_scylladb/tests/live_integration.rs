//! Tests against a live ScyllaDB (or Cassandra-compatible) node.
//!
//! Set `DBC_SCYLLA_URL` (e.g. `cpp_dbc:scylladb://127.0.0.1:9042`), then run
//! with `--ignored`.

use std::sync::Arc;

use dbc_core::{ColumnarConnection, DbUrl, Driver, ResultSet};
use dbc_driver_scylladb::ScyllaDriver;

fn connect_scylla() -> Arc<dyn ColumnarConnection> {
    let url = std::env::var("DBC_SCYLLA_URL").expect("DBC_SCYLLA_URL must be set");
    let url = DbUrl::parse(&url).expect("URL should parse");
    ScyllaDriver::new()
        .connect(&url, "", "")
        .expect("connect should succeed")
        .into_columnar()
        .expect("scylladb driver is columnar")
}

#[test]
#[ignore = "requires a running ScyllaDB node"]
fn create_insert_and_read_back_rows() {
    let conn = connect_scylla();

    conn.execute(
        "CREATE KEYSPACE IF NOT EXISTS dbc_live \
         WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}",
    )
    .expect("create keyspace");
    conn.execute("CREATE TABLE IF NOT EXISTS dbc_live.t (id int PRIMARY KEY, name text)")
        .expect("create table");
    conn.execute("INSERT INTO dbc_live.t (id, name) VALUES (1, 'a')")
        .expect("insert");

    let mut rs = conn
        .query("SELECT id, name FROM dbc_live.t WHERE id = 1")
        .expect("select");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_int_named("id").expect("id"), 1);
    assert_eq!(rs.get_string_named("name").expect("name"), "a");
    assert!(!rs.next().expect("end"));

    conn.execute("DROP TABLE dbc_live.t").expect("drop table");
    conn.close();
    assert!(conn.is_closed());
}
