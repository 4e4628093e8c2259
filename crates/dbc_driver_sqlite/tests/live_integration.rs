use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dbc_core::{
    DbError, DbUrl, Driver, InputStream, IsolationLevel, PreparedStatement, RelationalConnection,
    ResultSet, ValueType,
};
use dbc_driver_sqlite::SqliteDriver;

fn connect_at(path: &std::path::Path) -> Arc<dyn RelationalConnection> {
    let url_string = format!("cpp_dbc:sqlite://{}", path.display());
    let url = DbUrl::parse(&url_string).expect("sqlite URL should parse");
    SqliteDriver::new()
        .connect(&url, "", "")
        .expect("sqlite connect should succeed")
        .into_relational()
        .expect("sqlite driver is relational")
}

fn connect_sqlite() -> (Arc<dyn RelationalConnection>, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let db_path = temp_dir.path().join("test.sqlite");
    let connection = connect_at(&db_path);

    // Leak the tempdir so it doesn't get cleaned up while the connection
    // (or a second connection to the same file) is alive. The OS cleans it
    // up when the process exits.
    std::mem::forget(temp_dir);

    (connection, db_path)
}

// ---------------------------------------------------------------------------
// Basic round trips
// ---------------------------------------------------------------------------

#[test]
fn create_insert_and_read_back_three_rows() {
    let (conn, _) = connect_sqlite();

    conn.execute_update("CREATE TABLE t(id INTEGER PRIMARY KEY, name VARCHAR(32))")
        .expect("create table");

    let insert = conn
        .prepare_statement("INSERT INTO t(id, name) VALUES (?, ?)")
        .expect("prepare insert");
    assert_eq!(insert.parameter_count(), 2);

    for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
        insert.set_int(1, id).expect("bind id");
        insert.set_string(2, name).expect("bind name");
        assert_eq!(insert.execute_update().expect("insert row"), 1);
    }

    let mut rs = conn
        .execute_query("SELECT id, name FROM t ORDER BY id")
        .expect("select");
    assert!(rs.is_before_first());

    let mut rows = Vec::new();
    while rs.next().expect("next") {
        rows.push((
            rs.get_int_named("id").expect("id"),
            rs.get_string_named("name").expect("name"),
        ));
        assert_eq!(rs.row(), rows.len() as u64);
    }
    assert_eq!(
        rows,
        vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]
    );

    assert!(!rs.next().expect("next past end"));
    assert!(rs.is_after_last());
    assert_eq!(rs.row(), 0);
}

#[test]
fn null_columns_distinguish_from_zero() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE n(id INTEGER, name TEXT)")
        .expect("create");

    let insert = conn
        .prepare_statement("INSERT INTO n(id, name) VALUES (?, ?)")
        .expect("prepare");
    insert.set_int(1, 0).expect("bind");
    insert.set_null(2, ValueType::Varchar).expect("bind null");
    insert.execute_update().expect("insert");

    let mut rs = conn.execute_query("SELECT id, name FROM n").expect("select");
    assert!(rs.next().expect("next"));
    assert!(!rs.is_null(1).expect("id not null"));
    assert_eq!(rs.get_int(1).expect("id"), 0);
    assert!(rs.is_null(2).expect("name null"));
    assert_eq!(rs.get_string(2).expect("name"), "");
}

#[test]
fn blob_round_trip() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE b(id INTEGER, payload BLOB)")
        .expect("create");

    let payload: Vec<u8> = (0u8..=255).collect();
    let insert = conn
        .prepare_statement("INSERT INTO b(id, payload) VALUES (?, ?)")
        .expect("prepare");
    insert.set_int(1, 1).expect("bind id");
    insert.set_bytes(2, &payload).expect("bind payload");
    insert.execute_update().expect("insert");

    let mut rs = conn.execute_query("SELECT payload FROM b").expect("select");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_bytes(1).expect("payload").expect("not null"), payload);

    let mut stream = rs
        .get_binary_stream(1)
        .expect("stream")
        .expect("not null");
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).expect("read"), 16);
    assert_eq!(&buf[..4], &[0, 1, 2, 3]);
}

#[test]
fn batch_accumulation_executes_in_order() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE batch_t(id INTEGER)").expect("create");

    let insert = conn
        .prepare_statement("INSERT INTO batch_t(id) VALUES (?)")
        .expect("prepare");
    for id in 1..=4 {
        insert.set_int(1, id).expect("bind");
        insert.add_batch().expect("add batch");
    }
    let counts = insert.execute_batch().expect("execute batch");
    assert_eq!(counts, vec![1, 1, 1, 1]);

    let mut rs = conn
        .execute_query("SELECT COUNT(*) FROM batch_t")
        .expect("count");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_long(1).expect("count"), 4);
}

// ---------------------------------------------------------------------------
// Statement and form mismatches
// ---------------------------------------------------------------------------

#[test]
fn unbound_parameter_is_rejected_before_send() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE p(id INTEGER, name TEXT)")
        .expect("create");

    let insert = conn
        .prepare_statement("INSERT INTO p(id, name) VALUES (?, ?)")
        .expect("prepare");
    insert.set_int(1, 1).expect("bind only the first");

    let err = insert.execute_update().expect_err("must reject");
    assert_eq!(err.code(), "0x0202");
}

#[test]
fn bind_index_out_of_range_is_a_parameter_error() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE q(id INTEGER)").expect("create");

    let insert = conn
        .prepare_statement("INSERT INTO q(id) VALUES (?)")
        .expect("prepare");
    assert!(matches!(insert.set_int(2, 5), Err(DbError::Parameter(_))));
    assert!(matches!(insert.set_int(0, 5), Err(DbError::Parameter(_))));
}

#[test]
fn query_and_update_forms_are_enforced() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE f(id INTEGER)").expect("create");

    assert!(matches!(
        conn.execute_query("INSERT INTO f(id) VALUES (1)"),
        Err(DbError::Sql(_))
    ));

    let select = conn.prepare_statement("SELECT id FROM f").expect("prepare");
    assert!(matches!(select.execute_update(), Err(DbError::Sql(_))));
    assert!(select.execute().expect("execute"));

    let insert = conn
        .prepare_statement("INSERT INTO f(id) VALUES (42)")
        .expect("prepare");
    assert!(!insert.execute().expect("execute"));
}

#[test]
fn reexecution_invalidates_the_previous_result_set() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE r(id INTEGER)").expect("create");
    conn.execute_update("INSERT INTO r(id) VALUES (1)").expect("insert");

    let select = conn.prepare_statement("SELECT id FROM r").expect("prepare");
    let mut first = select.execute_query().expect("first execute");
    assert!(first.next().expect("next"));

    let mut second = select.execute_query().expect("second execute");
    assert!(matches!(first.next(), Err(DbError::ResultExhausted(_))));
    assert!(second.next().expect("second result set works"));
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn committed_transaction_is_visible_to_a_second_connection() {
    let (conn, path) = connect_sqlite();
    conn.execute_update("CREATE TABLE txc(id INTEGER)").expect("create");

    conn.set_auto_commit(false).expect("autocommit off");
    assert!(conn.begin_transaction().expect("begin"));
    assert!(conn.transaction_active());
    conn.execute_update("INSERT INTO txc(id) VALUES (1)").expect("insert");
    conn.commit().expect("commit");
    assert!(!conn.transaction_active());

    let other = connect_at(&path);
    let mut rs = other
        .execute_query("SELECT COUNT(*) FROM txc")
        .expect("count");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_long(1).expect("count"), 1);
}

#[test]
fn rolled_back_transaction_leaves_no_rows() {
    let (conn, path) = connect_sqlite();
    conn.execute_update("CREATE TABLE txr(id INTEGER)").expect("create");

    conn.set_auto_commit(false).expect("autocommit off");
    conn.begin_transaction().expect("begin");
    conn.execute_update("INSERT INTO txr(id) VALUES (1)").expect("insert");
    conn.rollback().expect("rollback");

    let other = connect_at(&path);
    let mut rs = other
        .execute_query("SELECT COUNT(*) FROM txr")
        .expect("count");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_long(1).expect("count"), 0);
}

#[test]
fn transaction_state_machine_edges() {
    let (conn, _) = connect_sqlite();

    // Autocommit on: no explicit transactions.
    assert!(matches!(conn.begin_transaction(), Err(DbError::Transaction(_))));
    assert!(matches!(conn.commit(), Err(DbError::Transaction(_))));
    assert!(matches!(conn.rollback(), Err(DbError::Transaction(_))));

    conn.set_auto_commit(false).expect("autocommit off");
    assert!(!conn.auto_commit());
    assert!(conn.begin_transaction().expect("begin"));
    // A second begin is not a new transaction.
    assert!(!conn.begin_transaction().expect("begin again"));

    // Turning autocommit back on commits implicitly.
    conn.set_auto_commit(true).expect("autocommit on");
    assert!(!conn.transaction_active());
    assert!(conn.auto_commit());
}

#[test]
fn isolation_levels_report_and_reject() {
    let (conn, _) = connect_sqlite();
    assert_eq!(conn.transaction_isolation(), IsolationLevel::Serializable);

    conn.set_transaction_isolation(IsolationLevel::ReadUncommitted)
        .expect("read uncommitted is supported");
    assert_eq!(conn.transaction_isolation(), IsolationLevel::ReadUncommitted);

    assert!(matches!(
        conn.set_transaction_isolation(IsolationLevel::RepeatableRead),
        Err(DbError::Unsupported(_))
    ));

    conn.set_transaction_isolation(IsolationLevel::Serializable)
        .expect("back to serializable");
    conn.set_auto_commit(false).expect("autocommit off");
    conn.begin_transaction().expect("begin");
    assert!(matches!(
        conn.set_transaction_isolation(IsolationLevel::Serializable),
        Err(DbError::Transaction(_))
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle and teardown
// ---------------------------------------------------------------------------

#[test]
fn close_is_idempotent_and_operations_fail_afterwards() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE c(id INTEGER)").expect("create");

    let stmt = conn
        .prepare_statement("INSERT INTO c(id) VALUES (?)")
        .expect("prepare");

    conn.close();
    conn.close();
    assert!(conn.is_closed());

    assert!(matches!(
        conn.execute_update("INSERT INTO c(id) VALUES (1)"),
        Err(DbError::ConnectionClosed)
    ));
    assert!(stmt.is_closed());
    assert!(matches!(stmt.set_int(1, 1), Err(DbError::ConnectionClosed)));
    assert!(matches!(stmt.execute_update(), Err(DbError::ConnectionClosed)));
}

#[test]
fn close_from_another_thread_fails_the_iterating_thread_cleanly() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE iter_t(id INTEGER)").expect("create");
    for i in 0..10 {
        conn.execute_update(&format!("INSERT INTO iter_t(id) VALUES ({i})"))
            .expect("insert");
    }

    let mut rs = conn
        .execute_query("SELECT id FROM iter_t ORDER BY id")
        .expect("select");
    assert!(rs.next().expect("first row"));

    let closer = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            conn.close();
        })
    };
    closer.join().expect("closer thread");

    assert!(conn.is_closed());
    match rs.next() {
        Err(DbError::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
    match rs.get_int(1) {
        Err(DbError::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[test]
fn concurrent_queries_and_teardown_do_not_corrupt() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE w(id INTEGER)").expect("create");
    conn.execute_update("INSERT INTO w(id) VALUES (1)").expect("insert");

    let worker = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            // Hammer the connection until it goes away underneath us.
            loop {
                match conn.execute_query("SELECT id FROM w") {
                    Ok(mut rs) => {
                        while rs.next().unwrap_or(false) {
                            let _ = rs.get_int(1);
                        }
                    }
                    Err(DbError::ConnectionClosed) => break,
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
        })
    };

    thread::sleep(Duration::from_millis(50));
    conn.close();
    worker.join().expect("worker thread");
}

#[test]
fn return_to_pool_resets_state_and_rolls_back() {
    let (conn, _) = connect_sqlite();
    conn.execute_update("CREATE TABLE pool_t(id INTEGER)").expect("create");

    conn.mark_pooled(true);
    assert!(conn.is_pooled());

    conn.set_auto_commit(false).expect("autocommit off");
    conn.begin_transaction().expect("begin");
    conn.execute_update("INSERT INTO pool_t(id) VALUES (1)").expect("insert");

    let stmt = conn
        .prepare_statement("SELECT id FROM pool_t")
        .expect("prepare");

    conn.return_to_pool().expect("return to pool");
    // Safe to call repeatedly.
    conn.return_to_pool().expect("second return is a no-op");

    assert!(!conn.transaction_active());
    assert!(conn.auto_commit());
    assert_eq!(conn.transaction_isolation(), IsolationLevel::Serializable);
    assert!(stmt.is_closed());

    let mut rs = conn
        .execute_query("SELECT COUNT(*) FROM pool_t")
        .expect("count");
    assert!(rs.next().expect("next"));
    assert_eq!(rs.get_long(1).expect("count"), 0);
}

#[test]
fn url_round_trips_through_the_connection() {
    let (conn, path) = connect_sqlite();
    let url = conn.url();
    assert!(url.starts_with("cpp_dbc:sqlite://"));
    assert!(url.contains(&path.display().to_string()));
}
