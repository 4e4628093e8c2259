//! Tests against a live Redis server.
//!
//! Set `DBC_REDIS_URL` (e.g. `cpp_dbc:redis://127.0.0.1:6379/0`), then run
//! with `--ignored`.

use std::sync::Arc;

use dbc_core::{DbUrl, Driver, KeyValueConnection};
use dbc_driver_redis::RedisDriver;

fn connect_redis() -> Arc<dyn KeyValueConnection> {
    let url = std::env::var("DBC_REDIS_URL").expect("DBC_REDIS_URL must be set");
    let url = DbUrl::parse(&url).expect("URL should parse");
    RedisDriver::new()
        .connect(&url, "", "")
        .expect("connect should succeed")
        .into_key_value()
        .expect("redis driver is key-value")
}

#[test]
#[ignore = "requires a running Redis server"]
fn set_get_exists_delete_round_trip() {
    let conn = connect_redis();

    conn.set("dbc:test:key", "value-1").expect("set");
    assert!(conn.exists("dbc:test:key").expect("exists"));
    assert_eq!(
        conn.get("dbc:test:key").expect("get").as_deref(),
        Some("value-1")
    );

    assert!(conn.delete("dbc:test:key").expect("delete"));
    assert!(!conn.delete("dbc:test:key").expect("second delete"));
    assert!(conn.get("dbc:test:key").expect("get after delete").is_none());
}

#[test]
#[ignore = "requires a running Redis server"]
fn expire_applies_only_to_existing_keys() {
    let conn = connect_redis();

    conn.set("dbc:test:ttl", "v").expect("set");
    assert!(conn.expire("dbc:test:ttl", 120).expect("expire"));
    assert!(!conn.expire("dbc:test:missing", 120).expect("expire missing"));

    conn.delete("dbc:test:ttl").expect("cleanup");
    conn.close();
    assert!(conn.is_closed());
    assert!(conn.get("dbc:test:ttl").is_err());
}
