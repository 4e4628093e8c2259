//! Redis driver: the key-value family.
//!
//! Shares the registration, URL-dispatch, and close contracts with the
//! relational drivers; the operation surface is direct key/value calls.
//! Credentials may come from the URL (preferred when present) or from the
//! connect arguments.

use std::sync::{Arc, Mutex, MutexGuard};

use dbc_core::{DbError, DbUrl, Driver, DriverConnection, KeyValueConnection};

pub const DEFAULT_PORT: u16 = 6379;

pub struct RedisDriver;

impl RedisDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RedisDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for RedisDriver {
    fn scheme(&self) -> &'static str {
        "redis"
    }

    fn name(&self) -> &'static str {
        "Redis"
    }

    fn connect(
        &self,
        url: &DbUrl,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let user = url.user().unwrap_or(user);
        let password = url.password().unwrap_or(password);

        let database: u32 = match url.database() {
            Some(db) => db.parse().map_err(|_| {
                DbError::InvalidUrl(format!("redis database index must be numeric: {db}"))
            })?,
            None => 0,
        };

        let auth = if password.is_empty() && user.is_empty() {
            String::new()
        } else {
            format!("{user}:{password}@")
        };
        let client_url = format!(
            "redis://{auth}{}:{}/{database}",
            url.host(),
            url.port_or(DEFAULT_PORT)
        );

        let client = redis::Client::open(client_url)
            .map_err(|e| DbError::connection_failure(e.to_string()))?;
        let mut conn = client
            .get_connection()
            .map_err(|e| DbError::connection_failure(e.to_string()))?;

        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| DbError::connection_failure(e.to_string()))?;

        log::info!("connected to redis at {}:{}", url.host(), url.port_or(DEFAULT_PORT));

        Ok(DriverConnection::KeyValue(Arc::new(RedisConnection {
            conn: Mutex::new(Some(conn)),
            url: url.as_str().to_string(),
        })))
    }
}

pub struct RedisConnection {
    conn: Mutex<Option<redis::Connection>>,
    url: String,
}

impl RedisConnection {
    fn lock(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn map_redis_err(e: &redis::RedisError) -> DbError {
    DbError::protocol(e.to_string())
}

impl KeyValueConnection for RedisConnection {
    fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DbError::ConnectionClosed)?;
        redis::cmd("GET")
            .arg(key)
            .query(conn)
            .map_err(|e| map_redis_err(&e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DbError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DbError::ConnectionClosed)?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query::<()>(conn)
            .map_err(|e| map_redis_err(&e))
    }

    fn delete(&self, key: &str) -> Result<bool, DbError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DbError::ConnectionClosed)?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query(conn)
            .map_err(|e| map_redis_err(&e))?;
        Ok(removed > 0)
    }

    fn exists(&self, key: &str) -> Result<bool, DbError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DbError::ConnectionClosed)?;
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query(conn)
            .map_err(|e| map_redis_err(&e))?;
        Ok(found != 0)
    }

    fn expire(&self, key: &str, seconds: u64) -> Result<bool, DbError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(DbError::ConnectionClosed)?;
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query(conn)
            .map_err(|e| map_redis_err(&e))?;
        Ok(applied == 1)
    }

    fn close(&self) {
        let mut guard = self.lock();
        if guard.is_some() {
            log::info!("closing redis connection to {}", self.url);
            *guard = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}
