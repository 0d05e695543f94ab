use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, Connection, RedisError, Script};

use super::client::{AsyncRemoteClient, RemoteClient};
use crate::RemoteError;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_error(err: RedisError, timeout: Duration) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(timeout)
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        RemoteError::Unavailable(err.to_string())
    } else {
        RemoteError::Other(Box::new(err))
    }
}

/// Blocking Redis client.
///
/// Keeps one connection, opened lazily and reopened after a failure. Every
/// command is bounded by `timeout` through the socket read/write timeouts.
pub struct RedisRemote {
    client: Client,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RedisRemote {
    pub fn open(url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::open(url).map_err(|err| map_error(err, timeout))?;
        Ok(Self {
            client,
            timeout,
            conn: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<Connection, RedisError> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }

    fn run<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, RedisError>,
    ) -> Result<T, RemoteError> {
        let mut slot = self.conn.lock();
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect().map_err(|err| map_error(err, self.timeout))?,
        };
        match op(&mut conn) {
            Ok(value) => {
                *slot = Some(conn);
                Ok(value)
            }
            // The connection is dropped; the next call reconnects
            Err(err) => Err(map_error(err, self.timeout)),
        }
    }
}

impl RemoteClient for RedisRemote {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.run(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        self.run(|conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.query(conn)
        })
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, RemoteError> {
        self.run(|conn| {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)?;
            Ok(reply.is_some())
        })
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.run(|conn| {
            let _removed: i64 = redis::cmd("DEL").arg(key).query(conn)?;
            Ok(())
        })
    }

    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        self.run(|conn| redis::cmd("EXISTS").arg(key).query(conn))
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError> {
        self.run(|conn| {
            let removed: i64 = Script::new(DELETE_IF_EQUALS)
                .key(key)
                .arg(expected)
                .invoke(conn)?;
            Ok(removed == 1)
        })
    }

    fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        self.run(|conn| {
            let extended: i64 = Script::new(EXPIRE_IF_EQUALS)
                .key(key)
                .arg(expected)
                .arg(millis(ttl))
                .invoke(conn)?;
            Ok(extended == 1)
        })
    }
}

/// Async Redis client on a reconnecting [`ConnectionManager`].
#[derive(Clone)]
pub struct AsyncRedisRemote {
    conn: ConnectionManager,
    timeout: Duration,
}

impl AsyncRedisRemote {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::open(url).map_err(|err| map_error(err, timeout))?;
        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn.map_err(|err| map_error(err, timeout))?,
            Err(_) => return Err(RemoteError::Timeout(timeout)),
        };
        Ok(Self { conn, timeout })
    }

    pub fn from_manager(conn: ConnectionManager, timeout: Duration) -> Self {
        Self { conn, timeout }
    }
}

#[async_trait]
impl AsyncRemoteClient for AsyncRedisRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let found: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(found)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(DELETE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(removed == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool, RemoteError> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(EXPIRE_IF_EQUALS)
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| map_error(err, self.timeout))?;
        Ok(extended == 1)
    }
}
