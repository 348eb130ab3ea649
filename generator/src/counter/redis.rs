use std::{fmt, time::Duration};

use deadpool_redis::{
    redis::AsyncCommands, Config, ConnectionAddr, ConnectionInfo, Pool, RedisConnectionInfo,
    Runtime, Timeouts,
};
use seqid_common::error::BoxedError;

use super::{CounterBackend, CounterConnection, CounterPool};

#[derive(Clone, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub pool: PoolConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            user: None,
            password: None,
            db: 0,
            pool: PoolConfig::default(),
        }
    }
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

// keep passwords out of logs and span fields
impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("pool", &self.pool)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    /// How long to wait for a free connection, unbounded if `None`.
    pub wait_timeout_ms: Option<u64>,
    pub create_timeout_ms: Option<u64>,
    pub recycle_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 32,
            wait_timeout_ms: Some(10_000),
            create_timeout_ms: Some(10_000),
            recycle_timeout_ms: Some(10_000),
        }
    }
}

impl PoolConfig {
    fn to_deadpool(&self) -> deadpool_redis::PoolConfig {
        let mut config = deadpool_redis::PoolConfig::new(self.max_size);
        config.timeouts = Timeouts {
            wait: self.wait_timeout_ms.map(Duration::from_millis),
            create: self.create_timeout_ms.map(Duration::from_millis),
            recycle: self.recycle_timeout_ms.map(Duration::from_millis),
        };
        config
    }
}

impl CounterBackend for RedisConfig {
    type Pool = Pool;

    #[tracing::instrument]
    async fn open(&self) -> Result<Pool, BoxedError> {
        let mut config = Config::from_connection_info(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                username: self.user.clone(),
                password: self.password.clone(),
            },
        });
        config.pool = Some(self.pool.to_deadpool());
        // connections are established lazily on first checkout
        config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(BoxedError::new)
    }
}

impl CounterPool for Pool {
    type Connection = deadpool_redis::Connection;

    async fn acquire(&self) -> Result<deadpool_redis::Connection, BoxedError> {
        self.get().await.map_err(BoxedError::new)
    }

    fn close(&self) {
        Pool::close(self)
    }
}

impl CounterConnection for deadpool_redis::Connection {
    async fn increment_by(&mut self, key: &str, delta: i64) -> Result<i64, BoxedError> {
        self.incr(key, delta).await.map_err(BoxedError::new)
    }

    async fn fetch(&mut self, key: &str) -> Result<Option<Vec<u8>>, BoxedError> {
        self.get(key).await.map_err(BoxedError::new)
    }
}

#[cfg(test)]
mod tests {
    use seqid_common::id::IdGenerator;

    use super::*;
    use crate::counter::CounterIdGenerator;

    #[test]
    fn defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 6379);
        assert!(config.user.is_none());
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: RedisConfig = serde_json::from_str(
            r#"{"host": "cache.internal", "password": "hunter2", "pool": {"max_size": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 6379);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.wait_timeout_ms, Some(10_000));
    }

    #[test]
    fn debug_hides_password() {
        let config = RedisConfig::new("localhost", 6379)
            .with_credentials(Some("svc".to_string()), Some("hunter2".to_string()));
        let printed = format!("{config:?}");
        assert!(printed.contains("svc"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn pool_is_created_lazily() {
        let generator = CounterIdGenerator::new(RedisConfig::new("127.0.0.1", 1));
        generator.init().await.unwrap();
        assert!(generator.is_initialized());
        generator.destroy().await;
        assert!(!generator.is_initialized());
    }

    #[tokio::test]
    #[ignore = "requires a redis server on localhost:6379"]
    async fn live_increment() {
        let generator = CounterIdGenerator::new(RedisConfig::default());
        generator.init().await.unwrap();
        let before = generator.current_id("seqid/test/live").await.unwrap();
        let next = generator.next_id("seqid/test/live").await.unwrap();
        assert_eq!(next, before + 1);
        generator.destroy().await;
    }
}
