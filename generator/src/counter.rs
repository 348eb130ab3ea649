//! Serial ids from a remote atomic counter (Redis `INCRBY`/`GET`).
//!
//! Fast and best-effort: every id is one server-side increment, there is no
//! client-side locking.

pub mod mem;
pub mod redis;

use std::{future::Future, sync::Arc};

use parking_lot::RwLock;
use seqid_common::{
    error::BoxedError,
    id::IdGenerator,
    namespace::{self, Namespace},
};
use snafu::{ensure, Location, OptionExt, ResultExt, Snafu};
use tracing::warn;

pub use self::{mem::MemoryCounter, redis::RedisConfig};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid namespace"))]
    InvalidNamespace {
        source: namespace::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("counter generator is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("counter generator is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("open counter connection pool error"))]
    Open {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("counter operation on {namespace} failed"))]
    OperationFailed {
        namespace: String,
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Endpoint configuration able to open a connection pool.
pub trait CounterBackend: Clone + Send + Sync + 'static {
    type Pool: CounterPool;

    fn open(&self) -> impl Future<Output = Result<Self::Pool, BoxedError>> + Send;
}

pub trait CounterPool: Clone + Send + Sync + 'static {
    /// Checked out connection, returned to the pool when dropped.
    type Connection: CounterConnection;

    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, BoxedError>> + Send;

    fn close(&self);
}

pub trait CounterConnection: Send {
    /// Atomically adds `delta` to `key` on the server and returns the new value.
    fn increment_by(
        &mut self,
        key: &str,
        delta: i64,
    ) -> impl Future<Output = Result<i64, BoxedError>> + Send;

    /// Raw stored value of `key`, `None` if it does not exist.
    fn fetch(&mut self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, BoxedError>> + Send;
}

struct Inner<B: CounterBackend> {
    backend: B,
    pool: RwLock<Option<B::Pool>>,
}

#[derive(Clone)]
pub struct CounterIdGenerator<B: CounterBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: CounterBackend> CounterIdGenerator<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                pool: RwLock::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn pool(&self) -> Result<B::Pool, Error> {
        self.inner.pool.read().clone().context(NotInitializedSnafu)
    }
}

impl<B: CounterBackend> IdGenerator for CounterIdGenerator<B> {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn init(&self) -> Result<(), Error> {
        ensure!(!self.is_initialized(), AlreadyInitializedSnafu);
        let pool = self.inner.backend.open().await.context(OpenSnafu)?;

        let mut slot = self.inner.pool.write();
        if slot.is_some() {
            // lost a race against a concurrent init
            pool.close();
            return AlreadyInitializedSnafu.fail();
        }
        *slot = Some(pool);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn destroy(&self) {
        let pool = self.inner.pool.write().take();
        match pool {
            Some(pool) => pool.close(),
            None => warn!("destroy called on an uninitialized counter generator"),
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.pool.read().is_some()
    }

    #[tracing::instrument(skip(self))]
    async fn next_id(&self, namespace: &str) -> Result<i64, Error> {
        let namespace = Namespace::parse(namespace).context(InvalidNamespaceSnafu)?;
        let pool = self.pool()?;
        let mut conn = pool
            .acquire()
            .await
            .context(OperationFailedSnafu { namespace: namespace.as_str() })?;
        conn.increment_by(namespace.as_str(), 1)
            .await
            .context(OperationFailedSnafu { namespace: namespace.as_str() })
    }

    /// Missing or non-numeric values read as `0`.
    #[tracing::instrument(skip(self))]
    async fn current_id(&self, namespace: &str) -> Result<i64, Error> {
        let namespace = Namespace::parse(namespace).context(InvalidNamespaceSnafu)?;
        let pool = self.pool()?;
        let mut conn = pool
            .acquire()
            .await
            .context(OperationFailedSnafu { namespace: namespace.as_str() })?;
        let raw = conn
            .fetch(namespace.as_str())
            .await
            .context(OperationFailedSnafu { namespace: namespace.as_str() })?;
        Ok(raw.as_deref().and_then(parse_counter).unwrap_or(0))
    }
}

fn parse_counter(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;

    async fn generator() -> (CounterIdGenerator<MemoryCounter>, MemoryCounter) {
        let store = MemoryCounter::new();
        let generator = CounterIdGenerator::new(store.clone());
        generator.init().await.unwrap();
        (generator, store)
    }

    #[tokio::test]
    async fn sequential_ids_start_at_one() {
        let (generator, _) = generator().await;
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(generator.next_id("orders").await.unwrap());
        }
        assert_eq!(ids, (1..=10).collect::<Vec<i64>>());
        assert_eq!(generator.current_id("orders").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let (generator, _) = generator().await;
        generator.next_id("a").await.unwrap();
        generator.next_id("a").await.unwrap();
        assert_eq!(generator.next_id("b").await.unwrap(), 1);
        // normalized namespaces share a key
        assert_eq!(generator.next_id("/a/").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn current_id_defaults_to_zero() {
        let (generator, store) = generator().await;
        assert_eq!(generator.current_id("fresh").await.unwrap(), 0);

        store.set_raw("garbage", b"not a number".to_vec());
        assert_eq!(generator.current_id("garbage").await.unwrap(), 0);

        store.set_raw("binary", vec![0xff, 0xfe]);
        assert_eq!(generator.current_id("binary").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_failures_are_operation_failed() {
        let (generator, store) = generator().await;
        store.set_failing(true);

        let err = generator.next_id("orders").await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));
        let err = generator.current_id("orders").await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));
        // connections are returned even on the failure path
        assert_eq!(store.checked_out(), 0);

        store.set_failing(false);
        assert_eq!(generator.next_id("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_namespace() {
        let (generator, _) = generator().await;
        assert!(matches!(
            generator.next_id("").await,
            Err(Error::InvalidNamespace { .. })
        ));
        assert!(matches!(
            generator.current_id("a//b").await,
            Err(Error::InvalidNamespace { .. })
        ));
    }

    #[tokio::test]
    async fn lifecycle() {
        let store = MemoryCounter::new();
        let generator = CounterIdGenerator::new(store.clone());
        assert!(matches!(
            generator.next_id("a").await,
            Err(Error::NotInitialized { .. })
        ));

        generator.init().await.unwrap();
        assert!(matches!(
            generator.init().await,
            Err(Error::AlreadyInitialized { .. })
        ));

        generator.destroy().await;
        generator.destroy().await;
        assert_eq!(store.close_count(), 1);
        assert!(!generator.is_initialized());
        assert!(matches!(
            generator.current_id("a").await,
            Err(Error::NotInitialized { .. })
        ));

        // a destroyed generator can be initialized again
        generator.init().await.unwrap();
        assert!(generator.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ids_are_unique() {
        let (generator, _) = generator().await;
        let generator = Arc::new(generator);
        let tasks = (0..8).map(|_| {
            let generator = generator.clone();
            tokio::spawn(async move {
                let mut ids = Vec::with_capacity(50);
                for _ in 0..50 {
                    ids.push(generator.next_id("shared").await.unwrap());
                }
                ids
            })
        });
        let mut ids: Vec<i64> = join_all(tasks)
            .await
            .into_iter()
            .flat_map(|joined| joined.unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(ids, (1..=400).collect::<Vec<i64>>());
    }
}
