//! Serial ids from a consensus service (etcd): revision guarded
//! compare-and-set, promoted to a distributed lock under contention.

pub mod atomic;
pub mod etcd;
pub mod mem;

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use seqid_common::{
    error::BoxedError,
    id::IdGenerator,
    namespace::{self, Namespace},
};
use snafu::{ensure, Location, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use self::atomic::{DistributedAtomicLong, PromotedToLock, RetryPolicy};
pub use self::{etcd::EtcdConfig, mem::MemoryCoordinator};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid namespace"))]
    InvalidNamespace {
        source: namespace::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("consensus generator is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("consensus generator is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("connect to coordination service error"))]
    Connect {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("counter at {path} error"))]
    Counter {
        path: String,
        source: atomic::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("retries exhausted on counter at {path}"))]
    RetriesExhausted {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A value together with the revision it was last modified at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: i64,
}

/// A held distributed lock. Must be passed back to [`Coordinator::unlock`].
#[derive(Debug)]
pub struct LockHandle {
    pub key: Vec<u8>,
    pub lease_id: Option<i64>,
}

/// Connection settings able to produce a started coordination client.
pub trait ConsensusBackend: Clone + Send + Sync + 'static {
    type Client: Coordinator;

    fn connect(&self) -> impl Future<Output = Result<Self::Client, BoxedError>> + Send;

    /// Prefix for every counter and lock path, empty or `/`-prefixed.
    fn root(&self) -> &str {
        ""
    }
}

pub trait Coordinator: Clone + Send + Sync + 'static {
    fn get(&self, path: &str)
        -> impl Future<Output = Result<Option<Versioned>, BoxedError>> + Send;

    /// Writes `value` if `path` is still at `expected_revision`, or is still
    /// absent when `expected_revision` is `None`. Returns whether it was written.
    fn compare_and_set(
        &self,
        path: &str,
        expected_revision: Option<i64>,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<bool, BoxedError>> + Send;

    /// Acquires the lock at `path`; `Ok(None)` if `timeout` elapsed first.
    fn lock(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Option<LockHandle>, BoxedError>> + Send;

    fn unlock(&self, handle: LockHandle) -> impl Future<Output = Result<(), BoxedError>> + Send;

    fn close(&self);
}

/// Retry and lock settings used by every call of a [`ConsensusIdGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(default)]
pub struct Policies {
    pub increment: RetryPolicy,
    pub read: RetryPolicy,
    pub lock_timeout_ms: Option<u64>,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            increment: RetryPolicy::new(1, 2000),
            read: RetryPolicy::new(3, 1000),
            lock_timeout_ms: Some(3000),
        }
    }
}

struct Inner<B: ConsensusBackend> {
    backend: B,
    policies: Policies,
    client: RwLock<Option<B::Client>>,
}

#[derive(Clone)]
pub struct ConsensusIdGenerator<B: ConsensusBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: ConsensusBackend> ConsensusIdGenerator<B> {
    pub fn new(backend: B, policies: Policies) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                policies,
                client: RwLock::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn client(&self) -> Result<B::Client, Error> {
        self.inner.client.read().clone().context(NotInitializedSnafu)
    }

    fn promoted(&self, lock_path: String, retry_policy: RetryPolicy) -> PromotedToLock {
        PromotedToLock {
            lock_path,
            retry_policy,
            timeout: self.inner.policies.lock_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl<B: ConsensusBackend> IdGenerator for ConsensusIdGenerator<B> {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn init(&self) -> Result<(), Error> {
        ensure!(!self.is_initialized(), AlreadyInitializedSnafu);
        let client = self.inner.backend.connect().await.context(ConnectSnafu)?;

        let mut slot = self.inner.client.write();
        if slot.is_some() {
            client.close();
            return AlreadyInitializedSnafu.fail();
        }
        *slot = Some(client);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn destroy(&self) {
        let client = self.inner.client.write().take();
        match client {
            Some(client) => client.close(),
            None => warn!("destroy called on an uninitialized consensus generator"),
        }
    }

    fn is_initialized(&self) -> bool {
        self.inner.client.read().is_some()
    }

    #[tracing::instrument(skip(self))]
    async fn next_id(&self, namespace: &str) -> Result<i64, Error> {
        let namespace = Namespace::parse(namespace).context(InvalidNamespaceSnafu)?;
        let client = self.client()?;
        let paths = namespace.paths(self.inner.backend.root());

        let policy = self.inner.policies.increment;
        let counter = DistributedAtomicLong::new(
            &client,
            &paths.counter,
            policy,
            Some(self.promoted(paths.lock.clone(), policy)),
        );
        let value = counter.increment().await.context(CounterSnafu {
            path: paths.counter.as_str(),
        })?;
        debug!(path = paths.counter.as_str(), stats = ?value.stats, "increment counter");

        ensure!(
            value.succeeded,
            RetriesExhaustedSnafu {
                path: paths.counter
            }
        );
        Ok(value.post_value)
    }

    #[tracing::instrument(skip(self))]
    async fn current_id(&self, namespace: &str) -> Result<i64, Error> {
        let namespace = Namespace::parse(namespace).context(InvalidNamespaceSnafu)?;
        let client = self.client()?;
        let paths = namespace.paths(self.inner.backend.root());

        let policy = self.inner.policies.read;
        let counter = DistributedAtomicLong::new(
            &client,
            &paths.counter,
            policy,
            Some(self.promoted(paths.lock.clone(), policy)),
        );
        let value = counter.get().await.context(CounterSnafu {
            path: paths.counter.as_str(),
        })?;
        debug!(path = paths.counter.as_str(), stats = ?value.stats, "read counter");

        ensure!(
            value.succeeded,
            RetriesExhaustedSnafu {
                path: paths.counter
            }
        );
        Ok(value.post_value)
    }
}
