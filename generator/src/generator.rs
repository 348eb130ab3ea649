use futures::future::join_all;
use seqid_common::{id::IdGenerator, registry::{self, GeneratorRegistry}};
use snafu::{Location, ResultExt, Snafu};
use tracing::info;

use crate::{
    consensus::{self, etcd, ConsensusIdGenerator, EtcdConfig},
    counter::{self, CounterIdGenerator, RedisConfig},
};

/// What [`Generator::next_id_or_sentinel`] returns once retries are exhausted.
pub const RETRIES_EXHAUSTED_SENTINEL: i64 = -1;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("counter generator error"), context(false))]
    Counter {
        source: counter::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("consensus generator error"), context(false))]
    Consensus {
        source: consensus::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("generator registry error"), context(false))]
    Registry {
        source: registry::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid etcd config"))]
    EtcdConfig {
        source: etcd::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    /// The call gave up after its retry budget, the counter may be fine.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(
            self,
            Error::Consensus {
                source: consensus::Error::RetriesExhausted { .. },
                ..
            }
        )
    }
}

/// Identifies one backend endpoint; equal signatures share a generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signature {
    Redis(RedisConfig),
    Etcd(EtcdConfig),
}

#[derive(Clone)]
pub enum Generator {
    Redis(CounterIdGenerator<RedisConfig>),
    Etcd(ConsensusIdGenerator<EtcdConfig>),
}

impl Generator {
    pub fn signature(&self) -> Signature {
        match self {
            Generator::Redis(g) => Signature::Redis(g.backend().clone()),
            Generator::Etcd(g) => Signature::Etcd(g.backend().clone()),
        }
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Generator::Redis(a), Generator::Redis(b)) => a.ptr_eq(b),
            (Generator::Etcd(a), Generator::Etcd(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Like [`IdGenerator::next_id`], but reports exhausted retries as
    /// [`RETRIES_EXHAUSTED_SENTINEL`] instead of an error.
    pub async fn next_id_or_sentinel(&self, namespace: &str) -> Result<i64, Error> {
        or_sentinel(self.next_id(namespace).await)
    }
}

fn or_sentinel(res: Result<i64, Error>) -> Result<i64, Error> {
    match res {
        Err(e) if e.is_retries_exhausted() => Ok(RETRIES_EXHAUSTED_SENTINEL),
        res => res,
    }
}

impl IdGenerator for Generator {
    type Error = Error;

    async fn init(&self) -> Result<(), Error> {
        match self {
            Generator::Redis(g) => g.init().await?,
            Generator::Etcd(g) => g.init().await?,
        }
        Ok(())
    }

    async fn destroy(&self) {
        match self {
            Generator::Redis(g) => g.destroy().await,
            Generator::Etcd(g) => g.destroy().await,
        }
    }

    fn is_initialized(&self) -> bool {
        match self {
            Generator::Redis(g) => g.is_initialized(),
            Generator::Etcd(g) => g.is_initialized(),
        }
    }

    async fn next_id(&self, namespace: &str) -> Result<i64, Error> {
        Ok(match self {
            Generator::Redis(g) => g.next_id(namespace).await?,
            Generator::Etcd(g) => g.next_id(namespace).await?,
        })
    }

    async fn current_id(&self, namespace: &str) -> Result<i64, Error> {
        Ok(match self {
            Generator::Redis(g) => g.current_id(namespace).await?,
            Generator::Etcd(g) => g.current_id(namespace).await?,
        })
    }
}

/// Entry point: hands out one shared, initialized generator per endpoint.
#[derive(Clone, Default)]
pub struct Generators {
    registry: GeneratorRegistry<Signature, Generator>,
}

impl Generators {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(skip(self))]
    pub async fn redis(&self, config: RedisConfig) -> Result<Generator, Error> {
        let signature = Signature::Redis(config.clone());
        Ok(self
            .registry
            .get_or_init(signature, || {
                Generator::Redis(CounterIdGenerator::new(config))
            })
            .await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn etcd(&self, config: EtcdConfig) -> Result<Generator, Error> {
        let signature = Signature::Etcd(config.clone());
        Ok(self
            .registry
            .get_or_init(signature, || {
                let policies = config.policies.clone();
                Generator::Etcd(ConsensusIdGenerator::new(config, policies))
            })
            .await?)
    }

    /// Generator for a `host1:2379,host2:2379[/root]` connection string with
    /// default timeouts and policies.
    pub async fn etcd_from_connection_string(
        &self,
        connection_string: &str,
    ) -> Result<Generator, Error> {
        let config =
            EtcdConfig::from_connection_string(connection_string).context(EtcdConfigSnafu)?;
        self.etcd(config).await
    }

    pub fn get(&self, signature: &Signature) -> Option<Generator> {
        self.registry.get(signature)
    }

    /// Drops the generator for `signature` from the registry and destroys it.
    /// Returns whether there was one.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, signature: &Signature) -> bool {
        match self.registry.remove(signature) {
            Some(generator) => {
                generator.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroys every generator handed out so far.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let generators = self.registry.drain();
        info!(count = generators.len(), "destroying generators");
        join_all(generators.iter().map(|g| g.destroy())).await;
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consensus::{MemoryCoordinator, Policies},
        counter::MemoryCounter,
    };

    #[tokio::test(start_paused = true)]
    async fn sentinel_only_replaces_exhaustion() {
        let coordinator = MemoryCoordinator::new();
        let generator = ConsensusIdGenerator::new(coordinator.clone(), Policies::default());
        generator.init().await.unwrap();
        coordinator.set_failing(true);

        let exhausted: Error = generator.next_id("orders").await.unwrap_err().into();
        assert!(exhausted.is_retries_exhausted());
        assert_eq!(
            or_sentinel(Err(exhausted)).unwrap(),
            RETRIES_EXHAUSTED_SENTINEL
        );
        // reads report exhaustion the same way
        let exhausted: Error = generator.current_id("orders").await.unwrap_err().into();
        assert!(exhausted.is_retries_exhausted());

        let store = MemoryCounter::new();
        let generator = CounterIdGenerator::new(store.clone());
        generator.init().await.unwrap();
        store.set_failing(true);
        let failed: Error = generator.next_id("orders").await.unwrap_err().into();
        assert!(!failed.is_retries_exhausted());
        assert!(or_sentinel(Err(failed)).is_err());

        assert_eq!(or_sentinel(Ok(7)).unwrap(), 7);
    }

    #[test]
    fn signatures_cover_pool_config() {
        let small = RedisConfig::default().with_pool(counter::redis::PoolConfig {
            max_size: 2,
            ..Default::default()
        });
        assert_ne!(
            Signature::Redis(RedisConfig::default()),
            Signature::Redis(small)
        );
        assert_eq!(
            Signature::Redis(RedisConfig::default()),
            Signature::Redis(RedisConfig::new("localhost", 6379))
        );
    }
}
