use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use parking_lot::Mutex;
use snafu::{IntoError, Location, Snafu};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{error::BoxedError, id::IdGenerator, utils::defer::defer};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("construct generator for {signature} error"))]
    Construction {
        signature: String,
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("construction of generator for {signature} was aborted"))]
    ConstructionAborted {
        signature: String,
        #[snafu(implicit)]
        location: Location,
    },
}

enum Slot<G> {
    Ready(G),
    Initializing(Vec<oneshot::Sender<G>>),
}

/// Maps a connection signature to exactly one live generator.
///
/// Construction is single-flight: concurrent lookups of a missing signature
/// run `make` and `init` once, the other callers wait for that result.
/// Failed constructions are never cached.
pub struct GeneratorRegistry<K, G> {
    slots: Arc<Mutex<HashMap<K, Slot<G>>>>,
}

impl<K, G> Clone for GeneratorRegistry<K, G> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K, G> Default for GeneratorRegistry<K, G> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, G> GeneratorRegistry<K, G>
where
    K: Hash + Eq + Clone + Debug + Send + 'static,
    G: IdGenerator,
{
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(skip(self, make))]
    pub async fn get_or_init<F>(&self, signature: K, make: F) -> Result<G, Error>
    where
        F: FnOnce() -> G,
    {
        // None means this caller has to construct the generator
        let waiter = {
            let mut slots = self.slots.lock();
            match slots.remove(&signature) {
                Some(Slot::Ready(generator)) => {
                    if generator.is_initialized() {
                        slots.insert(signature, Slot::Ready(generator.clone()));
                        return Ok(generator);
                    }
                    debug!("cached generator was destroyed, constructing a new one");
                    slots.insert(signature.clone(), Slot::Initializing(vec![]));
                    None
                }
                Some(Slot::Initializing(mut waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    slots.insert(signature.clone(), Slot::Initializing(waiters));
                    Some(rx)
                }
                None => {
                    slots.insert(signature.clone(), Slot::Initializing(vec![]));
                    None
                }
            }
        };
        match waiter {
            Some(rx) => match rx.await {
                Ok(generator) => Ok(generator),
                Err(_) => ConstructionAbortedSnafu {
                    signature: format!("{signature:?}"),
                }
                .fail(),
            },
            None => self.construct(signature, make).await,
        }
    }

    async fn construct<F>(&self, signature: K, make: F) -> Result<G, Error>
    where
        F: FnOnce() -> G,
    {
        // dropping the pending slot drops its senders, which aborts the waiters
        let abandoned = {
            let slots = self.slots.clone();
            let signature = signature.clone();
            defer(move || {
                slots.lock().remove(&signature);
            })
        };

        let generator = make();
        let res = generator.init().await;
        abandoned.cancel();

        let mut slots = self.slots.lock();
        let waiters = match slots.remove(&signature) {
            Some(Slot::Initializing(waiters)) => waiters,
            _ => Vec::new(),
        };
        match res {
            Ok(()) => {
                for waiter in waiters {
                    waiter.send(generator.clone()).ok();
                }
                slots.insert(signature, Slot::Ready(generator.clone()));
                Ok(generator)
            }
            Err(e) => Err(ConstructionSnafu {
                signature: format!("{signature:?}"),
            }
            .into_error(BoxedError::new(e))),
        }
    }

    /// The cached generator for `signature`, if it is constructed and live.
    pub fn get(&self, signature: &K) -> Option<G> {
        match self.slots.lock().get(signature) {
            Some(Slot::Ready(generator)) if generator.is_initialized() => Some(generator.clone()),
            _ => None,
        }
    }

    /// Takes a constructed generator out of the registry. Pending
    /// constructions are left alone.
    pub fn remove(&self, signature: &K) -> Option<G> {
        let mut slots = self.slots.lock();
        match slots.remove(signature)? {
            Slot::Ready(generator) => Some(generator),
            pending @ Slot::Initializing(_) => {
                slots.insert(signature.clone(), pending);
                None
            }
        }
    }

    /// Takes every constructed generator out of the registry.
    pub fn drain(&self) -> Vec<G> {
        let mut slots = self.slots.lock();
        let ready: Vec<K> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(signature, _)| signature.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|signature| match slots.remove(&signature) {
                Some(Slot::Ready(generator)) => Some(generator),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures::future::join_all;

    use super::*;

    #[derive(Debug)]
    struct Refused;

    impl std::fmt::Display for Refused {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("init refused")
        }
    }

    impl std::error::Error for Refused {}

    #[derive(Debug)]
    struct Inner {
        live: AtomicBool,
        fail: bool,
    }

    #[derive(Clone, Debug)]
    struct Fake(Arc<Inner>);

    impl Fake {
        fn new(fail: bool) -> Self {
            Self(Arc::new(Inner {
                live: AtomicBool::new(false),
                fail,
            }))
        }
    }

    impl IdGenerator for Fake {
        type Error = Refused;

        async fn init(&self) -> Result<(), Refused> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.0.fail {
                return Err(Refused);
            }
            self.0.live.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self) {
            self.0.live.store(false, Ordering::SeqCst);
        }

        fn is_initialized(&self) -> bool {
            self.0.live.load(Ordering::SeqCst)
        }

        async fn next_id(&self, _namespace: &str) -> Result<i64, Refused> {
            Ok(1)
        }

        async fn current_id(&self, _namespace: &str) -> Result<i64, Refused> {
            Ok(0)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_construct_once() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let made = Arc::new(AtomicUsize::new(0));

        let lookups = (0..16).map(|_| {
            let registry = registry.clone();
            let made = made.clone();
            tokio::spawn(async move {
                registry
                    .get_or_init("localhost:6379".to_string(), || {
                        made.fetch_add(1, Ordering::SeqCst);
                        Fake::new(false)
                    })
                    .await
            })
        });
        let generators: Vec<Fake> = join_all(lookups)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert!(generators.iter().all(|g| Arc::ptr_eq(&g.0, &generators[0].0)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn distinct_signatures_get_distinct_generators() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let a = registry
            .get_or_init("a".to_string(), || Fake::new(false))
            .await
            .unwrap();
        let b = registry
            .get_or_init("b".to_string(), || Fake::new(false))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let err = registry
            .get_or_init("a".to_string(), || Fake::new(true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Construction { .. }));
        assert!(registry.is_empty());

        let generator = registry
            .get_or_init("a".to_string(), || Fake::new(false))
            .await
            .unwrap();
        assert!(generator.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_see_aborted_construction() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let leader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .get_or_init("a".to_string(), || Fake::new(true))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let follower = registry
            .get_or_init("a".to_string(), || Fake::new(false))
            .await;

        assert!(matches!(
            leader.await.unwrap(),
            Err(Error::Construction { .. })
        ));
        assert!(matches!(
            follower,
            Err(Error::ConstructionAborted { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_construction_releases_slot() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let pending = registry.get_or_init("a".to_string(), || Fake::new(false));
        // poll once so the slot is marked as initializing, then give up on it
        assert!(
            tokio::time::timeout(Duration::from_millis(1), pending)
                .await
                .is_err()
        );

        let generator = tokio::time::timeout(
            Duration::from_secs(1),
            registry.get_or_init("a".to_string(), || Fake::new(false)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(generator.is_initialized());
    }

    #[tokio::test]
    async fn destroyed_generator_is_replaced() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        let first = registry
            .get_or_init("a".to_string(), || Fake::new(false))
            .await
            .unwrap();
        first.destroy().await;
        assert!(registry.get(&"a".to_string()).is_none());

        let second = registry
            .get_or_init("a".to_string(), || Fake::new(false))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first.0, &second.0));
        assert!(second.is_initialized());
    }

    #[tokio::test]
    async fn remove_and_drain() {
        let registry = GeneratorRegistry::<String, Fake>::new();
        for key in ["a", "b", "c"] {
            registry
                .get_or_init(key.to_string(), || Fake::new(false))
                .await
                .unwrap();
        }
        assert!(registry.remove(&"a".to_string()).is_some());
        assert!(registry.remove(&"a".to_string()).is_none());
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
