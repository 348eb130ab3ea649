//! In-process coordinator with revisioned keys and per-path locks.
//! Supports fault injection: hard failures and lost compare-and-sets.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use seqid_common::error::BoxedError;
use tokio::sync::OwnedMutexGuard;

use super::{ConsensusBackend, Coordinator, LockHandle, Versioned};

#[derive(Default)]
struct Shared {
    root: String,
    kvs: Mutex<HashMap<String, Versioned>>,
    revision: AtomicI64,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<Vec<u8>, OwnedMutexGuard<()>>>,
    lock_seq: AtomicU32,
    acquisitions: AtomicUsize,
    failing: AtomicBool,
    conflicts: AtomicU32,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryCoordinator(Arc<Shared>);

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A coordinator whose generators place every path under `root`.
    pub fn with_root(root: impl Into<String>) -> Self {
        Self(Arc::new(Shared {
            root: root.into(),
            ..Default::default()
        }))
    }

    /// Makes every operation fail with a transport error until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.0.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the next `n` compare-and-sets lose as if another writer got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.0.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn set_raw(&self, path: &str, value: Vec<u8>) {
        let revision = self.0.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.0
            .kvs
            .lock()
            .insert(path.to_owned(), Versioned { value, revision });
    }

    pub fn raw(&self, path: &str) -> Option<Vec<u8>> {
        self.0.kvs.lock().get(path).map(|v| v.value.clone())
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.0.acquisitions.load(Ordering::SeqCst)
    }

    pub fn locks_held(&self) -> usize {
        self.0.held.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BoxedError> {
        if self.0.failing.load(Ordering::SeqCst) {
            return Err(BoxedError::msg("coordination service unavailable"));
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        self.0
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ConsensusBackend for MemoryCoordinator {
    type Client = MemoryCoordinator;

    async fn connect(&self) -> Result<Self::Client, BoxedError> {
        Ok(self.clone())
    }

    fn root(&self) -> &str {
        &self.0.root
    }
}

impl Coordinator for MemoryCoordinator {
    async fn get(&self, path: &str) -> Result<Option<Versioned>, BoxedError> {
        self.check()?;
        Ok(self.0.kvs.lock().get(path).cloned())
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected_revision: Option<i64>,
        value: Vec<u8>,
    ) -> Result<bool, BoxedError> {
        self.check()?;
        if self.take_conflict() {
            return Ok(false);
        }
        let mut kvs = self.0.kvs.lock();
        let current = kvs.get(path).map(|v| v.revision);
        if current != expected_revision {
            return Ok(false);
        }
        let revision = self.0.revision.fetch_add(1, Ordering::SeqCst) + 1;
        kvs.insert(path.to_owned(), Versioned { value, revision });
        Ok(true)
    }

    async fn lock(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<LockHandle>, BoxedError> {
        self.check()?;
        let mutex = self
            .0
            .locks
            .lock()
            .entry(path.to_owned())
            .or_default()
            .clone();
        let guard = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => return Ok(None),
            },
            None => mutex.lock_owned().await,
        };

        let seq = self.0.lock_seq.fetch_add(1, Ordering::SeqCst);
        let key = format!("{path}/{seq:08}").into_bytes();
        self.0.held.lock().insert(key.clone(), guard);
        self.0.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Some(LockHandle {
            key,
            lease_id: None,
        }))
    }

    async fn unlock(&self, handle: LockHandle) -> Result<(), BoxedError> {
        // released even while failing, so fault injection cannot leak locks
        self.0.held.lock().remove(&handle.key);
        Ok(())
    }

    fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}
