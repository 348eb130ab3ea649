//! In-process counter store with the same contract as the Redis backend.
//! Supports fault injection and tracks checked out connections.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use seqid_common::error::BoxedError;

use super::{CounterBackend, CounterConnection, CounterPool};

#[derive(Default)]
struct Shared {
    values: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    checked_out: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryCounter(Arc<Shared>);

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent counter operation fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.0.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_raw(&self, key: &str, value: Vec<u8>) {
        self.0.values.lock().insert(key.to_owned(), value);
    }

    /// Connections currently checked out of the pool.
    pub fn checked_out(&self) -> usize {
        self.0.checked_out.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }
}

impl CounterBackend for MemoryCounter {
    type Pool = MemoryCounter;

    async fn open(&self) -> Result<Self::Pool, BoxedError> {
        Ok(self.clone())
    }
}

impl CounterPool for MemoryCounter {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, BoxedError> {
        self.0.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection(self.0.clone()))
    }

    fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MemoryConnection(Arc<Shared>);

impl MemoryConnection {
    fn check(&self) -> Result<(), BoxedError> {
        if self.0.failing.load(Ordering::SeqCst) {
            return Err(BoxedError::msg("connection reset by peer"));
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.0.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CounterConnection for MemoryConnection {
    async fn increment_by(&mut self, key: &str, delta: i64) -> Result<i64, BoxedError> {
        self.check()?;
        let mut values = self.0.values.lock();
        let current = match values.get(key) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| BoxedError::msg("value is not an integer or out of range"))?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| BoxedError::msg("increment or decrement would overflow"))?;
        values.insert(key.to_owned(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn fetch(&mut self, key: &str) -> Result<Option<Vec<u8>>, BoxedError> {
        self.check()?;
        Ok(self.0.values.lock().get(key).cloned())
    }
}
