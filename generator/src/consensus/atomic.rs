//! Distributed atomic long on top of a [`Coordinator`]: optimistic
//! compare-and-set with bounded retries, optionally promoted to a distributed
//! lock once the optimistic budget is spent.

use std::time::{Duration, Instant};

use snafu::{Location, OptionExt, Snafu};
use tracing::warn;

use super::Coordinator;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("malformed counter value at {path}: expected 8 bytes, got {len}"))]
    MalformedValue {
        path: String,
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("counter at {path} would overflow"))]
    Overflow {
        path: String,
        #[snafu(implicit)]
        location: Location,
    },
}

/// One initial attempt, then up to `max_retries` retries spaced `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, interval_ms: u64) -> Self {
        Self {
            max_retries,
            interval_ms,
        }
    }

    pub fn allow_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone)]
pub struct PromotedToLock {
    pub lock_path: String,
    pub retry_policy: RetryPolicy,
    /// Upper bound for acquiring the lock, wait forever if `None`.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone)]
pub struct AtomicStats {
    pub optimistic_tries: u32,
    pub promoted_tries: u32,
    pub optimistic_time: Duration,
    pub promoted_time: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct AtomicValue {
    pub pre_value: i64,
    pub post_value: i64,
    pub succeeded: bool,
    pub stats: AtomicStats,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(i64),
    Read,
}

pub struct DistributedAtomicLong<'a, C> {
    client: &'a C,
    path: &'a str,
    retry_policy: RetryPolicy,
    promoted: Option<PromotedToLock>,
}

impl<'a, C: Coordinator> DistributedAtomicLong<'a, C> {
    pub fn new(
        client: &'a C,
        path: &'a str,
        retry_policy: RetryPolicy,
        promoted: Option<PromotedToLock>,
    ) -> Self {
        Self {
            client,
            path,
            retry_policy,
            promoted,
        }
    }

    pub async fn increment(&self) -> Result<AtomicValue, Error> {
        self.run(Op::Add(1)).await
    }

    pub async fn add(&self, delta: i64) -> Result<AtomicValue, Error> {
        self.run(Op::Add(delta)).await
    }

    /// Protected read. A missing counter reads as `0`.
    pub async fn get(&self) -> Result<AtomicValue, Error> {
        self.run(Op::Read).await
    }

    async fn run(&self, op: Op) -> Result<AtomicValue, Error> {
        let mut result = AtomicValue::default();

        let started = Instant::now();
        result.succeeded = self
            .retry_loop(op, self.retry_policy, false, &mut result)
            .await?;
        result.stats.optimistic_time = started.elapsed();

        if !result.succeeded {
            if let Some(promoted) = &self.promoted {
                let started = Instant::now();
                result.succeeded = self.try_with_lock(op, promoted, &mut result).await?;
                result.stats.promoted_time = started.elapsed();
            }
        }
        Ok(result)
    }

    async fn try_with_lock(
        &self,
        op: Op,
        promoted: &PromotedToLock,
        result: &mut AtomicValue,
    ) -> Result<bool, Error> {
        let lock_path = promoted.lock_path.as_str();
        let handle = match self.client.lock(lock_path, promoted.timeout).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                warn!(lock_path, "timed out acquiring counter lock");
                return Ok(false);
            }
            Err(e) => {
                warn!(lock_path, "acquire counter lock error: {e}");
                return Ok(false);
            }
        };

        let res = self
            .retry_loop(op, promoted.retry_policy, true, result)
            .await;

        if let Err(e) = self.client.unlock(handle).await {
            warn!(lock_path, "release counter lock error: {e}");
        }
        res
    }

    async fn retry_loop(
        &self,
        op: Op,
        policy: RetryPolicy,
        promoted: bool,
        result: &mut AtomicValue,
    ) -> Result<bool, Error> {
        let mut retry_count = 0;
        loop {
            if promoted {
                result.stats.promoted_tries += 1;
            } else {
                result.stats.optimistic_tries += 1;
            }
            if self.try_once(op, result).await? {
                return Ok(true);
            }
            if !policy.allow_retry(retry_count) {
                return Ok(false);
            }
            retry_count += 1;
            tokio::time::sleep(policy.interval()).await;
        }
    }

    /// `Ok(false)` means the attempt may be retried: a lost compare-and-set
    /// or a transient coordination error.
    async fn try_once(&self, op: Op, result: &mut AtomicValue) -> Result<bool, Error> {
        let path = self.path;
        let current = match self.client.get(path).await {
            Ok(current) => current,
            Err(e) => {
                warn!(path, "read counter error: {e}");
                return Ok(false);
            }
        };
        let (pre_value, revision) = match current {
            Some(versioned) => (decode(path, &versioned.value)?, Some(versioned.revision)),
            None => (0, None),
        };
        result.pre_value = pre_value;

        let delta = match op {
            Op::Read => {
                result.post_value = pre_value;
                return Ok(true);
            }
            Op::Add(delta) => delta,
        };
        let post_value = pre_value
            .checked_add(delta)
            .context(OverflowSnafu { path })?;

        match self
            .client
            .compare_and_set(path, revision, encode(post_value))
            .await
        {
            Ok(true) => {
                result.post_value = post_value;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                warn!(path, "compare and set counter error: {e}");
                Ok(false)
            }
        }
    }
}

/// Counters are stored as 8 big-endian bytes.
pub fn encode(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub fn decode(path: &str, raw: &[u8]) -> Result<i64, Error> {
    let bytes: [u8; 8] = raw.try_into().ok().context(MalformedValueSnafu {
        path,
        len: raw.len(),
    })?;
    Ok(i64::from_be_bytes(bytes))
}
