use std::{fmt, time::Duration};

use etcd::{Compare, CompareOp, ConnectOptions, LockOptions, Txn, TxnOp};
use etcd_client as etcd;
use seqid_common::error::BoxedError;
use snafu::{ensure, Location, Snafu};
use tracing::{debug, warn};

use super::{ConsensusBackend, Coordinator, LockHandle, Policies, Versioned};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid etcd connection string: {value:?}"))]
    InvalidConnectionString {
        value: String,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Clone, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Prefix for every counter and lock key, empty or `/`-prefixed.
    pub root: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// TTL of the lease attached to held locks, so a crashed holder's lock expires.
    pub session_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub policies: Policies,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            root: String::new(),
            user: None,
            password: None,
            session_timeout_ms: 3_600_000,
            connect_timeout_ms: 3_000,
            request_timeout_ms: None,
            policies: Policies::default(),
        }
    }
}

impl EtcdConfig {
    /// Parses `host1:2379,host2:2379[/root]`.
    pub fn from_connection_string(value: &str) -> Result<Self, Error> {
        let (hosts, root) = match value.split_once('/') {
            Some((hosts, root)) => (hosts, root.trim_matches('/')),
            None => (value, ""),
        };
        let endpoints: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect();
        ensure!(
            !endpoints.is_empty(),
            InvalidConnectionStringSnafu { value }
        );
        ensure!(
            root.is_empty() || !root.split('/').any(str::is_empty),
            InvalidConnectionStringSnafu { value }
        );

        Ok(Self {
            endpoints,
            root: if root.is_empty() {
                String::new()
            } else {
                format!("/{root}")
            },
            ..Default::default()
        })
    }

    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.user = user;
        self.password = password;
        self
    }

    pub fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if let Some(timeout) = self.request_timeout_ms {
            options = options.with_timeout(Duration::from_millis(timeout));
        }
        if let Some(user) = &self.user {
            options = options.with_user(user.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

impl fmt::Debug for EtcdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdConfig")
            .field("endpoints", &self.endpoints)
            .field("root", &self.root)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("session_timeout_ms", &self.session_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("policies", &self.policies)
            .finish()
    }
}

impl ConsensusBackend for EtcdConfig {
    type Client = EtcdCoordinator;

    #[tracing::instrument]
    async fn connect(&self) -> Result<EtcdCoordinator, BoxedError> {
        let client = etcd::Client::connect(self.endpoints.clone(), Some(self.connect_options()))
            .await
            .map_err(BoxedError::new)?;
        Ok(EtcdCoordinator {
            client,
            lease_ttl: (self.session_timeout_ms / 1000).max(1) as i64,
        })
    }

    fn root(&self) -> &str {
        &self.root
    }
}

#[derive(Clone)]
pub struct EtcdCoordinator {
    client: etcd::Client,
    lease_ttl: i64,
}

impl EtcdCoordinator {
    async fn revoke(&self, lease_id: i64) {
        if let Err(e) = self.client.lease_client().revoke(lease_id).await {
            warn!(lease_id, "revoke lock lease error: {e:?}");
        }
    }
}

impl Coordinator for EtcdCoordinator {
    async fn get(&self, path: &str) -> Result<Option<Versioned>, BoxedError> {
        let resp = self
            .client
            .kv_client()
            .get(path, None)
            .await
            .map_err(BoxedError::new)?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }))
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected_revision: Option<i64>,
        value: Vec<u8>,
    ) -> Result<bool, BoxedError> {
        let guard = match expected_revision {
            Some(revision) => Compare::mod_revision(path, CompareOp::Equal, revision),
            None => Compare::create_revision(path, CompareOp::Equal, 0),
        };
        let txn = Txn::new()
            .when([guard])
            .and_then([TxnOp::put(path, value, None)]);
        let resp = self
            .client
            .kv_client()
            .txn(txn)
            .await
            .map_err(BoxedError::new)?;
        Ok(resp.succeeded())
    }

    async fn lock(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<LockHandle>, BoxedError> {
        let lease_id = self
            .client
            .lease_client()
            .grant(self.lease_ttl, None)
            .await
            .map_err(BoxedError::new)?
            .id();

        let mut lock_client = self.client.lock_client();
        let acquire = lock_client.lock(path, Some(LockOptions::new().with_lease(lease_id)));
        let acquired = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.ok(),
            None => Some(acquire.await),
        };

        match acquired {
            Some(Ok(resp)) => Ok(Some(LockHandle {
                key: resp.key().to_vec(),
                lease_id: Some(lease_id),
            })),
            Some(Err(e)) => {
                self.revoke(lease_id).await;
                Err(BoxedError::new(e))
            }
            // the pending request may still be granted, revoking the lease releases it
            None => {
                self.revoke(lease_id).await;
                Ok(None)
            }
        }
    }

    async fn unlock(&self, handle: LockHandle) -> Result<(), BoxedError> {
        let res = self.client.lock_client().unlock(handle.key).await;
        if let Some(lease_id) = handle.lease_id {
            self.revoke(lease_id).await;
        }
        res.map(|_| ()).map_err(BoxedError::new)
    }

    fn close(&self) {
        // channels close once the last clone of the client is dropped
        debug!("closing etcd coordinator");
    }
}
