//! etcd-backed coordinator (`etcd` cargo feature).
//!
//! Maps the [`Coordinator`] contract onto etcd's kv/watch/lease/txn APIs.
//! Compare-and-swap-on-absence is an etcd transaction guarded on
//! `create_revision == 0`; the atomic counter is a read/compare/put loop
//! on `mod_revision`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::mpsc;

use cronmesh_core::coordinator::{
    Coordinator, CoordinatorError, CoordinatorResult, EventKind, KeyValue, LeaseId, WatchEvent,
    WatchStream,
};

fn transport(e: etcd_client::Error) -> CoordinatorError {
    CoordinatorError::Unavailable(e.to_string())
}

fn to_key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).to_string(),
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
    }
}

/// [`Coordinator`] over an etcd cluster.
///
/// The inner client is cheap to clone; every operation works on its own
/// clone so `&self` methods never contend on a connection handle.
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to the given endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub async fn connect(endpoints: &[String]) -> CoordinatorResult<Self> {
        let client = Client::connect(endpoints, None).await.map_err(transport)?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(transport)?;
        Ok(resp.kvs().first().map(to_key_value))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let mut options = PutOptions::new().with_prev_key();
        if let Some(lease) = lease {
            options = options.with_lease(lease);
        }
        let resp = client
            .put(key, value, Some(options))
            .await
            .map_err(transport)?;
        Ok(resp.prev_key().map(to_key_value))
    }

    async fn delete(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await
            .map_err(transport)?;
        Ok(resp.prev_kvs().first().map(to_key_value))
    }

    async fn range(&self, prefix: &str) -> CoordinatorResult<(Vec<KeyValue>, i64)> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok((resp.kvs().iter().map(to_key_value).collect(), revision))
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> CoordinatorResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, mut stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(transport)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Hold the watcher so etcd keeps the watch open for the life
            // of this pump task.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.compact_revision() != 0 {
                            let _ = tx.send(Err(CoordinatorError::Compacted {
                                requested: from_revision,
                                oldest: resp.compact_revision(),
                            }));
                            return;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => EventKind::Put,
                                EventType::Delete => EventKind::Delete,
                            };
                            let sent = tx.send(Ok(WatchEvent {
                                kind,
                                key: String::from_utf8_lossy(kv.key()).to_string(),
                                value: kv.value().to_vec(),
                                revision: kv.mod_revision(),
                            }));
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    // Transport loss or cancellation: close the stream so
                    // the watcher resumes from its last revision.
                    Ok(None) | Err(_) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn grant(&self, ttl: Duration) -> CoordinatorResult<LeaseId> {
        let mut client = self.client.clone();
        // etcd TTLs are whole seconds with a minimum of 1.
        let secs = ttl.as_secs().max(1) as i64;
        let resp = client.lease_grant(secs, None).await.map_err(transport)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordinatorResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await.map_err(transport)?;
        keeper.keep_alive().await.map_err(transport)?;
        match stream.message().await.map_err(transport)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(CoordinatorError::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> CoordinatorResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            // Revoking an already-expired lease is a clean release.
            Err(etcd_client::Error::GRpcStatus(status))
                if status.message().contains("lease not found") =>
            {
                Ok(())
            }
            Err(e) => Err(transport(e)),
        }
    }

    async fn increment(&self, key: &str) -> CoordinatorResult<i64> {
        let mut client = self.client.clone();
        loop {
            let resp = client.get(key, None).await.map_err(transport)?;
            let (current, guard) = match resp.kvs().first() {
                None => (0, Compare::create_revision(key, CompareOp::Equal, 0)),
                Some(kv) => {
                    let n = String::from_utf8_lossy(kv.value())
                        .parse::<i64>()
                        .map_err(|_| CoordinatorError::CorruptCounter {
                            key: key.to_string(),
                        })?;
                    (
                        n,
                        Compare::mod_revision(key, CompareOp::Equal, kv.mod_revision()),
                    )
                }
            };
            let next = current + 1;
            let txn = Txn::new()
                .when(vec![guard])
                .and_then(vec![TxnOp::put(key, next.to_string(), None)]);
            let resp = client.txn(txn).await.map_err(transport)?;
            if resp.succeeded() {
                return Ok(next);
            }
            // Lost the race; re-read and try again.
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<bool> {
        let mut client = self.client.clone();
        let mut options = PutOptions::new();
        if let Some(lease) = lease {
            options = options.with_lease(lease);
        }
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, Some(options))]);
        let resp = client.txn(txn).await.map_err(transport)?;
        Ok(resp.succeeded())
    }
}
