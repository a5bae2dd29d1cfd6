//! etcd 协调存储实现

use std::sync::Arc;
use std::time::Duration;

use backoff::{ExponentialBackoff, future::retry};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use futures::stream;

use super::types::{
    CoordinationStore, KeyValue, LeaseId, StoreConnector, StoreError, WatchEvent, WatchStream,
};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// 基于 etcd 的协调存储
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }
}

#[tonic::async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?;
        Ok(lease.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64, StoreError> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        match responses.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(resp.ttl()),
            Some(_) => Err(StoreError::LeaseNotFound(lease)),
            None => Err(StoreError::Unavailable(
                "keep-alive stream closed".to_string(),
            )),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        resp.kvs()
            .iter()
            .map(|kv| {
                Ok(KeyValue {
                    key: kv.key_str()?.to_string(),
                    value: kv.value_str()?.to_string(),
                    lease: (kv.lease() != 0).then_some(kv.lease()),
                    create_revision: kv.create_revision(),
                    mod_revision: kv.mod_revision(),
                    version: kv.version(),
                })
            })
            .collect::<Result<Vec<_>, etcd_client::Error>>()
            .map_err(|e| StoreError::Encoding(e.to_string()))
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let (watcher, watch_stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix().with_prev_key()))
            .await?;

        // watcher 随流一起保存，丢弃它会关闭 watch
        let events = stream::unfold(
            (watcher, watch_stream),
            |(watcher, mut watch_stream)| async move {
                let item = match watch_stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            Err(StoreError::Unavailable("watch canceled by server".to_string()))
                        } else {
                            Ok(resp.events().iter().filter_map(convert_event).collect())
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => Err(StoreError::from(e)),
                };
                Some((item, (watcher, watch_stream)))
            },
        );

        Ok(Box::pin(events))
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let key = match kv.key_str() {
        Ok(key) => key.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid key encoding in watch event");
            return None;
        }
    };
    let prev_value = event
        .prev_kv()
        .and_then(|prev| prev.value_str().ok())
        .map(str::to_string);

    let watch_event = match event.event_type() {
        EventType::Put => WatchEvent {
            kind: super::types::WatchEventKind::Put,
            key,
            value: kv.value_str().unwrap_or_default().to_string(),
            prev_value,
        },
        EventType::Delete => WatchEvent {
            kind: super::types::WatchEventKind::Delete,
            key,
            value: prev_value.clone().unwrap_or_default(),
            prev_value,
        },
    };
    Some(watch_event)
}

/// etcd 连接器，带指数退避重试
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    pub dial_timeout: Duration,
    pub max_elapsed: Duration,
}

impl Default for EtcdConnector {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

#[tonic::async_trait]
impl StoreConnector for EtcdConnector {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn CoordinationStore>, StoreError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        let store = retry(backoff, || async {
            match EtcdStore::connect(endpoints, self.dial_timeout).await {
                Ok(store) => {
                    tracing::debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(store)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Arc::new(store))
    }
}
