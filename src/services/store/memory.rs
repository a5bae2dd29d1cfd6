use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::types::{
    CoordinationStore, KeyValue, LeaseId, StoreConnector, StoreError, WatchEvent, WatchStream,
};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// 广播给 watcher 的通知
#[derive(Debug, Clone)]
enum StoreNotice {
    Events(Vec<WatchEvent>),
    Disconnect,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
    create_revision: i64,
    mod_revision: i64,
    version: i64,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    revision: i64,
    next_lease: LeaseId,
}

impl Inner {
    fn remove_key(&mut self, key: &str) -> Option<WatchEvent> {
        let entry = self.kvs.remove(key)?;
        if let Some(lease_id) = entry.lease {
            if let Some(lease) = self.leases.get_mut(&lease_id) {
                lease.keys.remove(key);
            }
        }
        self.revision += 1;
        let mut event = WatchEvent::delete(key).with_prev_value(entry.value.clone());
        event.value = entry.value;
        Some(event)
    }

    fn drop_lease(&mut self, lease_id: LeaseId) -> Option<Vec<WatchEvent>> {
        let lease = self.leases.remove(&lease_id)?;
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        Some(keys.iter().filter_map(|key| self.remove_key(key)).collect())
    }
}

/// 进程内协调存储
///
/// 提供与 etcd 相同的租约、修订号与前缀 watch 语义，TTL 基于 tokio 时钟，
/// 因此可以在 `tokio::time::pause()` 下测试。克隆后共享同一份状态。
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    notices: broadcast::Sender<StoreNotice>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_lease: 1,
                ..Default::default()
            })),
            notices,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 故障注入：不可用时所有调用返回 `StoreError::Unavailable`，
    /// 已建立的 watch 流会收到一个错误项
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            tracing::debug!("Memory store marked unavailable, disconnecting watchers");
            let _ = self.notices.send(StoreNotice::Disconnect);
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// 清理过期租约及其关联的键
    pub fn expire_leases(&self) -> usize {
        let mut inner = self.lock();
        self.expire_locked(&mut inner)
    }

    /// 周期性清理过期租约，调用方负责 abort
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let expired = store.expire_leases();
                if expired > 0 {
                    tracing::debug!(expired_leases = expired, "Memory store reaped expired leases");
                }
            }
        })
    }

    /// 直接读取单个键（不受可用性开关影响）
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        inner.kvs.get(key).map(|entry| to_key_value(key, entry))
    }

    pub fn lease_count(&self) -> usize {
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        inner.leases.len()
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 持锁期间不会 panic，中毒时继续使用内部状态
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn expire_locked(&self, inner: &mut Inner) -> usize {
        let now = Instant::now();
        let mut expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        let mut events = Vec::new();
        for lease_id in &expired {
            if let Some(removed) = inner.drop_lease(*lease_id) {
                tracing::debug!(lease_id = *lease_id, keys = removed.len(), "Lease expired");
                events.extend(removed);
            }
        }
        self.publish(events);
        expired.len()
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        if !events.is_empty() {
            // 没有 watcher 时发送失败是正常情况
            let _ = self.notices.send(StoreNotice::Events(events));
        }
    }
}

fn to_key_value(key: &str, entry: &Entry) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: entry.value.clone(),
        lease: entry.lease,
        create_revision: entry.create_revision,
        mod_revision: entry.mod_revision,
        version: entry.version,
    }
}

#[tonic::async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        self.check_available()?;
        if ttl_secs <= 0 {
            return Err(StoreError::Encoding(format!("invalid lease ttl: {ttl_secs}")));
        }
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        let lease_id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            lease_id,
            Lease {
                ttl: ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: HashSet::new(),
            },
        );
        Ok(lease_id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        let entry = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl as u64);
        Ok(entry.ttl)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        let events = inner.drop_lease(lease).ok_or(StoreError::LeaseNotFound(lease))?;
        self.publish(events);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        self.expire_locked(&mut inner);

        if let Some(lease_id) = lease {
            if !inner.leases.contains_key(&lease_id) {
                return Err(StoreError::LeaseNotFound(lease_id));
            }
        }

        inner.revision += 1;
        let revision = inner.revision;
        let previous = inner.kvs.get(key).cloned();

        // 换租约时从旧租约上解绑
        if let Some(old_lease) = previous.as_ref().and_then(|e| e.lease) {
            if Some(old_lease) != lease {
                if let Some(old) = inner.leases.get_mut(&old_lease) {
                    old.keys.remove(key);
                }
            }
        }
        if let Some(lease_id) = lease {
            if let Some(attached) = inner.leases.get_mut(&lease_id) {
                attached.keys.insert(key.to_string());
            }
        }

        let entry = match &previous {
            Some(prev) => Entry {
                value: value.to_string(),
                lease,
                create_revision: prev.create_revision,
                mod_revision: revision,
                version: prev.version + 1,
            },
            None => Entry {
                value: value.to_string(),
                lease,
                create_revision: revision,
                mod_revision: revision,
                version: 1,
            },
        };
        inner.kvs.insert(key.to_string(), entry);

        let mut event = WatchEvent::put(key, value);
        event.prev_value = previous.map(|p| p.value);
        self.publish(vec![event]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        match inner.remove_key(key) {
            Some(event) => {
                self.publish(vec![event]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        self.expire_locked(&mut inner);
        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| to_key_value(key, entry))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let prefix = prefix.to_string();
        let receiver = self.notices.subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(move |notice| match notice {
            Ok(StoreNotice::Events(events)) => {
                let matched: Vec<WatchEvent> = events
                    .into_iter()
                    .filter(|event| event.key.starts_with(&prefix))
                    .collect();
                if matched.is_empty() {
                    None
                } else {
                    Some(Ok(matched))
                }
            }
            Ok(StoreNotice::Disconnect) => Some(Err(StoreError::Unavailable(
                "watch stream disconnected".to_string(),
            ))),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(StoreError::Unavailable(
                format!("watch stream lagged, {skipped} notices dropped"),
            ))),
        });

        Ok(Box::pin(stream))
    }
}

#[tonic::async_trait]
impl StoreConnector for MemoryStore {
    // 与 etcd 客户端一样，连接在首次调用时才真正使用
    async fn connect(&self, _endpoints: &[String]) -> Result<Arc<dyn CoordinationStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}
