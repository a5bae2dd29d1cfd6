use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use super::heartbeat::{Heartbeat, HeartbeatHandle};
use super::types::{
    DeleteHandler, KvBuilder, PutHandler, RegistryError, RegistryOptions, ServiceInstance,
    ServiceRegistry, default_kv,
};
use crate::services::store::{CoordinationStore, StoreError};

/// 基于租约的服务注册中心
///
/// 每个注册键对应一个租约和一个心跳任务；注销时先停止心跳再删除键。
pub struct LeaseRegistry {
    store: Arc<dyn CoordinationStore>,
    options: RegistryOptions,
    kv_builder: KvBuilder,
    put_handler: Option<PutHandler>,
    delete_handler: Option<DeleteHandler>,
    // 完整键 -> 心跳任务
    heartbeats: DashMap<String, HeartbeatHandle>,
    // 同一个键的注册与注销串行执行
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    task_tracker: TaskTracker,
}

impl std::fmt::Debug for LeaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRegistry")
            .field("options", &self.options)
            .field("registered", &self.heartbeats.len())
            .finish_non_exhaustive()
    }
}

/// `LeaseRegistry` 构建器
pub struct LeaseRegistryBuilder {
    store: Arc<dyn CoordinationStore>,
    options: RegistryOptions,
    kv_builder: KvBuilder,
    put_handler: Option<PutHandler>,
    delete_handler: Option<DeleteHandler>,
}

impl LeaseRegistryBuilder {
    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key_ttl(mut self, ttl: Duration) -> Self {
        self.options.key_ttl = ttl;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.options.heartbeat_interval = interval;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.key_prefix = prefix.into();
        self
    }

    pub fn kv_builder<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceInstance) -> (String, String) + Send + Sync + 'static,
    {
        self.kv_builder = Arc::new(f);
        self
    }

    pub fn put_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Result<(), &StoreError>) + Send + Sync + 'static,
    {
        self.put_handler = Some(Arc::new(f));
        self
    }

    pub fn delete_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Result<u64, &StoreError>) + Send + Sync + 'static,
    {
        self.delete_handler = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<LeaseRegistry, RegistryError> {
        self.options.validate()?;
        Ok(LeaseRegistry {
            store: self.store,
            options: self.options,
            kv_builder: self.kv_builder,
            put_handler: self.put_handler,
            delete_handler: self.delete_handler,
            heartbeats: DashMap::new(),
            key_locks: DashMap::new(),
            task_tracker: TaskTracker::new(),
        })
    }
}

impl LeaseRegistry {
    pub fn builder(store: Arc<dyn CoordinationStore>) -> LeaseRegistryBuilder {
        LeaseRegistryBuilder {
            store,
            options: RegistryOptions::default(),
            kv_builder: Arc::new(default_kv),
            put_handler: None,
            delete_handler: None,
        }
    }

    pub fn new(store: Arc<dyn CoordinationStore>, options: RegistryOptions) -> Result<Self, RegistryError> {
        Self::builder(store).options(options).build()
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// 实例在存储中的完整键和值
    pub fn key_value(&self, instance: &ServiceInstance) -> (String, String) {
        let (key, value) = (self.kv_builder)(instance);
        (format!("{}{}", self.options.key_prefix, key), value)
    }

    /// 当前持有心跳的完整键
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.heartbeats.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn lease_of(&self, instance: &ServiceInstance) -> Option<i64> {
        let (key, _) = self.key_value(instance);
        self.heartbeats.get(&key).map(|entry| entry.value().lease())
    }

    /// 注销全部实例并等待所有心跳任务退出
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        let keys = self.registered_keys();
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.remove_key(&key).await {
                tracing::error!(key = %key, error = %e, "Failed to unregister during shutdown");
                first_error.get_or_insert(e);
            }
        }
        self.task_tracker.close();
        self.task_tracker.wait().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks.entry(key.to_string()).or_default().clone()
    }

    // 停止心跳并撤销它持有的租约
    async fn retire(&self, key: &str, handle: HeartbeatHandle) {
        let lease = handle.stop().await;
        if let Err(e) = self.store.revoke_lease(lease).await {
            tracing::debug!(key = %key, lease_id = lease, error = %e, "Previous lease already gone");
        }
    }

    fn notify_put(&self, key: &str, result: &Result<(), StoreError>) {
        if let Some(handler) = &self.put_handler {
            handler(key, result.as_ref().map(|_| ()));
        }
    }

    // 停止心跳、删除键、撤销租约
    async fn remove_key(&self, key: &str) -> Result<(), RegistryError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let lease = match self.heartbeats.remove(key) {
            Some((_, handle)) => Some(handle.stop().await),
            None => None,
        };

        let result = self.store.delete(key).await;
        if let Some(handler) = &self.delete_handler {
            handler(key, result.as_ref().map(|n| *n));
        }
        let deleted = result?;

        if let Some(lease_id) = lease {
            match self.store.revoke_lease(lease_id).await {
                Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
                Err(e) => tracing::warn!(
                    key = %key,
                    lease_id = lease_id,
                    error = %e,
                    "Failed to revoke registration lease, it will expire on its own"
                ),
            }
        }

        tracing::info!(key = %key, deleted = deleted, "Unregistered service instance");
        Ok(())
    }
}

impl Drop for LeaseRegistry {
    // 未调用 shutdown 就被丢弃时，至少停止所有心跳，键随租约过期
    fn drop(&mut self) {
        for entry in self.heartbeats.iter() {
            entry.value().cancel();
        }
    }
}

#[tonic::async_trait]
impl ServiceRegistry for LeaseRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let (key, value) = self.key_value(instance);

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // 同一个键只保留一个租约
        if let Some((_, previous)) = self.heartbeats.remove(&key) {
            self.retire(&key, previous).await;
        }

        let lease = self.store.grant_lease(self.options.ttl_secs()).await.map_err(|e| {
            tracing::error!(key = %key, error = %e, "Failed to grant registration lease");
            e
        })?;

        let result = self.store.put(&key, &value, Some(lease)).await;
        self.notify_put(&key, &result);
        if let Err(e) = result {
            tracing::error!(key = %key, error = %e, "Failed to write registration key");
            let _ = self.store.revoke_lease(lease).await;
            return Err(e.into());
        }

        let heartbeat = Heartbeat {
            store: self.store.clone(),
            key: key.clone(),
            value: value.clone(),
            ttl_secs: self.options.ttl_secs(),
            interval: self.options.heartbeat_interval,
            put_handler: self.put_handler.clone(),
        };
        let handle = heartbeat.spawn(lease, &self.task_tracker);
        if let Some(replaced) = self.heartbeats.insert(key.clone(), handle) {
            self.retire(&key, replaced).await;
        }

        tracing::info!(
            service_name = %instance.service_name,
            address = %instance.address,
            key = %key,
            lease_id = lease,
            ttl_secs = self.options.ttl_secs(),
            "Registered service instance"
        );
        Ok(())
    }

    async fn unregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let (key, _) = self.key_value(instance);
        self.remove_key(&key).await.map_err(|e| {
            tracing::error!(
                service_name = %instance.service_name,
                address = %instance.address,
                error = %e,
                "Failed to unregister service instance"
            );
            e
        })
    }
}
