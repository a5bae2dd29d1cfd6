use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::store::StoreError;

/// 与 resolver 共享的默认键前缀
pub const DEFAULT_KEY_PREFIX: &str = "/_grpc/service/";
pub const DEFAULT_KEY_TTL_SECS: i64 = 5 * 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 3 * 60;

// 服务实例信息，身份由 address 决定
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    /// host:port
    pub address: String,
    /// 目前没有选择器使用权重，可通过 `KvBuilder` 编码进存储
    #[serde(default)]
    pub weight: u32,
}

impl ServiceInstance {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            weight: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// 注册中心错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Invalid registry config: {0}")]
    InvalidConfig(String),
}

/// 根据实例生成相对于前缀的 (key, value)
pub type KvBuilder = Arc<dyn Fn(&ServiceInstance) -> (String, String) + Send + Sync>;
/// 写入结果回调（注册与心跳重写都会触发）
pub type PutHandler = Arc<dyn Fn(&str, Result<(), &StoreError>) + Send + Sync>;
/// 删除结果回调，成功时携带删除数量
pub type DeleteHandler = Arc<dyn Fn(&str, Result<u64, &StoreError>) + Send + Sync>;

/// 默认键布局：`<service>/<address>`，值为地址
pub fn default_kv(instance: &ServiceInstance) -> (String, String) {
    (
        format!("{}/{}", instance.service_name, instance.address),
        instance.address.clone(),
    )
}

/// 注册中心运行参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub key_prefix: String,
    pub key_ttl: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_ttl: Duration::from_secs(DEFAULT_KEY_TTL_SECS as u64),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        }
    }
}

impl RegistryOptions {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.key_ttl.as_secs() == 0 {
            return Err(RegistryError::InvalidConfig(
                "key ttl must be at least one second".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        // 租约按整秒申请，比较时使用截断后的 TTL
        if self.heartbeat_interval >= Duration::from_secs(self.key_ttl.as_secs()) {
            return Err(RegistryError::InvalidConfig(format!(
                "heartbeat interval ({}s) must be shorter than key ttl ({}s)",
                self.heartbeat_interval.as_secs_f64(),
                self.key_ttl.as_secs()
            )));
        }
        Ok(())
    }

    pub fn ttl_secs(&self) -> i64 {
        self.key_ttl.as_secs() as i64
    }
}

/// 服务注册接口
#[tonic::async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    async fn unregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;
}
