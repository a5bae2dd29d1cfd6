use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use thiserror::Error;

/// 租约 ID
pub type LeaseId = i64;

/// 协调存储错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease not found or expired: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Invalid store data: {0}")]
    Encoding(String),
}

/// 存储中的一条键值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// 每次写入递增，删除后归零
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// watch 流中的单个变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// Put 时为新值；Delete 时为被删除的值（存储可能不提供，此时为空）
    pub value: String,
    pub prev_value: Option<String>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::Put,
            key: key.into(),
            value: value.into(),
            prev_value: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::Delete,
            key: key.into(),
            value: String::new(),
            prev_value: None,
        }
    }

    pub fn with_prev_value(mut self, prev: impl Into<String>) -> Self {
        self.prev_value = Some(prev.into());
        self
    }
}

/// 按投递顺序产出事件批次的 watch 流
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<Vec<WatchEvent>, StoreError>> + Send>>;

/// 协调存储客户端：只通过 get/put/delete/watch/lease 原语访问
#[tonic::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    /// 续约，返回剩余 TTL 秒数；已过期的租约返回 `LeaseNotFound`
    async fn keep_alive(&self, lease: LeaseId) -> Result<i64, StoreError>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// 返回删除的键数量
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

/// 根据端点列表建立存储连接
#[tonic::async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    async fn connect(&self, endpoints: &[String]) -> Result<Arc<dyn CoordinationStore>, StoreError>;
}

/// 端点字符串解析函数
pub type EndpointParser = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// 默认端点解析：按 `,` 分割
pub fn split_endpoints(endpoints: &str) -> Vec<String> {
    endpoints
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn default_endpoint_parser() -> EndpointParser {
    Arc::new(split_endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_endpoints() {
        assert_eq!(
            split_endpoints("10.0.0.1:2379, 10.0.0.2:2379,,"),
            vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]
        );
        assert!(split_endpoints("").is_empty());
    }
}
