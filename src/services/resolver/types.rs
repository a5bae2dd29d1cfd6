use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::services::registry::DEFAULT_KEY_PREFIX;
use crate::services::store::StoreError;

/// 解析器错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// 解析目标：`scheme://authority/endpoint`
///
/// 对 `etcd` 来说 authority 是逗号分隔的存储端点，endpoint 是服务名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    pub fn new(
        scheme: impl Into<String>,
        authority: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn parse(target: &str) -> Result<Self, ResolverError> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| ResolverError::InvalidTarget(format!("missing scheme in {target:?}")))?;
        if scheme.is_empty() {
            return Err(ResolverError::InvalidTarget(format!("empty scheme in {target:?}")));
        }
        let (authority, endpoint) = rest.split_once('/').unwrap_or((rest, ""));
        Ok(Self::new(scheme, authority, endpoint))
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

/// 推送给连接管理器的地址
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub addr: String,
    pub server_name: String,
}

impl Address {
    pub fn new(addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: server_name.into(),
        }
    }
}

/// 地址列表的消费方，每次收到完整列表
pub trait AddressSink: Send + Sync {
    fn update_addresses(&self, addresses: Vec<Address>);
}

impl AddressSink for mpsc::UnboundedSender<Vec<Address>> {
    fn update_addresses(&self, addresses: Vec<Address>) {
        if self.send(addresses).is_err() {
            tracing::debug!("Address consumer dropped, update discarded");
        }
    }
}

impl AddressSink for watch::Sender<Vec<Address>> {
    fn update_addresses(&self, addresses: Vec<Address>) {
        self.send_replace(addresses);
    }
}

/// 解析器生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Created,
    Initializing,
    Watching,
    Closed,
}

/// 初次全量拉取失败时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialFetchPolicy {
    /// 以空集合进入 Watching
    #[default]
    Proceed,
    /// 带退避重试直到成功或关闭
    Retry,
}

/// 解析器运行参数
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverOptions {
    pub key_prefix: String,
    pub initial_fetch: InitialFetchPolicy,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            initial_fetch: InitialFetchPolicy::Proceed,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ResolverOptions {
    /// 不设总时长上限的指数退避
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.backoff_initial,
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            multiplier: self.backoff_multiplier,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff::backoff::Backoff::reset(&mut backoff);
        backoff
    }

    /// 服务的基础键 `<key_prefix><service>`，也是 watch 的前缀
    pub fn service_prefix(&self, service: &str) -> String {
        format!("{}{}", self.key_prefix, service)
    }
}

/// 键是否属于该服务：等于基础键，或位于 `<基础键>/` 之下
///
/// 只按前缀匹配时，服务 `x` 的 watch 也会收到服务 `xy` 的键。
pub fn is_service_key(service_prefix: &str, key: &str) -> bool {
    match key.strip_prefix(service_prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// 解析器句柄
pub trait Resolver: Send + Sync {
    /// 尽力立即重新解析
    fn resolve_now(&self);

    fn close(&self);
}

/// 按 scheme 注册的解析器工厂
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn build(
        &self,
        target: &Target,
        sink: Arc<dyn AddressSink>,
    ) -> Result<Box<dyn Resolver>, ResolverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = Target::parse("etcd://10.0.0.1:2379,10.0.0.2:2379/user.Service").unwrap();
        assert_eq!(target.scheme, "etcd");
        assert_eq!(target.authority, "10.0.0.1:2379,10.0.0.2:2379");
        assert_eq!(target.endpoint, "user.Service");
        assert_eq!(
            target.to_string(),
            "etcd://10.0.0.1:2379,10.0.0.2:2379/user.Service"
        );
    }

    #[test]
    fn test_parse_target_without_endpoint() {
        let target = Target::parse("list://a:1,b:2").unwrap();
        assert_eq!(target.authority, "a:1,b:2");
        assert_eq!(target.endpoint, "");
    }

    #[test]
    fn test_parse_target_rejects_missing_scheme() {
        assert!(matches!(
            Target::parse("10.0.0.1:2379/svc"),
            Err(ResolverError::InvalidTarget(_))
        ));
        assert!(Target::parse("://a/b").is_err());
    }

    #[test]
    fn test_service_prefix() {
        let options = ResolverOptions::default();
        assert_eq!(options.service_prefix("x"), "/_grpc/service/x");
    }

    #[test]
    fn test_is_service_key() {
        let base = "/_grpc/service/x";
        assert!(is_service_key(base, "/_grpc/service/x"));
        assert!(is_service_key(base, "/_grpc/service/x/10.0.0.1:9000"));
        assert!(!is_service_key(base, "/_grpc/service/xy"));
        assert!(!is_service_key(base, "/_grpc/service/xy/10.0.0.1:9000"));
        assert!(!is_service_key(base, "/_grpc/service/"));
    }
}
