use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::client_manager::ClientManagerConfig;
use crate::services::registry::{DEFAULT_KEY_PREFIX, RegistryOptions, ServiceInstance};
use crate::services::resolver::{InitialFetchPolicy, ResolverError, ResolverOptions};

/// 配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "GRPC_LB_CONFIG";
/// 环境变量覆盖项前缀
pub const ENV_PREFIX: &str = "GRPC_LB_";

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Duplicate {kind} registration: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("Missing {kind}: {name}")]
    Missing { kind: &'static str, name: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub resolver: ResolverConfig,
    pub balancer: BalancerConfig,
    pub client: ClientConfig,
    pub instance: Option<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 逗号分隔的存储端点；`memory` 表示进程内存储
    pub endpoints: String,
    pub key_prefix: String,
    pub dial_timeout: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: "memory".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dial_timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 租约 TTL（秒）
    pub key_ttl: u64,
    /// 心跳间隔（秒），必须小于 key_ttl
    pub heartbeat_interval: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_ttl: 300,
            heartbeat_interval: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// 要监听的目标，例如 `etcd://127.0.0.1:2379/user.Service`
    pub target: Option<String>,
    pub initial_fetch: InitialFetchPolicy,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            target: None,
            initial_fetch: InitialFetchPolicy::Proceed,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// `random` 或 `consistent_hash`
    pub policy: String,
    pub replicas: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: "random".to_string(),
            replicas: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { connect_timeout: 10 }
    }
}

/// 本进程要注册的实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub service_name: String,
    pub address: String,
    #[serde(default)]
    pub weight: u32,
}

/// 可通过 `GRPC_LB_*` 环境变量覆盖的配置项
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvOverrides {
    pub endpoints: Option<String>,
    pub key_ttl: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub policy: Option<String>,
    pub target: Option<String>,
    pub service_name: Option<String>,
    pub address: Option<String>,
}

impl Config {
    /// 读取配置文件（不存在时使用默认值），再应用 `.env` 与环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::info!(path = %path, "Config file not found, using defaults");
            Self::default()
        };

        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_env()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(endpoints) = overrides.endpoints {
            self.store.endpoints = endpoints;
        }
        if let Some(ttl) = overrides.key_ttl {
            self.registry.key_ttl = ttl;
        }
        if let Some(interval) = overrides.heartbeat_interval {
            self.registry.heartbeat_interval = interval;
        }
        if let Some(policy) = overrides.policy {
            self.balancer.policy = policy;
        }
        if let Some(target) = overrides.target {
            self.resolver.target = Some(target);
        }
        match (overrides.service_name, overrides.address) {
            (Some(service_name), Some(address)) => {
                self.instance = Some(InstanceConfig {
                    service_name,
                    address,
                    weight: self.instance.as_ref().map(|i| i.weight).unwrap_or_default(),
                });
            }
            (service_name, address) => {
                if let Some(instance) = self.instance.as_mut() {
                    if let Some(service_name) = service_name {
                        instance.service_name = service_name;
                    }
                    if let Some(address) = address {
                        instance.address = address;
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.balancer.replicas == 0 {
            return Err(ConfigError::Invalid("balancer.replicas must be positive".to_string()));
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.store.endpoints.trim() == "memory"
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            key_prefix: self.store.key_prefix.clone(),
            key_ttl: Duration::from_secs(self.registry.key_ttl),
            heartbeat_interval: Duration::from_secs(self.registry.heartbeat_interval),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            key_prefix: self.store.key_prefix.clone(),
            initial_fetch: self.resolver.initial_fetch,
            backoff_initial: Duration::from_millis(self.resolver.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.resolver.backoff_max_ms),
            backoff_multiplier: self.resolver.backoff_multiplier,
        }
    }

    pub fn client_manager_config(&self) -> ClientManagerConfig {
        ClientManagerConfig {
            connect_timeout: Duration::from_secs(self.client.connect_timeout),
            ..Default::default()
        }
    }

    pub fn service_instance(&self) -> Option<ServiceInstance> {
        self.instance.as_ref().map(|i| {
            ServiceInstance::new(i.service_name.clone(), i.address.clone()).with_weight(i.weight)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.uses_memory_store());
        assert_eq!(config.registry.key_ttl, 300);
        assert_eq!(config.registry.heartbeat_interval, 180);
        assert_eq!(config.balancer.policy, "random");
        assert_eq!(config.balancer.replicas, 20);
        assert!(config.instance.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [store]
            endpoints = "10.0.0.1:2379,10.0.0.2:2379"

            [registry]
            key_ttl = 5
            heartbeat_interval = 2

            [resolver]
            target = "etcd://10.0.0.1:2379/x"
            initial_fetch = "retry"

            [balancer]
            policy = "consistent_hash"

            [instance]
            service_name = "x"
            address = "10.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert!(!config.uses_memory_store());
        assert_eq!(config.resolver.initial_fetch, InitialFetchPolicy::Retry);
        assert_eq!(config.balancer.policy, "consistent_hash");
        let options = config.registry_options();
        assert_eq!(options.key_ttl, Duration::from_secs(5));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(
            config.service_instance(),
            Some(ServiceInstance::new("x", "10.0.0.1:9000"))
        );
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_ttl() {
        let config = Config::from_toml(
            r#"
            [registry]
            key_ttl = 10
            heartbeat_interval = 10
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX)
            .from_iter(vec![
                ("GRPC_LB_ENDPOINTS".to_string(), "127.0.0.1:2379".to_string()),
                ("GRPC_LB_KEY_TTL".to_string(), "30".to_string()),
                ("GRPC_LB_HEARTBEAT_INTERVAL".to_string(), "10".to_string()),
                ("GRPC_LB_SERVICE_NAME".to_string(), "x".to_string()),
                ("GRPC_LB_ADDRESS".to_string(), "10.0.0.1:9000".to_string()),
            ])
            .unwrap();

        let mut config = Config::default();
        config.apply_overrides(overrides);

        assert_eq!(config.store.endpoints, "127.0.0.1:2379");
        assert_eq!(config.registry.key_ttl, 30);
        assert_eq!(config.registry.heartbeat_interval, 10);
        let instance = config.instance.unwrap();
        assert_eq!(instance.service_name, "x");
        assert_eq!(instance.address, "10.0.0.1:9000");
    }
}
