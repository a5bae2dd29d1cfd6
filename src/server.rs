use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::services::registry::LeaseRegistry;
use crate::services::store::{CoordinationStore, MemoryStore, StoreConnector};
use crate::services::{Catalog, GrpcClientManager};

/// 注册表在 catalog 中的名称
pub const LEASE_REGISTRY: &str = "lease";

const MEMORY_REAPER_PERIOD: Duration = Duration::from_secs(1);

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化时忽略
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub async fn start() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    })
    .await
}

struct StoreHandles {
    store: Arc<dyn CoordinationStore>,
    connector: Arc<dyn StoreConnector>,
    reaper: Option<JoinHandle<()>>,
}

async fn connect_store(config: &Config) -> Result<StoreHandles, Box<dyn std::error::Error>> {
    if config.uses_memory_store() {
        tracing::info!("Using in-process memory store");
        let store = MemoryStore::new();
        let reaper = store.spawn_reaper(MEMORY_REAPER_PERIOD);
        return Ok(StoreHandles {
            store: Arc::new(store.clone()),
            connector: Arc::new(store),
            reaper: Some(reaper),
        });
    }
    connect_remote_store(config).await
}

#[cfg(feature = "etcd")]
async fn connect_remote_store(config: &Config) -> Result<StoreHandles, Box<dyn std::error::Error>> {
    use crate::services::store::{EtcdConnector, split_endpoints};

    let connector = EtcdConnector {
        dial_timeout: Duration::from_secs(config.store.dial_timeout),
        ..Default::default()
    };
    let endpoints = split_endpoints(&config.store.endpoints);
    tracing::info!(endpoints = ?endpoints, "Connecting to etcd");
    let store = connector.connect(&endpoints).await?;
    Ok(StoreHandles {
        store,
        connector: Arc::new(connector),
        reaper: None,
    })
}

#[cfg(not(feature = "etcd"))]
async fn connect_remote_store(config: &Config) -> Result<StoreHandles, Box<dyn std::error::Error>> {
    Err(Box::new(crate::config::ConfigError::Invalid(format!(
        "store endpoints {:?} require the `etcd` feature",
        config.store.endpoints
    ))))
}

/// 组合根：按配置监听目标服务、注册本实例，直到 `shutdown` 完成
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()>,
{
    let handles = connect_store(&config).await?;
    let result = serve(&config, &handles, shutdown).await;
    if let Some(reaper) = &handles.reaper {
        reaper.abort();
    }
    result
}

async fn serve<F>(
    config: &Config,
    handles: &StoreHandles,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()>,
{
    let catalog: Catalog<Channel> = Catalog::with_defaults(
        handles.connector.clone(),
        config.resolver_options(),
        config.balancer.replicas,
    )?;
    let registry = Arc::new(LeaseRegistry::new(
        handles.store.clone(),
        config.registry_options(),
    )?);
    catalog.register_registry(LEASE_REGISTRY, registry.clone())?;

    // 先完成所有查找，失败时不会留下已注册的实例
    let watcher = match &config.resolver.target {
        Some(target) => {
            let balancer = catalog.balancer(&config.balancer.policy)?;
            let manager = GrpcClientManager::new(balancer, config.client_manager_config());
            let (tx, rx) = mpsc::unbounded_channel();
            let listener = manager.spawn_address_listener(rx);
            let resolver = catalog.build_resolver(target, Arc::new(tx))?;
            tracing::info!(
                target = %target,
                balancer = manager.balancer_name(),
                "Watching target service"
            );
            Some((resolver, listener))
        }
        None => None,
    };

    if let Some(instance) = config.service_instance() {
        catalog.registry(LEASE_REGISTRY)?.register(&instance).await?;
    }

    shutdown.await;
    tracing::info!("Shutting down...");

    if let Some((resolver, listener)) = watcher {
        resolver.close();
        drop(resolver);
        if let Err(e) = listener.await {
            tracing::warn!(error = %e, "Address listener terminated abnormally");
        }
    }

    registry.shutdown().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
