use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};

use super::balancer::{PickError, PickInfo, Picked, Picker, PickerBuilder};
use super::resolver::Address;

pub type ClientPool = Arc<RwLock<HashMap<String, Channel>>>;

/// 客户端管理器错误类型
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid URI {uri}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// 连接管理配置
#[derive(Debug, Clone)]
pub struct ClientManagerConfig {
    pub connect_timeout: Duration,
    /// 地址前拼接的 URI scheme
    pub uri_scheme: String,
}

impl Default for ClientManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            uri_scheme: "http".to_string(),
        }
    }
}

/// 最小的连接管理器：每个地址一个懒连接的 `Channel`，
/// 地址集合变化时用当前快照重建 picker。
#[derive(Clone)]
pub struct GrpcClientManager {
    clients: ClientPool,
    builder: Arc<dyn PickerBuilder<Channel>>,
    picker: Arc<RwLock<Arc<dyn Picker<Channel>>>>,
    config: ClientManagerConfig,
}

impl std::fmt::Debug for GrpcClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcClientManager")
            .field("balancer", &self.builder.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GrpcClientManager {
    pub fn new(builder: Arc<dyn PickerBuilder<Channel>>, config: ClientManagerConfig) -> Self {
        let picker = builder.build(&HashMap::new());
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            builder,
            picker: Arc::new(RwLock::new(picker)),
            config,
        }
    }

    pub fn balancer_name(&self) -> &'static str {
        self.builder.name()
    }

    /// 使用当前 picker 选择一个连接
    pub async fn pick(&self, info: &PickInfo) -> Result<Picked<Channel>, PickError> {
        let picker = self.picker.read().await.clone();
        picker.pick(info)
    }

    /// 当前持有连接的地址
    pub async fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.clients.read().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub async fn get_or_create_client(&self, address: &str) -> Result<Channel, ClientError> {
        // 先尝试从缓存获取客户端
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(address) {
                return Ok(client.clone());
            }
        }

        // 缓存中没有，创建新的懒连接
        let uri = format!("{}://{}", self.config.uri_scheme, address);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|source| ClientError::InvalidUri { uri, source })?
            .connect_timeout(self.config.connect_timeout);
        let channel = endpoint.connect_lazy();

        let mut clients = self.clients.write().await;
        let channel = clients.entry(address.to_string()).or_insert(channel).clone();

        tracing::info!(address = %address, "Created gRPC client channel");
        Ok(channel)
    }

    pub async fn remove_client(&self, address: &str) {
        let mut clients = self.clients.write().await;
        if clients.remove(address).is_some() {
            tracing::info!(address = %address, "Removed gRPC client channel");
        }
    }

    pub async fn clear_all(&self) {
        let count = {
            let mut clients = self.clients.write().await;
            let count = clients.len();
            clients.clear();
            count
        };
        self.rebuild_picker().await;
        tracing::info!(count = count, "Cleared gRPC client channels");
    }

    /// 与 resolver 推送的完整地址列表对齐，并重建 picker
    pub async fn update_addresses(&self, addresses: Vec<Address>) {
        let wanted: HashSet<String> = addresses.into_iter().map(|a| a.addr).collect();

        let stale: Vec<String> = {
            let clients = self.clients.read().await;
            clients
                .keys()
                .filter(|addr| !wanted.contains(*addr))
                .cloned()
                .collect()
        };
        for addr in stale {
            self.remove_client(&addr).await;
        }

        for addr in &wanted {
            if let Err(e) = self.get_or_create_client(addr).await {
                tracing::warn!(address = %addr, error = %e, "Skipping unusable address");
            }
        }

        self.rebuild_picker().await;
    }

    async fn rebuild_picker(&self) {
        let snapshot = self.clients.read().await.clone();
        let picker = self.builder.build(&snapshot);
        *self.picker.write().await = picker;
        tracing::debug!(
            balancer = self.builder.name(),
            ready = snapshot.len(),
            "Rebuilt picker from connection snapshot"
        );
    }

    /// 消费 resolver 推送的地址列表，直到发送端关闭
    pub fn spawn_address_listener(&self, mut updates: mpsc::UnboundedReceiver<Vec<Address>>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(addresses) = updates.recv().await {
                manager.update_addresses(addresses).await;
            }
            tracing::debug!("Address update channel closed");
        })
    }
}
