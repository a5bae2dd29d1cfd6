use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::sync::{Notify, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::address_set::AddressSet;
use super::types::{
    AddressSink, InitialFetchPolicy, Resolver, ResolverBuilder, ResolverError, ResolverOptions,
    ResolverState, Target, is_service_key,
};
use crate::services::store::{
    CoordinationStore, EndpointParser, KeyValue, StoreConnector, WatchEvent, WatchStream,
    default_endpoint_parser,
};

pub const SCHEME: &str = "etcd";

/// 基于协调存储 watch 的解析器工厂
pub struct StoreResolverBuilder {
    connector: Arc<dyn StoreConnector>,
    options: ResolverOptions,
    endpoint_parser: EndpointParser,
}

impl StoreResolverBuilder {
    pub fn new(connector: Arc<dyn StoreConnector>, options: ResolverOptions) -> Self {
        Self {
            connector,
            options,
            endpoint_parser: default_endpoint_parser(),
        }
    }

    pub fn endpoint_parser<F>(mut self, parser: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.endpoint_parser = Arc::new(parser);
        self
    }
}

impl ResolverBuilder for StoreResolverBuilder {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn build(
        &self,
        target: &Target,
        sink: Arc<dyn AddressSink>,
    ) -> Result<Box<dyn Resolver>, ResolverError> {
        if target.endpoint.is_empty() {
            return Err(ResolverError::InvalidTarget(format!(
                "missing service name in {target}"
            )));
        }
        let endpoints = (self.endpoint_parser)(&target.authority);
        Ok(Box::new(StoreResolver::start(
            self.connector.clone(),
            endpoints,
            target.endpoint.clone(),
            sink,
            self.options.clone(),
        )))
    }
}

/// 监听某个服务的地址变化
///
/// 后台任务依次经历 `Created -> Initializing -> Watching -> Closed`，
/// 每处理完一批事件就把完整地址列表推送给 `AddressSink`。
#[derive(Debug)]
pub struct StoreResolver {
    service: String,
    cancel: CancellationToken,
    resolve_now: Arc<Notify>,
    state: watch::Receiver<ResolverState>,
}

impl StoreResolver {
    pub fn start(
        connector: Arc<dyn StoreConnector>,
        endpoints: Vec<String>,
        service: impl Into<String>,
        sink: Arc<dyn AddressSink>,
        options: ResolverOptions,
    ) -> Self {
        let service = service.into();
        let (state_tx, state_rx) = watch::channel(ResolverState::Created);
        let cancel = CancellationToken::new();
        let resolve_now = Arc::new(Notify::new());

        let task = WatchTask {
            prefix: options.service_prefix(&service),
            service: service.clone(),
            connector,
            endpoints,
            sink,
            addrs: AddressSet::new(),
            options,
            state: state_tx,
            cancel: cancel.clone(),
            resolve_now: resolve_now.clone(),
        };
        tokio::spawn(task.run());

        Self {
            service,
            cancel,
            resolve_now,
            state: state_rx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ResolverState> {
        self.state.clone()
    }

    /// 等待进入指定状态（或已关闭）
    pub async fn wait_for_state(&self, wanted: ResolverState) -> ResolverState {
        let mut rx = self.state.clone();
        match rx
            .wait_for(|state| *state == wanted || *state == ResolverState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => ResolverState::Closed,
        }
    }

    /// 关闭并等待后台任务退出
    pub async fn shutdown(&self) {
        self.close();
        self.wait_for_state(ResolverState::Closed).await;
    }
}

impl Resolver for StoreResolver {
    fn resolve_now(&self) {
        self.resolve_now.notify_one();
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StoreResolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// 后台 watch 任务，地址集合的唯一写者
struct WatchTask {
    service: String,
    prefix: String,
    connector: Arc<dyn StoreConnector>,
    endpoints: Vec<String>,
    sink: Arc<dyn AddressSink>,
    addrs: AddressSet,
    options: ResolverOptions,
    state: watch::Sender<ResolverState>,
    cancel: CancellationToken,
    resolve_now: Arc<Notify>,
}

impl WatchTask {
    async fn run(mut self) {
        self.set_state(ResolverState::Initializing);

        if let Some(store) = self.connect().await {
            let stream = self.initialize(store.as_ref()).await;
            if !self.cancel.is_cancelled() {
                self.set_state(ResolverState::Watching);
                self.watch(store.as_ref(), stream).await;
            }
        }

        self.set_state(ResolverState::Closed);
        tracing::info!(service_name = %self.service, "Resolver closed");
    }

    fn set_state(&self, state: ResolverState) {
        tracing::debug!(service_name = %self.service, state = ?state, "Resolver state changed");
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Option<Arc<dyn CoordinationStore>> {
        let mut backoff = self.options.backoff();
        loop {
            match self.connector.connect(&self.endpoints).await {
                Ok(store) => return Some(store),
                Err(e) => {
                    let delay = self.next_delay(&mut backoff);
                    tracing::warn!(
                        service_name = %self.service,
                        endpoints = ?self.endpoints,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to connect to store, retrying"
                    );
                    if !self.sleep_or_cancel(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    // 先建立 watch 再全量拉取，两者之间的事件不会丢失
    async fn initialize(&mut self, store: &dyn CoordinationStore) -> Option<WatchStream> {
        let stream = match store.watch_prefix(&self.prefix).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(service_name = %self.service, error = %e, "Failed to open watch");
                None
            }
        };

        let mut backoff = self.options.backoff();
        loop {
            match store.get_prefix(&self.prefix).await {
                Ok(kvs) => {
                    self.addrs = self.owned_addresses(&kvs);
                    tracing::info!(
                        service_name = %self.service,
                        addresses = self.addrs.len(),
                        "Initial address fetch complete"
                    );
                    self.push();
                    break;
                }
                Err(e) => match self.options.initial_fetch {
                    InitialFetchPolicy::Proceed => {
                        tracing::warn!(
                            service_name = %self.service,
                            error = %e,
                            "Initial address fetch failed, watching with an empty set"
                        );
                        break;
                    }
                    InitialFetchPolicy::Retry => {
                        let delay = self.next_delay(&mut backoff);
                        tracing::warn!(
                            service_name = %self.service,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Initial address fetch failed, retrying"
                        );
                        if !self.sleep_or_cancel(delay).await {
                            break;
                        }
                    }
                },
            }
        }

        stream
    }

    async fn watch(&mut self, store: &dyn CoordinationStore, stream: Option<WatchStream>) {
        let cancel = self.cancel.clone();
        let resolve_now = self.resolve_now.clone();
        let mut backoff = self.options.backoff();
        let mut pending = stream;

        loop {
            let mut current = match pending.take() {
                Some(stream) => stream,
                None => match self.reopen(store, &mut backoff).await {
                    Some(stream) => stream,
                    None => return,
                },
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = resolve_now.notified() => self.resync(store).await,
                    batch = current.next() => match batch {
                        Some(Ok(events)) => {
                            backoff.reset();
                            self.apply_batch(&events);
                        }
                        Some(Err(e)) => {
                            tracing::error!(
                                service_name = %self.service,
                                error = %e,
                                "Watch error, reconnecting..."
                            );
                            break;
                        }
                        None => {
                            tracing::warn!(
                                service_name = %self.service,
                                "Watch stream ended, reconnecting..."
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    // 退避后重新建立 watch，并全量同步补上断开期间的变化
    async fn reopen(
        &mut self,
        store: &dyn CoordinationStore,
        backoff: &mut ExponentialBackoff,
    ) -> Option<WatchStream> {
        loop {
            let delay = self.next_delay(backoff);
            if !self.sleep_or_cancel(delay).await {
                return None;
            }
            match store.watch_prefix(&self.prefix).await {
                Ok(stream) => {
                    tracing::info!(service_name = %self.service, "Watch re-established");
                    self.resync(store).await;
                    return Some(stream);
                }
                Err(e) => tracing::warn!(
                    service_name = %self.service,
                    error = %e,
                    "Failed to re-establish watch"
                ),
            }
        }
    }

    async fn resync(&mut self, store: &dyn CoordinationStore) {
        match store.get_prefix(&self.prefix).await {
            Ok(kvs) => {
                self.addrs = self.owned_addresses(&kvs);
                tracing::debug!(
                    service_name = %self.service,
                    addresses = self.addrs.len(),
                    "Resolver resynced from store"
                );
                self.push();
            }
            Err(e) => tracing::warn!(
                service_name = %self.service,
                error = %e,
                "Resync failed, keeping current addresses"
            ),
        }
    }

    fn owned_addresses(&self, kvs: &[KeyValue]) -> AddressSet {
        AddressSet::from_kvs(kvs.iter().filter(|kv| is_service_key(&self.prefix, &kv.key)))
    }

    fn apply_batch(&mut self, events: &[WatchEvent]) {
        let owned: Vec<&WatchEvent> = events
            .iter()
            .filter(|event| is_service_key(&self.prefix, &event.key))
            .collect();
        if owned.is_empty() {
            return;
        }
        for event in owned {
            if self.addrs.apply(event) {
                tracing::debug!(
                    service_name = %self.service,
                    kind = ?event.kind,
                    key = %event.key,
                    "Applied address change"
                );
            }
        }
        self.push();
    }

    fn push(&self) {
        let addresses = self.addrs.addresses(&self.service);
        tracing::debug!(
            service_name = %self.service,
            count = addresses.len(),
            "Pushing address list"
        );
        self.sink.update_addresses(addresses);
    }

    fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        backoff.next_backoff().unwrap_or(self.options.backoff_max)
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
