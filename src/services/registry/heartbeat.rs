use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::PutHandler;
use crate::services::store::{CoordinationStore, LeaseId, StoreError};

// 单个注册键的心跳任务句柄
#[derive(Debug)]
pub(crate) struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    lease: Arc<AtomicI64>,
}

impl HeartbeatHandle {
    /// 当前持有的租约（心跳可能重新申请过）
    pub(crate) fn lease(&self) -> LeaseId {
        self.lease.load(Ordering::SeqCst)
    }

    /// 只通知停止，不等待
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 通知停止并等待任务退出，返回最后持有的租约
    pub(crate) async fn stop(self) -> LeaseId {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Heartbeat task terminated abnormally");
        }
        self.lease.load(Ordering::SeqCst)
    }
}

pub(crate) struct Heartbeat {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) ttl_secs: i64,
    pub(crate) interval: Duration,
    pub(crate) put_handler: Option<PutHandler>,
}

impl Heartbeat {
    pub(crate) fn spawn(self, lease: LeaseId, tracker: &TaskTracker) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let lease = Arc::new(AtomicI64::new(lease));

        let task = tracker.spawn(self.run(cancel.clone(), lease.clone()));

        HeartbeatHandle { cancel, task, lease }
    }

    async fn run(self, cancel: CancellationToken, lease: Arc<AtomicI64>) {
        // 第一次心跳在一个周期之后
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            key = %self.key,
            interval_secs = self.interval.as_secs_f64(),
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = self.beat(&lease).await;
                    match &result {
                        Ok(()) => tracing::trace!(key = %self.key, "Heartbeat OK"),
                        Err(e) => tracing::warn!(
                            key = %self.key,
                            error = %e,
                            "Heartbeat failed, will retry on next tick"
                        ),
                    }
                    if let Some(handler) = &self.put_handler {
                        handler(&self.key, result.as_ref().map(|_| ()));
                    }
                }
            }
        }

        tracing::debug!(key = %self.key, "Heartbeat stopped");
    }

    // 续约并重写键值；租约已过期时重新申请
    async fn beat(&self, lease: &AtomicI64) -> Result<(), StoreError> {
        let current = lease.load(Ordering::SeqCst);
        let renewed = match self.store.keep_alive(current).await {
            Ok(_) => self.store.put(&self.key, &self.value, Some(current)).await,
            Err(e) => Err(e),
        };

        match renewed {
            Err(StoreError::LeaseNotFound(expired)) => {
                tracing::warn!(
                    key = %self.key,
                    lease_id = expired,
                    "Registration lease expired, granting a new one"
                );
                let fresh = self.store.grant_lease(self.ttl_secs).await?;
                lease.store(fresh, Ordering::SeqCst);
                self.store.put(&self.key, &self.value, Some(fresh)).await
            }
            other => other,
        }
    }
}
