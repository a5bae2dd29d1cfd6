use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// 选择连接失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PickError {
    #[error("No connection available")]
    NoConnectionAvailable,
}

/// 每次调用的选择参数
///
/// `routing_key` 存在时作为一致性哈希的输入，缺省时按计数器分散。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PickInfo {
    pub routing_key: Option<String>,
    pub call_seq: u64,
}

impl PickInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_key(key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(key.into()),
            call_seq: 0,
        }
    }

    pub fn call_seq(mut self, seq: u64) -> Self {
        self.call_seq = seq;
        self
    }
}

/// 选中的连接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picked<C> {
    pub address: String,
    pub connection: C,
}

/// 就绪连接快照：地址 -> 连接句柄
pub type ReadySnapshot<C> = HashMap<String, C>;

/// 基于快照的单次调用选择策略，构建后不可变
pub trait Picker<C>: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<Picked<C>, PickError>;
}

/// 每当就绪连接集合变化时由连接管理器调用
pub trait PickerBuilder<C>: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, ready: &ReadySnapshot<C>) -> Arc<dyn Picker<C>>;
}

/// 按地址排序，保证相同快照得到相同的选择行为
pub(crate) fn sorted_connections<C: Clone>(ready: &ReadySnapshot<C>) -> Vec<(String, C)> {
    let mut conns: Vec<(String, C)> = ready
        .iter()
        .map(|(addr, conn)| (addr.clone(), conn.clone()))
        .collect();
    conns.sort_by(|a, b| a.0.cmp(&b.0));
    conns
}
