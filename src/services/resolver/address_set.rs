use std::collections::{BTreeMap, BTreeSet};

use super::types::Address;
use crate::services::store::{KeyValue, WatchEvent, WatchEventKind};

/// 解析器持有的地址集合，只由 watch 任务修改
///
/// 以存储键为索引：同一键上的 Put 覆盖旧地址，Delete 按键移除，
/// 因此不携带值的删除事件也能正确生效。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    entries: BTreeMap<String, String>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kvs<'a>(kvs: impl IntoIterator<Item = &'a KeyValue>) -> Self {
        let entries = kvs
            .into_iter()
            .filter(|kv| !kv.value.is_empty())
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect();
        Self { entries }
    }

    /// 应用单个事件，返回集合是否发生变化
    pub fn apply(&mut self, event: &WatchEvent) -> bool {
        match event.kind {
            WatchEventKind::Put => {
                if event.value.is_empty() {
                    return self.entries.remove(&event.key).is_some();
                }
                self.entries.insert(event.key.clone(), event.value.clone()).as_deref()
                    != Some(event.value.as_str())
            }
            WatchEventKind::Delete => self.entries.remove(&event.key).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.entries.values().any(|v| v == addr)
    }

    /// 去重并排序后的地址列表
    pub fn addresses(&self, server_name: &str) -> Vec<Address> {
        self.entries
            .values()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|addr| Address::new(addr.clone(), server_name))
            .collect()
    }
}
