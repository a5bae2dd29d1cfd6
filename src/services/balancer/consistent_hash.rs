use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::hash_ring::{DEFAULT_REPLICAS, HashRing};
use super::types::{PickError, PickInfo, Picked, Picker, PickerBuilder, ReadySnapshot};

pub const NAME: &str = "consistent_hash";

/// 一致性哈希选择器构建器
#[derive(Debug, Clone)]
pub struct ConsistentHashBuilder {
    replicas: usize,
}

impl Default for ConsistentHashBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl ConsistentHashBuilder {
    pub fn new(replicas: usize) -> Self {
        Self { replicas }
    }
}

impl<C> PickerBuilder<C> for ConsistentHashBuilder
where
    C: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&self, ready: &ReadySnapshot<C>) -> Arc<dyn Picker<C>> {
        Arc::new(ConsistentHashPicker::new(ready, self.replicas))
    }
}

#[derive(Debug)]
pub struct ConsistentHashPicker<C> {
    ring: HashRing,
    conns: HashMap<String, C>,
    // 没有路由键时的计数器
    fallback_seq: AtomicU64,
}

impl<C: Clone> ConsistentHashPicker<C> {
    pub fn new(ready: &ReadySnapshot<C>, replicas: usize) -> Self {
        Self {
            ring: HashRing::with_addresses(replicas, ready.keys().cloned()),
            conns: ready.clone(),
            fallback_seq: AtomicU64::new(0),
        }
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }
}

impl<C> Picker<C> for ConsistentHashPicker<C>
where
    C: Clone + Send + Sync,
{
    fn pick(&self, info: &PickInfo) -> Result<Picked<C>, PickError> {
        if self.ring.is_empty() {
            return Err(PickError::NoConnectionAvailable);
        }

        let owner = match info.routing_key.as_deref() {
            Some(key) => self.ring.get(key),
            None => {
                let seq = self.fallback_seq.fetch_add(1, Ordering::Relaxed);
                self.ring.get(&seq.to_string())
            }
        }
        .ok_or(PickError::NoConnectionAvailable)?;

        let connection = self
            .conns
            .get(owner)
            .cloned()
            .ok_or(PickError::NoConnectionAvailable)?;

        Ok(Picked {
            address: owner.to_string(),
            connection,
        })
    }
}
