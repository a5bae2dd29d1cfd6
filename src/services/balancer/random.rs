use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::{PickError, PickInfo, Picked, Picker, PickerBuilder, ReadySnapshot, sorted_connections};

pub const NAME: &str = "random";

/// 随机均匀选择
#[derive(Debug, Default, Clone)]
pub struct RandomBuilder;

impl<C> PickerBuilder<C> for RandomBuilder
where
    C: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        NAME
    }

    fn build(&self, ready: &ReadySnapshot<C>) -> Arc<dyn Picker<C>> {
        Arc::new(RandomPicker::new(ready, rand::random()))
    }
}

#[derive(Debug)]
pub struct RandomPicker<C> {
    conns: Vec<(String, C)>,
    seed: u64,
    draws: AtomicU64,
}

impl<C: Clone> RandomPicker<C> {
    pub fn new(ready: &ReadySnapshot<C>, seed: u64) -> Self {
        Self {
            conns: sorted_connections(ready),
            seed,
            draws: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<C> Picker<C> for RandomPicker<C>
where
    C: Clone + Send + Sync,
{
    fn pick(&self, _info: &PickInfo) -> Result<Picked<C>, PickError> {
        if self.conns.is_empty() {
            return Err(PickError::NoConnectionAvailable);
        }
        // 每次抽样派生独立的随机源，无需加锁
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed ^ draw.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let (address, connection) = &self.conns[rng.gen_range(0..self.conns.len())];
        Ok(Picked {
            address: address.clone(),
            connection: connection.clone(),
        })
    }
}
