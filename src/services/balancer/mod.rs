//! Balancer module
//!
//! - `types`: picker/builder traits and per-call pick info
//! - `hash_ring`: consistent hash ring
//! - `random`: uniform random picker
//! - `consistent_hash`: hash-ring picker with routing-key support

pub mod consistent_hash;
pub mod hash_ring;
pub mod random;
pub mod types;

pub use consistent_hash::{ConsistentHashBuilder, ConsistentHashPicker};
pub use hash_ring::{DEFAULT_REPLICAS, HashRing};
pub use random::{RandomBuilder, RandomPicker};
pub use types::*;
