//! Coordination store module
//!
//! - `types`: store trait, events and errors
//! - `memory`: in-process store with leases and prefix watch
//! - `etcd`: etcd-backed store (feature `etcd`)

pub mod memory;
pub mod types;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use memory::MemoryStore;
pub use types::*;

#[cfg(feature = "etcd")]
pub use etcd::{EtcdConnector, EtcdStore};
