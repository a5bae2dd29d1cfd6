//! Registry service module
//!
//! This module contains the lease-backed service registry split into logical components:
//! - `types`: instance, options, callbacks and the `ServiceRegistry` trait
//! - `service`: `LeaseRegistry` register/unregister logic
//! - `heartbeat`: cancellable per-registration renewal task

mod heartbeat;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::{LeaseRegistry, LeaseRegistryBuilder};
pub use types::{
    DEFAULT_KEY_PREFIX, DeleteHandler, KvBuilder, PutHandler, RegistryError, RegistryOptions,
    ServiceInstance, ServiceRegistry, default_kv,
};
