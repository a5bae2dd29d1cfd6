pub mod balancer;
pub mod catalog;
pub mod client_manager;
pub mod registry;
pub mod resolver;
pub mod store;

pub use catalog::Catalog;
pub use client_manager::{ClientManagerConfig, GrpcClientManager};
pub use registry::{LeaseRegistry, ServiceInstance, ServiceRegistry};
pub use resolver::{Address, AddressSink, Resolver, StoreResolver, Target};
pub use store::{CoordinationStore, MemoryStore, StoreConnector};
