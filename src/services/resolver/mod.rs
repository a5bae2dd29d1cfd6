//! Address resolver module
//!
//! - `types`: targets, addresses, resolver traits and options
//! - `address_set`: single-writer address set maintained from watch events
//! - `store_resolver`: coordination-store watch resolver (`etcd` scheme)
//! - `list`: static comma-separated list resolver (`list` scheme)

pub mod address_set;
pub mod list;
pub mod store_resolver;
pub mod types;

pub use address_set::AddressSet;
pub use list::{ListResolver, ListResolverBuilder};
pub use store_resolver::{StoreResolver, StoreResolverBuilder};
pub use types::*;
