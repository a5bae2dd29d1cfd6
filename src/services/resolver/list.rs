use std::sync::Arc;

use super::types::{Address, AddressSink, Resolver, ResolverBuilder, ResolverError, Target};
use crate::services::store::split_endpoints;

pub const SCHEME: &str = "list";

/// 静态地址列表：`list://10.0.0.1:9000,10.0.0.2:9000/service`
#[derive(Debug, Default, Clone)]
pub struct ListResolverBuilder;

impl ResolverBuilder for ListResolverBuilder {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn build(
        &self,
        target: &Target,
        sink: Arc<dyn AddressSink>,
    ) -> Result<Box<dyn Resolver>, ResolverError> {
        let addresses: Vec<Address> = split_endpoints(&target.authority)
            .into_iter()
            .map(|addr| Address::new(addr, target.endpoint.clone()))
            .collect();
        if addresses.is_empty() {
            return Err(ResolverError::InvalidTarget(format!(
                "no addresses in {target}"
            )));
        }

        tracing::debug!(target = %target, count = addresses.len(), "Resolved static address list");
        sink.update_addresses(addresses);
        Ok(Box::new(ListResolver))
    }
}

/// 地址固定，无需后台任务
#[derive(Debug)]
pub struct ListResolver;

impl Resolver for ListResolver {
    fn resolve_now(&self) {}

    fn close(&self) {}
}
