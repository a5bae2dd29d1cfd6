use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::balancer::{ConsistentHashBuilder, PickerBuilder, RandomBuilder};
use super::registry::ServiceRegistry;
use super::resolver::{
    AddressSink, ListResolverBuilder, Resolver, ResolverBuilder, ResolverOptions,
    StoreResolverBuilder, Target,
};
use super::store::StoreConnector;
use crate::config::ConfigError;

/// 名称 -> 工厂 的显式注册表，由组合根创建并注入
pub struct Catalog<C> {
    balancers: DashMap<String, Arc<dyn PickerBuilder<C>>>,
    resolvers: DashMap<String, Arc<dyn ResolverBuilder>>,
    registries: DashMap<String, Arc<dyn ServiceRegistry>>,
}

impl<C> Default for Catalog<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Catalog<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("balancers", &sorted_names(&self.balancers))
            .field("resolvers", &sorted_names(&self.resolvers))
            .field("registries", &sorted_names(&self.registries))
            .finish()
    }
}

fn sorted_names<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut names: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

fn insert_unique<V>(
    map: &DashMap<String, V>,
    kind: &'static str,
    name: &str,
    value: V,
) -> Result<(), ConfigError> {
    match map.entry(name.to_string()) {
        Entry::Occupied(_) => Err(ConfigError::Duplicate {
            kind,
            name: name.to_string(),
        }),
        Entry::Vacant(slot) => {
            slot.insert(value);
            tracing::debug!(kind = kind, name = %name, "Registered factory");
            Ok(())
        }
    }
}

fn lookup<V: Clone>(map: &DashMap<String, V>, kind: &'static str, name: &str) -> Result<V, ConfigError> {
    map.get(name)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| ConfigError::Missing {
            kind,
            name: name.to_string(),
        })
}

impl<C> Catalog<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            balancers: DashMap::new(),
            resolvers: DashMap::new(),
            registries: DashMap::new(),
        }
    }

    /// 注册内置的 `random`、`consistent_hash` 选择器以及 `etcd`、`list` 解析器
    pub fn with_defaults(
        connector: Arc<dyn StoreConnector>,
        resolver_options: ResolverOptions,
        replicas: usize,
    ) -> Result<Self, ConfigError> {
        let catalog = Self::new();
        catalog.register_balancer(Arc::new(RandomBuilder))?;
        catalog.register_balancer(Arc::new(ConsistentHashBuilder::new(replicas)))?;
        catalog.register_resolver(Arc::new(StoreResolverBuilder::new(connector, resolver_options)))?;
        catalog.register_resolver(Arc::new(ListResolverBuilder))?;
        Ok(catalog)
    }

    pub fn register_balancer(&self, builder: Arc<dyn PickerBuilder<C>>) -> Result<(), ConfigError> {
        let name = builder.name();
        insert_unique(&self.balancers, "balancer", name, builder)
    }

    pub fn balancer(&self, name: &str) -> Result<Arc<dyn PickerBuilder<C>>, ConfigError> {
        lookup(&self.balancers, "balancer", name)
    }

    pub fn register_resolver(&self, builder: Arc<dyn ResolverBuilder>) -> Result<(), ConfigError> {
        let scheme = builder.scheme();
        insert_unique(&self.resolvers, "resolver", scheme, builder)
    }

    pub fn resolver(&self, scheme: &str) -> Result<Arc<dyn ResolverBuilder>, ConfigError> {
        lookup(&self.resolvers, "resolver", scheme)
    }

    pub fn register_registry(
        &self,
        name: &str,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<(), ConfigError> {
        insert_unique(&self.registries, "registry", name, registry)
    }

    pub fn registry(&self, name: &str) -> Result<Arc<dyn ServiceRegistry>, ConfigError> {
        lookup(&self.registries, "registry", name)
    }

    /// 解析 `scheme://authority/endpoint` 并交给对应 scheme 的解析器
    pub fn build_resolver(
        &self,
        target: &str,
        sink: Arc<dyn AddressSink>,
    ) -> Result<Box<dyn Resolver>, ConfigError> {
        let target = Target::parse(target)?;
        let builder = self.resolver(&target.scheme)?;
        Ok(builder.build(&target, sink)?)
    }
}
