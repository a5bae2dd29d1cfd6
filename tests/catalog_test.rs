use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use grpc_lb::config::ConfigError;
use grpc_lb::services::balancer::{PickInfo, Picker, PickerBuilder, RandomBuilder};
use grpc_lb::services::registry::{
    LeaseRegistry, RegistryOptions, ServiceInstance, ServiceRegistry,
};
use grpc_lb::services::resolver::{
    Address, Resolver, ResolverBuilder, ResolverError, ResolverOptions,
};
use grpc_lb::services::store::MemoryStore;
use grpc_lb::services::Catalog;

fn catalog(store: &MemoryStore) -> Catalog<u32> {
    Catalog::with_defaults(Arc::new(store.clone()), ResolverOptions::default(), 20)
        .expect("built-in factories should register")
}

#[test]
fn test_builtin_factories() {
    let catalog = catalog(&MemoryStore::new());

    assert_eq!(catalog.balancer("random").unwrap().name(), "random");
    assert_eq!(
        catalog.balancer("consistent_hash").unwrap().name(),
        "consistent_hash"
    );
    assert_eq!(catalog.resolver("etcd").unwrap().scheme(), "etcd");
    assert_eq!(catalog.resolver("list").unwrap().scheme(), "list");
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let catalog = catalog(&MemoryStore::new());

    let err = catalog.register_balancer(Arc::new(RandomBuilder)).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Duplicate { kind: "balancer", ref name } if name == "random"
    ));

    let store = MemoryStore::new();
    let registry = Arc::new(LeaseRegistry::new(Arc::new(store), RegistryOptions::default()).unwrap());
    catalog.register_registry("lease", registry.clone()).unwrap();
    assert!(matches!(
        catalog.register_registry("lease", registry),
        Err(ConfigError::Duplicate { kind: "registry", .. })
    ));
}

#[test]
fn test_missing_factories() {
    let catalog = catalog(&MemoryStore::new());

    assert!(matches!(
        catalog.balancer("round_robin"),
        Err(ConfigError::Missing { kind: "balancer", .. })
    ));
    assert!(matches!(
        catalog.registry("lease"),
        Err(ConfigError::Missing { kind: "registry", .. })
    ));

    let (tx, _rx) = mpsc::unbounded_channel::<Vec<Address>>();
    assert!(matches!(
        catalog.build_resolver("dns://127.0.0.1/x", Arc::new(tx)),
        Err(ConfigError::Missing { kind: "resolver", .. })
    ));
}

#[test]
fn test_invalid_targets() {
    let catalog = catalog(&MemoryStore::new());
    let (tx, _rx) = mpsc::unbounded_channel::<Vec<Address>>();
    let sink = Arc::new(tx);

    assert!(matches!(
        catalog.build_resolver("no-scheme", sink.clone()),
        Err(ConfigError::Resolver(ResolverError::InvalidTarget(_)))
    ));
    // etcd 目标必须带服务名
    assert!(matches!(
        catalog.build_resolver("etcd://127.0.0.1:2379/", sink.clone()),
        Err(ConfigError::Resolver(ResolverError::InvalidTarget(_)))
    ));
    assert!(matches!(
        catalog.build_resolver("list:///x", sink),
        Err(ConfigError::Resolver(ResolverError::InvalidTarget(_)))
    ));
}

#[test]
fn test_list_resolver_pushes_once() {
    let catalog = catalog(&MemoryStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Address>>();

    let resolver = catalog
        .build_resolver("list://10.0.0.2:9000, 10.0.0.1:9000/x", Arc::new(tx))
        .unwrap();
    let list = rx.try_recv().unwrap();
    assert_eq!(
        list,
        vec![Address::new("10.0.0.2:9000", "x"), Address::new("10.0.0.1:9000", "x")]
    );

    resolver.resolve_now();
    resolver.close();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_registry_and_resolver_through_catalog() {
    let store = MemoryStore::new();
    let catalog = catalog(&store);
    let registry = Arc::new(
        LeaseRegistry::builder(Arc::new(store.clone()))
            .key_ttl(Duration::from_secs(10))
            .heartbeat_interval(Duration::from_secs(3))
            .build()
            .unwrap(),
    );
    catalog.register_registry("lease", registry.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Address>>();
    let resolver = catalog
        .build_resolver("etcd://memory/x", Arc::new(tx))
        .unwrap();

    let instance = ServiceInstance::new("x", "10.0.0.1:9000");
    catalog.registry("lease").unwrap().register(&instance).await.unwrap();

    let list = timeout(Duration::from_secs(5), async {
        loop {
            let list = rx.recv().await.unwrap();
            if !list.is_empty() {
                return list;
            }
        }
    })
    .await
    .expect("timed out waiting for registered address");
    assert_eq!(list, vec![Address::new("10.0.0.1:9000", "x")]);

    // 使用选择器选中刚注册的地址
    let ready: HashMap<String, u32> = list.iter().map(|a| (a.addr.clone(), 1u32)).collect();
    let picker = catalog.balancer("consistent_hash").unwrap().build(&ready);
    let picked = picker.pick(&PickInfo::with_routing_key("user-42")).unwrap();
    assert_eq!(picked.address, "10.0.0.1:9000");

    resolver.close();
    registry.shutdown().await.unwrap();
}
