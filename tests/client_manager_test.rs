use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use grpc_lb::services::balancer::{ConsistentHashBuilder, PickError, PickInfo, RandomBuilder};
use grpc_lb::services::registry::{LeaseRegistry, ServiceInstance, ServiceRegistry};
use grpc_lb::services::resolver::{Address, ResolverOptions, StoreResolver};
use grpc_lb::services::store::MemoryStore;
use grpc_lb::services::{ClientManagerConfig, GrpcClientManager};

fn address(addr: &str) -> Address {
    Address::new(addr, "x")
}

#[tokio::test]
async fn test_update_addresses_reconciles_channels() {
    let manager = GrpcClientManager::new(Arc::new(RandomBuilder), ClientManagerConfig::default());
    assert_eq!(manager.balancer_name(), "random");
    assert_eq!(
        manager.pick(&PickInfo::new()).await.unwrap_err(),
        PickError::NoConnectionAvailable
    );

    manager
        .update_addresses(vec![address("127.0.0.1:50051"), address("127.0.0.1:50052")])
        .await;
    assert_eq!(manager.addresses().await, vec!["127.0.0.1:50051", "127.0.0.1:50052"]);
    let picked = manager.pick(&PickInfo::new()).await.unwrap();
    assert!(picked.address == "127.0.0.1:50051" || picked.address == "127.0.0.1:50052");

    manager.update_addresses(vec![address("127.0.0.1:50052")]).await;
    assert_eq!(manager.addresses().await, vec!["127.0.0.1:50052"]);
    for _ in 0..10 {
        assert_eq!(
            manager.pick(&PickInfo::new()).await.unwrap().address,
            "127.0.0.1:50052"
        );
    }

    manager.update_addresses(Vec::new()).await;
    assert!(manager.addresses().await.is_empty());
    assert_eq!(
        manager.pick(&PickInfo::new()).await.unwrap_err(),
        PickError::NoConnectionAvailable
    );
}

#[tokio::test]
async fn test_unusable_address_is_skipped() {
    let manager = GrpcClientManager::new(Arc::new(RandomBuilder), ClientManagerConfig::default());

    manager
        .update_addresses(vec![address("bad address"), address("127.0.0.1:50051")])
        .await;

    assert_eq!(manager.addresses().await, vec!["127.0.0.1:50051"]);
    assert!(manager.get_or_create_client("bad address").await.is_err());
}

#[tokio::test]
async fn test_clear_all() {
    let manager = GrpcClientManager::new(
        Arc::new(ConsistentHashBuilder::default()),
        ClientManagerConfig::default(),
    );
    manager.update_addresses(vec![address("127.0.0.1:50051")]).await;
    manager.clear_all().await;

    assert!(manager.addresses().await.is_empty());
    assert!(manager.pick(&PickInfo::with_routing_key("k")).await.is_err());
}

#[tokio::test]
async fn test_registry_to_picker_end_to_end() {
    let store = MemoryStore::new();
    let registry = LeaseRegistry::builder(Arc::new(store.clone()))
        .key_ttl(Duration::from_secs(10))
        .heartbeat_interval(Duration::from_secs(3))
        .build()
        .unwrap();

    let manager = GrpcClientManager::new(
        Arc::new(ConsistentHashBuilder::new(20)),
        ClientManagerConfig::default(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = manager.spawn_address_listener(rx);
    let resolver = StoreResolver::start(
        Arc::new(store.clone()),
        vec!["memory".to_string()],
        "x",
        Arc::new(tx),
        ResolverOptions::default(),
    );

    for addr in ["127.0.0.1:50051", "127.0.0.1:50052", "127.0.0.1:50053"] {
        registry.register(&ServiceInstance::new("x", addr)).await.unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while manager.addresses().await.len() != 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for manager to see all instances");

    let info = PickInfo::with_routing_key("user-42");
    let first = manager.pick(&info).await.unwrap().address;
    for _ in 0..10 {
        assert_eq!(manager.pick(&info).await.unwrap().address, first);
    }

    // 注销选中的实例后，请求落到其他实例
    registry
        .unregister(&ServiceInstance::new("x", first.clone()))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while manager.addresses().await.len() != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for removal");
    assert_ne!(manager.pick(&info).await.unwrap().address, first);

    // 解析器关闭后监听任务随通道关闭而退出
    resolver.shutdown().await;
    drop(resolver);
    timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener should exit")
        .unwrap();

    registry.shutdown().await.unwrap();
}
