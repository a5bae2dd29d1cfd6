use std::time::Duration;

use grpc_lb::config::Config;

#[tokio::test]
async fn test_run_with_memory_store() {
    let config = Config::from_toml(
        r#"
        [registry]
        key_ttl = 10
        heartbeat_interval = 3

        [resolver]
        target = "list://127.0.0.1:50051,127.0.0.1:50052/x"

        [balancer]
        policy = "consistent_hash"

        [instance]
        service_name = "x"
        address = "127.0.0.1:50051"
        "#,
    )
    .unwrap();
    config.validate().unwrap();

    let result = grpc_lb::server::run(config, tokio::time::sleep(Duration::from_millis(50))).await;
    assert!(result.is_ok(), "run failed: {:?}", result.err());
}

#[tokio::test]
async fn test_run_rejects_unknown_policy() {
    let config = Config::from_toml(
        r#"
        [resolver]
        target = "list://127.0.0.1:50051/x"

        [balancer]
        policy = "round_robin"

        [instance]
        service_name = "x"
        address = "127.0.0.1:50051"
        "#,
    )
    .unwrap();

    let result = grpc_lb::server::run(config, std::future::ready(())).await;
    assert!(result.is_err());
}

#[cfg(not(feature = "etcd"))]
#[tokio::test]
async fn test_remote_store_requires_etcd_feature() {
    let config = Config::from_toml(
        r#"
        [store]
        endpoints = "127.0.0.1:2379"
        "#,
    )
    .unwrap();

    let result = grpc_lb::server::run(config, std::future::ready(())).await;
    assert!(result.is_err());
}
