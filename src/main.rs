#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    grpc_lb::server::init_tracing();
    tracing::info!("Starting service discovery node...");
    grpc_lb::server::start().await?;
    Ok(())
}
