//! Basic registry server example
//!
//! Run with: cargo run -p registry-manifests --example basic_server

use registry_manifests::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let storage = MemoryStorage::with_buckets(&["registry"]);

    let app = RegistryBuilder::new(storage.into())
        .bucket("registry")
        .sync_concurrency(4)
        .build();

    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Registry listening on http://{}", addr);
    tracing::info!("Try: curl -i http://{}/v2/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
