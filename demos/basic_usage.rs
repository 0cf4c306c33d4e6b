//! Basic usage example for Stowage
//!
//! This example demonstrates:
//! - Loading configuration from `stowage.toml` / `STOWAGE_*` environment variables
//! - Writing, reading and listing objects on a local store
//! - Optimistic concurrency with `put_if_match`
//! - Streaming writes
//! - Registering several backends with a `StorageManager`
//!
//! Run with: cargo run --example basic_usage
//!
//! Set `RUST_LOG=stowage=debug` to see retry and backend logs.

use std::path::Path;
use std::sync::Arc;

use stowage::{MemoryBackend, StorageManager, StoreConfig, Tags};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("📦 Stowage - Basic Usage Example\n");

    let config_file = Path::new("stowage.toml");
    let mut config = StoreConfig::load(config_file.exists().then_some(config_file))?;
    if std::env::var_os("STOWAGE_ROOT_PATH").is_none() && !config_file.exists() {
        config.root_path = std::env::temp_dir().join("stowage-demo");
    }
    println!("Store root: {}", config.root_path.display());

    let client = stowage::open_local(&config).await?;

    // ==================== Object Operations ====================

    println!("\n📤 Uploading 'notes/hello.txt'...");
    let meta = client.put("notes/hello.txt", "Hello, Stowage!").await?;
    println!("   ✅ {} ({}, {})", meta.key, meta.human_readable_size(), meta.content_hash);

    let mut tags = Tags::new();
    tags.insert("content-type".to_string(), "text/csv".to_string());
    client
        .put_with_tags("reports/2024/q1.csv", "region,total\nnorth,42\n", tags)
        .await?;

    println!("\n📥 Downloading 'notes/hello.txt'...");
    let object = client.get("notes/hello.txt").await?;
    println!("   {}", String::from_utf8_lossy(&object.body));

    // ==================== Conditional Writes ====================

    println!("\n🔒 Conditional update...");
    let updated = client
        .put_if_match("notes/hello.txt", "Hello again!", &object.metadata.content_hash)
        .await?;
    match client
        .put_if_match("notes/hello.txt", "Stale write", &object.metadata.content_hash)
        .await
    {
        Ok(_) => println!("   ⚠️  stale write unexpectedly accepted"),
        Err(e) => println!("   ✅ stale write rejected: {}", e),
    }
    println!("   current hash: {}", updated.content_hash);

    // ==================== Streaming ====================

    println!("\n🌊 Streaming write...");
    let mut writer = client.writer("logs/app.log", Tags::new()).await?;
    for line in 0..5 {
        writer.write(format!("line {}\n", line)).await?;
    }
    let log = writer.commit().await?;
    println!("   ✅ committed {} bytes", log.size_bytes);

    // ==================== Listing ====================

    println!("\n📋 Listing all objects...");
    for meta in client.list_all("").await? {
        println!("   - {} ({})", meta.key, meta.human_readable_size());
    }

    // ==================== Multiple Backends ====================

    println!("\n🗂️  Registering backends...");
    let manager = StorageManager::new(&config);
    manager.register("local", client.backend().clone())?;
    manager.register("scratch", Arc::new(MemoryBackend::new()))?;
    for name in manager.names() {
        let count = manager.client(&name)?.list_all("").await?.len();
        println!("   - {}: {} objects", name, count);
    }

    // ==================== Cleanup ====================

    println!("\n🗑️  Deleting objects...");
    for key in ["notes/hello.txt", "reports/2024/q1.csv", "logs/app.log"] {
        client.delete(key).await?;
    }
    println!("   ✅ Done");

    Ok(())
}
