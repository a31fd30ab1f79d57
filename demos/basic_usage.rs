//! Basic FastDFS Client Usage Example
//!
//! This example demonstrates the fundamental operations of the FastDFS client:
//! - Uploading files from buffers, with metadata
//! - Appending to an appender file
//! - Downloading files, whole and in part
//! - Getting file information and public URLs
//! - Deleting files
//!
//! Run this example with:
//! ```bash
//! FASTDFS_TRACKER_ADDR=192.168.1.100:22122 RUST_LOG=fdfs=debug cargo run --example basic_usage
//! ```

use fdfs::{Client, ClientConfig, Metadata, ModifyMode, ServerEndpoint};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Step 1: Configure the client
    let tracker: ServerEndpoint = std::env::var("FASTDFS_TRACKER_ADDR")
        .unwrap_or_else(|_| "192.168.1.100:22122".to_string())
        .parse()?;
    let config = ClientConfig::new(tracker.host(), tracker.port())
        .with_domain("http://static.example.com")
        .with_max_conns(10)
        .with_connect_timeout(5000)
        .with_network_timeout(30000);
    let client = Client::new(config)?;

    // Example 1: Upload from buffer with metadata
    println!("1. Uploading data from buffer...");
    let mut metadata = Metadata::new();
    metadata.insert("author".to_string(), "demo".to_string());
    let file = client
        .upload_buffer(b"Hello, FastDFS!", Some("txt"), None, Some(&metadata))
        .await?;
    println!("   File ID: {}", file.file_id());
    if let Some(url) = client.public_url(&file.filename, Some(&file.group_name)) {
        println!("   Public URL: {}", url);
    }

    // Example 2: Download, whole and partial
    println!("2. Downloading file...");
    let data = client.download(&file.filename, Some(&file.group_name), 0, 0).await?;
    println!("   Content: {}", String::from_utf8_lossy(&data));
    let part = client.download(&file.filename, Some(&file.group_name), 7, 7).await?;
    println!("   Bytes 7..14: {}", String::from_utf8_lossy(&part));

    // Example 3: File information and metadata
    println!("3. Getting file information...");
    let info = client.get_file_info(&file.filename, Some(&file.group_name)).await?;
    println!("   File size: {} bytes", info.file_size);
    println!("   CRC32: {:08x}", info.crc32);
    println!("   Source IP: {}", info.source_ip_addr);
    let stored = client.get_metadata(&file.filename, Some(&file.group_name)).await?;
    println!("   Metadata: {:?}", stored);

    // Example 4: Appender file
    println!("4. Appending to an appender file...");
    let log = client
        .upload_appender_buffer(b"first line\n", Some("log"), None, None)
        .await?;
    client
        .modify_buffer(b"second line\n", &log.filename, Some(&log.group_name), ModifyMode::Append)
        .await?;
    let content = client.download(&log.filename, Some(&log.group_name), 0, 0).await?;
    print!("{}", String::from_utf8_lossy(&content));

    // Example 5: Delete files
    println!("5. Deleting files...");
    for f in [&file, &log] {
        let removed = client.delete(&f.filename, Some(&f.group_name)).await?;
        println!("   {} removed: {}", f.file_id(), removed);
    }

    client.close().await;
    Ok(())
}
