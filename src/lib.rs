//! FastDFS Rust Client Library
//!
//! Async client for the FastDFS distributed file system. The crate is layered:
//!
//! - [`protocol`]: frame header, metadata and remote filename codecs
//! - [`connection`]: TCP connections and a per-server idle pool
//! - [`tracker`]: storage server lookups and group statistics
//! - [`storage`]: upload, append/modify, download, metadata and delete commands
//! - [`Client`]: a facade that fills in the default group, remembers the last
//!   failure and composes public URLs
//!
//! # Example
//!
//! ```no_run
//! use fdfs::{Client, ClientConfig, ModifyMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("192.168.1.100", 22122).with_group_name("group1");
//!     let client = Client::new(config)?;
//!
//!     let file = client.upload_appender_buffer(b"Hello, ", Some("txt"), None, None).await?;
//!     client.modify_buffer(b"FastDFS!", &file.filename, None, ModifyMode::Append).await?;
//!     let data = client.download(&file.filename, None, 0, 0).await?;
//!     assert_eq!(&data[..], b"Hello, FastDFS!");
//!     client.delete(&file.filename, None).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod client;
pub mod connection;
mod errors;
pub mod protocol;
pub mod storage;
pub mod tracker;
mod types;

// Re-export public API
pub use client::Client;
pub use errors::{map_status_to_error, ErrorKind, FastDFSError, Result};
pub use storage::{ContentSource, StorageClient};
pub use tokio_util::sync::CancellationToken;
pub use tracker::TrackerClient;
pub use types::*;
