//! FastDFS Rust Client
//!
//! Main client struct for interacting with FastDFS distributed file system.
//! It composes a tracker client and a storage client, fills in the configured
//! default group, and records the last failure for callers that poll for it.

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionPool;
use crate::errors::{FastDFSError, Result};
use crate::protocol::get_file_ext_name;
use crate::storage::{ContentSource, StorageClient};
use crate::tracker::TrackerClient;
use crate::types::{
    ClientConfig, FileDescriptor, FileInfo, GroupInfo, Metadata, MetadataFlag, ModifyMode,
    FDFS_FILE_EXT_NAME_MAX_LEN,
};

/// FastDFS client for file operations
///
/// Every operation returns a `Result`; failures are also remembered and can be
/// read back with [`Client::last_error`].
///
/// # Example
///
/// ```no_run
/// use fdfs::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::new("192.168.1.100", 22122).with_domain("https://cdn.example.com");
///     let client = Client::new(config)?;
///
///     let file = client.upload_file("photo.jpg", None, None, None).await?;
///     let data = client.download(&file.filename, None, 0, 0).await?;
///     let url = client.public_url(&file.filename, None);
///     client.delete(&file.filename, None).await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    config: ClientConfig,
    tracker_pool: Arc<ConnectionPool>,
    storage_pool: Arc<ConnectionPool>,
    tracker: Arc<TrackerClient>,
    storage: StorageClient,
    closed: RwLock<bool>,
    last_error: RwLock<Option<String>>,
}

impl Client {
    /// Creates a new FastDFS client with the given configuration
    ///
    /// The configuration is validated here; no connection is opened until the
    /// first operation.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let tracker_pool = Arc::new(ConnectionPool::new(
            config.max_conns,
            Duration::from_millis(config.connect_timeout),
            Duration::from_millis(config.idle_timeout),
        ));

        let storage_pool = Arc::new(ConnectionPool::new(
            config.max_conns,
            Duration::from_millis(config.connect_timeout),
            Duration::from_millis(config.idle_timeout),
        ));

        let tracker = Arc::new(
            TrackerClient::new(
                tracker_pool.clone(),
                config.tracker_endpoint(),
                config.network_timeout,
            )
            .with_storage_port(config.storage_port),
        );

        let storage = StorageClient::new(
            storage_pool.clone(),
            tracker.clone(),
            config.network_timeout,
            config.chunk_size,
        );

        Ok(Self {
            config,
            tracker_pool,
            storage_pool,
            tracker,
            storage,
            closed: RwLock::new(false),
            last_error: RwLock::new(None),
        })
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Checks if the client is closed
    async fn check_closed(&self) -> Result<()> {
        if *self.closed.read().await {
            return Err(FastDFSError::ClientClosed);
        }
        Ok(())
    }

    fn group_name<'a>(&'a self, group_name: Option<&'a str>) -> &'a str {
        group_name.unwrap_or(&self.config.group_name)
    }

    /// Remembers the outcome of a public operation
    async fn record<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        let mut last_error = self.last_error.write().await;
        match &result {
            Ok(_) => *last_error = None,
            Err(e) => {
                tracing::warn!(operation, kind = ?e.kind(), error = %e, "operation failed");
                *last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn upload(
        &self,
        content: ContentSource,
        file_ext_name: &str,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
        is_appender: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileDescriptor> {
        self.check_closed().await?;
        if file_ext_name.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "Extension longer than {} bytes: {}",
                FDFS_FILE_EXT_NAME_MAX_LEN, file_ext_name
            )));
        }
        check_not_empty(&content)?;
        let group_name = self.group_name(group_name);
        let assignment = self
            .tracker
            .query_storage_for_upload(Some(group_name))
            .await?;
        self.storage
            .upload(&assignment, file_ext_name, content, metadata, is_appender, cancel)
            .await
    }

    async fn upload_local_file(
        &self,
        local_filename: &str,
        file_ext_name: Option<&str>,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
        is_appender: bool,
    ) -> Result<FileDescriptor> {
        let content = local_file(local_filename).await?;
        let file_ext_name = file_ext_name
            .map(str::to_string)
            .unwrap_or_else(|| get_file_ext_name(local_filename));
        self.upload(
            content,
            &file_ext_name,
            group_name,
            metadata,
            is_appender,
            None,
        )
        .await
    }

    /// Uploads a file from the local filesystem
    ///
    /// The extension is taken from the path when `file_ext_name` is `None`,
    /// and the configured group is used when `group_name` is `None`.
    pub async fn upload_file(
        &self,
        local_filename: &str,
        file_ext_name: Option<&str>,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<FileDescriptor> {
        let result = self
            .upload_local_file(local_filename, file_ext_name, group_name, metadata, false)
            .await;
        self.record("upload_file", result).await
    }

    /// Uploads data from a buffer
    pub async fn upload_buffer(
        &self,
        data: &[u8],
        file_ext_name: Option<&str>,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<FileDescriptor> {
        let result = self
            .upload(
                data.into(),
                file_ext_name.unwrap_or(""),
                group_name,
                metadata,
                false,
                None,
            )
            .await;
        self.record("upload_buffer", result).await
    }

    /// Uploads a local file as an appender file, which accepts later
    /// [`Client::modify_file`] and [`Client::modify_buffer`] calls
    pub async fn upload_appender_file(
        &self,
        local_filename: &str,
        file_ext_name: Option<&str>,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<FileDescriptor> {
        let result = self
            .upload_local_file(local_filename, file_ext_name, group_name, metadata, true)
            .await;
        self.record("upload_appender_file", result).await
    }

    /// Uploads a buffer as an appender file
    pub async fn upload_appender_buffer(
        &self,
        data: &[u8],
        file_ext_name: Option<&str>,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<FileDescriptor> {
        let result = self
            .upload(
                data.into(),
                file_ext_name.unwrap_or(""),
                group_name,
                metadata,
                true,
                None,
            )
            .await;
        self.record("upload_appender_buffer", result).await
    }

    /// Streams `len` bytes from `reader` into a new file
    ///
    /// The transfer stops with a `Cancelled` error at the next chunk boundary
    /// once `cancel` is triggered.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        len: u64,
        file_ext_name: &str,
        group_name: Option<&str>,
        metadata: Option<&Metadata>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileDescriptor>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let result = self
            .upload(
                ContentSource::reader(reader, len),
                file_ext_name,
                group_name,
                metadata,
                false,
                cancel,
            )
            .await;
        self.record("upload_reader", result).await
    }

    async fn modify(
        &self,
        content: ContentSource,
        remote_filename: &str,
        group_name: Option<&str>,
        mode: ModifyMode,
    ) -> Result<()> {
        self.check_closed().await?;
        check_not_empty(&content)?;
        let group_name = self.group_name(group_name);
        let endpoint = self
            .tracker
            .query_storage_for_update(group_name, remote_filename)
            .await?;
        self.storage
            .modify(group_name, &endpoint, remote_filename, mode, content, None)
            .await
    }

    /// Writes a local file's content into an existing appender file
    pub async fn modify_file(
        &self,
        local_filename: &str,
        remote_filename: &str,
        group_name: Option<&str>,
        mode: ModifyMode,
    ) -> Result<()> {
        let result = match local_file(local_filename).await {
            Ok(content) => {
                self.modify(content, remote_filename, group_name, mode)
                    .await
            }
            Err(e) => Err(e),
        };
        self.record("modify_file", result).await
    }

    /// Writes a buffer into an existing appender file
    pub async fn modify_buffer(
        &self,
        data: &[u8],
        remote_filename: &str,
        group_name: Option<&str>,
        mode: ModifyMode,
    ) -> Result<()> {
        let result = self
            .modify(data.into(), remote_filename, group_name, mode)
            .await;
        self.record("modify_buffer", result).await
    }

    async fn fetch_range(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.check_closed().await?;
        let group_name = self.group_name(group_name);
        let endpoint = self
            .tracker
            .query_storage_for_download(group_name, remote_filename)
            .await?;
        self.storage
            .download(group_name, &endpoint, remote_filename, offset, length)
            .await
    }

    /// Downloads `length` bytes starting at `offset`
    ///
    /// A `length` of 0 reads to the end of the file.
    pub async fn download(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let result = self
            .fetch_range(remote_filename, group_name, offset, length)
            .await;
        self.record("download", result).await
    }

    async fn fetch_to_file(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        local_filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<u64> {
        self.check_closed().await?;
        let group_name = self.group_name(group_name);
        let endpoint = self
            .tracker
            .query_storage_for_download(group_name, remote_filename)
            .await?;

        if let Some(parent) = Path::new(local_filename).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::File::create(local_filename).await?;
        self.storage
            .download_to(group_name, &endpoint, remote_filename, 0, 0, &mut file, cancel)
            .await
    }

    /// Streams a whole file to the local filesystem, returning its size
    ///
    /// Parent directories are created when missing.
    pub async fn download_to_file(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        local_filename: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<u64> {
        let result = self
            .fetch_to_file(remote_filename, group_name, local_filename, cancel)
            .await;
        self.record("download_to_file", result).await
    }

    /// Composes `{domain}/{group}/{filename}` without any network access
    ///
    /// Returns `None` when no public domain is configured.
    pub fn public_url(&self, remote_filename: &str, group_name: Option<&str>) -> Option<String> {
        if self.config.domain.is_empty() {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.config.domain,
            self.group_name(group_name),
            remote_filename
        ))
    }

    /// Like [`Client::public_url`], but also returns `None` when the file
    /// does not exist or its existence cannot be confirmed
    pub async fn build_public_url(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
    ) -> Option<String> {
        let url = self.public_url(remote_filename, group_name)?;
        match self.check_exists(remote_filename, group_name).await {
            Ok(true) => Some(url),
            _ => None,
        }
    }

    async fn check_exists(&self, remote_filename: &str, group_name: Option<&str>) -> Result<bool> {
        self.check_closed().await?;
        self.storage
            .exists(self.group_name(group_name), remote_filename)
            .await
    }

    /// Checks whether a file exists; an absent file yields `Ok(false)`
    pub async fn exists(&self, remote_filename: &str, group_name: Option<&str>) -> Result<bool> {
        let result = self.check_exists(remote_filename, group_name).await;
        self.record("exists", result).await
    }

    async fn fetch_metadata(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
    ) -> Result<Metadata> {
        self.check_closed().await?;
        self.storage
            .get_metadata(self.group_name(group_name), remote_filename)
            .await
    }

    /// Retrieves metadata for a file
    pub async fn get_metadata(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
    ) -> Result<Metadata> {
        let result = self.fetch_metadata(remote_filename, group_name).await;
        self.record("get_metadata", result).await
    }

    async fn store_metadata(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.check_closed().await?;
        let group_name = self.group_name(group_name);
        let endpoint = self
            .tracker
            .query_storage_for_update(group_name, remote_filename)
            .await?;
        self.storage
            .set_metadata(group_name, &endpoint, remote_filename, metadata, flag)
            .await
    }

    /// Replaces or merges the metadata of a file
    pub async fn set_metadata(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let result = self
            .store_metadata(remote_filename, group_name, metadata, flag)
            .await;
        self.record("set_metadata", result).await
    }

    async fn file_info(&self, remote_filename: &str, group_name: Option<&str>) -> Result<FileInfo> {
        self.check_closed().await?;
        let group_name = self.group_name(group_name);
        let endpoint = self
            .tracker
            .query_storage_for_download(group_name, remote_filename)
            .await?;
        self.storage
            .query_file_info(group_name, &endpoint, remote_filename)
            .await
    }

    /// Retrieves file information including size, create time, and CRC32
    pub async fn get_file_info(
        &self,
        remote_filename: &str,
        group_name: Option<&str>,
    ) -> Result<FileInfo> {
        let result = self.file_info(remote_filename, group_name).await;
        self.record("get_file_info", result).await
    }

    /// Deletes a file
    ///
    /// Deleting an absent file succeeds with `Ok(false)`; `Ok(true)` means
    /// this call removed the file.
    pub async fn delete(&self, remote_filename: &str, group_name: Option<&str>) -> Result<bool> {
        let result = self.remove(remote_filename, group_name).await;
        self.record("delete", result).await
    }

    async fn remove(&self, remote_filename: &str, group_name: Option<&str>) -> Result<bool> {
        self.check_closed().await?;
        self.storage
            .delete(self.group_name(group_name), remote_filename)
            .await
    }

    async fn groups(&self) -> Result<Vec<GroupInfo>> {
        self.check_closed().await?;
        self.tracker.list_groups().await
    }

    /// Lists the groups known to the tracker
    pub async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let result = self.groups().await;
        self.record("list_groups", result).await
    }

    /// Message of the most recent failed operation
    ///
    /// Cleared by the next successful operation.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Closes the client and releases all resources
    ///
    /// After calling close, all operations will return ClientClosed error.
    /// It's safe to call close multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.tracker_pool.close().await;
        self.storage_pool.close().await;
        tracing::debug!(tracker = %self.tracker.endpoint(), "client closed");
    }
}

/// Checks that `path` names a regular, non-empty local file
async fn local_file(path: &str) -> Result<ContentSource> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(ContentSource::File(path.into())),
        Ok(meta) if meta.is_file() => Err(FastDFSError::InvalidArgument(format!(
            "File is empty: {}",
            path
        ))),
        _ => Err(FastDFSError::InvalidArgument(format!("No such file: {}", path))),
    }
}

fn check_not_empty(content: &ContentSource) -> Result<()> {
    let empty = match content {
        ContentSource::Buffer(data) => data.is_empty(),
        ContentSource::Reader { len, .. } => *len == 0,
        ContentSource::File(_) => false,
    };
    if empty {
        return Err(FastDFSError::InvalidArgument("Content is empty".to_string()));
    }
    Ok(())
}
