//! FastDFS Storage Client
//!
//! Executes upload, append/modify, download, metadata, file info and delete
//! commands against storage servers. Content is streamed in fixed-size chunks
//! and long transfers honour a cancellation token between chunks.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionPool};
use crate::errors::{FastDFSError, Result};
use crate::protocol::*;
use crate::tracker::TrackerClient;
use crate::types::*;

/// Where uploaded or written content comes from
pub enum ContentSource {
    /// Bytes already in memory
    Buffer(Bytes),
    /// A local file, streamed from disk
    File(PathBuf),
    /// Any reader yielding exactly `len` bytes
    Reader {
        /// Content stream
        reader: Box<dyn AsyncRead + Send + Unpin>,
        /// Total number of bytes the reader will yield
        len: u64,
    },
}

impl ContentSource {
    /// Wraps a reader of known length
    pub fn reader<R>(reader: R, len: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        ContentSource::Reader {
            reader: Box::new(reader),
            len,
        }
    }

    /// Opens the source; only local I/O happens here
    async fn open(self) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
        match self {
            ContentSource::Buffer(data) => {
                let len = data.len() as u64;
                Ok((Box::new(std::io::Cursor::new(data)), len))
            }
            ContentSource::File(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let len = file.metadata().await?.len();
                Ok((Box::new(file), len))
            }
            ContentSource::Reader { reader, len } => Ok((reader, len)),
        }
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Buffer(data) => f.debug_tuple("Buffer").field(&data.len()).finish(),
            ContentSource::File(path) => f.debug_tuple("File").field(path).finish(),
            ContentSource::Reader { len, .. } => f.debug_struct("Reader").field("len", len).finish(),
        }
    }
}

impl From<Bytes> for ContentSource {
    fn from(data: Bytes) -> Self {
        ContentSource::Buffer(data)
    }
}

impl From<Vec<u8>> for ContentSource {
    fn from(data: Vec<u8>) -> Self {
        ContentSource::Buffer(Bytes::from(data))
    }
}

impl From<&[u8]> for ContentSource {
    fn from(data: &[u8]) -> Self {
        ContentSource::Buffer(Bytes::copy_from_slice(data))
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>, operation: &str) -> Result<()> {
    if cancel.is_some_and(|token| token.is_cancelled()) {
        return Err(FastDFSError::Cancelled(operation.to_string()));
    }
    Ok(())
}

/// Client for storage server commands
pub struct StorageClient {
    pool: Arc<ConnectionPool>,
    tracker: Arc<TrackerClient>,
    network_timeout: u64,
    chunk_size: usize,
}

impl StorageClient {
    /// Creates a storage client
    ///
    /// `tracker` resolves storage servers for the commands that take only a
    /// group and filename.
    pub fn new(
        pool: Arc<ConnectionPool>,
        tracker: Arc<TrackerClient>,
        network_timeout: u64,
        chunk_size: usize,
    ) -> Self {
        Self {
            pool,
            tracker,
            network_timeout,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Sends one request frame and reads one response body
    async fn exchange(
        &self,
        endpoint: &ServerEndpoint,
        cmd: StorageCommand,
        request: &[u8],
        context: &str,
    ) -> Result<Bytes> {
        let max_len = match cmd {
            StorageCommand::GetMetadata => STORAGE_MAX_METADATA_REPLY_LEN,
            _ => STORAGE_MAX_REPLY_LEN,
        };
        let mut conn = self.pool.acquire(endpoint).await?;
        let result = async {
            conn.send(&encode_frame(cmd.into(), request), self.network_timeout)
                .await?;
            conn.receive_response(self.network_timeout, max_len as u64, context)
                .await
        }
        .await;
        self.pool.finish(conn, result).await
    }

    /// Streams exactly `len` bytes from `reader` to the server
    async fn send_content(
        &self,
        conn: &mut Connection,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        len: u64,
        cancel: Option<&CancellationToken>,
        operation: &str,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut remaining = len;

        while remaining > 0 {
            check_cancelled(cancel, operation)?;
            let n = remaining.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..n]).await?;
            conn.send(&buf[..n], self.network_timeout).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Streams exactly `len` bytes from the server into `writer`
    async fn receive_content<W>(
        &self,
        conn: &mut Connection,
        len: u64,
        writer: &mut W,
        cancel: Option<&CancellationToken>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.chunk_size.min(len as usize).max(1)];
        let mut remaining = len;

        while remaining > 0 {
            check_cancelled(cancel, "download")?;
            let n = remaining.min(buf.len() as u64) as usize;
            conn.receive_into(&mut buf[..n], self.network_timeout).await?;
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Uploads `content` to the server named by `assignment`
    ///
    /// Empty content is rejected before any connection is made. Non-empty
    /// `metadata` is stored with an overwrite right after the upload; if that
    /// fails the new file is removed again and the error returned.
    pub async fn upload(
        &self,
        assignment: &StorageAssignment,
        file_ext_name: &str,
        content: ContentSource,
        metadata: Option<&Metadata>,
        is_appender: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileDescriptor> {
        if file_ext_name.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "Extension longer than {} bytes: {}",
                FDFS_FILE_EXT_NAME_MAX_LEN, file_ext_name
            )));
        }

        let (mut reader, file_size) = content.open().await?;
        if file_size == 0 {
            return Err(FastDFSError::InvalidArgument(
                "Upload content is empty".to_string(),
            ));
        }

        let cmd = if is_appender {
            StorageCommand::UploadAppenderFile
        } else {
            StorageCommand::UploadFile
        };

        let prefix_len = 1 + FDFS_PROTO_PKG_LEN_SIZE + FDFS_FILE_EXT_NAME_MAX_LEN;
        let mut request = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + prefix_len);
        request.put(encode_header(prefix_len as u64 + file_size, cmd.into(), 0));
        request.put_u8(assignment.store_path_index);
        request.put_u64(file_size);
        request.put(pad_string(file_ext_name, FDFS_FILE_EXT_NAME_MAX_LEN));

        let mut conn = self
            .pool
            .acquire(&assignment.endpoint)
            .await
            .map_err(|e| e.in_storage("upload"))?;
        let result = async {
            conn.send(&request, self.network_timeout).await?;
            self.send_content(&mut conn, reader.as_mut(), file_size, cancel, "upload")
                .await?;
            conn.receive_response(self.network_timeout, STORAGE_MAX_REPLY_LEN as u64, "")
                .await
        }
        .await;
        let body = self
            .pool
            .finish(conn, result)
            .await
            .map_err(|e| e.in_storage("upload"))?;

        if body.len() <= FDFS_GROUP_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidResponse(format!(
                "Upload reply too short: {} bytes",
                body.len()
            ))
            .in_storage("upload"));
        }
        let group_name = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
        let remote_filename = String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).to_string();

        tracing::debug!(
            group = %group_name,
            filename = %remote_filename,
            size = file_size,
            storage = %assignment.endpoint,
            "uploaded file"
        );

        if let Some(meta) = metadata.filter(|m| !m.is_empty()) {
            if let Err(e) = self
                .set_metadata(
                    &group_name,
                    &assignment.endpoint,
                    &remote_filename,
                    meta,
                    MetadataFlag::Overwrite,
                )
                .await
            {
                tracing::warn!(filename = %remote_filename, error = %e, "metadata failed, removing upload");
                if let Err(cleanup) = self
                    .delete_on(&group_name, &assignment.endpoint, &remote_filename)
                    .await
                {
                    tracing::warn!(
                        group = %group_name,
                        filename = %remote_filename,
                        error = %cleanup,
                        "failed to remove upload after metadata failure"
                    );
                }
                return Err(e);
            }
        }

        Ok(describe_upload(group_name, remote_filename, file_size))
    }

    /// Writes `content` into an existing appender file
    pub async fn modify(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
        mode: ModifyMode,
        content: ContentSource,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        check_group_name(group_name)?;
        let (mut reader, file_size) = content.open().await?;
        if file_size == 0 {
            return Err(FastDFSError::InvalidArgument(
                "Modify content is empty".to_string(),
            ));
        }

        let name = remote_filename.as_bytes();
        let (cmd, operation, fields) = match mode {
            ModifyMode::Append => (
                StorageCommand::AppendFile,
                "append",
                vec![name.len() as u64, file_size],
            ),
            ModifyMode::Overwrite { offset } => (
                StorageCommand::ModifyFile,
                "modify",
                vec![name.len() as u64, offset, file_size],
            ),
        };

        let prefix_len = fields.len() * FDFS_PROTO_PKG_LEN_SIZE + name.len();
        let mut request = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + prefix_len);
        request.put(encode_header(prefix_len as u64 + file_size, cmd.into(), 0));
        for field in fields {
            request.put_u64(field);
        }
        request.put_slice(name);

        let mut conn = self
            .pool
            .acquire(endpoint)
            .await
            .map_err(|e| e.in_storage(operation))?;
        let result = async {
            conn.send(&request, self.network_timeout).await?;
            self.send_content(&mut conn, reader.as_mut(), file_size, cancel, operation)
                .await?;
            conn.receive_response(
                self.network_timeout,
                STORAGE_MAX_REPLY_LEN as u64,
                remote_filename,
            )
            .await
        }
        .await;
        self.pool
            .finish(conn, result)
            .await
            .map_err(|e| e.in_storage(operation))?;

        tracing::debug!(group = %group_name, filename = %remote_filename, ?mode, size = file_size, "modified file");
        Ok(())
    }

    /// Downloads `length` bytes starting at `offset`; a length of 0 reads to
    /// the end of the file
    pub async fn download(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let mut data = Vec::new();
        self.download_to(group_name, endpoint, remote_filename, offset, length, &mut data, None)
            .await?;
        Ok(Bytes::from(data))
    }

    /// Streams a byte range into `writer`, returning the number of bytes written
    #[allow(clippy::too_many_arguments)]
    pub async fn download_to<W>(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
        offset: u64,
        length: u64,
        writer: &mut W,
        cancel: Option<&CancellationToken>,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        check_group_name(group_name)?;

        let mut request = BytesMut::with_capacity(16 + FDFS_GROUP_NAME_MAX_LEN + remote_filename.len());
        request.put_u64(offset);
        request.put_u64(length);
        request.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        request.put_slice(remote_filename.as_bytes());

        let mut conn = self
            .pool
            .acquire(endpoint)
            .await
            .map_err(|e| e.in_storage("download"))?;
        let result = async {
            conn.send(
                &encode_frame(StorageCommand::DownloadFile.into(), &request),
                self.network_timeout,
            )
            .await?;
            let header = conn.receive_header(self.network_timeout, remote_filename).await?;
            self.receive_content(&mut conn, header.length, writer, cancel)
                .await?;
            Ok::<_, FastDFSError>(header.length)
        }
        .await;
        self.pool
            .finish(conn, result)
            .await
            .map_err(|e| e.in_storage("download"))
    }

    /// Reports whether the file exists; an absent file is not an error
    pub async fn exists(&self, group_name: &str, remote_filename: &str) -> Result<bool> {
        let endpoint = match self
            .tracker
            .query_storage_for_download(group_name, remote_filename)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };

        match self.query_file_info(group_name, &endpoint, remote_filename).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetches size, creation time and checksum from the storage server
    pub async fn query_file_info(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
    ) -> Result<FileInfo> {
        check_group_name(group_name)?;
        let request = group_and_filename(group_name, remote_filename);
        let body = self
            .exchange(endpoint, StorageCommand::QueryFileInfo, &request, remote_filename)
            .await
            .map_err(|e| e.in_storage("query file info"))?;

        if body.len() < STORAGE_FILE_INFO_BODY_LEN {
            return Err(FastDFSError::InvalidResponse(format!(
                "File info response too short: {} bytes",
                body.len()
            ))
            .in_storage("query file info"));
        }

        let file_size = decode_int64(&body[0..8]);
        let create_timestamp = decode_int64(&body[8..16]);
        let crc32 = decode_int64(&body[16..24]) as u32;
        let source_ip_addr = unpad_string(&body[24..24 + IP_ADDRESS_SIZE]);

        Ok(FileInfo {
            file_size,
            create_time: SystemTime::UNIX_EPOCH + Duration::from_secs(create_timestamp),
            crc32,
            source_ip_addr,
        })
    }

    /// Retrieves metadata for a file
    pub async fn get_metadata(&self, group_name: &str, remote_filename: &str) -> Result<Metadata> {
        let endpoint = self
            .tracker
            .query_storage_for_download(group_name, remote_filename)
            .await?;
        let request = group_and_filename(group_name, remote_filename);
        let body = self
            .exchange(&endpoint, StorageCommand::GetMetadata, &request, remote_filename)
            .await
            .map_err(|e| e.in_storage("get metadata"))?;

        Ok(decode_metadata(&body))
    }

    /// Replaces or merges the metadata of a file
    pub async fn set_metadata(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        check_group_name(group_name)?;
        let meta = encode_metadata(metadata);
        let name = remote_filename.as_bytes();

        let mut request =
            BytesMut::with_capacity(2 * 8 + 1 + FDFS_GROUP_NAME_MAX_LEN + name.len() + meta.len());
        request.put_u64(name.len() as u64);
        request.put_u64(meta.len() as u64);
        request.put_u8(flag.into());
        request.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        request.put_slice(name);
        request.put(meta);

        self.exchange(endpoint, StorageCommand::SetMetadata, &request, remote_filename)
            .await
            .map_err(|e| e.in_storage("set metadata"))?;
        Ok(())
    }

    /// Deletes a file
    ///
    /// Returns `true` when this call removed the file and `false` when it was
    /// already absent. Both are successes.
    pub async fn delete(&self, group_name: &str, remote_filename: &str) -> Result<bool> {
        let endpoint = match self
            .tracker
            .query_storage_for_update(group_name, remote_filename)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        self.delete_on(group_name, &endpoint, remote_filename).await
    }

    async fn delete_on(
        &self,
        group_name: &str,
        endpoint: &ServerEndpoint,
        remote_filename: &str,
    ) -> Result<bool> {
        let request = group_and_filename(group_name, remote_filename);
        match self
            .exchange(endpoint, StorageCommand::DeleteFile, &request, remote_filename)
            .await
        {
            Ok(_) => {
                tracing::debug!(group = %group_name, filename = %remote_filename, "deleted file");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.in_storage("delete")),
        }
    }
}

fn group_and_filename(group_name: &str, remote_filename: &str) -> BytesMut {
    let mut request = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + remote_filename.len());
    request.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
    request.put_slice(remote_filename.as_bytes());
    request
}

/// Fills in what the assigned filename reveals about the new file
fn describe_upload(group_name: String, filename: String, file_size: u64) -> FileDescriptor {
    let decoded = decode_remote_filename(&filename).filter(|info| info.file_size.is_some());
    FileDescriptor {
        create_time: decoded
            .as_ref()
            .map(|info| SystemTime::UNIX_EPOCH + Duration::from_secs(info.create_timestamp.into())),
        crc32: decoded.as_ref().map(|info| info.crc32),
        group_name,
        filename,
        file_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_upload_without_encoded_fields() {
        let descriptor = describe_upload("group1".to_string(), "custom-name".to_string(), 12);
        assert_eq!(descriptor.file_id(), "group1/custom-name");
        assert_eq!(descriptor.file_size, 12);
        assert!(descriptor.create_time.is_none());
        assert!(descriptor.crc32.is_none());
    }

    #[test]
    fn test_check_cancelled() {
        let token = CancellationToken::new();
        assert!(check_cancelled(Some(&token), "upload").is_ok());
        assert!(check_cancelled(None, "upload").is_ok());

        token.cancel();
        let err = check_cancelled(Some(&token), "upload").unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_content_source_lengths() {
        let (_, len) = ContentSource::from(&b"hello"[..]).open().await.unwrap();
        assert_eq!(len, 5);

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![7u8; 300]).unwrap();
        let (_, len) = ContentSource::File(file.path().to_path_buf())
            .open()
            .await
            .unwrap();
        assert_eq!(len, 300);

        let missing = ContentSource::File(PathBuf::from("/nonexistent/dir/file.bin"))
            .open()
            .await;
        assert!(missing.is_err());
    }
}
