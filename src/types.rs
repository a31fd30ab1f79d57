//! FastDFS Protocol Types and Constants
//!
//! This module defines the protocol-level constants, command codes, and data structures
//! shared by the tracker client, the storage client and the facade.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::errors::{FastDFSError, Result};

/// Default network ports for FastDFS servers
pub const TRACKER_DEFAULT_PORT: u16 = 22122;
/// Default storage server port
pub const STORAGE_DEFAULT_PORT: u16 = 23000;

/// Group used when a call omits one and the config does not override it
pub const DEFAULT_GROUP_NAME: &str = "group1";

/// Protocol header size
pub const FDFS_PROTO_HEADER_LEN: usize = 10;
/// Width of every integer field on the wire
pub const FDFS_PROTO_PKG_LEN_SIZE: usize = 8;
/// Command code carried by every server response
pub const FDFS_PROTO_CMD_RESP: u8 = 100;

/// Field size limits
pub const FDFS_GROUP_NAME_MAX_LEN: usize = 16;
/// Maximum extension length, without the dot
pub const FDFS_FILE_EXT_NAME_MAX_LEN: usize = 6;
/// Maximum metadata key length
pub const FDFS_MAX_META_NAME_LEN: usize = 64;
/// Maximum metadata value length
pub const FDFS_MAX_META_VALUE_LEN: usize = 256;
/// Size of an IP address field in storage replies
pub const IP_ADDRESS_SIZE: usize = 16;
/// Size of an IP address field in tracker replies
pub const TRACKER_IP_ADDRESS_SIZE: usize = IP_ADDRESS_SIZE - 1;

/// Store path prefix of a remote filename, e.g. `M00/00/00/`
pub const FDFS_LOGIC_FILE_PATH_LEN: usize = 10;
/// Length of the base64 block following the store path
pub const FDFS_FILENAME_BASE64_LENGTH: usize = 27;

/// High bits set in the encoded size of an appender file
pub const FDFS_APPENDER_FILE_SIZE: u64 = 1 << 58;
/// High bits set in the encoded size of a trunk file
pub const FDFS_TRUNK_FILE_MARK_SIZE: u64 = 1 << 59;

/// Tracker reply sizes
pub const TRACKER_QUERY_STORAGE_FETCH_BODY_LEN: usize =
    FDFS_GROUP_NAME_MAX_LEN + TRACKER_IP_ADDRESS_SIZE + FDFS_PROTO_PKG_LEN_SIZE;
/// Store reply carries one extra byte for the store path index
pub const TRACKER_QUERY_STORAGE_STORE_BODY_LEN: usize = TRACKER_QUERY_STORAGE_FETCH_BODY_LEN + 1;
/// One group stat record: null-terminated name plus eleven integers
pub const TRACKER_GROUP_STAT_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + 1 + 11 * FDFS_PROTO_PKG_LEN_SIZE;
/// Query file info reply: size, create time, crc32, source ip
pub const STORAGE_FILE_INFO_BODY_LEN: usize = 3 * FDFS_PROTO_PKG_LEN_SIZE + IP_ADDRESS_SIZE;

/// Most groups a tracker reports
pub const FDFS_MAX_GROUPS: usize = 512;
/// Most storage servers in one group
pub const FDFS_MAX_SERVERS_EACH_GROUP: usize = 32;
/// Largest reply accepted for storage commands other than get-metadata
pub const STORAGE_MAX_REPLY_LEN: usize = 64 * 1024;
/// Largest get-metadata reply accepted
pub const STORAGE_MAX_METADATA_REPLY_LEN: usize = 1024 * 1024;

/// Protocol separators
pub const FDFS_RECORD_SEPARATOR: u8 = 0x01;
/// Separates a metadata key from its value
pub const FDFS_FIELD_SEPARATOR: u8 = 0x02;

/// Tracker protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackerCommand {
    /// Pick a storage server in any group
    ServiceQueryStoreWithoutGroupOne = 101,
    /// Resolve the storage server holding a file, for reads
    ServiceQueryFetchOne = 102,
    /// Resolve the storage server holding a file, for writes
    ServiceQueryUpdate = 103,
    /// Pick a storage server in a named group
    ServiceQueryStoreWithGroupOne = 104,
    /// List every storage server of a group that accepts writes
    ServiceQueryStoreWithGroupAll = 107,
    /// List group statistics
    ServerListAllGroups = 91,
}

impl From<TrackerCommand> for u8 {
    fn from(cmd: TrackerCommand) -> u8 {
        cmd as u8
    }
}

/// Storage protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageCommand {
    /// Upload a regular file
    UploadFile = 11,
    /// Delete a file
    DeleteFile = 12,
    /// Replace or merge metadata
    SetMetadata = 13,
    /// Download a byte range
    DownloadFile = 14,
    /// Fetch metadata
    GetMetadata = 15,
    /// Fetch size, create time and checksum
    QueryFileInfo = 22,
    /// Upload a file that accepts later appends and modifications
    UploadAppenderFile = 23,
    /// Append to an appender file
    AppendFile = 24,
    /// Overwrite part of an appender file
    ModifyFile = 34,
}

impl From<StorageCommand> for u8 {
    fn from(cmd: StorageCommand) -> u8 {
        cmd as u8
    }
}

/// Metadata operation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataFlag {
    /// Replace all existing metadata with new values
    Overwrite = b'O',
    /// Merge new metadata with existing metadata
    Merge = b'M',
}

impl From<MetadataFlag> for u8 {
    fn from(flag: MetadataFlag) -> u8 {
        flag as u8
    }
}

/// How a modify call writes its content into an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyMode {
    /// Write at the current end of file
    Append,
    /// Overwrite starting at `offset`, growing the file if needed
    Overwrite {
        /// Byte position of the first written byte
        offset: u64,
    },
}

/// Address of a tracker or storage server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    host: String,
    port: u16,
}

impl ServerEndpoint {
    /// Creates an endpoint from a host name or IP and a port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerEndpoint {
    type Err = FastDFSError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("Invalid server address: {}", s)))?;
        if host.is_empty() {
            return Err(FastDFSError::InvalidArgument(format!(
                "Invalid server address: {}",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| FastDFSError::InvalidArgument(format!("Invalid port in address: {}", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Statistics and write targets of one storage group
#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    /// Group name
    pub name: String,
    /// Storage servers currently accepting writes for this group
    pub storage_servers: Vec<ServerEndpoint>,
    /// Total capacity in MB
    pub total_mb: u64,
    /// Free space in MB
    pub free_mb: u64,
    /// Free trunk space in MB
    pub trunk_free_mb: u64,
    /// Number of storage servers in the group
    pub storage_count: u64,
    /// Storage service port shared by the group
    pub storage_port: u64,
    /// Storage HTTP port shared by the group
    pub storage_http_port: u64,
    /// Number of active storage servers
    pub active_count: u64,
    /// Index of the storage server receiving writes
    pub current_write_server: u64,
    /// Store paths per storage server
    pub store_path_count: u64,
    /// Subdirectories per store path
    pub subdir_count_per_path: u64,
    /// Current trunk file id
    pub current_trunk_file_id: u64,
}

/// Storage server chosen by the tracker for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAssignment {
    /// Group the server belongs to
    pub group_name: String,
    /// Server to upload to
    pub endpoint: ServerEndpoint,
    /// Index of the storage path to use (0-based)
    pub store_path_index: u8,
}

/// Handle to a stored file, as returned by an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Group holding the file
    pub group_name: String,
    /// Server-assigned remote filename, e.g. `M00/00/00/wKgB...jpg`
    pub filename: String,
    /// Number of bytes uploaded
    pub file_size: u64,
    /// Creation time encoded in the filename, if any
    pub create_time: Option<SystemTime>,
    /// CRC32 encoded in the filename, if any
    pub crc32: Option<u32>,
}

impl FileDescriptor {
    /// Renders the `group/filename` form used by other FastDFS clients
    pub fn file_id(&self) -> String {
        format!("{}/{}", self.group_name, self.filename)
    }
}

/// Information about a file stored in FastDFS
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Size of the file in bytes
    pub file_size: u64,
    /// Timestamp when the file was created
    pub create_time: SystemTime,
    /// CRC32 checksum of the file
    pub crc32: u32,
    /// IP address of the source storage server
    pub source_ip_addr: String,
}

/// Fixed FastDFS frame header (10 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the message body (not including header)
    pub length: u64,
    /// Command code (request type or response type)
    pub cmd: u8,
    /// Status code (0 for success, error code otherwise)
    pub status: u8,
}

/// One decoded request or response
#[derive(Debug, Clone)]
pub struct Frame {
    /// Command code
    pub cmd: u8,
    /// Status code
    pub status: u8,
    /// Payload
    pub body: bytes::Bytes,
}

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Group used when a call does not name one
    pub group_name: String,
    /// Public access domain prepended by `build_public_url`, empty when unset
    pub domain: String,
    /// Tracker host name or IP
    pub tracker_host: String,
    /// Tracker port
    pub tracker_port: u16,
    /// Maximum number of idle connections kept per server
    pub max_conns: usize,
    /// Timeout for establishing connections in milliseconds
    pub connect_timeout: u64,
    /// Timeout for network I/O operations in milliseconds
    pub network_timeout: u64,
    /// Timeout for idle connections in the pool in milliseconds
    pub idle_timeout: u64,
    /// Size of the pieces streamed during uploads and downloads
    pub chunk_size: usize,
    /// Storage port used to resolve download servers from the filename alone
    pub storage_port: Option<u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            group_name: DEFAULT_GROUP_NAME.to_string(),
            domain: String::new(),
            tracker_host: "127.0.0.1".to_string(),
            tracker_port: TRACKER_DEFAULT_PORT,
            max_conns: 10,
            connect_timeout: 5000,
            network_timeout: 30000,
            idle_timeout: 60000,
            chunk_size: 256 * 1024,
            storage_port: None,
        }
    }
}

impl ClientConfig {
    /// Creates a new client configuration for the given tracker
    pub fn new(tracker_host: impl Into<String>, tracker_port: u16) -> Self {
        Self {
            tracker_host: tracker_host.into(),
            tracker_port,
            ..Default::default()
        }
    }

    /// Sets the default group name
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = group_name.into();
        self
    }

    /// Sets the public access domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Sets the maximum number of idle connections per server
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Sets the connection timeout in milliseconds
    pub fn with_connect_timeout(mut self, timeout: u64) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the network timeout in milliseconds
    pub fn with_network_timeout(mut self, timeout: u64) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Sets the idle timeout in milliseconds
    pub fn with_idle_timeout(mut self, timeout: u64) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the streaming chunk size in bytes
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Enables resolving download servers locally from the filename
    pub fn with_storage_port(mut self, port: u16) -> Self {
        self.storage_port = Some(port);
        self
    }

    /// Tracker address as an endpoint
    pub fn tracker_endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.tracker_host.clone(), self.tracker_port)
    }

    /// Checks the configuration once, before any connection is made
    pub fn validate(&self) -> Result<()> {
        if self.tracker_host.is_empty() {
            return Err(FastDFSError::InvalidArgument(
                "Tracker host is required".to_string(),
            ));
        }
        if self.tracker_port == 0 {
            return Err(FastDFSError::InvalidArgument(
                "Tracker port must be nonzero".to_string(),
            ));
        }
        if self.group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "Group name longer than {} bytes: {}",
                FDFS_GROUP_NAME_MAX_LEN, self.group_name
            )));
        }
        if self.max_conns == 0 {
            return Err(FastDFSError::InvalidArgument(
                "max_conns must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(FastDFSError::InvalidArgument(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metadata dictionary type
pub type Metadata = std::collections::HashMap<String, String>;
