//! FastDFS Error Definitions
//!
//! This module defines all error types for the FastDFS client.
//! Low-level codec and connection errors are wrapped by the tracker and storage
//! clients into `Tracker` / `Storage` errors that keep the original cause.

use thiserror::Error;

/// Result type alias for FastDFS operations
pub type Result<T> = std::result::Result<T, FastDFSError>;

/// Broad classification of a [`FastDFSError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input, no network activity attempted
    Validation,
    /// A TCP connection could not be established or used
    Connection,
    /// Malformed frame or unexpected status from a peer
    Protocol,
    /// The tracker rejected or could not service a query
    Tracker,
    /// A storage node failed a command
    Storage,
    /// The file does not exist
    NotFound,
    /// A network read or write timed out
    Timeout,
    /// A streaming transfer was cancelled
    Cancelled,
    /// The client has been closed
    Closed,
    /// Local filesystem failure
    LocalIo,
}

/// Base error type for all FastDFS errors
#[derive(Error, Debug)]
pub enum FastDFSError {
    /// Client has been closed
    #[error("Client is closed")]
    ClientClosed,

    /// Requested file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// No storage server is available
    #[error("No storage server available")]
    NoStorageServer,

    /// Connection timeout
    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    /// Network I/O timeout
    #[error("Network timeout during {operation} to {addr}")]
    NetworkTimeout {
        /// `read` or `write`
        operation: String,
        /// Peer address
        addr: String,
    },

    /// File ID format is invalid
    #[error("Invalid file ID: {0}")]
    InvalidFileId(String),

    /// Server response is invalid
    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    /// Insufficient storage space
    #[error("Insufficient storage space")]
    InsufficientSpace,

    /// File already exists
    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    /// Invalid argument was provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Nonzero status returned by a server
    #[error("Protocol error (code {code}): {message}")]
    Protocol {
        /// Status byte as received
        code: u8,
        /// Description
        message: String,
    },

    /// Network-related error
    #[error("Network error during {operation} to {addr}: {source}")]
    Network {
        /// `connect`, `read` or `write`
        operation: String,
        /// Peer address
        addr: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Tracker query failed
    #[error("Tracker {operation} failed: {source}")]
    Tracker {
        /// Query that failed
        operation: &'static str,
        /// Underlying cause
        #[source]
        source: Box<FastDFSError>,
    },

    /// Storage command failed
    #[error("Storage {operation} failed: {source}")]
    Storage {
        /// Command that failed
        operation: &'static str,
        /// Underlying cause
        #[source]
        source: Box<FastDFSError>,
    },

    /// Streaming transfer was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FastDFSError {
    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FastDFSError::ClientClosed => ErrorKind::Closed,
            FastDFSError::FileNotFound(_) => ErrorKind::NotFound,
            FastDFSError::InvalidFileId(_) | FastDFSError::InvalidArgument(_) => {
                ErrorKind::Validation
            }
            FastDFSError::ConnectionTimeout(_) | FastDFSError::Network { .. } => {
                ErrorKind::Connection
            }
            FastDFSError::NetworkTimeout { .. } => ErrorKind::Timeout,
            FastDFSError::InvalidResponse(_) | FastDFSError::Protocol { .. } => {
                ErrorKind::Protocol
            }
            FastDFSError::NoStorageServer | FastDFSError::Tracker { .. } => ErrorKind::Tracker,
            FastDFSError::InsufficientSpace
            | FastDFSError::FileAlreadyExists(_)
            | FastDFSError::Storage { .. } => ErrorKind::Storage,
            FastDFSError::Cancelled(_) => ErrorKind::Cancelled,
            FastDFSError::Io(_) => ErrorKind::LocalIo,
        }
    }

    /// Innermost error, looking through tracker and storage wrappers
    pub fn root_cause(&self) -> &FastDFSError {
        match self {
            FastDFSError::Tracker { source, .. } | FastDFSError::Storage { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// True when the file is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), FastDFSError::FileNotFound(_))
    }

    /// True when a network read, write or connect timed out
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root_cause(),
            FastDFSError::NetworkTimeout { .. } | FastDFSError::ConnectionTimeout(_)
        )
    }

    /// True when a streaming transfer was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), FastDFSError::Cancelled(_))
    }

    /// Status byte received from the server, if this error came from one
    pub fn status_code(&self) -> Option<u8> {
        match self.root_cause() {
            FastDFSError::FileNotFound(_) => Some(2),
            FastDFSError::FileAlreadyExists(_) => Some(6),
            FastDFSError::InsufficientSpace => Some(28),
            FastDFSError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the error was a complete server reply, so the connection
    /// that produced it is still in a clean state
    pub(crate) fn leaves_connection_usable(&self) -> bool {
        matches!(
            self,
            FastDFSError::FileNotFound(_)
                | FastDFSError::FileAlreadyExists(_)
                | FastDFSError::InsufficientSpace
                | FastDFSError::Protocol { .. }
        )
    }

    /// Wraps the error as a tracker failure
    pub(crate) fn in_tracker(self, operation: &'static str) -> Self {
        if self.passes_through() {
            return self;
        }
        FastDFSError::Tracker {
            operation,
            source: Box::new(self),
        }
    }

    /// Wraps the error as a storage failure
    pub(crate) fn in_storage(self, operation: &'static str) -> Self {
        if self.passes_through() {
            return self;
        }
        FastDFSError::Storage {
            operation,
            source: Box::new(self),
        }
    }

    fn passes_through(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound
                | ErrorKind::Validation
                | ErrorKind::Cancelled
                | ErrorKind::Closed
                | ErrorKind::LocalIo
                | ErrorKind::Tracker
                | ErrorKind::Storage
        )
    }
}

/// Maps FastDFS protocol status codes to Rust errors
///
/// Status code 0 indicates success (no error).
/// Other status codes are mapped to predefined errors or a Protocol error.
///
/// Common status codes:
///   - 0: Success
///   - 2: File not found (ENOENT)
///   - 6: File already exists (EEXIST)
///   - 22: Invalid argument (EINVAL)
///   - 28: Insufficient space (ENOSPC)
pub fn map_status_to_error(status: u8, context: &str) -> Option<FastDFSError> {
    match status {
        0 => None,
        2 => Some(FastDFSError::FileNotFound(context.to_string())),
        6 => Some(FastDFSError::FileAlreadyExists(context.to_string())),
        22 => Some(FastDFSError::Protocol {
            code: status,
            message: format!("Server rejected request as invalid: {}", context),
        }),
        28 => Some(FastDFSError::InsufficientSpace),
        _ => Some(FastDFSError::Protocol {
            code: status,
            message: format!("Unknown error code: {}", status),
        }),
    }
}
