//! FastDFS Connection Management
//!
//! This module handles TCP connections to FastDFS servers with connection pooling
//! and health checking.
//!
//! Every operation acquires a connection, performs one request/response exchange
//! on it and hands it back through [`ConnectionPool::finish`], which keeps the
//! connection when the exchange ended cleanly and discards it otherwise.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::{map_status_to_error, FastDFSError, Result};
use crate::protocol::{decode_frame, decode_header};
use crate::types::{FrameHeader, ServerEndpoint, FDFS_PROTO_CMD_RESP, FDFS_PROTO_HEADER_LEN};

/// Largest body accepted alongside a nonzero status before the connection is
/// considered out of sync
const MAX_ERROR_BODY_LEN: u64 = 64 * 1024;

/// Represents a TCP connection to a FastDFS server (tracker or storage)
///
/// It wraps a TcpStream with additional metadata and async operations.
/// Each connection tracks its last usage time for idle timeout management.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    endpoint: ServerEndpoint,
    last_used: Instant,
}

impl Connection {
    /// Creates a new connection with an established TCP stream
    pub fn new(stream: TcpStream, endpoint: ServerEndpoint) -> Self {
        Self {
            stream,
            endpoint,
            last_used: Instant::now(),
        }
    }

    /// Transmits data to the server with a timeout
    ///
    /// This method updates the last_used timestamp.
    pub async fn send(&mut self, data: &[u8], timeout_ms: u64) -> Result<()> {
        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.stream.write_all(data),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "write".to_string(),
                addr: self.endpoint.to_string(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::NetworkTimeout {
                operation: "write".to_string(),
                addr: self.endpoint.to_string(),
            }),
        }
    }

    /// Fills `buf` completely from the server
    ///
    /// The timeout applies to the entire read, not individual socket reads.
    pub async fn receive_into(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<()> {
        let result = timeout(
            Duration::from_millis(timeout_ms),
            self.stream.read_exact(buf),
        )
        .await;

        match result {
            Ok(Ok(_)) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "read".to_string(),
                addr: self.endpoint.to_string(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::NetworkTimeout {
                operation: "read".to_string(),
                addr: self.endpoint.to_string(),
            }),
        }
    }

    /// Reads exactly 'size' bytes from the server
    ///
    /// `size` is allocated up front; callers bound it first.
    pub async fn receive_full(&mut self, size: usize, timeout_ms: u64) -> Result<Bytes> {
        let mut buf = vec![0u8; size];
        self.receive_into(&mut buf, timeout_ms).await?;
        Ok(Bytes::from(buf))
    }

    /// Reads a response header and checks its status
    ///
    /// On a nonzero status the (normally empty) body is drained so the
    /// connection stays usable, and the mapped status error is returned.
    /// On success the caller is responsible for reading `length` body bytes.
    pub async fn receive_header(&mut self, timeout_ms: u64, context: &str) -> Result<FrameHeader> {
        let data = self.receive_full(FDFS_PROTO_HEADER_LEN, timeout_ms).await?;
        let header = decode_header(&data)?;
        if header.cmd != FDFS_PROTO_CMD_RESP {
            return Err(FastDFSError::InvalidResponse(format!(
                "Unexpected response command {} from {}",
                header.cmd, self.endpoint
            )));
        }

        if let Some(err) = map_status_to_error(header.status, context) {
            if header.length > MAX_ERROR_BODY_LEN {
                return Err(FastDFSError::InvalidResponse(format!(
                    "Oversized error body of {} bytes",
                    header.length
                )));
            }
            if header.length > 0 {
                self.receive_full(header.length as usize, timeout_ms).await?;
            }
            return Err(err);
        }

        Ok(header)
    }

    /// Reads one complete response frame and returns its body
    ///
    /// A header announcing more than `max_len` body bytes is rejected before
    /// anything is allocated for it.
    pub async fn receive_response(
        &mut self,
        timeout_ms: u64,
        max_len: u64,
        context: &str,
    ) -> Result<Bytes> {
        let header_data = self.receive_full(FDFS_PROTO_HEADER_LEN, timeout_ms).await?;
        let header = decode_header(&header_data)?;
        if header.cmd != FDFS_PROTO_CMD_RESP {
            return Err(FastDFSError::InvalidResponse(format!(
                "Unexpected response command {} from {}",
                header.cmd, self.endpoint
            )));
        }
        let limit = if header.status == 0 { max_len } else { MAX_ERROR_BODY_LEN };
        if header.length > limit {
            return Err(FastDFSError::InvalidResponse(format!(
                "Response body of {} bytes exceeds {} from {}",
                header.length, limit, self.endpoint
            )));
        }

        let body = self.receive_full(header.length as usize, timeout_ms).await?;
        tracing::trace!(endpoint = %self.endpoint, len = body.len(), "received response");

        let mut frame = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body.len());
        frame.extend_from_slice(&header_data);
        frame.extend_from_slice(&body);
        Ok(decode_frame(&frame, context)?.body)
    }

    /// Non-blocking probe: a healthy idle connection has nothing to read
    ///
    /// A closed peer reads as end-of-stream and unsolicited bytes mean the
    /// stream is out of sync; both make the connection unusable.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.try_read(&mut probe) {
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }

    /// Returns the timestamp of the last send or receive operation
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Returns the server this connection is connected to
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Manages a pool of reusable connections to multiple servers
///
/// It maintains separate idle lists for each server endpoint and handles:
///   - Connection reuse to minimize overhead
///   - Idle connection cleanup
///   - Thread-safe concurrent access
///   - Connection health checking before reuse
pub struct ConnectionPool {
    max_conns: usize,
    connect_timeout: Duration,
    idle_timeout: Duration,
    pools: Mutex<HashMap<ServerEndpoint, Vec<Connection>>>,
    closed: Mutex<bool>,
}

impl ConnectionPool {
    /// Creates a new, empty connection pool
    ///
    /// Connections are created on demand when acquire is called.
    pub fn new(max_conns: usize, connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            max_conns,
            connect_timeout,
            idle_timeout,
            pools: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    /// Retrieves an idle connection to `endpoint` or opens a new one
    ///
    /// The most recently released connection is tried first. Connections that
    /// have been idle too long or fail the liveness probe are discarded.
    pub async fn acquire(&self, endpoint: &ServerEndpoint) -> Result<Connection> {
        if *self.closed.lock().await {
            return Err(FastDFSError::ClientClosed);
        }

        {
            let mut pools = self.pools.lock().await;
            if let Some(pool) = pools.get_mut(endpoint) {
                while let Some(conn) = pool.pop() {
                    if conn.last_used().elapsed() < self.idle_timeout && conn.is_alive() {
                        tracing::trace!(%endpoint, "reusing pooled connection");
                        return Ok(conn);
                    }
                    tracing::debug!(%endpoint, "discarding stale connection");
                }
            }
        }

        self.create_connection(endpoint).await
    }

    /// Creates a new TCP connection to a server
    async fn create_connection(&self, endpoint: &ServerEndpoint) -> Result<Connection> {
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%endpoint, "opened connection");
                Ok(Connection::new(stream, endpoint.clone()))
            }
            Ok(Err(e)) => Err(FastDFSError::Network {
                operation: "connect".to_string(),
                addr: endpoint.to_string(),
                source: e,
            }),
            Err(_) => Err(FastDFSError::ConnectionTimeout(endpoint.to_string())),
        }
    }

    /// Returns a healthy connection to the idle set
    ///
    /// The connection is dropped instead when the pool is closed or already
    /// holds `max_conns` idle connections for that server.
    pub async fn release(&self, conn: Connection) {
        if *self.closed.lock().await {
            return;
        }

        let mut pools = self.pools.lock().await;
        let pool = pools.entry(conn.endpoint().clone()).or_default();

        let idle_timeout = self.idle_timeout;
        pool.retain(|c| c.last_used().elapsed() <= idle_timeout);

        if pool.len() < self.max_conns {
            pool.push(conn);
        }
    }

    /// Closes a connection that must not be reused
    pub async fn invalidate(&self, conn: Connection) {
        tracing::debug!(endpoint = %conn.endpoint(), "invalidating connection");
        conn.shutdown().await;
    }

    /// Ends an exchange: releases the connection when `result` is a success or
    /// a complete server reply, invalidates it otherwise, and passes `result` on
    pub async fn finish<T>(&self, conn: Connection, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.release(conn).await,
            Err(e) if e.leaves_connection_usable() => self.release(conn).await,
            Err(_) => self.invalidate(conn).await,
        }
        result
    }

    /// Number of idle connections currently held for `endpoint`
    pub async fn idle_count(&self, endpoint: &ServerEndpoint) -> usize {
        self.pools
            .lock()
            .await
            .get(endpoint)
            .map_or(0, |pool| pool.len())
    }

    /// Shuts down the connection pool and closes all connections
    ///
    /// After close is called, acquire will return ClientClosed error.
    /// It's safe to call close multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        let mut pools = self.pools.lock().await;
        pools.clear();
    }
}
