//! FastDFS Tracker Client
//!
//! Queries the tracker for group statistics and for the storage server to use
//! for an upload, a download or an update. Selection policy is entirely the
//! tracker's; this client only consumes its answers.

use bytes::{Buf, Bytes, BytesMut, BufMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;

use crate::connection::ConnectionPool;
use crate::errors::{FastDFSError, Result};
use crate::protocol::*;
use crate::types::*;

/// Client for the tracker's service queries
pub struct TrackerClient {
    pool: Arc<ConnectionPool>,
    endpoint: ServerEndpoint,
    network_timeout: u64,
    storage_port: Option<u16>,
}

impl TrackerClient {
    /// Creates a tracker client talking to `endpoint` through `pool`
    pub fn new(pool: Arc<ConnectionPool>, endpoint: ServerEndpoint, network_timeout: u64) -> Self {
        Self {
            pool,
            endpoint,
            network_timeout,
            storage_port: None,
        }
    }

    /// Enables the local download-server fast path
    ///
    /// With a storage port set, download queries for filenames that carry
    /// their source server are answered without contacting the tracker.
    pub fn with_storage_port(mut self, storage_port: Option<u16>) -> Self {
        self.storage_port = storage_port;
        self
    }

    /// Tracker this client talks to
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Sends one request frame and reads one response body of at most
    /// `max_len` bytes
    async fn exchange(
        &self,
        cmd: TrackerCommand,
        body: &[u8],
        max_len: usize,
        context: &str,
    ) -> Result<Bytes> {
        let mut conn = self.pool.acquire(&self.endpoint).await?;
        let result = async {
            conn.send(&encode_frame(cmd.into(), body), self.network_timeout)
                .await?;
            conn.receive_response(self.network_timeout, max_len as u64, context)
                .await
        }
        .await;
        self.pool.finish(conn, result).await
    }

    /// Lists every group known to the tracker together with the storage
    /// servers currently accepting writes in it
    ///
    /// The per-group queries run one after another over a single pooled
    /// connection.
    pub async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let body = self
            .exchange(
                TrackerCommand::ServerListAllGroups,
                &[],
                FDFS_MAX_GROUPS * TRACKER_GROUP_STAT_LEN,
                "",
            )
            .await
            .map_err(|e| e.in_tracker("list groups"))?;
        let mut groups = parse_group_stats(&body).map_err(|e| e.in_tracker("list groups"))?;

        let servers: Vec<Vec<ServerEndpoint>> = stream::iter(groups.iter())
            .then(|group| self.query_storage_servers(&group.name))
            .try_collect()
            .await?;
        for (group, servers) in groups.iter_mut().zip(servers) {
            group.storage_servers = servers;
        }

        tracing::debug!(count = groups.len(), "listed groups");
        Ok(groups)
    }

    /// Lists the storage servers of `group_name` that accept writes
    ///
    /// A group without usable storage servers yields an empty list.
    pub async fn query_storage_servers(&self, group_name: &str) -> Result<Vec<ServerEndpoint>> {
        check_group_name(group_name)?;
        let request = pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN);

        match self
            .exchange(
                TrackerCommand::ServiceQueryStoreWithGroupAll,
                &request,
                STORAGE_LIST_MAX_LEN,
                group_name,
            )
            .await
        {
            Ok(body) => parse_storage_list(&body).map_err(|e| e.in_tracker("query store all")),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.in_tracker("query store all")),
        }
    }

    /// Asks the tracker for a storage server to upload to
    ///
    /// With no group (or an empty one) the tracker may pick any group.
    pub async fn query_storage_for_upload(&self, group_name: Option<&str>) -> Result<StorageAssignment> {
        let (cmd, request) = match group_name.filter(|g| !g.is_empty()) {
            Some(group) => {
                check_group_name(group)?;
                (
                    TrackerCommand::ServiceQueryStoreWithGroupOne,
                    pad_string(group, FDFS_GROUP_NAME_MAX_LEN),
                )
            }
            None => (TrackerCommand::ServiceQueryStoreWithoutGroupOne, Bytes::new()),
        };

        let body = match self
            .exchange(
                cmd,
                &request,
                TRACKER_QUERY_STORAGE_STORE_BODY_LEN,
                group_name.unwrap_or(""),
            )
            .await
        {
            Ok(body) => body,
            // the tracker answers ENOENT when the group has no usable storage
            Err(e) if e.is_not_found() => return Err(FastDFSError::NoStorageServer),
            Err(e) => return Err(e.in_tracker("query store")),
        };
        if body.is_empty() {
            return Err(FastDFSError::NoStorageServer);
        }

        let assignment = parse_store_reply(&body).map_err(|e| e.in_tracker("query store"))?;
        tracing::debug!(
            group = %assignment.group_name,
            storage = %assignment.endpoint,
            store_path_index = assignment.store_path_index,
            "tracker assigned storage"
        );
        Ok(assignment)
    }

    /// Resolves the storage server to read `remote_filename` from
    pub async fn query_storage_for_download(
        &self,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<ServerEndpoint> {
        check_group_name(group_name)?;
        check_remote_filename(remote_filename)?;

        if let Some(port) = self.storage_port {
            if let Some(info) = decode_remote_filename(remote_filename) {
                let endpoint = ServerEndpoint::new(info.source_ip.to_string(), port);
                tracing::trace!(%endpoint, "resolved storage from filename");
                return Ok(endpoint);
            }
        }

        self.query_file_location(TrackerCommand::ServiceQueryFetchOne, group_name, remote_filename)
            .await
            .map_err(|e| e.in_tracker("query fetch"))
    }

    /// Resolves the storage server to modify or delete `remote_filename` on
    pub async fn query_storage_for_update(
        &self,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<ServerEndpoint> {
        check_group_name(group_name)?;
        check_remote_filename(remote_filename)?;

        self.query_file_location(TrackerCommand::ServiceQueryUpdate, group_name, remote_filename)
            .await
            .map_err(|e| e.in_tracker("query update"))
    }

    async fn query_file_location(
        &self,
        cmd: TrackerCommand,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<ServerEndpoint> {
        let mut request = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + remote_filename.len());
        request.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN));
        request.put_slice(remote_filename.as_bytes());

        let body = self
            .exchange(cmd, &request, TRACKER_QUERY_STORAGE_FETCH_BODY_LEN, remote_filename)
            .await?;
        if body.len() < TRACKER_QUERY_STORAGE_FETCH_BODY_LEN {
            return Err(FastDFSError::InvalidResponse(format!(
                "Fetch reply too short: {} bytes",
                body.len()
            )));
        }
        parse_endpoint(&body[FDFS_GROUP_NAME_MAX_LEN..])
    }
}

/// Group name, a full group of (ip, port) entries and the store path index
const STORAGE_LIST_MAX_LEN: usize = FDFS_GROUP_NAME_MAX_LEN
    + 1
    + FDFS_MAX_SERVERS_EACH_GROUP * (TRACKER_IP_ADDRESS_SIZE + FDFS_PROTO_PKG_LEN_SIZE);

/// Storage commands only make sense for names a storage server could have assigned
fn check_remote_filename(remote_filename: &str) -> Result<()> {
    if is_valid_remote_filename(remote_filename) {
        Ok(())
    } else {
        Err(FastDFSError::FileNotFound(remote_filename.to_string()))
    }
}

/// Parses a 15-byte IP followed by an 8-byte port
fn parse_endpoint(data: &[u8]) -> Result<ServerEndpoint> {
    let ip_addr = unpad_string(&data[..TRACKER_IP_ADDRESS_SIZE]);
    let port = decode_int64(&data[TRACKER_IP_ADDRESS_SIZE..TRACKER_IP_ADDRESS_SIZE + 8]);
    let port = u16::try_from(port)
        .map_err(|_| FastDFSError::InvalidResponse(format!("Invalid storage port: {}", port)))?;
    if ip_addr.is_empty() {
        return Err(FastDFSError::InvalidResponse("Empty storage address".to_string()));
    }
    Ok(ServerEndpoint::new(ip_addr, port))
}

fn parse_store_reply(body: &[u8]) -> Result<StorageAssignment> {
    if body.len() < TRACKER_QUERY_STORAGE_STORE_BODY_LEN {
        return Err(FastDFSError::InvalidResponse(format!(
            "Storage server response too short: {} bytes",
            body.len()
        )));
    }

    Ok(StorageAssignment {
        group_name: unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]),
        endpoint: parse_endpoint(&body[FDFS_GROUP_NAME_MAX_LEN..])?,
        store_path_index: body[TRACKER_QUERY_STORAGE_STORE_BODY_LEN - 1],
    })
}

/// Group name, N × (ip, port), store path index
fn parse_storage_list(body: &[u8]) -> Result<Vec<ServerEndpoint>> {
    const ENTRY_LEN: usize = TRACKER_IP_ADDRESS_SIZE + FDFS_PROTO_PKG_LEN_SIZE;

    if body.len() < FDFS_GROUP_NAME_MAX_LEN + 1
        || (body.len() - FDFS_GROUP_NAME_MAX_LEN - 1) % ENTRY_LEN != 0
    {
        return Err(FastDFSError::InvalidResponse(format!(
            "Invalid storage list length: {} bytes",
            body.len()
        )));
    }

    body[FDFS_GROUP_NAME_MAX_LEN..body.len() - 1]
        .chunks(ENTRY_LEN)
        .map(parse_endpoint)
        .collect()
}

fn parse_group_stats(body: &[u8]) -> Result<Vec<GroupInfo>> {
    if body.len() % TRACKER_GROUP_STAT_LEN != 0 {
        return Err(FastDFSError::InvalidResponse(format!(
            "Group list length {} is not a multiple of {}",
            body.len(),
            TRACKER_GROUP_STAT_LEN
        )));
    }

    let groups = body
        .chunks(TRACKER_GROUP_STAT_LEN)
        .map(|record| {
            let name = unpad_string(&record[..FDFS_GROUP_NAME_MAX_LEN + 1]);
            let mut buf = &record[FDFS_GROUP_NAME_MAX_LEN + 1..];
            GroupInfo {
                name,
                storage_servers: Vec::new(),
                total_mb: buf.get_u64(),
                free_mb: buf.get_u64(),
                trunk_free_mb: buf.get_u64(),
                storage_count: buf.get_u64(),
                storage_port: buf.get_u64(),
                storage_http_port: buf.get_u64(),
                active_count: buf.get_u64(),
                current_write_server: buf.get_u64(),
                store_path_count: buf.get_u64(),
                subdir_count_per_path: buf.get_u64(),
                current_trunk_file_id: buf.get_u64(),
            }
        })
        .collect();

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_bytes(buf: &mut BytesMut, ip: &str, port: u64) {
        buf.put(pad_string(ip, TRACKER_IP_ADDRESS_SIZE));
        buf.put_u64(port);
    }

    #[test]
    fn test_parse_store_reply() {
        let mut body = BytesMut::new();
        body.put(pad_string("group2", FDFS_GROUP_NAME_MAX_LEN));
        endpoint_bytes(&mut body, "10.0.0.7", 23000);
        body.put_u8(3);

        let assignment = parse_store_reply(&body).unwrap();
        assert_eq!(assignment.group_name, "group2");
        assert_eq!(assignment.endpoint, ServerEndpoint::new("10.0.0.7", 23000));
        assert_eq!(assignment.store_path_index, 3);

        assert!(parse_store_reply(&body[..20]).is_err());
    }

    #[test]
    fn test_parse_storage_list() {
        let mut body = BytesMut::new();
        body.put(pad_string("group1", FDFS_GROUP_NAME_MAX_LEN));
        endpoint_bytes(&mut body, "10.0.0.1", 23000);
        endpoint_bytes(&mut body, "10.0.0.2", 23001);
        body.put_u8(0);

        let servers = parse_storage_list(&body).unwrap();
        assert_eq!(
            servers,
            vec![
                ServerEndpoint::new("10.0.0.1", 23000),
                ServerEndpoint::new("10.0.0.2", 23001)
            ]
        );

        assert!(parse_storage_list(&body[..body.len() - 2]).is_err());
    }

    #[test]
    fn test_parse_group_stats() {
        let mut body = BytesMut::new();
        for (name, free) in [("group1", 1024u64), ("group2", 2048u64)] {
            body.put(pad_string(name, FDFS_GROUP_NAME_MAX_LEN + 1));
            for field in [4096, free, 0, 2, 23000, 8888, 2, 0, 1, 256, 0] {
                body.put_u64(field);
            }
        }

        let groups = parse_group_stats(&body).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "group1");
        assert_eq!(groups[0].free_mb, 1024);
        assert_eq!(groups[1].free_mb, 2048);
        assert_eq!(groups[1].active_count, 2);
        assert_eq!(groups[1].storage_port, 23000);
        assert_eq!(groups[1].subdir_count_per_path, 256);

        assert!(parse_group_stats(&body[..100]).is_err());
    }

    #[test]
    fn test_parse_endpoint_rejects_bad_port() {
        let mut body = BytesMut::new();
        endpoint_bytes(&mut body, "10.0.0.1", 70000);
        assert!(parse_endpoint(&body).is_err());
    }
}
