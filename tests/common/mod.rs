//! In-process FastDFS server used by the client tests
//!
//! One listener answers both tracker and storage commands. Tracker replies
//! always point back at the listener itself, so a client configured with the
//! mock's port as its tracker ends up talking to the same process for storage
//! commands over a separate pool.

#![allow(dead_code)]

use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fdfs::protocol::{decode_metadata, encode_metadata, pad_string, unpad_string};
use fdfs::{ClientConfig, Metadata, FDFS_APPENDER_FILE_SIZE, FDFS_GROUP_NAME_MAX_LEN};

const NAME_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_encode_padding(false),
);

const ENOENT: u8 = 2;
const EINVAL: u8 = 22;
const GROUPS: [&str; 2] = ["group1", "group2"];

struct StoredFile {
    data: Vec<u8>,
    metadata: Metadata,
    appender: bool,
    created: u32,
}

#[derive(Default)]
struct State {
    files: HashMap<(String, String), StoredFile>,
    next_timestamp: u32,
    assigned_group: String,
}

/// Handle to a running mock server
pub struct MockServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    state: Arc<Mutex<State>>,
}

impl MockServer {
    /// Binds an ephemeral port and starts serving
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(Mutex::new(State {
            next_timestamp: 1_700_000_000,
            assigned_group: GROUPS[0].to_string(),
            ..Default::default()
        }));

        let counter = accepted.clone();
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone(), port));
            }
        });

        MockServer {
            port,
            accepted,
            state,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Client configuration pointing at this server
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
            .with_connect_timeout(1000)
            .with_network_timeout(2000)
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    /// Content stored under `group/filename`
    pub fn stored(&self, group_name: &str, filename: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(group_name.to_string(), filename.to_string()))
            .map(|f| f.data.clone())
    }
}

/// Accepts connections and keeps them open without ever replying
pub async fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    port
}

/// Answers each request, on any connection, with the next raw reply from
/// `replies`; once they run out it stops replying but keeps connections open
pub async fn scripted_server(replies: Vec<Vec<u8>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let replies = replies.clone();
            tokio::spawn(async move {
                while read_request(&mut stream).await.is_some() {
                    let reply = replies.lock().unwrap().pop_front();
                    match reply {
                        Some(reply) => {
                            if stream.write_all(&reply).await.is_err() {
                                return;
                            }
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
            });
        }
    });
    port
}

/// Raw response frame with the given announced length and status
pub fn reply_frame(length: u64, status: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(10 + body.len());
    frame.put_u64(length);
    frame.put_u8(100);
    frame.put_u8(status);
    frame.put_slice(body);
    frame.to_vec()
}

/// Reads one request frame, returning its command and body
async fn read_request(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 10];
    stream.read_exact(&mut header).await.ok()?;
    let mut length = &header[..8];
    let mut body = vec![0u8; length.get_u64() as usize];
    stream.read_exact(&mut body).await.ok()?;
    Some((header[8], body))
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>, port: u16) {
    while let Some((cmd, body)) = read_request(&mut stream).await {
        let (status, reply) = {
            let mut state = state.lock().unwrap();
            handle(&mut state, cmd, &body, port)
        };

        let response = reply_frame(reply.len() as u64, status, &reply);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn put_endpoint(buf: &mut BytesMut, port: u16) {
    buf.put(pad_string("127.0.0.1", 15));
    buf.put_u64(port as u64);
}

fn group_and_name(body: &[u8]) -> (String, String) {
    (
        unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]),
        String::from_utf8_lossy(&body[FDFS_GROUP_NAME_MAX_LEN..]).to_string(),
    )
}

fn ok(reply: BytesMut) -> (u8, Vec<u8>) {
    (0, reply.to_vec())
}

fn fail(status: u8) -> (u8, Vec<u8>) {
    (status, Vec::new())
}

fn handle(state: &mut State, cmd: u8, body: &[u8], port: u16) -> (u8, Vec<u8>) {
    match cmd {
        // query store, with or without a group
        101 | 104 => {
            let group = if cmd == 104 {
                unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN])
            } else {
                GROUPS[0].to_string()
            };
            if !GROUPS.contains(&group.as_str()) {
                return fail(ENOENT);
            }
            state.assigned_group = group.clone();
            let mut reply = BytesMut::new();
            reply.put(pad_string(&group, FDFS_GROUP_NAME_MAX_LEN));
            put_endpoint(&mut reply, port);
            reply.put_u8(0);
            ok(reply)
        }
        // query fetch / update
        102 | 103 => {
            let (group, _) = group_and_name(body);
            if !GROUPS.contains(&group.as_str()) {
                return fail(ENOENT);
            }
            let mut reply = BytesMut::new();
            reply.put(pad_string(&group, FDFS_GROUP_NAME_MAX_LEN));
            put_endpoint(&mut reply, port);
            ok(reply)
        }
        // list groups
        91 => {
            let mut reply = BytesMut::new();
            for (i, group) in GROUPS.iter().enumerate() {
                reply.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN + 1));
                let free = 1024 * (i as u64 + 1);
                for field in [4096, free, 0, 1, port as u64, 8888, 1, 0, 1, 256, 0] {
                    reply.put_u64(field);
                }
            }
            ok(reply)
        }
        // storage servers of one group
        107 => {
            let group = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
            if !GROUPS.contains(&group.as_str()) {
                return fail(ENOENT);
            }
            let mut reply = BytesMut::new();
            reply.put(pad_string(&group, FDFS_GROUP_NAME_MAX_LEN));
            put_endpoint(&mut reply, port);
            reply.put_u8(0);
            ok(reply)
        }
        // upload, upload appender
        11 | 23 => {
            let mut fields = &body[1..];
            let size = fields.get_u64() as usize;
            let ext = unpad_string(&fields[..6]);
            let data = fields[6..].to_vec();
            if data.len() != size {
                return fail(EINVAL);
            }

            let appender = cmd == 23;
            let created = state.next_timestamp;
            state.next_timestamp += 1;

            let mut raw = BytesMut::new();
            raw.put_slice(&[127, 0, 0, 1]);
            raw.put_u32(created);
            let encoded_size = if appender {
                size as u64 | FDFS_APPENDER_FILE_SIZE
            } else {
                size as u64
            };
            raw.put_u64(encoded_size);
            raw.put_u32(crc32fast::hash(&data));

            let mut filename = format!("M00/00/00/{}", NAME_BASE64.encode(&raw));
            if !ext.is_empty() {
                filename.push('.');
                filename.push_str(&ext);
            }

            let group = state.assigned_group.clone();
            state.files.insert(
                (group.clone(), filename.clone()),
                StoredFile {
                    data,
                    metadata: Metadata::new(),
                    appender,
                    created,
                },
            );

            let mut reply = BytesMut::new();
            reply.put(pad_string(&group, FDFS_GROUP_NAME_MAX_LEN));
            reply.put_slice(filename.as_bytes());
            ok(reply)
        }
        // append, modify
        24 | 34 => {
            let mut fields = body;
            let name_len = fields.get_u64() as usize;
            let offset = if cmd == 34 { Some(fields.get_u64() as usize) } else { None };
            let size = fields.get_u64() as usize;
            let filename = String::from_utf8_lossy(&fields[..name_len]).to_string();
            let data = &fields[name_len..];
            if data.len() != size {
                return fail(EINVAL);
            }

            let file = state
                .files
                .iter_mut()
                .find(|((_, name), _)| *name == filename)
                .map(|(_, file)| file);
            let Some(file) = file else {
                return fail(ENOENT);
            };
            if !file.appender {
                return fail(EINVAL);
            }

            let start = offset.unwrap_or(file.data.len());
            if start > file.data.len() {
                return fail(EINVAL);
            }
            let end = start + data.len();
            if end > file.data.len() {
                file.data.resize(end, 0);
            }
            file.data[start..end].copy_from_slice(data);
            ok(BytesMut::new())
        }
        // download
        14 => {
            let mut fields = body;
            let offset = fields.get_u64() as usize;
            let length = fields.get_u64() as usize;
            let key = group_and_name(fields);
            let Some(file) = state.files.get(&key) else {
                return fail(ENOENT);
            };
            if offset > file.data.len() {
                return fail(EINVAL);
            }
            let end = if length == 0 {
                file.data.len()
            } else {
                (offset + length).min(file.data.len())
            };
            (0, file.data[offset..end].to_vec())
        }
        // query file info
        22 => {
            let key = group_and_name(body);
            let Some(file) = state.files.get(&key) else {
                return fail(ENOENT);
            };
            let mut reply = BytesMut::new();
            reply.put_u64(file.data.len() as u64);
            reply.put_u64(file.created as u64);
            reply.put_u64(crc32fast::hash(&file.data) as u64);
            reply.put(pad_string("127.0.0.1", 16));
            ok(reply)
        }
        // get metadata
        15 => {
            let key = group_and_name(body);
            match state.files.get(&key) {
                Some(file) => (0, encode_metadata(&file.metadata).to_vec()),
                None => fail(ENOENT),
            }
        }
        // set metadata
        13 => {
            let mut fields = body;
            let name_len = fields.get_u64() as usize;
            let meta_len = fields.get_u64() as usize;
            let flag = fields.get_u8();
            let group = unpad_string(&fields[..FDFS_GROUP_NAME_MAX_LEN]);
            let rest = &fields[FDFS_GROUP_NAME_MAX_LEN..];
            let filename = String::from_utf8_lossy(&rest[..name_len]).to_string();
            let incoming = decode_metadata(&rest[name_len..name_len + meta_len]);

            let Some(file) = state.files.get_mut(&(group, filename)) else {
                return fail(ENOENT);
            };
            match flag {
                b'O' => file.metadata = incoming,
                b'M' => file.metadata.extend(incoming),
                _ => return fail(EINVAL),
            }
            ok(BytesMut::new())
        }
        // delete
        12 => {
            let key = group_and_name(body);
            match state.files.remove(&key) {
                Some(_) => ok(BytesMut::new()),
                None => fail(ENOENT),
            }
        }
        _ => fail(EINVAL),
    }
}
