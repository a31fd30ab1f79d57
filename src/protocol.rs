//! FastDFS Protocol Encoding and Decoding
//!
//! This module handles all protocol-level encoding and decoding operations
//! for communication with FastDFS servers: frames, fixed-width fields,
//! metadata records and the information FastDFS packs into remote filenames.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::errors::{map_status_to_error, FastDFSError, Result};
use crate::types::*;

/// Storage servers encode filenames with the URL-safe alphabet and no padding
const FILENAME_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Fields a storage server packs into the base64 part of a remote filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameInfo {
    /// Storage server that received the upload
    pub source_ip: Ipv4Addr,
    /// Upload time, seconds since the epoch
    pub create_timestamp: u32,
    /// File size; unknown for appender files
    pub file_size: Option<u64>,
    /// CRC32 of the uploaded content
    pub crc32: u32,
}

/// Encodes a FastDFS protocol header into a 10-byte buffer
///
/// The header format is:
///   - Bytes 0-7: Body length (8 bytes, big-endian uint64)
///   - Byte 8: Command code
///   - Byte 9: Status code (0 for request, error code for response)
pub fn encode_header(length: u64, cmd: u8, status: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN);
    buf.put_u64(length);
    buf.put_u8(cmd);
    buf.put_u8(status);
    buf.freeze()
}

/// Decodes a FastDFS protocol header from a buffer
///
/// Only the first 10 bytes are read.
pub fn decode_header(data: &[u8]) -> Result<FrameHeader> {
    if data.len() < FDFS_PROTO_HEADER_LEN {
        return Err(FastDFSError::InvalidResponse(format!(
            "Header too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = &data[..FDFS_PROTO_HEADER_LEN];
    let length = buf.get_u64();
    let cmd = buf.get_u8();
    let status = buf.get_u8();

    Ok(FrameHeader { length, cmd, status })
}

/// Encodes a complete request frame: header followed by `body`
pub fn encode_frame(cmd: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN + body.len());
    buf.put(encode_header(body.len() as u64, cmd, 0));
    buf.put_slice(body);
    buf.freeze()
}

/// Decodes one complete frame
///
/// Fails when the header's length field disagrees with the bytes present,
/// and with the mapped status error when the status byte is nonzero.
/// `context` names the subject of the request (usually the remote filename)
/// and ends up in not-found errors.
pub fn decode_frame(data: &[u8], context: &str) -> Result<Frame> {
    let header = decode_header(data)?;
    let available = (data.len() - FDFS_PROTO_HEADER_LEN) as u64;
    if header.length != available {
        return Err(FastDFSError::InvalidResponse(format!(
            "Length field {} does not match {} body bytes",
            header.length, available
        )));
    }
    if let Some(err) = map_status_to_error(header.status, context) {
        return Err(err);
    }

    Ok(Frame {
        cmd: header.cmd,
        status: header.status,
        body: Bytes::copy_from_slice(&data[FDFS_PROTO_HEADER_LEN..]),
    })
}

/// Splits a FastDFS file ID into its components
///
/// A file ID has the format: "groupName/path/to/file"
/// For example: "group1/M00/00/00/wKgBcFxyz.jpg"
pub fn split_file_id(file_id: &str) -> Result<(String, String)> {
    let (group_name, remote_filename) = file_id
        .split_once('/')
        .ok_or_else(|| FastDFSError::InvalidFileId(file_id.to_string()))?;

    if group_name.is_empty() || group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    if remote_filename.is_empty() {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    Ok((group_name.to_string(), remote_filename.to_string()))
}

/// Constructs a complete file ID from its components
///
/// This is the inverse operation of split_file_id.
pub fn join_file_id(group_name: &str, remote_filename: &str) -> String {
    format!("{}/{}", group_name, remote_filename)
}

/// Encodes metadata key-value pairs into FastDFS wire format
///
/// Format: key1<0x02>value1<0x01>key2<0x02>value2
///
/// Keys are truncated to 64 bytes and values to 256 bytes if they exceed limits.
/// Records are written in key order so equal maps encode identically.
pub fn encode_metadata(metadata: &Metadata) -> Bytes {
    if metadata.is_empty() {
        return Bytes::new();
    }

    let mut entries: Vec<(&String, &String)> = metadata.iter().collect();
    entries.sort();

    let mut buf = BytesMut::new();
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            buf.put_u8(FDFS_RECORD_SEPARATOR);
        }

        let key_bytes = key.as_bytes();
        let value_bytes = value.as_bytes();
        let key_len = key_bytes.len().min(FDFS_MAX_META_NAME_LEN);
        let value_len = value_bytes.len().min(FDFS_MAX_META_VALUE_LEN);

        buf.put_slice(&key_bytes[..key_len]);
        buf.put_u8(FDFS_FIELD_SEPARATOR);
        buf.put_slice(&value_bytes[..value_len]);
    }

    buf.freeze()
}

/// Decodes FastDFS wire format metadata into a HashMap
///
/// This is the inverse operation of encode_metadata.
/// Records without exactly one field separator are skipped; a repeated key
/// keeps the last value.
pub fn decode_metadata(data: &[u8]) -> Metadata {
    let mut metadata = HashMap::new();

    for record in data.split(|&b| b == FDFS_RECORD_SEPARATOR) {
        if record.is_empty() {
            continue;
        }

        let fields: Vec<&[u8]> = record.split(|&b| b == FDFS_FIELD_SEPARATOR).collect();
        if fields.len() != 2 {
            continue;
        }

        let key = String::from_utf8_lossy(fields[0]).to_string();
        let value = String::from_utf8_lossy(fields[1]).to_string();
        metadata.insert(key, value);
    }

    metadata
}

/// Extracts the file extension from a local path
///
/// The extension is lowercased, has no leading dot and is truncated to 6 characters
/// if it exceeds the FastDFS maximum.
///
/// Examples:
///   - "test.JPG" -> "jpg"
///   - "file.tar.gz" -> "gz"
///   - "noext" -> ""
///   - "file.verylongext" -> "verylo" (truncated)
pub fn get_file_ext_name(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .chars()
        .take(FDFS_FILE_EXT_NAME_MAX_LEN)
        .collect::<String>()
        .to_lowercase()
}

/// Pads a string to a fixed length with null bytes (0x00)
///
/// This is used to create fixed-width fields in the FastDFS protocol.
/// If the string is longer than length, it will be truncated.
pub fn pad_string(s: &str, length: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(length);
    let bytes = s.as_bytes();
    let copy_len = bytes.len().min(length);
    buf.put_slice(&bytes[..copy_len]);
    buf.resize(length, 0);
    buf.freeze()
}

/// Removes trailing null bytes from a byte slice
///
/// Fields are cut at the first null so that C-style terminated strings decode
/// the same way as padded ones.
pub fn unpad_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Decodes an 8-byte big-endian representation to a 64-bit integer
///
/// FastDFS protocol uses big-endian byte order for all numeric fields.
pub fn decode_int64(data: &[u8]) -> u64 {
    if data.len() < 8 {
        return 0;
    }
    let mut buf = &data[..8];
    buf.get_u64()
}

/// Validates a group name before it is padded into a 16-byte field
pub fn check_group_name(group_name: &str) -> Result<()> {
    if group_name.is_empty() || group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidArgument(format!(
            "Group name must be 1 to {} bytes: {:?}",
            FDFS_GROUP_NAME_MAX_LEN, group_name
        )));
    }
    Ok(())
}

/// Checks that a remote filename has the shape storage servers assign
///
/// Names look like `M00/00/00/` followed by a 27-character base64 block and
/// an optional extension. Anything else cannot exist on a storage server.
pub fn is_valid_remote_filename(remote_filename: &str) -> bool {
    let bytes = remote_filename.as_bytes();
    bytes.len() >= FDFS_LOGIC_FILE_PATH_LEN + FDFS_FILENAME_BASE64_LENGTH
        && bytes[0] == b'M'
        && bytes[1].is_ascii_hexdigit()
        && bytes[2].is_ascii_hexdigit()
        && bytes[3] == b'/'
}

/// Decodes the fields packed into a remote filename
///
/// Returns `None` when the name is malformed.
pub fn decode_remote_filename(remote_filename: &str) -> Option<FilenameInfo> {
    if !is_valid_remote_filename(remote_filename) {
        return None;
    }

    let encoded = remote_filename
        .get(FDFS_LOGIC_FILE_PATH_LEN..FDFS_LOGIC_FILE_PATH_LEN + FDFS_FILENAME_BASE64_LENGTH)?;
    let decoded = FILENAME_BASE64.decode(encoded).ok()?;
    if decoded.len() < 20 {
        return None;
    }

    let mut buf = &decoded[..20];
    let source_ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
    let create_timestamp = buf.get_u32();
    let raw_size = buf.get_u64();
    let crc32 = buf.get_u32();

    let file_size = if raw_size & FDFS_APPENDER_FILE_SIZE != 0 {
        None
    } else if raw_size >> 63 != 0 || raw_size & FDFS_TRUNK_FILE_MARK_SIZE != 0 {
        // low 32 bits carry the size, the rest is random or trunk marking
        Some(raw_size & 0xFFFF_FFFF)
    } else {
        Some(raw_size)
    };

    Some(FilenameInfo {
        source_ip,
        create_timestamp,
        file_size,
        crc32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_name(ip: [u8; 4], ts: u32, size: u64, crc: u32, ext: &str) -> String {
        let mut raw = BytesMut::new();
        raw.put_slice(&ip);
        raw.put_u32(ts);
        raw.put_u64(size);
        raw.put_u32(crc);
        format!("M00/00/00/{}.{}", FILENAME_BASE64.encode(&raw), ext)
    }

    #[test]
    fn test_encode_decode_header() {
        let length = 1024;
        let cmd = 11;
        let status = 0;

        let encoded = encode_header(length, cmd, status);
        assert_eq!(encoded.len(), FDFS_PROTO_HEADER_LEN);

        let decoded = decode_header(&encoded).unwrap();
        assert_eq!(decoded.length, length);
        assert_eq!(decoded.cmd, cmd);
        assert_eq!(decoded.status, status);
    }

    #[test]
    fn test_decode_frame_length_mismatch() {
        let mut frame = BytesMut::new();
        frame.put(encode_header(5, FDFS_PROTO_CMD_RESP, 0));
        frame.put_slice(b"abc");

        let err = decode_frame(&frame, "").unwrap_err();
        assert!(matches!(err, FastDFSError::InvalidResponse(_)));
    }

    #[test]
    fn test_decode_frame_surfaces_status() {
        let frame = encode_header(0, FDFS_PROTO_CMD_RESP, 2);
        let err = decode_frame(&frame, "M00/00/00/missing").unwrap_err();
        assert!(err.is_not_found());

        let frame = encode_header(0, FDFS_PROTO_CMD_RESP, 71);
        let err = decode_frame(&frame, "").unwrap_err();
        assert_eq!(err.status_code(), Some(71));
    }

    #[test]
    fn test_encode_decode_frame() {
        let frame = encode_frame(StorageCommand::GetMetadata.into(), b"payload");
        let decoded = decode_frame(&frame, "").unwrap();
        assert_eq!(decoded.cmd, 15);
        assert_eq!(decoded.status, 0);
        assert_eq!(&decoded.body[..], b"payload");
    }

    #[test]
    fn test_split_file_id() {
        let file_id = "group1/M00/00/00/test.jpg";
        let (group_name, remote_filename) = split_file_id(file_id).unwrap();

        assert_eq!(group_name, "group1");
        assert_eq!(remote_filename, "M00/00/00/test.jpg");
        assert_eq!(join_file_id(&group_name, &remote_filename), file_id);
    }

    #[test]
    fn test_encode_metadata_is_ordered() {
        let mut metadata = HashMap::new();
        metadata.insert("width".to_string(), "1024".to_string());
        metadata.insert("height".to_string(), "768".to_string());

        let encoded = encode_metadata(&metadata);
        assert_eq!(&encoded[..], b"height\x02768\x01width\x021024");
        assert_eq!(decode_metadata(&encoded), metadata);
    }

    #[test]
    fn test_decode_metadata_last_write_wins() {
        let decoded = decode_metadata(b"k\x02one\x01k\x02two\x01broken");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("k"), Some(&"two".to_string()));
    }

    #[test]
    fn test_get_file_ext_name() {
        assert_eq!(get_file_ext_name("test.jpg"), "jpg");
        assert_eq!(get_file_ext_name("/tmp/PHOTO.JPEG"), "jpeg");
        assert_eq!(get_file_ext_name("file.tar.gz"), "gz");
        assert_eq!(get_file_ext_name("noext"), "");
        assert_eq!(get_file_ext_name("file.verylongext"), "verylo");
    }

    #[test]
    fn test_pad_unpad_string() {
        let padded = pad_string("test", 16);
        assert_eq!(padded.len(), 16);
        assert_eq!(unpad_string(&padded), "test");
        assert_eq!(unpad_string(b"abc\0garbage"), "abc");
    }

    #[test]
    fn test_decode_remote_filename() {
        let name = encoded_name([192, 168, 1, 112], 1_700_000_000, 4096, 0xDEADBEEF, "jpg");
        let info = decode_remote_filename(&name).unwrap();

        assert_eq!(info.source_ip, Ipv4Addr::new(192, 168, 1, 112));
        assert_eq!(info.create_timestamp, 1_700_000_000);
        assert_eq!(info.file_size, Some(4096));
        assert_eq!(info.crc32, 0xDEADBEEF);
    }

    #[test]
    fn test_decode_remote_filename_flags() {
        let appender = encoded_name([10, 0, 0, 1], 1, FDFS_APPENDER_FILE_SIZE | 7, 0, "log");
        assert_eq!(decode_remote_filename(&appender).unwrap().file_size, None);

        let randomized = encoded_name([10, 0, 0, 1], 1, (1 << 63) | (0x1234 << 32) | 99, 0, "bin");
        assert_eq!(decode_remote_filename(&randomized).unwrap().file_size, Some(99));
    }

    #[test]
    fn test_check_group_name() {
        assert!(check_group_name("group1").is_ok());
        assert!(check_group_name("").is_err());
        assert!(check_group_name("seventeen-bytes-x").is_err());
    }

    #[test]
    fn test_invalid_remote_filename() {
        assert!(!is_valid_remote_filename("nonexistent"));
        assert!(!is_valid_remote_filename("X00/00/00/wKgBcFxyzwKgBcFxyzwKgBcFxyzAB.jpg"));
        assert!(decode_remote_filename("M00/00/00/short").is_none());
    }
}
