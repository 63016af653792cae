//! Chunk RPC messages spoken between the proxy and the file server.
//!
//! Downloads are probe-first: the opening request of a fetch sets
//! `is_probe` and carries no payload back, only the open status, version
//! and total size, so the proxy can resolve a cache hit without moving
//! bytes. Subsequent requests walk `chunk_num` forward until a response
//! with `is_last` set.

use crate::frame::frame;
use crate::wire::*;
use crate::{OpenOption, ParseError};
use bytes::{BufMut, Bytes, BytesMut};

const OP_DOWNLOAD_CHUNK: u8 = 0x01;
const OP_UPLOAD_CHUNK: u8 = 0x02;
const OP_STAT_EXISTS: u8 = 0x03;
const OP_STAT_IS_DIR: u8 = 0x04;
const OP_STAT_VERSION: u8 = 0x05;
const OP_DELETE: u8 = 0x06;

const OP_CHUNK: u8 = 0x81;
const OP_BOOL: u8 = 0x82;
const OP_VERSION: u8 = 0x83;

/// A request from the proxy to the file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Fetch one chunk of a file, or probe its open status and metadata.
    DownloadChunk {
        path: String,
        chunk_num: u32,
        option: OpenOption,
        is_probe: bool,
    },
    /// Store one chunk of a new file version.
    UploadChunk {
        path: String,
        version: u64,
        chunk_num: u32,
        is_last: bool,
        data: Bytes,
    },
    /// Does the path exist on the server?
    StatExists { path: String },
    /// Is the path a directory on the server?
    StatIsDir { path: String },
    /// Current version of the path, -1 if absent.
    StatVersion { path: String },
    /// Remove the path from the server.
    Delete { path: String },
}

impl Request {
    /// Encode the request as a complete frame.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, |b| match self {
            Request::DownloadChunk {
                path,
                chunk_num,
                option,
                is_probe,
            } => {
                b.put_u8(OP_DOWNLOAD_CHUNK);
                put_str(b, path);
                b.put_u32(*chunk_num);
                b.put_u8(option.as_u8());
                put_bool(b, *is_probe);
            }
            Request::UploadChunk {
                path,
                version,
                chunk_num,
                is_last,
                data,
            } => {
                b.put_u8(OP_UPLOAD_CHUNK);
                put_str(b, path);
                b.put_u64(*version);
                b.put_u32(*chunk_num);
                put_bool(b, *is_last);
                put_bytes(b, data);
            }
            Request::StatExists { path } => {
                b.put_u8(OP_STAT_EXISTS);
                put_str(b, path);
            }
            Request::StatIsDir { path } => {
                b.put_u8(OP_STAT_IS_DIR);
                put_str(b, path);
            }
            Request::StatVersion { path } => {
                b.put_u8(OP_STAT_VERSION);
                put_str(b, path);
            }
            Request::Delete { path } => {
                b.put_u8(OP_DELETE);
                put_str(b, path);
            }
        });
    }

    /// Parse a request from a frame payload.
    pub fn parse(mut payload: &[u8]) -> Result<Self, ParseError> {
        let buf = &mut payload;
        let opcode = get_u8(buf)?;
        match opcode {
            OP_DOWNLOAD_CHUNK => {
                let path = get_str(buf)?;
                let chunk_num = get_u32(buf)?;
                let option = OpenOption::from_u8(get_u8(buf)?)
                    .ok_or(ParseError::Invalid("open option"))?;
                let is_probe = get_bool(buf)?;
                Ok(Request::DownloadChunk {
                    path,
                    chunk_num,
                    option,
                    is_probe,
                })
            }
            OP_UPLOAD_CHUNK => {
                let path = get_str(buf)?;
                let version = get_u64(buf)?;
                let chunk_num = get_u32(buf)?;
                let is_last = get_bool(buf)?;
                let data = get_bytes(buf)?;
                Ok(Request::UploadChunk {
                    path,
                    version,
                    chunk_num,
                    is_last,
                    data,
                })
            }
            OP_STAT_EXISTS => Ok(Request::StatExists { path: get_str(buf)? }),
            OP_STAT_IS_DIR => Ok(Request::StatIsDir { path: get_str(buf)? }),
            OP_STAT_VERSION => Ok(Request::StatVersion { path: get_str(buf)? }),
            OP_DELETE => Ok(Request::Delete { path: get_str(buf)? }),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

/// One chunk of a download, or the reply to a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    /// The request was legal (open status was not an error).
    pub valid: bool,
    /// The file exists on the server.
    pub exists: bool,
    /// Server-authoritative version of the file.
    pub version: u64,
    /// Total file size in bytes.
    pub total_size: u64,
    /// Which chunk this is.
    pub chunk_number: u32,
    /// No chunks follow this one.
    pub is_last: bool,
    /// Open-mode grant or negative errno.
    pub status_code: i32,
    /// Chunk payload; empty for probes.
    pub data: Bytes,
}

impl ChunkResponse {
    /// Reply for a request whose open was refused with `status_code`.
    pub fn refused(status_code: i32, chunk_number: u32) -> Self {
        Self {
            valid: false,
            exists: false,
            version: 0,
            total_size: 0,
            chunk_number,
            is_last: true,
            status_code,
            data: Bytes::new(),
        }
    }

    /// Reply for a legal open of a path absent on the server.
    pub fn absent(status_code: i32, chunk_number: u32) -> Self {
        Self {
            valid: true,
            exists: false,
            version: 0,
            total_size: 0,
            chunk_number,
            is_last: true,
            status_code,
            data: Bytes::new(),
        }
    }
}

/// A reply from the file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Download data or probe metadata.
    Chunk(ChunkResponse),
    /// Outcome of an upload chunk, a stat, or a delete.
    Bool(bool),
    /// A file version, -1 if absent.
    Version(i64),
}

impl Response {
    /// Encode the response as a complete frame.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, |b| match self {
            Response::Chunk(chunk) => {
                b.put_u8(OP_CHUNK);
                put_bool(b, chunk.valid);
                put_bool(b, chunk.exists);
                b.put_u64(chunk.version);
                b.put_u64(chunk.total_size);
                b.put_u32(chunk.chunk_number);
                put_bool(b, chunk.is_last);
                b.put_i32(chunk.status_code);
                put_bytes(b, &chunk.data);
            }
            Response::Bool(value) => {
                b.put_u8(OP_BOOL);
                put_bool(b, *value);
            }
            Response::Version(version) => {
                b.put_u8(OP_VERSION);
                b.put_i64(*version);
            }
        });
    }

    /// Parse a response from a frame payload.
    pub fn parse(mut payload: &[u8]) -> Result<Self, ParseError> {
        let buf = &mut payload;
        let opcode = get_u8(buf)?;
        match opcode {
            OP_CHUNK => {
                let valid = get_bool(buf)?;
                let exists = get_bool(buf)?;
                let version = get_u64(buf)?;
                let total_size = get_u64(buf)?;
                let chunk_number = get_u32(buf)?;
                let is_last = get_bool(buf)?;
                let status_code = get_i32(buf)?;
                let data = get_bytes(buf)?;
                Ok(Response::Chunk(ChunkResponse {
                    valid,
                    exists,
                    version,
                    total_size,
                    chunk_number,
                    is_last,
                    status_code,
                    data,
                }))
            }
            OP_BOOL => Ok(Response::Bool(get_bool(buf)?)),
            OP_VERSION => Ok(Response::Version(get_i64(buf)?)),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_frame;
    use crate::{MODE_RW, errno};

    fn roundtrip_request(request: Request) -> Request {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        Request::parse(&payload).unwrap()
    }

    fn roundtrip_response(response: Response) -> Response {
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        Response::parse(&payload).unwrap()
    }

    #[test]
    fn test_download_chunk_roundtrip() {
        let request = Request::DownloadChunk {
            path: "dir/a.txt".to_string(),
            chunk_num: 7,
            option: OpenOption::Write,
            is_probe: true,
        };
        assert_eq!(roundtrip_request(request.clone()), request);
    }

    #[test]
    fn test_upload_chunk_roundtrip() {
        let request = Request::UploadChunk {
            path: "b.bin".to_string(),
            version: 3,
            chunk_num: 1,
            is_last: false,
            data: Bytes::from_static(b"payload bytes"),
        };
        assert_eq!(roundtrip_request(request.clone()), request);
    }

    #[test]
    fn test_stat_and_delete_roundtrip() {
        for request in [
            Request::StatExists { path: "x".into() },
            Request::StatIsDir { path: "d".into() },
            Request::StatVersion { path: "v".into() },
            Request::Delete { path: "gone".into() },
        ] {
            assert_eq!(roundtrip_request(request.clone()), request);
        }
    }

    #[test]
    fn test_chunk_response_roundtrip() {
        let response = Response::Chunk(ChunkResponse {
            valid: true,
            exists: true,
            version: 12,
            total_size: 1_000_000,
            chunk_number: 3,
            is_last: true,
            status_code: MODE_RW,
            data: Bytes::from_static(b"tail"),
        });
        assert_eq!(roundtrip_response(response.clone()), response);
    }

    #[test]
    fn test_refused_response() {
        let refused = ChunkResponse::refused(errno::ENOENT, 0);
        assert!(!refused.valid);
        assert!(refused.is_last);
        let response = roundtrip_response(Response::Chunk(refused.clone()));
        assert_eq!(response, Response::Chunk(refused));
    }

    #[test]
    fn test_negative_version_roundtrip() {
        assert_eq!(
            roundtrip_response(Response::Version(-1)),
            Response::Version(-1)
        );
    }

    #[test]
    fn test_parse_truncated() {
        let request = Request::StatExists {
            path: "abcdef".into(),
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        let payload = decode_frame(&mut buf).unwrap().unwrap();

        // Drop the path tail: the string length no longer matches.
        assert!(matches!(
            Request::parse(&payload[..payload.len() - 2]),
            Err(ParseError::Truncated)
        ));
    }

    #[test]
    fn test_parse_unknown_opcode() {
        assert!(matches!(
            Request::parse(&[0x7f]),
            Err(ParseError::UnknownOpcode(0x7f))
        ));
        assert!(matches!(
            Response::parse(&[0x00]),
            Err(ParseError::UnknownOpcode(0x00))
        ));
    }

    #[test]
    fn test_parse_bad_open_option() {
        let mut buf = BytesMut::new();
        Request::DownloadChunk {
            path: "p".into(),
            chunk_num: 0,
            option: OpenOption::Read,
            is_probe: false,
        }
        .encode(&mut buf);
        let mut payload = decode_frame(&mut buf).unwrap().unwrap().to_vec();

        // Corrupt the option byte (path "p" is 2+1 bytes after the opcode).
        let option_at = 1 + 2 + 1 + 4;
        payload[option_at] = 9;
        assert!(matches!(
            Request::parse(&payload),
            Err(ParseError::Invalid(_))
        ));
    }
}
