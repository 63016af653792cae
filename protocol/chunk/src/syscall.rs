//! POSIX-style operations spoken between clients and the proxy.
//!
//! Every operation resolves to a single numeric result in the POSIX style:
//! a descriptor, byte count or position on success, a negative errno on
//! failure. Reads additionally carry the bytes. Read and write payloads
//! are bounded by one transfer chunk per message; callers loop for more.

use crate::frame::frame;
use crate::wire::*;
use crate::{OpenOption, ParseError, Whence};
use bytes::{BufMut, Bytes, BytesMut};

const OP_OPEN: u8 = 0x10;
const OP_CLOSE: u8 = 0x11;
const OP_READ: u8 = 0x12;
const OP_WRITE: u8 = 0x13;
const OP_LSEEK: u8 = 0x14;
const OP_UNLINK: u8 = 0x15;
const OP_CLIENT_DONE: u8 = 0x16;

const OP_CODE: u8 = 0x90;
const OP_DATA: u8 = 0x91;

/// A file operation from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { path: String, option: OpenOption },
    Close { fd: u64 },
    Read { fd: u64, len: u32 },
    Write { fd: u64, data: Bytes },
    Lseek { fd: u64, offset: i64, whence: Whence },
    Unlink { path: String },
    ClientDone,
}

impl Request {
    /// Encode the request as a complete frame.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, |b| match self {
            Request::Open { path, option } => {
                b.put_u8(OP_OPEN);
                put_str(b, path);
                b.put_u8(option.as_u8());
            }
            Request::Close { fd } => {
                b.put_u8(OP_CLOSE);
                b.put_u64(*fd);
            }
            Request::Read { fd, len } => {
                b.put_u8(OP_READ);
                b.put_u64(*fd);
                b.put_u32(*len);
            }
            Request::Write { fd, data } => {
                b.put_u8(OP_WRITE);
                b.put_u64(*fd);
                put_bytes(b, data);
            }
            Request::Lseek { fd, offset, whence } => {
                b.put_u8(OP_LSEEK);
                b.put_u64(*fd);
                b.put_i64(*offset);
                b.put_u8(whence.as_u8());
            }
            Request::Unlink { path } => {
                b.put_u8(OP_UNLINK);
                put_str(b, path);
            }
            Request::ClientDone => {
                b.put_u8(OP_CLIENT_DONE);
            }
        });
    }

    /// Parse a request from a frame payload.
    pub fn parse(mut payload: &[u8]) -> Result<Self, ParseError> {
        let buf = &mut payload;
        let opcode = get_u8(buf)?;
        match opcode {
            OP_OPEN => {
                let path = get_str(buf)?;
                let option = OpenOption::from_u8(get_u8(buf)?)
                    .ok_or(ParseError::Invalid("open option"))?;
                Ok(Request::Open { path, option })
            }
            OP_CLOSE => Ok(Request::Close { fd: get_u64(buf)? }),
            OP_READ => Ok(Request::Read {
                fd: get_u64(buf)?,
                len: get_u32(buf)?,
            }),
            OP_WRITE => Ok(Request::Write {
                fd: get_u64(buf)?,
                data: get_bytes(buf)?,
            }),
            OP_LSEEK => {
                let fd = get_u64(buf)?;
                let offset = get_i64(buf)?;
                let whence =
                    Whence::from_u8(get_u8(buf)?).ok_or(ParseError::Invalid("whence"))?;
                Ok(Request::Lseek { fd, offset, whence })
            }
            OP_UNLINK => Ok(Request::Unlink { path: get_str(buf)? }),
            OP_CLIENT_DONE => Ok(Request::ClientDone),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

/// The proxy's reply to a file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Descriptor, byte count, position, or negative errno.
    Code(i64),
    /// Read result: byte count (or negative errno) plus the bytes.
    Data { code: i64, data: Bytes },
}

impl Response {
    /// Encode the response as a complete frame.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, |b| match self {
            Response::Code(code) => {
                b.put_u8(OP_CODE);
                b.put_i64(*code);
            }
            Response::Data { code, data } => {
                b.put_u8(OP_DATA);
                b.put_i64(*code);
                put_bytes(b, data);
            }
        });
    }

    /// Parse a response from a frame payload.
    pub fn parse(mut payload: &[u8]) -> Result<Self, ParseError> {
        let buf = &mut payload;
        let opcode = get_u8(buf)?;
        match opcode {
            OP_CODE => Ok(Response::Code(get_i64(buf)?)),
            OP_DATA => Ok(Response::Data {
                code: get_i64(buf)?,
                data: get_bytes(buf)?,
            }),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;
    use crate::frame::decode_frame;

    fn roundtrip_request(request: Request) -> Request {
        let mut buf = BytesMut::new();
        request.encode(&mut buf);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        Request::parse(&payload).unwrap()
    }

    fn roundtrip_response(response: Response) -> Response {
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        Response::parse(&payload).unwrap()
    }

    #[test]
    fn test_request_roundtrips() {
        for request in [
            Request::Open {
                path: "a/b.txt".into(),
                option: OpenOption::CreateNew,
            },
            Request::Close { fd: 42 },
            Request::Read { fd: 1, len: 4096 },
            Request::Write {
                fd: 2,
                data: Bytes::from_static(b"written"),
            },
            Request::Lseek {
                fd: 3,
                offset: -128,
                whence: Whence::FromEnd,
            },
            Request::Unlink { path: "dead".into() },
            Request::ClientDone,
        ] {
            assert_eq!(roundtrip_request(request.clone()), request);
        }
    }

    #[test]
    fn test_response_roundtrips() {
        for response in [
            Response::Code(17),
            Response::Code(errno::EBADF as i64),
            Response::Data {
                code: 5,
                data: Bytes::from_static(b"hello"),
            },
            Response::Data {
                code: 0,
                data: Bytes::new(),
            },
        ] {
            assert_eq!(roundtrip_response(response.clone()), response);
        }
    }

    #[test]
    fn test_negative_offset_survives() {
        let request = roundtrip_request(Request::Lseek {
            fd: 9,
            offset: i64::MIN,
            whence: Whence::FromCurrent,
        });
        match request {
            Request::Lseek { offset, .. } => assert_eq!(offset, i64::MIN),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_whence() {
        let mut buf = BytesMut::new();
        Request::Lseek {
            fd: 1,
            offset: 0,
            whence: Whence::FromStart,
        }
        .encode(&mut buf);
        let mut payload = decode_frame(&mut buf).unwrap().unwrap().to_vec();
        *payload.last_mut().unwrap() = 7;
        assert!(matches!(
            Request::parse(&payload),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_truncated() {
        assert!(matches!(
            Request::parse(&[OP_CLOSE, 0, 0]),
            Err(ParseError::Truncated)
        ));
        assert!(matches!(
            Response::parse(&[OP_DATA, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 9]),
            Err(ParseError::Truncated)
        ));
    }
}
