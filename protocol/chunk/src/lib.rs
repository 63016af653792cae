//! Wire protocol for the ferry caching file proxy.
//!
//! Two message families share one frame format (a `u32` big-endian length
//! prefix followed by an opcode byte and the message fields):
//!
//! - [`rpc`] — the chunk RPC spoken between the proxy and the file server
//!   (probe-first chunked download, chunked upload, stat and delete).
//! - [`syscall`] — the POSIX-style operations spoken between clients and
//!   the proxy (open/close/read/write/lseek/unlink).
//!
//! File transfers move in fixed [`CHUNK_SIZE`] pieces on both sides.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use protocol_chunk::frame::decode_frame;
//! use protocol_chunk::syscall::Request;
//! use protocol_chunk::OpenOption;
//!
//! let mut buf = BytesMut::new();
//! Request::Open {
//!     path: "dir/a.txt".to_string(),
//!     option: OpenOption::Read,
//! }
//! .encode(&mut buf);
//!
//! let payload = decode_frame(&mut buf).unwrap().unwrap();
//! let decoded = Request::parse(&payload).unwrap();
//! assert!(matches!(decoded, Request::Open { .. }));
//! ```

pub mod frame;
pub mod rpc;
pub mod syscall;

mod wire;

/// Fixed transfer chunk size: 300 KiB on both sides of every transfer.
pub const CHUNK_SIZE: usize = 300 * 1024;

/// Open granted read-only.
pub const MODE_R: i32 = 1;
/// Open granted read-write.
pub const MODE_RW: i32 = 2;

/// Errno-style status codes carried on the wire. Negative by convention;
/// `EIO` keeps its historical out-of-band value.
pub mod errno {
    pub const EPERM: i32 = -1;
    pub const ENOENT: i32 = -2;
    pub const EBADF: i32 = -9;
    pub const EACCES: i32 = -13;
    pub const EEXIST: i32 = -17;
    pub const EISDIR: i32 = -21;
    pub const EINVAL: i32 = -22;
    pub const EIO: i32 = -100;
}

/// Message decode error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// The payload ended before the message did.
    #[error("truncated message")]
    Truncated,
    /// Unknown opcode byte.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// A field failed validation.
    #[error("invalid field: {0}")]
    Invalid(&'static str),
}

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Existing file, read-only.
    Read,
    /// Existing file, read-write.
    Write,
    /// Read-write, created if absent.
    Create,
    /// Read-write, must not already exist.
    CreateNew,
}

impl OpenOption {
    pub fn as_u8(self) -> u8 {
        match self {
            OpenOption::Read => 0,
            OpenOption::Write => 1,
            OpenOption::Create => 2,
            OpenOption::CreateNew => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpenOption::Read),
            1 => Some(OpenOption::Write),
            2 => Some(OpenOption::Create),
            3 => Some(OpenOption::CreateNew),
            _ => None,
        }
    }
}

/// Origin for an lseek reposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    FromStart,
    FromCurrent,
    FromEnd,
}

impl Whence {
    pub fn as_u8(self) -> u8 {
        match self {
            Whence::FromStart => 0,
            Whence::FromCurrent => 1,
            Whence::FromEnd => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Whence::FromStart),
            1 => Some(Whence::FromCurrent),
            2 => Some(Whence::FromEnd),
            _ => None,
        }
    }
}
