//! Typed blocking façade over the chunk RPC to the file server.
//!
//! Each client session owns one connection. Calls are strictly
//! request-reply; there is no retry or timeout at this layer, failures
//! surface as [`RpcError`] and the session maps them to `EIO`.

use crate::metrics::{BYTES_DOWNLOADED, BYTES_UPLOADED, RPC_CALLS};
use bytes::{Bytes, BytesMut};
use protocol_chunk::frame::{FrameDecoder, FrameError, read_frame};
use protocol_chunk::rpc::{ChunkResponse, Request, Response};
use protocol_chunk::{CHUNK_SIZE, OpenOption, ParseError};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use tracing::{debug, trace};

/// Chunk RPC failure.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by server")]
    Disconnected,
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("server rejected upload chunk")]
    UploadRejected,
}

/// One session's connection to the file server.
pub struct RpcClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    send_buf: BytesMut,
}

impl RpcClient {
    /// Connect to the file server.
    pub fn connect(addr: SocketAddr) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!(server = %addr, "connected to file server");
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            send_buf: BytesMut::with_capacity(4096),
        })
    }

    fn call(&mut self, request: &Request) -> Result<Response, RpcError> {
        RPC_CALLS.increment();
        self.send_buf.clear();
        request.encode(&mut self.send_buf);
        self.stream.write_all(&self.send_buf)?;

        let payload = read_frame(&mut self.stream, &mut self.decoder)?
            .ok_or(RpcError::Disconnected)?;
        Ok(Response::parse(&payload)?)
    }

    /// Fetch one chunk, or probe open status and metadata when `is_probe`.
    pub fn download_chunk(
        &mut self,
        logical: &str,
        chunk_num: u32,
        option: OpenOption,
        is_probe: bool,
    ) -> Result<ChunkResponse, RpcError> {
        trace!(path = logical, chunk_num, is_probe, "download chunk");
        let response = self.call(&Request::DownloadChunk {
            path: logical.to_string(),
            chunk_num,
            option,
            is_probe,
        })?;
        match response {
            Response::Chunk(chunk) => {
                BYTES_DOWNLOADED.add(chunk.data.len() as u64);
                Ok(chunk)
            }
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Stream a local file to the server as `version` of `logical`.
    ///
    /// Empty files still send one empty final chunk so the server learns
    /// the new version.
    pub fn upload(&mut self, logical: &str, source: &Path, version: u64) -> Result<(), RpcError> {
        let mut file = File::open(source)?;
        let total_size = file.metadata()?.len();
        debug!(path = logical, version, total_size, "uploading file");

        let mut chunk_num = 0u32;
        let mut offset = 0u64;
        loop {
            let chunk_len = CHUNK_SIZE.min((total_size - offset) as usize);
            let mut data = vec![0u8; chunk_len];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut data)?;

            let is_last = offset + chunk_len as u64 >= total_size;
            let response = self.call(&Request::UploadChunk {
                path: logical.to_string(),
                version,
                chunk_num,
                is_last,
                data: Bytes::from(data),
            })?;
            match response {
                Response::Bool(true) => {}
                Response::Bool(false) => return Err(RpcError::UploadRejected),
                _ => return Err(RpcError::UnexpectedResponse),
            }

            BYTES_UPLOADED.add(chunk_len as u64);
            offset += chunk_len as u64;
            chunk_num += 1;
            if is_last {
                return Ok(());
            }
        }
    }

    /// Does the path exist on the server?
    pub fn stat_exists(&mut self, logical: &str) -> Result<bool, RpcError> {
        match self.call(&Request::StatExists {
            path: logical.to_string(),
        })? {
            Response::Bool(value) => Ok(value),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Is the path a directory on the server?
    pub fn stat_is_dir(&mut self, logical: &str) -> Result<bool, RpcError> {
        match self.call(&Request::StatIsDir {
            path: logical.to_string(),
        })? {
            Response::Bool(value) => Ok(value),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Current version of the path on the server, -1 if absent.
    pub fn stat_version(&mut self, logical: &str) -> Result<i64, RpcError> {
        match self.call(&Request::StatVersion {
            path: logical.to_string(),
        })? {
            Response::Version(version) => Ok(version),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Remove the path from the server. `Ok(false)` means the server
    /// refused (absent or not deletable).
    pub fn delete(&mut self, logical: &str) -> Result<bool, RpcError> {
        match self.call(&Request::Delete {
            path: logical.to_string(),
        })? {
            Response::Bool(value) => Ok(value),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }
}
