//! Length-prefixed message framing.
//!
//! Every message travels as a `u32` big-endian payload length followed by
//! the payload itself (opcode byte plus fields). Frames larger than
//! [`MAX_FRAME_SIZE`] are a protocol fault and poison the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest accepted payload: one transfer chunk plus message overhead.
pub const MAX_FRAME_SIZE: usize = crate::CHUNK_SIZE + 1024;

/// Framing error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// The peer announced a payload larger than [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    Oversized(usize),
}

/// Decode a single frame from `buf`.
///
/// Returns `Ok(Some(payload))` when a complete frame was consumed,
/// `Ok(None)` when more data is needed.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(len));
    }

    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Write a frame: reserve the length prefix, let `body` append the payload,
/// then backfill the prefix.
pub fn frame<F: FnOnce(&mut BytesMut)>(buf: &mut BytesMut, body: F) {
    let start = buf.len();
    buf.put_u32(0);
    body(buf);
    let len = (buf.len() - start - LEN_PREFIX) as u32;
    buf[start..start + LEN_PREFIX].copy_from_slice(&len.to_be_bytes());
}

/// Stateful frame decoder for incremental reads from a stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Feed raw bytes into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from buffered data.
    pub fn next(&mut self) -> Result<Option<Bytes>, FrameError> {
        decode_frame(&mut self.buffer)
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Blocking read of the next frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary; an EOF inside a
/// frame is reported as [`io::ErrorKind::UnexpectedEof`].
pub fn read_frame<R: Read>(reader: &mut R, decoder: &mut FrameDecoder) -> io::Result<Option<Bytes>> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match decoder.next() {
            Ok(Some(payload)) => return Ok(Some(payload)),
            Ok(None) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }

        let n = reader.read(&mut chunk)?;
        if n == 0 {
            if decoder.buffered() == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        decoder.feed(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        frame(&mut buf, |b| b.put_slice(payload));
        buf
    }

    #[test]
    fn test_roundtrip() {
        let mut buf = encode(b"hello frame");
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"hello frame");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = encode(b"");
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_incomplete_prefix() {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_payload() {
        let encoded = encode(b"partial");
        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = encode(b"first");
        buf.extend_from_slice(&encode(b"second"));

        let first = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], b"first");
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_incremental_feed() {
        let encoded = encode(b"drip fed");
        let mut decoder = FrameDecoder::new();

        for byte in &encoded[..] {
            assert!(matches!(decoder.next(), Ok(None) | Ok(Some(_))));
            decoder.feed(&[*byte]);
        }

        let payload = decoder.next().unwrap().unwrap();
        assert_eq!(&payload[..], b"drip fed");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_read_frame_from_stream() {
        let mut stream: &[u8] = &encode(b"over the wire")[..];
        let mut decoder = FrameDecoder::new();

        let payload = read_frame(&mut stream, &mut decoder).unwrap().unwrap();
        assert_eq!(&payload[..], b"over the wire");

        // Clean EOF after the frame.
        assert!(read_frame(&mut stream, &mut decoder).unwrap().is_none());
    }

    #[test]
    fn test_read_frame_truncated_stream() {
        let encoded = encode(b"cut short");
        let mut stream: &[u8] = &encoded[..encoded.len() - 2];
        let mut decoder = FrameDecoder::new();

        let err = read_frame(&mut stream, &mut decoder).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
