//! Field-level encode/decode helpers shared by the message sets.

use crate::ParseError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8, ParseError> {
    if buf.remaining() < 1 {
        return Err(ParseError::Truncated);
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8]) -> Result<u16, ParseError> {
    if buf.remaining() < 2 {
        return Err(ParseError::Truncated);
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32, ParseError> {
    if buf.remaining() < 4 {
        return Err(ParseError::Truncated);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> Result<u64, ParseError> {
    if buf.remaining() < 8 {
        return Err(ParseError::Truncated);
    }
    Ok(buf.get_u64())
}

pub(crate) fn get_i32(buf: &mut &[u8]) -> Result<i32, ParseError> {
    Ok(get_u32(buf)? as i32)
}

pub(crate) fn get_i64(buf: &mut &[u8]) -> Result<i64, ParseError> {
    Ok(get_u64(buf)? as i64)
}

pub(crate) fn get_bool(buf: &mut &[u8]) -> Result<bool, ParseError> {
    Ok(get_u8(buf)? != 0)
}

pub(crate) fn get_str(buf: &mut &[u8]) -> Result<String, ParseError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(ParseError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| ParseError::Invalid("path is not utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

pub(crate) fn get_bytes(buf: &mut &[u8]) -> Result<Bytes, ParseError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(ParseError::Truncated);
    }
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}
