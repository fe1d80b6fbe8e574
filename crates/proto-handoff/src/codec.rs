//! Primitive encode/decode helpers for the self-describing binary envelope
//! described by the bus protocol: strings are length-prefixed with a `u16`,
//! blobs with a `u32`, and every multi-byte integer is big-endian.

use bytes::{Buf, BufMut, Bytes};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("buffer underrun: needed {needed} more byte(s)")]
    UnexpectedEof { needed: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown message variant tag {0}")]
    UnknownTag(u8),
    #[error("field exceeds its length-prefix limit: {0}")]
    FieldTooLarge(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn require(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        Err(Error::UnexpectedEof {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

pub fn put_u8(out: &mut impl BufMut, v: u8) {
    out.put_u8(v);
}
pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    require(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn put_u16(out: &mut impl BufMut, v: u16) {
    out.put_u16(v);
}
pub fn get_u16(buf: &mut Bytes) -> Result<u16> {
    require(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn put_u32(out: &mut impl BufMut, v: u32) {
    out.put_u32(v);
}
pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    require(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn put_u64(out: &mut impl BufMut, v: u64) {
    out.put_u64(v);
}
pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    require(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn put_u128(out: &mut impl BufMut, v: u128) {
    out.put_u128(v);
}
pub fn get_u128(buf: &mut Bytes) -> Result<u128> {
    require(buf, 16)?;
    Ok(buf.get_u128())
}

pub fn put_f64(out: &mut impl BufMut, v: f64) {
    out.put_f64(v);
}
pub fn get_f64(buf: &mut Bytes) -> Result<f64> {
    require(buf, 8)?;
    Ok(buf.get_f64())
}

/// length-prefixed (`u16`) UTF-8 string.
pub fn put_str(out: &mut impl BufMut, s: &str) {
    let bytes = s.as_bytes();
    debug_assert!(bytes.len() <= u16::MAX as usize, "string field too long");
    out.put_u16(bytes.len() as u16);
    out.put_slice(bytes);
}

pub fn get_str(buf: &mut Bytes) -> Result<String> {
    let len = get_u16(buf)? as usize;
    require(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

/// length-prefixed (`u16`) optional UTF-8 string: absent is encoded as `u16::MAX`.
pub fn put_opt_str(out: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => out.put_u16(u16::MAX),
        Some(s) => put_str(out, s),
    }
}

pub fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>> {
    require(buf, 2)?;
    if buf.chunk()[0] == 0xff && buf.chunk()[1] == 0xff {
        buf.advance(2);
        return Ok(None);
    }
    Ok(Some(get_str(buf)?))
}

/// length-prefixed (`u32`) binary blob.
pub fn put_blob(out: &mut impl BufMut, b: &[u8]) {
    out.put_u32(b.len() as u32);
    out.put_slice(b);
}

pub fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    require(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}
