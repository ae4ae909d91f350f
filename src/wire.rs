//! MySQL wire primitives.
//!
//! Readers and writers for the protocol's basic data types: fixed-width
//! little-endian integers, length-encoded integers, length-encoded and
//! nul-terminated strings.
//!
//! See: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_dt.html>

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Marker byte for a NULL value in a length-encoded column.
pub const NULL_MARKER: u8 = 0xFB;

/// Ensures `buf` holds at least `n` more bytes before a fixed-width read.
#[inline]
pub fn need(buf: &impl Buf, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Unexpected(format!(
            "frame truncated: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16_le(buf: &mut Bytes) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn get_u24_le(buf: &mut Bytes) -> Result<u32> {
    need(buf, 3)?;
    let lo = buf.get_u16_le() as u32;
    let hi = buf.get_u8() as u32;
    Ok(lo | (hi << 16))
}

pub fn get_u32_le(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_u64_le(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Reads a length-encoded integer.
///
/// - `0x00..=0xFA`: the byte itself
/// - `0xFC`: u16 follows
/// - `0xFD`: u24 follows
/// - `0xFE`: u64 follows
pub fn get_lenenc_int(buf: &mut Bytes) -> Result<u64> {
    match get_u8(buf)? {
        first @ 0x00..=0xFA => Ok(u64::from(first)),
        0xFC => get_u16_le(buf).map(u64::from),
        0xFD => get_u24_le(buf).map(u64::from),
        0xFE => get_u64_le(buf),
        first => Err(Error::Unexpected(format!(
            "invalid length-encoded integer prefix 0x{first:02X}"
        ))),
    }
}

/// Reads a length-encoded byte string.
pub fn get_lenenc_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_lenenc_int(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

/// Reads a length-encoded string, replacing invalid UTF-8.
pub fn get_lenenc_string(buf: &mut Bytes) -> Result<String> {
    let bytes = get_lenenc_bytes(buf)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads one column of a text-protocol row: either the NULL marker or a
/// length-encoded byte string.
pub fn get_lenenc_value(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if buf.first() == Some(&NULL_MARKER) {
        buf.advance(1);
        return Ok(None);
    }
    get_lenenc_bytes(buf).map(Some)
}

/// Reads a nul-terminated string, excluding the terminator.
pub fn get_cstring(buf: &mut Bytes) -> Result<String> {
    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(Error::Unexpected("nul terminator missing".into()));
    };
    let bytes = buf.split_to(end + 1);
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

pub fn put_u24_le(buf: &mut BytesMut, value: u32) {
    buf.put_u16_le((value & 0xFFFF) as u16);
    buf.put_u8((value >> 16) as u8);
}

/// Writes a length-encoded integer.
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 0x1_0000 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 0x100_0000 {
        buf.put_u8(0xFD);
        put_u24_le(buf, value as u32);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Writes a length-encoded byte string.
pub fn put_lenenc_bytes(buf: &mut BytesMut, src: &[u8]) {
    put_lenenc_int(buf, src.len() as u64);
    buf.put_slice(src);
}

/// Writes a nul-terminated string.
pub fn put_cstring(buf: &mut BytesMut, src: &str) {
    buf.put_slice(src.as_bytes());
    buf.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_u24_le() {
        let mut buf = Bytes::from_static(&[0x56, 0x34, 0x12]);
        assert_eq!(get_u24_le(&mut buf).unwrap(), 0x0012_3456);
        assert!(get_u24_le(&mut buf).is_err());
    }

    #[test]
    fn test_lenenc_int() {
        let mut buf = Bytes::from_static(&[0x42]);
        assert_eq!(get_lenenc_int(&mut buf).unwrap(), 0x42);

        let mut buf = Bytes::from_static(&[0xFC, 0x34, 0x12]);
        assert_eq!(get_lenenc_int(&mut buf).unwrap(), 0x1234);

        let mut buf = Bytes::from_static(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(get_lenenc_int(&mut buf).unwrap(), 0x0012_3456);

        let mut buf = Bytes::from_static(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(get_lenenc_int(&mut buf).unwrap(), 0x0807_0605_0403_0201);

        let mut buf = Bytes::from_static(&[0xFB]);
        assert!(get_lenenc_int(&mut buf).is_err());
    }

    #[test]
    fn test_lenenc_int_write_matches_read() {
        for value in [0u64, 250, 251, 0xFFFF, 0x1_0000, 0xFF_FFFF, 0x100_0000] {
            let mut buf = BytesMut::new();
            put_lenenc_int(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(get_lenenc_int(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_lenenc_string() {
        let mut buf = Bytes::from_static(&[0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(get_lenenc_string(&mut buf).unwrap(), "hello");
    }

    #[test]
    fn test_lenenc_value_null() {
        let mut buf = Bytes::from_static(&[0xFB, 0x01, b'x']);
        assert_eq!(get_lenenc_value(&mut buf).unwrap(), None);
        assert_eq!(
            get_lenenc_value(&mut buf).unwrap(),
            Some(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn test_cstring() {
        let mut buf = Bytes::from_static(b"hello\0world\0");
        assert_eq!(get_cstring(&mut buf).unwrap(), "hello");
        assert_eq!(get_cstring(&mut buf).unwrap(), "world");

        let mut buf = Bytes::from_static(b"unterminated");
        assert!(get_cstring(&mut buf).is_err());
    }

    #[test]
    fn test_put_cstring() {
        let mut buf = BytesMut::new();
        put_cstring(&mut buf, "abc");
        assert_eq!(&buf[..], b"abc\0");
    }
}
