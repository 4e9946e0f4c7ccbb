//! Fixed-width big-endian encoding helpers.
//!
//! Metadata records, log sequence keys and frame headers all use big-endian
//! fixed-width integers so byte order equals numeric order under the
//! lexicographic key comparator.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

/// Encode a u64 as 8 big-endian bytes.
pub fn u64_be(value: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    buf
}

/// Encode a u32 as 4 big-endian bytes.
pub fn u32_be(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

/// Decode a u64 from exactly 8 big-endian bytes.
pub fn read_u64_be(buf: &[u8]) -> Result<u64> {
    if buf.len() != 8 {
        return Err(Error::corruption(format!(
            "expected 8-byte integer, got {} bytes",
            buf.len()
        )));
    }
    Ok(BigEndian::read_u64(buf))
}

/// Decode a u32 from exactly 4 big-endian bytes.
pub fn read_u32_be(buf: &[u8]) -> Result<u32> {
    if buf.len() != 4 {
        return Err(Error::corruption(format!(
            "expected 4-byte integer, got {} bytes",
            buf.len()
        )));
    }
    Ok(BigEndian::read_u32(buf))
}
