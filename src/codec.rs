//! Length-prefix varint encoding and the CRC32 checksum used by every
//! on-disk record format.
//!
//! All variable-length fields (keys, values, index keys) are prefixed
//! with an LEB128 varint: 7 payload bits per byte, high bit set on every
//! byte except the last. Fixed-width integers elsewhere in the crate use
//! little-endian encoding via `byteorder`.

use std::io::Read;

use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

/// Checksum algorithm for WAL frames. Computed over the frame payload only.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Largest encoded size of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends a varint-encoded u64 to the buffer.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decodes a varint from the front of the slice, returning the value and
/// the number of bytes consumed.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            break;
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(Error::Corruption("truncated varint".to_string()))
}

/// Reads a varint one byte at a time from a reader.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;

    for _ in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        result |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }

    Err(Error::Corruption("varint exceeds 10 bytes".to_string()))
}

/// Appends a varint length prefix followed by the bytes themselves.
pub fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Reads a varint length prefix followed by that many bytes. The cap
/// bounds allocations when decoding untrusted file contents.
pub fn read_len_prefixed<R: Read>(reader: &mut R, cap: usize) -> Result<Vec<u8>> {
    let len = read_varint(reader)? as usize;
    if len > cap {
        return Err(Error::Corruption(format!(
            "length prefix {} exceeds cap {}",
            len, cap
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}
