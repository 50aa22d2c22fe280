//! Variable-length integer encoding utilities.
//!
//! Seven payload bits per byte, least significant group first, with the high
//! bit marking a continuation byte.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{Result, StrataError};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(StrataError::storage("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(StrataError::storage("Incomplete VarInt"))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(StrataError::storage("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_boundaries() {
        assert_eq!(encode_u64(0), vec![0]);
        assert_eq!(encode_u64(127), vec![0x7F]);
        assert_eq!(encode_u64(128), vec![0x80, 0x01]);
        assert_eq!(encode_u64(u64::MAX).len(), 10);
    }

    #[test]
    fn test_stream_helpers() {
        let mut buffer = Vec::new();
        write_u64(&mut buffer, 300).unwrap();
        write_u64(&mut buffer, 7).unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_u64(&mut cursor).unwrap(), 300);
        assert_eq!(read_u64(&mut cursor).unwrap(), 7);
        assert!(read_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_incomplete_varint() {
        assert!(decode_u64(&[0x80, 0x80]).is_err());
        assert_eq!(decode_u64(&[0xAC, 0x02, 0xFF]).unwrap(), (300, 2));
    }
}
