//! Structured file I/O for binary index data.
//!
//! Every file written through [`StructWriter`] starts with a magic number and
//! a format version and ends with a CRC32 of everything before it. Readers
//! call [`StructReader::check_header`] first and [`StructReader::finish`] last
//! so truncated or corrupted files are rejected instead of half-decoded.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, StrataError};
use crate::storage::{StorageError, StorageInput, StorageOutput};
use crate::util::varint::encode_u64;

/// A checksumming writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Write the file header.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.update(&[value]);
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.update(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.update(&value.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.update(value);
        Ok(())
    }

    /// Write a sorted integer array using delta encoding.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            self.write_varint(value.wrapping_sub(previous) as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Write a serde value as a length-prefixed bincode blob.
    pub fn write_serialized<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write_bytes(&bytes)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Write the trailing checksum, sync and close the output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()
    }
}

/// A checksum-verifying reader for files produced by [`StructWriter`].
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: crc32fast::Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        if file_size < 4 {
            return Err(StorageError::Corrupt("file too short for checksum".to_string()).into());
        }
        Ok(StructReader {
            reader,
            hasher: crc32fast::Hasher::new(),
            position: 0,
            file_size,
        })
    }

    /// Read the header, failing on a magic mismatch or a newer version.
    pub fn check_header(&mut self, magic: u32, max_version: u32) -> Result<u32> {
        let found = self.read_u32()?;
        if found != magic {
            return Err(StorageError::Corrupt(format!(
                "bad magic {found:#x}, expected {magic:#x}"
            ))
            .into());
        }
        let version = self.read_u32()?;
        if version > max_version {
            return Err(StorageError::Corrupt(format!(
                "unsupported version {version} (max {max_version})"
            ))
            .into());
        }
        Ok(version)
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.update(&[value]);
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.update(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.update(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(StorageError::Corrupt("VarInt overflow".to_string()).into());
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| StrataError::storage(format!("Invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()?;
        if self.position + length > self.file_size {
            return Err(StorageError::Corrupt(format!("length {length} past end of file")).into());
        }
        self.read_raw(length as usize)
    }

    /// Read an exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.update(&bytes);
        Ok(bytes)
    }

    /// Read a delta-compressed integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        let length = self.read_varint()? as usize;
        let mut values = Vec::with_capacity(length.min(1 << 20));

        let mut previous = 0u32;
        for _ in 0..length {
            let value = previous.wrapping_add(self.read_varint()? as u32);
            values.push(value);
            previous = value;
        }

        Ok(values)
    }

    /// Read a length-prefixed bincode blob.
    pub fn read_serialized<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_bytes()?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Compare the trailing checksum with everything read so far.
    pub fn verify_checksum(&mut self) -> Result<bool> {
        if self.position + 4 != self.file_size {
            return Ok(false);
        }
        let stored = self.reader.read_u32::<LittleEndian>()?;
        Ok(stored == self.hasher.clone().finalize())
    }

    /// Verify the checksum and close the reader.
    pub fn finish(mut self) -> Result<()> {
        if !self.verify_checksum()? {
            return Err(StorageError::Corrupt("checksum mismatch".to_string()).into());
        }
        self.reader.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;

    const MAGIC: u32 = 0x5354_5354;

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new();

        {
            let output = storage.create_output("test.struct").unwrap();
            let mut writer = StructWriter::new(output);

            writer.write_header(MAGIC, 1).unwrap();
            writer.write_u8(42).unwrap();
            writer.write_u64(9876543210).unwrap();
            writer.write_varint(12345).unwrap();
            writer.write_string("body").unwrap();
            writer.write_delta_compressed_u32s(&[1, 5, 10, 15, 25]).unwrap();
            writer.write_serialized(&vec![Some(3i64), None]).unwrap();
            writer.close().unwrap();
        }

        let input = storage.open_input("test.struct").unwrap();
        let mut reader = StructReader::new(input).unwrap();

        assert_eq!(reader.check_header(MAGIC, 1).unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u64().unwrap(), 9876543210);
        assert_eq!(reader.read_varint().unwrap(), 12345);
        assert_eq!(reader.read_string().unwrap(), "body");
        assert_eq!(
            reader.read_delta_compressed_u32s().unwrap(),
            vec![1, 5, 10, 15, 25]
        );
        let column: Vec<Option<i64>> = reader.read_serialized().unwrap();
        assert_eq!(column, vec![Some(3), None]);
        reader.finish().unwrap();
    }

    #[test]
    fn test_corrupted_file_is_rejected() {
        let storage = MemoryStorage::new();
        {
            let output = storage.create_output("a.bin").unwrap();
            let mut writer = StructWriter::new(output);
            writer.write_header(MAGIC, 1).unwrap();
            writer.write_u64(7).unwrap();
            writer.close().unwrap();
        }

        let mut bytes = crate::storage::read_all(&storage, "a.bin").unwrap();
        bytes[9] ^= 0xFF;
        crate::storage::write_all(&storage, "a.bin", &bytes).unwrap();

        let mut reader = StructReader::new(storage.open_input("a.bin").unwrap()).unwrap();
        reader.check_header(MAGIC, 1).unwrap();
        reader.read_u64().unwrap();
        assert!(reader.finish().is_err());
    }

    #[test]
    fn test_wrong_magic() {
        let storage = MemoryStorage::new();
        {
            let mut writer = StructWriter::new(storage.create_output("b.bin").unwrap());
            writer.write_header(0xDEAD_BEEF, 1).unwrap();
            writer.close().unwrap();
        }
        let mut reader = StructReader::new(storage.open_input("b.bin").unwrap()).unwrap();
        assert!(reader.check_header(MAGIC, 1).is_err());
    }
}
