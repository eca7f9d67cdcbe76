//! Ordered byte stream used by machine snapshots
//!
//! Every subsystem appends its own blob to a shared [`ByteWriter`] and
//! consumes exactly what it wrote from a [`ByteReader`]. Values are stored
//! big-endian, matching guest byte order; there is no framing between blobs.

use crate::error::SnapshotError;

/// Append-only snapshot writer with a fixed capacity ceiling
#[derive(Debug)]
pub struct ByteWriter {
    data: Vec<u8>,
    capacity: u64,
}

impl ByteWriter {
    /// Create a writer that refuses to grow past `capacity` bytes
    pub fn with_capacity_limit(capacity: u64) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    /// Number of bytes written so far
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the writer, returning the written bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let new_len = self.data.len() as u64 + bytes.len() as u64;
        if new_len > self.capacity {
            return Err(SnapshotError::CapacityExceeded(self.capacity));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), SnapshotError> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), SnapshotError> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), SnapshotError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), SnapshotError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), SnapshotError> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), SnapshotError> {
        self.write_u64(value.to_bits())
    }

    /// Length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) -> Result<(), SnapshotError> {
        self.write_u32(value.len() as u32)?;
        self.write_bytes(value.as_bytes())
    }

    /// Length-prefixed byte blob
    pub fn write_blob(&mut self, value: &[u8]) -> Result<(), SnapshotError> {
        self.write_u64(value.len() as u64)?;
        self.write_bytes(value)
    }
}

/// Cursor over a snapshot produced by [`ByteWriter`]
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current read position
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        if self.remaining() < len {
            return Err(SnapshotError::Truncated {
                offset: self.offset,
                wanted: len,
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, SnapshotError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SnapshotError::Invalid(format!(
                "bad boolean byte 0x{:02x} at offset {}",
                other,
                self.offset - 1
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, SnapshotError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, SnapshotError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String, SnapshotError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SnapshotError::Invalid(format!("bad string: {}", e)))
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| SnapshotError::Invalid(format!("blob length {} too large", len)))?;
        self.read_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_values() {
        let mut writer = ByteWriter::with_capacity_limit(1024);
        writer.write_u32(0x5853_4156).unwrap();
        writer.write_bool(true).unwrap();
        writer.write_string("default.xex").unwrap();
        writer.write_f64(1.5).unwrap();

        let data = writer.into_inner();
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0x5853_4156);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_string().unwrap(), "default.xex");
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_values_are_big_endian() {
        let mut writer = ByteWriter::with_capacity_limit(16);
        writer.write_u32(0x5853_4156).unwrap();
        writer.write_u16(0x0102).unwrap();
        writer.write_string("ab").unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0x58, 0x53, 0x41, 0x56, 0x01, 0x02, 0, 0, 0, 2, b'a', b'b']
        );
    }

    #[test]
    fn test_truncated_read() {
        let data = [1u8, 2, 3];
        let mut reader = ByteReader::new(&data);
        assert!(matches!(
            reader.read_u32(),
            Err(SnapshotError::Truncated { offset: 0, wanted: 4 })
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let mut writer = ByteWriter::with_capacity_limit(6);
        writer.write_u32(1).unwrap();
        assert!(matches!(
            writer.write_u32(2),
            Err(SnapshotError::CapacityExceeded(6))
        ));
        assert_eq!(writer.offset(), 4);
    }
}
