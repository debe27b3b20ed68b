//! Byte-level page storage.
//!
//! Elements are fixed width and little-endian, addressed by byte offset
//! `element_index * width`. Every access is bounds-checked against the page
//! extent and fails instead of touching adjacent memory.

use super::error::{DsmError, DsmResult};
use super::types::{ElementKind, ElementValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStorage {
    bytes: Vec<u8>,
}

impl PageStorage {
    /// Zero-filled storage of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, offset: usize, width: usize) -> DsmResult<std::ops::Range<usize>> {
        match offset.checked_add(width) {
            Some(end) if end <= self.bytes.len() => Ok(offset..end),
            _ => Err(DsmError::OutOfBounds {
                offset,
                width,
                size: self.bytes.len(),
            }),
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> DsmResult<[u8; N]> {
        let range = self.range(offset, N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[range]);
        Ok(buf)
    }

    fn write_array<const N: usize>(&mut self, offset: usize, buf: [u8; N]) -> DsmResult<()> {
        let range = self.range(offset, N)?;
        self.bytes[range].copy_from_slice(&buf);
        Ok(())
    }

    pub fn read_i64(&self, offset: usize) -> DsmResult<i64> {
        self.read_array(offset).map(i64::from_le_bytes)
    }

    pub fn write_i64(&mut self, offset: usize, value: i64) -> DsmResult<()> {
        self.write_array(offset, value.to_le_bytes())
    }

    pub fn read_f32(&self, offset: usize) -> DsmResult<f32> {
        self.read_array(offset).map(f32::from_le_bytes)
    }

    pub fn write_f32(&mut self, offset: usize, value: f32) -> DsmResult<()> {
        self.write_array(offset, value.to_le_bytes())
    }
}

/// A fixed-width value that can live in page storage.
pub trait Element: Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    const KIND: ElementKind;

    fn read_from(storage: &PageStorage, offset: usize) -> DsmResult<Self>;

    fn write_to(self, storage: &mut PageStorage, offset: usize) -> DsmResult<()>;

    fn into_value(self) -> ElementValue;
}

impl Element for i64 {
    const KIND: ElementKind = ElementKind::Int64;

    fn read_from(storage: &PageStorage, offset: usize) -> DsmResult<Self> {
        storage.read_i64(offset)
    }

    fn write_to(self, storage: &mut PageStorage, offset: usize) -> DsmResult<()> {
        storage.write_i64(offset, self)
    }

    fn into_value(self) -> ElementValue {
        ElementValue::Int64(self)
    }
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::Float32;

    fn read_from(storage: &PageStorage, offset: usize) -> DsmResult<Self> {
        storage.read_f32(offset)
    }

    fn write_to(self, storage: &mut PageStorage, offset: usize) -> DsmResult<()> {
        storage.write_f32(offset, self)
    }

    fn into_value(self) -> ElementValue {
        ElementValue::Float32(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64 * 1024;

    #[test]
    fn test_int64_round_trip_at_index_zero() {
        let mut storage = PageStorage::new(PAGE);
        storage.write_i64(0, 42).unwrap();
        assert_eq!(storage.read_i64(0).unwrap(), 42);
    }

    #[test]
    fn test_encoding_is_little_endian() {
        let mut storage = PageStorage::new(16);
        storage.write_i64(8, 0x0102).unwrap();
        assert_eq!(&storage.as_bytes()[8..10], &[0x02, 0x01]);

        storage.write_f32(0, 1.5).unwrap();
        assert_eq!(&storage.as_bytes()[0..4], &1.5f32.to_le_bytes());
        assert_eq!(storage.read_f32(0).unwrap(), 1.5);
    }

    #[test]
    fn test_int64_near_page_end_is_out_of_bounds() {
        let mut storage = PageStorage::new(PAGE);
        for offset in PAGE - 7..PAGE {
            assert!(matches!(
                storage.write_i64(offset, 1),
                Err(DsmError::OutOfBounds { .. })
            ));
            assert!(storage.read_i64(offset).is_err());
        }
        // Last aligned slot still fits
        assert!(storage.write_i64(PAGE - 8, 7).is_ok());
    }

    #[test]
    fn test_float_bounds_and_overflowing_offset() {
        let storage = PageStorage::new(PAGE);
        assert!(storage.read_f32(PAGE - 4).is_ok());
        assert!(storage.read_f32(PAGE - 3).is_err());
        assert!(matches!(
            storage.read_i64(usize::MAX - 2),
            Err(DsmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_failed_write_leaves_storage_untouched() {
        let mut storage = PageStorage::new(8);
        assert!(storage.write_i64(1, -1).is_err());
        assert!(storage.as_bytes().iter().all(|b| *b == 0));
    }
}
