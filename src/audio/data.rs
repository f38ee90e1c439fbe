//! The unit of streamed audio
//!
//! An [`AudioData`] owns a fixed-capacity byte buffer, a valid sub-range of
//! it, and a small tag map for metadata such as the presentation timestamp.
//! It has no internal synchronization: ownership moves from stage to stage
//! (capture, codec, queue, transport) and only the current owner touches it.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Metadata key for the presentation timestamp in nanoseconds
pub const META_PTS: &str = "pts";
/// Metadata key for the capture frame index
pub const META_FRAME_INDEX: &str = "frame_index";

/// A metadata tag value
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int32(i32),
    Int64(i64),
    String(String),
}

/// Fixed-capacity audio buffer with a valid range and metadata tags
#[derive(Debug, Clone)]
pub struct AudioData {
    buffer: Vec<u8>,
    range_offset: usize,
    range_length: usize,
    meta: HashMap<String, MetaValue>,
}

impl AudioData {
    /// Create a zero-filled buffer whose whole capacity is valid
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            range_offset: 0,
            range_length: capacity,
            meta: HashMap::new(),
        }
    }

    /// Wrap existing bytes; capacity and valid length equal `bytes.len()`
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            buffer: bytes,
            range_offset: 0,
            range_length: len,
            meta: HashMap::new(),
        }
    }

    /// Copy a slice into a new buffer
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Length of the valid range
    pub fn size(&self) -> usize {
        self.range_length
    }

    /// Size of the backing buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn offset(&self) -> usize {
        self.range_offset
    }

    pub fn is_empty(&self) -> bool {
        self.range_length == 0
    }

    /// Restrict the valid range. Fails if it would extend past the capacity.
    pub fn set_range(&mut self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.buffer.len() => {
                self.range_offset = offset;
                self.range_length = size;
                Ok(())
            }
            _ => Err(Error::CapacityExceeded {
                len: offset.saturating_add(size),
                capacity: self.buffer.len(),
            }),
        }
    }

    /// The valid bytes
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.range_offset..self.range_offset + self.range_length]
    }

    /// The whole backing buffer, writable
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Consume into the valid bytes
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.range_offset == 0 {
            self.buffer.truncate(self.range_length);
            self.buffer
        } else {
            self.data().to_vec()
        }
    }

    pub fn set_int32(&mut self, name: &str, value: i32) {
        self.meta.insert(name.to_string(), MetaValue::Int32(value));
    }

    pub fn set_int64(&mut self, name: &str, value: i64) {
        self.meta.insert(name.to_string(), MetaValue::Int64(value));
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.meta.insert(name.to_string(), MetaValue::String(value.into()));
    }

    pub fn find_int32(&self, name: &str) -> Option<i32> {
        match self.meta.get(name) {
            Some(MetaValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn find_int64(&self, name: &str) -> Option<i64> {
        match self.meta.get(name) {
            Some(MetaValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn find_string(&self, name: &str) -> Option<&str> {
        match self.meta.get(name) {
            Some(MetaValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Presentation timestamp, if tagged
    pub fn pts(&self) -> Option<i64> {
        self.find_int64(META_PTS)
    }

    pub fn set_pts(&mut self, pts_ns: i64) {
        self.set_int64(META_PTS, pts_ns);
    }

    /// Copy all metadata tags from another buffer
    pub fn copy_meta_from(&mut self, other: &AudioData) {
        self.meta
            .extend(other.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let mut data = AudioData::new(16);
        assert_eq!(data.size(), 16);
        assert_eq!(data.capacity(), 16);

        data.data_mut()[4] = 7;
        data.set_range(4, 8).unwrap();
        assert_eq!(data.size(), 8);
        assert_eq!(data.data()[0], 7);

        assert!(data.set_range(10, 7).is_err());
        assert!(data.set_range(usize::MAX, 2).is_err());
        // failed set_range leaves the previous range intact
        assert_eq!(data.size(), 8);
    }

    #[test]
    fn test_meta() {
        let mut data = AudioData::new(4);
        assert_eq!(data.pts(), None);
        data.set_pts(1234);
        data.set_int32("seq", 3);
        data.set_string("codec", "pcm");

        assert_eq!(data.pts(), Some(1234));
        assert_eq!(data.find_int32("seq"), Some(3));
        assert_eq!(data.find_string("codec"), Some("pcm"));
        // wrong type reads as absent
        assert_eq!(data.find_int64("seq"), None);
    }

    #[test]
    fn test_into_vec_respects_range() {
        let mut data = AudioData::from_vec(vec![1, 2, 3, 4, 5]);
        data.set_range(0, 3).unwrap();
        assert_eq!(data.clone().into_vec(), vec![1, 2, 3]);
        data.set_range(1, 3).unwrap();
        assert_eq!(data.into_vec(), vec![2, 3, 4]);
    }
}
