use std::io::{self, Write};

use crate::BackendError;

/// Default capacity of the output buffer; large enough for one high-quality
/// 1080p JPEG.
pub const DEFAULT_BITSTREAM_CAPACITY: usize = 2_000_000;

/// Fixed-capacity encoded-output buffer reused across frames.
///
/// The runtime appends one encoded unit at synchronization; the driver drains
/// it by writing it out, which leaves the buffer empty again.
#[derive(Debug)]
pub struct Bitstream {
    data: Box<[u8]>,
    data_offset: usize,
    data_length: usize,
}

impl Bitstream {
    #[must_use]
    pub fn with_capacity(max_length: usize) -> Self {
        Self {
            data: vec![0_u8; max_length].into_boxed_slice(),
            data_offset: 0,
            data_length: 0,
        }
    }

    #[must_use]
    pub fn max_length(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data_length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data_length == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.data_offset..self.data_offset + self.data_length]
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<(), BackendError> {
        let end = self.data_offset + self.data_length;
        let available = self.data.len() - end;
        if payload.len() > available {
            return Err(BackendError::NotEnoughBuffer {
                needed: payload.len(),
                available,
            });
        }
        self.data[end..end + payload.len()].copy_from_slice(payload);
        self.data_length += payload.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data_offset = 0;
        self.data_length = 0;
    }

    /// Writes the pending payload to `sink` and empties the buffer.
    pub fn write_to<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        let written = self.data_length;
        sink.write_all(self.as_slice())?;
        self.clear();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_write_drains_buffer() {
        let mut bitstream = Bitstream::with_capacity(8);
        bitstream.append(&[0xFF, 0xD8]).unwrap();
        bitstream.append(&[0xFF, 0xD9]).unwrap();
        assert_eq!(bitstream.len(), 4);

        let mut out = Vec::new();
        assert_eq!(bitstream.write_to(&mut out).unwrap(), 4);
        assert_eq!(out, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(bitstream.is_empty());
        assert_eq!(bitstream.max_length(), 8);
    }

    #[test]
    fn append_beyond_capacity_reports_sizes() {
        let mut bitstream = Bitstream::with_capacity(4);
        bitstream.append(&[1, 2, 3]).unwrap();
        match bitstream.append(&[4, 5]) {
            Err(BackendError::NotEnoughBuffer { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(bitstream.as_slice(), &[1, 2, 3]);
    }
}
