//! Container header and region layout.
//!
//! # On-disk layout
//!
//! ```text
//! offset  size  field
//! 0       3     magic  "CPK"
//! 3       1     version (0)
//! 4       4     obfuscation key
//! 8       4     max_file_count  (i32 LE)
//! 12      4     max_block_count (i32 LE)
//! 16      4     block_count     (i32 LE)
//! ```
//!
//! The header is followed by `max_block_count` block records, then
//! `max_file_count` string records, then the cluster heap, which starts on the
//! next [`CLUSTER_SIZE`] boundary.  Metadata regions are sized to their
//! maximum capacity so they never move.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::block::BLOCK_RECORD_SIZE;
use crate::crypto::KEY_LEN;
use crate::strings::STRING_RECORD_SIZE;

pub const MAGIC: &[u8; 3] = b"CPK";
pub const VERSION: u8 = 0;
/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 20;
/// Allocation granularity of the heap.
pub const CLUSTER_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid capacity: max_file_count={max_file_count}, max_block_count={max_block_count}")]
    InvalidCapacity { max_file_count: i32, max_block_count: i32 },
    #[error("Block count {block_count} outside 0..={max_block_count}")]
    InvalidBlockCount { block_count: i32, max_block_count: i32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Round `n` up to the next multiple of [`CLUSTER_SIZE`].
pub fn round_up_to_cluster(n: u64) -> u64 {
    n.div_ceil(CLUSTER_SIZE) * CLUSTER_SIZE
}

/// Number of clusters needed to hold `n` bytes.
pub fn clusters_for(n: u64) -> u64 {
    n.div_ceil(CLUSTER_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic:           [u8; 3],
    pub version:         u8,
    pub key:             [u8; KEY_LEN],
    pub max_file_count:  i32,
    pub max_block_count: i32,
    /// Number of block records in use.  Only ever grows.
    pub block_count:     i32,
}

impl Header {
    pub fn new(max_file_count: i32, max_block_count: i32, key: [u8; KEY_LEN]) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            key,
            max_file_count,
            max_block_count,
            block_count: 0,
        }
    }

    /// Check magic, version and the capacity invariants.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if &self.magic != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        if self.version != VERSION {
            return Err(HeaderError::UnsupportedVersion(self.version));
        }
        if self.max_file_count <= 0
            || self.max_block_count <= 0
            || self.max_file_count > self.max_block_count
        {
            return Err(HeaderError::InvalidCapacity {
                max_file_count:  self.max_file_count,
                max_block_count: self.max_block_count,
            });
        }
        if self.block_count < 0 || self.block_count > self.max_block_count {
            return Err(HeaderError::InvalidBlockCount {
                block_count:     self.block_count,
                max_block_count: self.max_block_count,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Region offsets derived from the capacities.  Only meaningful for a
    /// header that passes [`Header::validate`].
    pub fn layout(&self) -> Layout {
        Layout::new(self.max_file_count as u32, self.max_block_count as u32)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u8(self.version)?;
        writer.write_all(&self.key)?;
        writer.write_i32::<LittleEndian>(self.max_file_count)?;
        writer.write_i32::<LittleEndian>(self.max_block_count)?;
        writer.write_i32::<LittleEndian>(self.block_count)?;
        Ok(())
    }

    /// Decode a header.  The result is validated; a header that fails
    /// [`Header::validate`] is never returned.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 3];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        let version = reader.read_u8()?;
        let mut key = [0u8; KEY_LEN];
        reader.read_exact(&mut key)?;
        let header = Self {
            magic,
            version,
            key,
            max_file_count:  reader.read_i32::<LittleEndian>()?,
            max_block_count: reader.read_i32::<LittleEndian>()?,
            block_count:     reader.read_i32::<LittleEndian>()?,
        };
        header.validate()?;
        Ok(header)
    }
}

// ── Layout ───────────────────────────────────────────────────────────────────

/// Absolute byte offsets of each region in the container stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_offset:  u64,
    pub string_offset: u64,
    pub heap_offset:   u64,
}

impl Layout {
    pub fn new(max_file_count: u32, max_block_count: u32) -> Self {
        let block_offset  = HEADER_SIZE as u64;
        let string_offset = block_offset + BLOCK_RECORD_SIZE as u64 * max_block_count as u64;
        let heap_offset   = round_up_to_cluster(
            string_offset + STRING_RECORD_SIZE as u64 * max_file_count as u64,
        );
        Self { block_offset, string_offset, heap_offset }
    }

    pub fn block_record(&self, index: usize) -> u64 {
        self.block_offset + (index * BLOCK_RECORD_SIZE) as u64
    }

    pub fn string_record(&self, index: usize) -> u64 {
        self.string_offset + (index * STRING_RECORD_SIZE) as u64
    }

    pub fn cluster(&self, cluster_index: u64) -> u64 {
        self.heap_offset + cluster_index * CLUSTER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_encodes_to_fixed_size() {
        let header = Header::new(2, 4, [9, 8, 7, 6]);
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..3], MAGIC);
        assert_eq!(buf[3], VERSION);
        assert_eq!(&buf[4..8], &[9, 8, 7, 6]);
        assert_eq!(&buf[8..12], &2i32.to_le_bytes());
        assert_eq!(&buf[12..16], &4i32.to_le_bytes());
        assert_eq!(&buf[16..20], &0i32.to_le_bytes());
    }

    #[test]
    fn read_rejects_bad_magic() {
        let mut buf = Vec::new();
        Header::new(1, 1, [0; 4]).write(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(Header::read(Cursor::new(buf)), Err(HeaderError::InvalidMagic)));
    }

    #[test]
    fn read_rejects_bad_version() {
        let mut buf = Vec::new();
        Header::new(1, 1, [0; 4]).write(&mut buf).unwrap();
        buf[3] = 3;
        assert!(matches!(
            Header::read(Cursor::new(buf)),
            Err(HeaderError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn validate_checks_capacity_invariants() {
        assert!(Header::new(1, 1, [0; 4]).is_valid());
        assert!(!Header::new(0, 1, [0; 4]).is_valid());
        assert!(!Header::new(1, 0, [0; 4]).is_valid());
        assert!(!Header::new(5, 4, [0; 4]).is_valid());

        let mut h = Header::new(2, 4, [0; 4]);
        h.block_count = 5;
        assert!(matches!(h.validate(), Err(HeaderError::InvalidBlockCount { .. })));
    }

    #[test]
    fn truncated_header_is_io_error() {
        let buf = b"CPK\0\0".to_vec();
        assert!(matches!(Header::read(Cursor::new(buf)), Err(HeaderError::Io(_))));
    }

    #[test]
    fn heap_starts_on_cluster_boundary() {
        let layout = Layout::new(2, 4);
        assert_eq!(layout.block_offset, 20);
        assert_eq!(layout.string_offset, 20 + 12 * 4);
        assert_eq!(layout.heap_offset, CLUSTER_SIZE);

        let big = Layout::new(100, 1000);
        assert_eq!(big.string_offset, 20 + 12_000);
        assert_eq!(big.heap_offset, round_up_to_cluster(20 + 12_000 + 25_600));
        assert_eq!(big.heap_offset % CLUSTER_SIZE, 0);
        assert_eq!(big.cluster(3), big.heap_offset + 3 * CLUSTER_SIZE);
    }

    #[test]
    fn cluster_rounding() {
        assert_eq!(round_up_to_cluster(0), 0);
        assert_eq!(round_up_to_cluster(1), CLUSTER_SIZE);
        assert_eq!(round_up_to_cluster(CLUSTER_SIZE), CLUSTER_SIZE);
        assert_eq!(round_up_to_cluster(CLUSTER_SIZE + 1), 2 * CLUSTER_SIZE);
        assert_eq!(clusters_for(8193), 3);
    }
}
