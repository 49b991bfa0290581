use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::header::{clusters_for, round_up_to_cluster};

/// Encoded size of one [`BlockData`] record.
pub const BLOCK_RECORD_SIZE: usize = 12;
/// `string_index` value marking a free block.
pub const FREE_STRING_INDEX: i32 = -1;

/// One slot of the block table.
///
/// A used block (`string_index >= 0`) stores the exact byte length of its
/// blob.  A free block stores its cluster-rounded capacity, which is 0 for a
/// retired slot waiting to be recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockData {
    pub string_index:  i32,
    pub cluster_index: i32,
    pub length:        i32,
}

impl BlockData {
    pub fn free(cluster_index: i32, capacity: i32) -> Self {
        Self { string_index: FREE_STRING_INDEX, cluster_index, length: capacity }
    }

    pub fn is_used(&self) -> bool {
        self.string_index >= 0
    }

    /// Cluster-rounded capacity in bytes.
    pub fn capacity(&self) -> u64 {
        round_up_to_cluster(self.length.max(0) as u64)
    }

    pub fn cluster_count(&self) -> u64 {
        clusters_for(self.length.max(0) as u64)
    }

    pub fn start_cluster(&self) -> u64 {
        self.cluster_index.max(0) as u64
    }

    /// First cluster past the end of this block.
    pub fn end_cluster(&self) -> u64 {
        self.start_cluster() + self.cluster_count()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self.string_index)?;
        writer.write_i32::<LittleEndian>(self.cluster_index)?;
        writer.write_i32::<LittleEndian>(self.length)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self {
            string_index:  reader.read_i32::<LittleEndian>()?,
            cluster_index: reader.read_i32::<LittleEndian>()?,
            length:        reader.read_i32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CLUSTER_SIZE;

    #[test]
    fn field_order_is_string_cluster_length() {
        let block = BlockData { string_index: 7, cluster_index: 3, length: 5000 };
        let mut buf = Vec::new();
        block.write(&mut buf).unwrap();
        assert_eq!(buf.len(), BLOCK_RECORD_SIZE);
        assert_eq!(&buf[0..4], &7i32.to_le_bytes());
        assert_eq!(&buf[4..8], &3i32.to_le_bytes());
        assert_eq!(&buf[8..12], &5000i32.to_le_bytes());
        assert_eq!(BlockData::read(&buf[..]).unwrap(), block);
    }

    #[test]
    fn used_block_extent_rounds_up() {
        let block = BlockData { string_index: 0, cluster_index: 2, length: 5000 };
        assert!(block.is_used());
        assert_eq!(block.capacity(), 2 * CLUSTER_SIZE);
        assert_eq!(block.cluster_count(), 2);
        assert_eq!(block.end_cluster(), 4);
    }

    #[test]
    fn retired_block_has_no_extent() {
        let block = BlockData::free(9, 0);
        assert!(!block.is_used());
        assert_eq!(block.cluster_count(), 0);
        assert_eq!(block.end_cluster(), 9);
    }
}
