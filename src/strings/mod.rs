//! String table: fixed-size, obfuscated filename records.
//!
//! Each record is a length byte followed by a 255-byte buffer.  A length of 0
//! marks an empty slot; freeing a slot only clears the length byte and the
//! stale buffer is overwritten when the slot is reused.
//!
//! Slot selection prefers previously freed slots in the order they were freed,
//! then the lowest index never handed out.

use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Read, Write};

use crate::crypto::{xor_in_place, KEY_LEN};

/// Longest name, in UTF-8 bytes, a record can hold.
pub const MAX_NAME_LEN: usize = 255;
/// Encoded size of one [`StringData`] record.
pub const STRING_RECORD_SIZE: usize = 1 + MAX_NAME_LEN;

// ── StringData ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringData {
    pub length: u8,
    pub bytes:  [u8; MAX_NAME_LEN],
}

impl StringData {
    pub fn empty() -> Self {
        Self { length: 0, bytes: [0u8; MAX_NAME_LEN] }
    }

    /// Obfuscate `name` into a record.  Returns `None` when the name does not
    /// fit in [`MAX_NAME_LEN`] bytes.
    pub fn encode(name: &str, key: &[u8; KEY_LEN]) -> Option<Self> {
        let raw = name.as_bytes();
        if raw.len() > MAX_NAME_LEN {
            return None;
        }
        let mut record = Self::empty();
        record.length = raw.len() as u8;
        record.bytes[..raw.len()].copy_from_slice(raw);
        xor_in_place(key, &mut record.bytes[..raw.len()]);
        Some(record)
    }

    /// Recover the name.  `None` for an empty slot or bytes that are not
    /// valid UTF-8 after de-obfuscation.
    pub fn decode(&self, key: &[u8; KEY_LEN]) -> Option<String> {
        if self.length == 0 {
            return None;
        }
        let mut raw = self.bytes[..self.length as usize].to_vec();
        xor_in_place(key, &mut raw);
        String::from_utf8(raw).ok()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.length)?;
        writer.write_all(&self.bytes)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let length = reader.read_u8()?;
        let mut bytes = [0u8; MAX_NAME_LEN];
        reader.read_exact(&mut bytes)?;
        Ok(Self { length, bytes })
    }
}

// ── StringTable ──────────────────────────────────────────────────────────────

/// In-memory slot bookkeeping for the string records.
#[derive(Debug, Clone)]
pub struct StringTable {
    max_file_count: usize,
    occupied:       BTreeSet<usize>,
    free_queue:     VecDeque<usize>,
}

impl StringTable {
    pub fn new(max_file_count: usize) -> Self {
        Self {
            max_file_count,
            occupied:   BTreeSet::new(),
            free_queue: VecDeque::new(),
        }
    }

    /// Record a slot found in use while loading.
    pub fn mark_occupied(&mut self, index: usize) -> bool {
        index < self.max_file_count && self.occupied.insert(index)
    }

    /// Claim a slot, or `None` when every slot is taken.
    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(index) = self.free_queue.pop_front() {
            self.occupied.insert(index);
            return Some(index);
        }
        let mut candidate = 0usize;
        for &index in &self.occupied {
            if index != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= self.max_file_count {
            return None;
        }
        self.occupied.insert(candidate);
        Some(candidate)
    }

    /// Release a slot for reuse.  Releasing a slot that is not held is a no-op.
    pub fn free(&mut self, index: usize) {
        if self.occupied.remove(&index) {
            self.free_queue.push_back(index);
        }
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        self.occupied.contains(&index)
    }

    pub fn capacity(&self) -> usize {
        self.max_file_count
    }
}
