//! Cluster-granular block allocator.
//!
//! The allocator owns the block table and a free index keyed by capacity.
//! Every bucket is a FIFO of block indices, so among equally sized free
//! blocks the one freed first is handed out first.
//!
//! Allocation picks the smallest capacity bucket that can satisfy the
//! request.  An exact fit is reused in place; a larger block is split, the
//! front half becoming the allocation and the tail going back to the free
//! index under a fresh (or recycled) slot.  When nothing fits, a block is
//! appended at the end of the heap and the caller grows the stream.
//!
//! Freeing rounds the block back up to its capacity and merges it with the
//! free blocks physically adjacent on either side.  Absorbed slots stay in
//! the table as zero-length records; the table never shrinks, and slots in
//! the zero bucket are recycled before the table grows.
//!
//! The allocator does no I/O.  Slots it touches are queued in a dirty set
//! that the container drains and writes back after each operation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::debug;

use crate::block::{BlockData, FREE_STRING_INDEX};
use crate::header::{round_up_to_cluster, CLUSTER_SIZE};

/// Largest capacity a single block can describe.
pub const MAX_BLOCK_BYTES: u64 = (i32::MAX as u64 / CLUSTER_SIZE) * CLUSTER_SIZE;

/// Result of a successful [`BlockAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub index:    usize,
    /// New heap size in clusters when the request was served by appending.
    /// The caller must extend the stream to cover it.
    pub heap_end: Option<u64>,
}

/// A structural inconsistency found by [`BlockAllocator::verify`] or by the
/// container's integrity check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    #[error("blocks {first} and {second} overlap")]
    Overlap { first: usize, second: usize },
    #[error("heap clusters {start}..{end} are not covered by any block")]
    Gap { start: u64, end: u64 },
    #[error("free block {index} has unaligned capacity {length}")]
    UnalignedFree { index: usize, length: i32 },
    #[error("free block {index} is missing from the free index")]
    Unindexed { index: usize },
    #[error("block {index} is indexed under capacity {bucket} but holds {length}")]
    WrongBucket { index: usize, bucket: i32, length: i32 },
    #[error("used block {index} is present in the free index")]
    UsedInFreeIndex { index: usize },
    #[error("block {index} references string slot {string_index} which is empty")]
    DanglingString { index: usize, string_index: i32 },
    #[error("string slot {string_index} is referenced by blocks {first} and {second}")]
    SharedString { string_index: i32, first: usize, second: usize },
    #[error("name index entry {name:?} points at block {index} which does not hold it")]
    StaleName { name: String, index: usize },
}

#[derive(Debug, Clone)]
pub struct BlockAllocator {
    blocks:          Vec<BlockData>,
    max_block_count: usize,
    free_by_len:     BTreeMap<i32, VecDeque<usize>>,
    heap_clusters:   u64,
    dirty:           BTreeSet<usize>,
}

impl BlockAllocator {
    pub fn new(max_block_count: usize) -> Self {
        Self {
            blocks:          Vec::new(),
            max_block_count,
            free_by_len:     BTreeMap::new(),
            heap_clusters:   0,
            dirty:           BTreeSet::new(),
        }
    }

    /// Rebuild allocator state from a loaded block table.  Free blocks are
    /// indexed in slot order.  A free block whose length is not cluster
    /// aligned is rounded up and marked dirty.
    pub fn from_blocks(blocks: Vec<BlockData>, max_block_count: usize) -> Self {
        let mut alloc = Self::new(max_block_count);
        alloc.heap_clusters = blocks.iter().map(BlockData::end_cluster).max().unwrap_or(0);
        alloc.blocks = blocks;
        for index in 0..alloc.blocks.len() {
            let block = alloc.blocks[index];
            if block.is_used() {
                continue;
            }
            let capacity = block.capacity() as i32;
            if capacity != block.length {
                alloc.blocks[index].length = capacity;
                alloc.dirty.insert(index);
            }
            alloc.push_free(index);
        }
        alloc
    }

    pub fn blocks(&self) -> &[BlockData] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&BlockData> {
        self.blocks.get(index)
    }

    /// Slots currently in the table (the header's `block_count`).
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn max_block_count(&self) -> usize {
        self.max_block_count
    }

    pub fn heap_clusters(&self) -> u64 {
        self.heap_clusters
    }

    /// Bytes held by free blocks.
    pub fn free_bytes(&self) -> u64 {
        self.free_by_len
            .iter()
            .map(|(&len, queue)| len as u64 * queue.len() as u64)
            .sum()
    }

    /// Free blocks with non-zero capacity.
    pub fn free_block_count(&self) -> usize {
        self.free_by_len.range(1..).map(|(_, queue)| queue.len()).sum()
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// Reserve a block able to hold `length` bytes.
    ///
    /// Returns `None` when the request cannot be met without exceeding the
    /// block table capacity or the addressable heap; state is unchanged in
    /// that case.  The returned block carries `length` but is not linked to a
    /// string slot until [`BlockAllocator::link`] is called.
    pub fn alloc(&mut self, length: u64) -> Option<Allocation> {
        if length > MAX_BLOCK_BYTES {
            return None;
        }
        if length == 0 {
            let index = self.take_slot()?;
            self.blocks[index] = BlockData::free(self.heap_cluster_index(), 0);
            self.dirty.insert(index);
            return Some(Allocation { index, heap_end: None });
        }

        let need = round_up_to_cluster(length) as i32;
        let bucket = self.free_by_len.range(need..).next().map(|(&len, _)| len);

        match bucket {
            Some(len) if len == need => {
                let index = self.pop_bucket(len)?;
                self.blocks[index].length = length as i32;
                self.dirty.insert(index);
                Some(Allocation { index, heap_end: None })
            }
            Some(len) => {
                // Secure the remainder slot first so a failure leaves the
                // free index untouched.
                let rest = self.take_slot()?;
                let index = match self.pop_bucket(len) {
                    Some(index) => index,
                    None => {
                        self.push_free(rest);
                        return None;
                    }
                };
                let start = self.blocks[index].cluster_index;
                let rest_start = start + (need as u64 / CLUSTER_SIZE) as i32;
                self.blocks[rest] = BlockData::free(rest_start, len - need);
                self.push_free(rest);
                self.blocks[index].length = length as i32;
                self.dirty.insert(index);
                self.dirty.insert(rest);
                debug!(index, rest, capacity = len, taken = need, "split free block");
                Some(Allocation { index, heap_end: None })
            }
            None => {
                let clusters = need as u64 / CLUSTER_SIZE;
                let heap_end = self.heap_clusters + clusters;
                if heap_end > i32::MAX as u64 {
                    return None;
                }
                let index = self.take_slot()?;
                self.blocks[index] = BlockData {
                    string_index:  FREE_STRING_INDEX,
                    cluster_index: self.heap_clusters as i32,
                    length:        length as i32,
                };
                self.heap_clusters = heap_end;
                self.dirty.insert(index);
                debug!(index, clusters, heap_end, "appended block at heap end");
                Some(Allocation { index, heap_end: Some(heap_end) })
            }
        }
    }

    /// Bind an allocated block to its string slot, marking it used.
    pub fn link(&mut self, index: usize, string_index: usize) {
        self.blocks[index].string_index = string_index as i32;
        self.dirty.insert(index);
    }

    /// Return a block to the free index, merging it with free neighbours.
    pub fn free(&mut self, index: usize) {
        let capacity = self.blocks[index].capacity();
        {
            let block = &mut self.blocks[index];
            block.string_index = FREE_STRING_INDEX;
            block.length = capacity as i32;
        }
        self.dirty.insert(index);
        if capacity == 0 {
            self.push_free(index);
            return;
        }

        let start = self.blocks[index].start_cluster();
        let end = self.blocks[index].end_cluster();
        let mut prev = None;
        let mut next = None;
        for queue in self.free_by_len.range(1..).map(|(_, q)| q) {
            for &candidate in queue {
                let block = &self.blocks[candidate];
                if block.end_cluster() == start {
                    prev = Some(candidate);
                } else if block.start_cluster() == end {
                    next = Some(candidate);
                }
            }
        }

        let mut merged = capacity;
        for neighbour in [prev, next].into_iter().flatten() {
            let extra = self.blocks[neighbour].length as u64;
            if merged + extra > MAX_BLOCK_BYTES {
                continue;
            }
            self.remove_free(neighbour);
            let absorbed = self.blocks[neighbour];
            if absorbed.cluster_index < self.blocks[index].cluster_index {
                self.blocks[index].cluster_index = absorbed.cluster_index;
            }
            merged += extra;
            self.blocks[neighbour].length = 0;
            self.push_free(neighbour);
            self.dirty.insert(neighbour);
            debug!(index, absorbed = neighbour, "coalesced free blocks");
        }
        self.blocks[index].length = merged as i32;
        self.push_free(index);
    }

    /// Drain the slots modified since the last call, in slot order.
    pub fn take_dirty(&mut self) -> Vec<(usize, BlockData)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty.into_iter().map(|i| (i, self.blocks[i])).collect()
    }

    /// Queue `index` for write-back again, e.g. after its record failed to
    /// reach the stream.
    pub fn mark_dirty(&mut self, index: usize) {
        if index < self.blocks.len() {
            self.dirty.insert(index);
        }
    }

    /// Roll back to `saved`, an earlier clone of this allocator.  Every slot
    /// whose record differs between the two stays dirty, so whatever reached
    /// the stream in between is overwritten on the next write-back.
    pub fn restore(&mut self, saved: BlockAllocator) {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.extend(saved.dirty.iter().copied());
        let span = self.blocks.len().max(saved.blocks.len());
        dirty.extend((0..span).filter(|&i| self.blocks.get(i) != saved.blocks.get(i)));

        *self = saved;
        let live = self.blocks.len();
        self.dirty = dirty.into_iter().filter(|&i| i < live).collect();
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Check that the block table tiles the heap and that the free index
    /// agrees with it.
    pub fn verify(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();

        let mut extents: Vec<(u64, u64, usize)> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.cluster_count() > 0)
            .map(|(i, b)| (b.start_cluster(), b.end_cluster(), i))
            .collect();
        extents.sort_unstable();

        let mut covered = 0u64;
        let mut last: Option<usize> = None;
        for &(start, end, index) in &extents {
            if start < covered {
                if let Some(first) = last {
                    issues.push(IntegrityIssue::Overlap { first, second: index });
                }
            } else if start > covered {
                issues.push(IntegrityIssue::Gap { start: covered, end: start });
            }
            if end > covered {
                covered = end;
                last = Some(index);
            }
        }
        if covered < self.heap_clusters {
            issues.push(IntegrityIssue::Gap { start: covered, end: self.heap_clusters });
        }

        let mut indexed = BTreeSet::new();
        for (&bucket, queue) in &self.free_by_len {
            for &index in queue {
                indexed.insert(index);
                let block = &self.blocks[index];
                if block.is_used() {
                    issues.push(IntegrityIssue::UsedInFreeIndex { index });
                } else if block.length != bucket {
                    issues.push(IntegrityIssue::WrongBucket { index, bucket, length: block.length });
                }
            }
        }
        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_used() {
                continue;
            }
            if block.length as u64 % CLUSTER_SIZE != 0 {
                issues.push(IntegrityIssue::UnalignedFree { index, length: block.length });
            }
            if !indexed.contains(&index) {
                issues.push(IntegrityIssue::Unindexed { index });
            }
        }
        issues
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn heap_cluster_index(&self) -> i32 {
        self.heap_clusters.min(i32::MAX as u64) as i32
    }

    /// A recycled zero-length slot, or a new slot appended to the table.
    fn take_slot(&mut self) -> Option<usize> {
        if let Some(index) = self.pop_bucket(0) {
            return Some(index);
        }
        if self.blocks.len() >= self.max_block_count {
            return None;
        }
        self.blocks.push(BlockData::free(self.heap_cluster_index(), 0));
        let index = self.blocks.len() - 1;
        self.dirty.insert(index);
        Some(index)
    }

    fn pop_bucket(&mut self, len: i32) -> Option<usize> {
        let queue = self.free_by_len.get_mut(&len)?;
        let index = queue.pop_front();
        if queue.is_empty() {
            self.free_by_len.remove(&len);
        }
        index
    }

    fn push_free(&mut self, index: usize) {
        let len = self.blocks[index].length;
        self.free_by_len.entry(len).or_default().push_back(index);
    }

    fn remove_free(&mut self, index: usize) {
        let len = self.blocks[index].length;
        if let Some(queue) = self.free_by_len.get_mut(&len) {
            queue.retain(|&i| i != index);
            if queue.is_empty() {
                self.free_by_len.remove(&len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: u64 = CLUSTER_SIZE;

    /// Allocate and link in one step, as the container does for a new file.
    fn put(alloc: &mut BlockAllocator, length: u64, string_index: usize) -> usize {
        let a = alloc.alloc(length).expect("allocation failed");
        alloc.link(a.index, string_index);
        a.index
    }

    #[test]
    fn appends_grow_the_heap() {
        let mut alloc = BlockAllocator::new(4);
        let a = alloc.alloc(3).unwrap();
        assert_eq!(a, Allocation { index: 0, heap_end: Some(1) });
        alloc.link(a.index, 0);
        let b = alloc.alloc(C + 1).unwrap();
        assert_eq!(b, Allocation { index: 1, heap_end: Some(3) });
        assert_eq!(alloc.block(1).unwrap().cluster_index, 1);
        assert_eq!(alloc.block(1).unwrap().length, (C + 1) as i32);
        assert_eq!(alloc.heap_clusters(), 3);
    }

    #[test]
    fn exact_fit_reuses_block() {
        let mut alloc = BlockAllocator::new(4);
        let a = put(&mut alloc, 10, 0);
        put(&mut alloc, 10, 1);
        alloc.free(a);
        let again = alloc.alloc(C).unwrap();
        assert_eq!(again, Allocation { index: a, heap_end: None });
        assert_eq!(alloc.block(a).unwrap().length, C as i32);
    }

    #[test]
    fn larger_fit_is_split_front_first() {
        let mut alloc = BlockAllocator::new(4);
        let big = put(&mut alloc, 3 * C, 0);
        put(&mut alloc, 1, 1);
        alloc.free(big);

        let a = alloc.alloc(100).unwrap();
        assert_eq!(a.index, big);
        assert_eq!(a.heap_end, None);
        let front = *alloc.block(big).unwrap();
        assert_eq!(front.cluster_index, 0);
        assert_eq!(front.length, 100);

        let rest = *alloc.block(2).unwrap();
        assert!(!rest.is_used());
        assert_eq!(rest.cluster_index, 1);
        assert_eq!(rest.length, (2 * C) as i32);
        alloc.link(a.index, 0);
        assert!(alloc.verify().is_empty());
    }

    #[test]
    fn split_fails_cleanly_when_table_full() {
        let mut alloc = BlockAllocator::new(2);
        let big = put(&mut alloc, 2 * C, 0);
        put(&mut alloc, 1, 1);
        alloc.free(big);
        let before = alloc.blocks().to_vec();

        assert_eq!(alloc.alloc(1), None);
        assert_eq!(alloc.blocks(), &before[..]);
        // The untouched free block still serves an exact fit.
        assert_eq!(alloc.alloc(2 * C).map(|a| a.index), Some(big));
    }

    #[test]
    fn smallest_sufficient_bucket_wins() {
        let mut alloc = BlockAllocator::new(8);
        let three = put(&mut alloc, 3 * C, 0);
        put(&mut alloc, 1, 1);
        let two = put(&mut alloc, 2 * C, 2);
        put(&mut alloc, 1, 3);
        alloc.free(three);
        alloc.free(two);
        assert_eq!(alloc.alloc(C + 1).map(|a| a.index), Some(two));
    }

    #[test]
    fn ties_break_oldest_freed_first() {
        let mut alloc = BlockAllocator::new(8);
        let a = put(&mut alloc, 1, 0);
        put(&mut alloc, 1, 1);
        let b = put(&mut alloc, 1, 2);
        put(&mut alloc, 1, 3);
        alloc.free(b);
        alloc.free(a);
        assert_eq!(alloc.alloc(1).map(|x| x.index), Some(b));
        assert_eq!(alloc.alloc(1).map(|x| x.index), Some(a));
    }

    #[test]
    fn free_merges_both_neighbours() {
        let mut alloc = BlockAllocator::new(8);
        let a = put(&mut alloc, 1, 0);
        let b = put(&mut alloc, C + 5, 1);
        let c = put(&mut alloc, 1, 2);
        put(&mut alloc, 1, 3);
        alloc.free(a);
        alloc.free(c);
        alloc.free(b);

        let merged = *alloc.block(b).unwrap();
        assert_eq!(merged.cluster_index, 0);
        assert_eq!(merged.length, (4 * C) as i32);
        assert_eq!(alloc.block(a).unwrap().length, 0);
        assert_eq!(alloc.block(c).unwrap().length, 0);
        assert_eq!(alloc.free_block_count(), 1);
        assert_eq!(alloc.free_bytes(), 4 * C);
        assert!(alloc.verify().is_empty());

        // The merged region absorbs a 4-cluster file without growing the heap.
        let d = alloc.alloc(4 * C).unwrap();
        assert_eq!(d, Allocation { index: b, heap_end: None });
    }

    #[test]
    fn retired_slots_are_recycled_before_growth() {
        let mut alloc = BlockAllocator::new(3);
        let a = put(&mut alloc, 1, 0);
        let b = put(&mut alloc, 1, 1);
        put(&mut alloc, 1, 2);
        alloc.free(a);
        alloc.free(b);
        assert_eq!(alloc.block_count(), 3);

        // Split of the merged 2-cluster block needs a slot: the retired one.
        let x = alloc.alloc(1).unwrap();
        assert_eq!(x.index, b);
        alloc.link(x.index, 0);
        let rest = *alloc.block(a).unwrap();
        assert_eq!(rest.cluster_index, 1);
        assert_eq!(rest.length, C as i32);
        assert!(alloc.verify().is_empty());
    }

    #[test]
    fn zero_length_blocks() {
        let mut alloc = BlockAllocator::new(2);
        let empty = put(&mut alloc, 0, 0);
        assert_eq!(alloc.heap_clusters(), 0);
        alloc.free(empty);
        assert_eq!(alloc.alloc(0).map(|a| a.index), Some(empty));
        assert_eq!(alloc.alloc(0).map(|a| a.index), Some(1));
        assert_eq!(alloc.alloc(0), None);
    }

    #[test]
    fn table_capacity_limits_appends() {
        let mut alloc = BlockAllocator::new(1);
        put(&mut alloc, 1, 0);
        assert_eq!(alloc.alloc(1), None);
        assert_eq!(alloc.heap_clusters(), 1);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut alloc = BlockAllocator::new(1);
        assert_eq!(alloc.alloc(MAX_BLOCK_BYTES + 1), None);
        assert_eq!(alloc.block_count(), 0);
    }

    #[test]
    fn dirty_set_is_drained() {
        let mut alloc = BlockAllocator::new(4);
        put(&mut alloc, 1, 0);
        let dirty = alloc.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].0, 0);
        assert_eq!(dirty[0].1.string_index, 0);
        assert!(alloc.take_dirty().is_empty());
    }

    #[test]
    fn restore_undoes_split_and_free() {
        let mut alloc = BlockAllocator::new(8);
        let a = put(&mut alloc, 100, 0);
        put(&mut alloc, 100, 1);
        alloc.take_dirty();

        let saved = alloc.clone();
        let fresh = alloc.alloc(10).unwrap();
        alloc.link(fresh.index, 2);
        alloc.free(a);
        alloc.take_dirty();

        alloc.restore(saved);
        assert_eq!(alloc.block_count(), 2);
        assert_eq!(alloc.block(a).unwrap().string_index, 0);
        assert!(alloc.verify().is_empty());
        // Slot `a` changed in between, so it has to be rewritten.
        let dirty: Vec<usize> = alloc.take_dirty().into_iter().map(|(i, _)| i).collect();
        assert_eq!(dirty, vec![a]);
    }

    #[test]
    fn mark_dirty_ignores_unknown_slots() {
        let mut alloc = BlockAllocator::new(4);
        put(&mut alloc, 1, 0);
        alloc.take_dirty();
        alloc.mark_dirty(0);
        alloc.mark_dirty(3);
        assert_eq!(alloc.take_dirty().len(), 1);
    }

    #[test]
    fn from_blocks_rebuilds_free_index() {
        let blocks = vec![
            BlockData { string_index: 0, cluster_index: 0, length: 10 },
            BlockData::free(1, (2 * C) as i32),
            BlockData::free(0, 0),
            BlockData { string_index: 1, cluster_index: 3, length: 1 },
        ];
        let mut alloc = BlockAllocator::from_blocks(blocks, 8);
        assert_eq!(alloc.heap_clusters(), 4);
        assert_eq!(alloc.free_bytes(), 2 * C);
        assert!(alloc.verify().is_empty());
        assert_eq!(alloc.alloc(2 * C).map(|a| a.index), Some(1));
    }

    #[test]
    fn verify_reports_overlap_and_gap() {
        let blocks = vec![
            BlockData { string_index: 0, cluster_index: 0, length: (2 * C) as i32 },
            BlockData { string_index: 1, cluster_index: 1, length: 1 },
            BlockData { string_index: 2, cluster_index: 4, length: 1 },
        ];
        let alloc = BlockAllocator::from_blocks(blocks, 8);
        let issues = alloc.verify();
        assert!(issues.contains(&IntegrityIssue::Overlap { first: 0, second: 1 }));
        assert!(issues.contains(&IntegrityIssue::Gap { start: 2, end: 4 }));
    }
}
