//! High-level [`Container`] API, the primary embedding surface.
//!
//! ```no_run
//! use clusterpack::container::{AccessMode, Container, CreateOptions};
//!
//! let mut pack = Container::create_file("assets.cpk", CreateOptions::default())?;
//! pack.write_file("readme.txt", b"Hello, world!")?;
//! pack.shutdown()?;
//!
//! let mut pack = Container::open_file("assets.cpk", AccessMode::Read)?;
//! assert_eq!(pack.read_file("readme.txt")?.as_deref(), Some(&b"Hello, world!"[..]));
//! # Ok::<(), clusterpack::container::ContainerError>(())
//! ```
//!
//! # Failure model
//! Misuse (empty or over-long names, payloads past the per-file limit, an
//! operation the access mode forbids) returns an error immediately.  Running
//! out of file slots or block slots is not an error: allocation-class calls
//! return `Ok(false)` and leave the container untouched.  Stream I/O errors
//! propagate, except from [`Container::save_as_file`], which reports them as
//! `Ok(false)`.
//!
//! The name index is only updated after the payload and metadata writes for
//! an operation have succeeded, so lookups never see a half-written entry.
//! When a write fails part way, the block and string tables are rolled back
//! to their state before the call.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, BlockAllocator, IntegrityIssue, MAX_BLOCK_BYTES};
use crate::block::{BlockData, BLOCK_RECORD_SIZE};
use crate::crypto::generate_key;
use crate::header::{Header, HeaderError, Layout, HEADER_SIZE};
use crate::io_stream::{copy_range_to, read_exact_at, write_all_at, Stream};
use crate::strings::{StringData, StringTable, MAX_NAME_LEN, STRING_RECORD_SIZE};

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("File name must not be empty")]
    EmptyName,
    #[error("File name is {0} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("Payload of {0} bytes exceeds the per-file limit of {MAX_BLOCK_BYTES}")]
    PayloadTooLarge(u64),
    #[error("Container is {0}")]
    AccessDenied(&'static str),
    #[error("Invalid capacity: max_file_count={max_file_count}, max_block_count={max_block_count}")]
    InvalidCapacity { max_file_count: u32, max_block_count: u32 },
    #[error("Corrupt container: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

// ── AccessMode ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }
}

// ── CreateOptions ────────────────────────────────────────────────────────────

/// Capacities fixed at creation time.  Both regions are reserved up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub max_file_count:  u32,
    pub max_block_count: u32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            max_file_count:  1024,
            max_block_count: 4096,
        }
    }
}

impl CreateOptions {
    fn validate(&self) -> Result<()> {
        let limit = i32::MAX as u32;
        if self.max_file_count == 0
            || self.max_block_count == 0
            || self.max_file_count > self.max_block_count
            || self.max_block_count > limit
        {
            return Err(ContainerError::InvalidCapacity {
                max_file_count:  self.max_file_count,
                max_block_count: self.max_block_count,
            });
        }
        Ok(())
    }
}

// ── Views ────────────────────────────────────────────────────────────────────

/// Location of one stored file.  A snapshot; it does not track later changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name:   String,
    /// Absolute byte offset of the first payload byte in the stream.
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub file_count:      usize,
    pub max_file_count:  usize,
    pub block_count:     usize,
    pub max_block_count: usize,
    pub heap_offset:     u64,
    pub heap_bytes:      u64,
    /// Logical bytes held by files.
    pub used_bytes:      u64,
    pub free_bytes:      u64,
    pub free_blocks:     usize,
}

// ── Container ────────────────────────────────────────────────────────────────

pub struct Container<S: Stream> {
    path:    PathBuf,
    access:  AccessMode,
    stream:  S,
    header:  Header,
    layout:  Layout,
    blocks:  BlockAllocator,
    strings: StringTable,
    names:   HashMap<String, usize>,
}

impl Container<File> {
    /// Create (or truncate) a container file on disk.
    pub fn create_file<P: AsRef<Path>>(path: P, opts: CreateOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::create(path, AccessMode::ReadWrite, file, opts)
    }

    /// Open an existing container file.  Metadata is always readable; `access`
    /// governs which file operations are permitted.
    pub fn open_file<P: AsRef<Path>>(path: P, access: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(access.can_write())
            .open(path)?;
        Self::load(path, access, file)
    }
}

impl<S: Stream> Container<S> {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Format `stream` as an empty container.  Any previous content is
    /// discarded.  On failure the stream is dropped and no container is
    /// returned.
    pub fn create<P: Into<PathBuf>>(path: P, access: AccessMode, mut stream: S, opts: CreateOptions) -> Result<Self> {
        let path = path.into();
        if !access.can_write() {
            return Err(ContainerError::AccessDenied("read-only"));
        }
        opts.validate()?;

        let header = Header::new(opts.max_file_count as i32, opts.max_block_count as i32, generate_key());
        let layout = header.layout();
        let formatted = (|| -> io::Result<()> {
            stream.set_len(0)?;
            let mut buf = Vec::with_capacity(HEADER_SIZE);
            header.write(&mut buf)?;
            write_all_at(&mut stream, 0, &buf)?;
            stream.set_len(layout.heap_offset)?;
            stream.flush()
        })();
        if let Err(e) = formatted {
            warn!(path = %path.display(), error = %e, "container creation failed");
            return Err(e.into());
        }

        info!(
            path = %path.display(),
            max_files = opts.max_file_count,
            max_blocks = opts.max_block_count,
            heap_offset = layout.heap_offset,
            "created container"
        );
        Ok(Self {
            path,
            access,
            stream,
            blocks: BlockAllocator::new(opts.max_block_count as usize),
            strings: StringTable::new(opts.max_file_count as usize),
            names: HashMap::new(),
            header,
            layout,
        })
    }

    /// Open an existing container.  The header must pass validation and every
    /// block and string record must be consistent, or the load is rejected.
    pub fn load<P: Into<PathBuf>>(path: P, access: AccessMode, mut stream: S) -> Result<Self> {
        let path = path.into();
        stream.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut stream)?;
        let layout = header.layout();

        let stream_len = stream.len()?;
        if stream_len < layout.heap_offset {
            return Err(ContainerError::Corrupt(format!(
                "stream is {stream_len} bytes, metadata needs {}",
                layout.heap_offset
            )));
        }

        let block_count = header.block_count as usize;
        let mut raw = vec![0u8; block_count * BLOCK_RECORD_SIZE];
        read_exact_at(&mut stream, layout.block_offset, &mut raw)?;
        let records = raw
            .chunks_exact(BLOCK_RECORD_SIZE)
            .map(BlockData::read)
            .collect::<io::Result<Vec<_>>>()?;

        let mut strings = StringTable::new(header.max_file_count as usize);
        let mut names = HashMap::new();
        for (index, block) in records.iter().enumerate() {
            if block.cluster_index < 0 || block.length < 0 {
                return Err(ContainerError::Corrupt(format!("block {index} has a negative field")));
            }
            if !block.is_used() {
                continue;
            }
            let slot = block.string_index as usize;
            if slot >= strings.capacity() {
                return Err(ContainerError::Corrupt(format!(
                    "block {index} references string slot {slot} past the table"
                )));
            }
            if !strings.mark_occupied(slot) {
                return Err(ContainerError::Corrupt(format!("string slot {slot} is shared")));
            }
            let mut buf = [0u8; STRING_RECORD_SIZE];
            read_exact_at(&mut stream, layout.string_record(slot), &mut buf)?;
            let name = StringData::read(&buf[..])?
                .decode(&header.key)
                .ok_or_else(|| ContainerError::Corrupt(format!("block {index} has no readable name")))?;
            if names.insert(name, index).is_some() {
                return Err(ContainerError::Corrupt(format!("duplicate name at block {index}")));
            }
        }

        let blocks = BlockAllocator::from_blocks(records, header.max_block_count as usize);
        if let Some(issue) = blocks.verify().into_iter().next() {
            return Err(ContainerError::Corrupt(issue.to_string()));
        }

        let mut container = Self { path, access, stream, header, layout, blocks, strings, names };
        if access.can_write() {
            container.persist_blocks()?;
        } else {
            container.blocks.take_dirty();
        }
        info!(
            path = %container.path.display(),
            files = container.names.len(),
            blocks = container.blocks.block_count(),
            "loaded container"
        );
        Ok(container)
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn file_count(&self) -> usize {
        self.names.len()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn file_info(&self, name: &str) -> Option<FileInfo> {
        let &index = self.names.get(name)?;
        let block = self.blocks.block(index)?;
        Some(FileInfo {
            name:   name.to_owned(),
            offset: self.layout.cluster(block.start_cluster()),
            length: block.length as u64,
        })
    }

    /// Every stored file, ordered by name.
    pub fn file_infos(&self) -> Vec<FileInfo> {
        let mut infos: Vec<FileInfo> = self.names.keys().filter_map(|n| self.file_info(n)).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn stats(&self) -> ContainerStats {
        let used_bytes = self
            .names
            .values()
            .filter_map(|&i| self.blocks.block(i))
            .map(|b| b.length as u64)
            .sum();
        ContainerStats {
            file_count: self.names.len(),
            max_file_count: self.strings.capacity(),
            block_count: self.blocks.block_count(),
            max_block_count: self.blocks.max_block_count(),
            heap_offset: self.layout.heap_offset,
            heap_bytes: self.blocks.heap_clusters() * crate::header::CLUSTER_SIZE,
            used_bytes,
            free_bytes: self.blocks.free_bytes(),
            free_blocks: self.blocks.free_block_count(),
        }
    }

    /// Cross-check the block table, the free index, the string table and
    /// the name index.  An empty result means the container is consistent.
    pub fn check_integrity(&mut self) -> Result<Vec<IntegrityIssue>> {
        let mut issues = self.blocks.verify();

        let mut owners: HashMap<i32, usize> = HashMap::new();
        for (index, block) in self.blocks.blocks().iter().enumerate() {
            if !block.is_used() {
                continue;
            }
            if !self.strings.is_occupied(block.string_index as usize) {
                issues.push(IntegrityIssue::DanglingString { index, string_index: block.string_index });
            }
            if let Some(first) = owners.insert(block.string_index, index) {
                issues.push(IntegrityIssue::SharedString {
                    string_index: block.string_index,
                    first,
                    second: index,
                });
            }
        }

        let entries: Vec<(String, usize)> = self.names.iter().map(|(n, &i)| (n.clone(), i)).collect();
        for (name, index) in entries {
            let stored = match self.blocks.block(index).copied() {
                Some(block) if block.is_used() => self.read_name(block.string_index as usize)?,
                _ => None,
            };
            if stored.as_deref() != Some(name.as_str()) {
                issues.push(IntegrityIssue::StaleName { name, index });
            }
        }
        Ok(issues)
    }

    // ── Read ─────────────────────────────────────────────────────────────────

    /// Whole file contents, or `None` if no such file exists.
    pub fn read_file(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_file_segment(name, 0, u64::MAX)
    }

    /// Up to `length` bytes starting at `offset`.  Ranges past the end are
    /// truncated, never rejected.
    pub fn read_file_segment(&mut self, name: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let Some((start, len)) = self.resolve_read(name, offset, length)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len as usize];
        read_exact_at(&mut self.stream, start, &mut buf)?;
        Ok(Some(buf))
    }

    /// Fill as much of `buf` as the file allows from `offset`.  Returns the
    /// number of bytes copied.
    pub fn read_file_into(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some((start, len)) = self.resolve_read(name, offset, buf.len() as u64)? else {
            return Ok(None);
        };
        let len = len as usize;
        read_exact_at(&mut self.stream, start, &mut buf[..len])?;
        Ok(Some(len))
    }

    /// Stream the whole file into `sink`.  Returns bytes copied.
    pub fn read_file_to<W: Write + ?Sized>(&mut self, name: &str, sink: &mut W) -> Result<Option<u64>> {
        self.read_file_segment_to(name, 0, u64::MAX, sink)
    }

    pub fn read_file_segment_to<W: Write + ?Sized>(
        &mut self,
        name:   &str,
        offset: u64,
        length: u64,
        sink:   &mut W,
    ) -> Result<Option<u64>> {
        let Some((start, len)) = self.resolve_read(name, offset, length)? else {
            return Ok(None);
        };
        Ok(Some(copy_range_to(&mut self.stream, start, len, sink)?))
    }

    /// Copy a file out to `dest` on the local filesystem.  I/O failures are
    /// logged and reported as `Ok(false)`, as is a missing source file.
    pub fn save_as_file<P: AsRef<Path>>(&mut self, name: &str, dest: P) -> Result<bool> {
        let dest = dest.as_ref();
        let Some((start, len)) = self.resolve_read(name, 0, u64::MAX)? else {
            return Ok(false);
        };
        let stream = &mut self.stream;
        let copied = File::create(dest).and_then(|mut out| {
            copy_range_to(stream, start, len, &mut out)?;
            out.flush()
        });
        match copied {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(name, dest = %dest.display(), error = %e, "save_as_file failed");
                Ok(false)
            }
        }
    }

    // ── Write ────────────────────────────────────────────────────────────────

    /// Store `data` under `name`, replacing any existing file of that name.
    ///
    /// Returns `Ok(false)` without touching the container when a new name
    /// would exceed the file capacity or no block can be allocated.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        self.require_write()?;
        validate_name(name)?;
        let length = data.len() as u64;
        if length > MAX_BLOCK_BYTES {
            return Err(ContainerError::PayloadTooLarge(length));
        }

        let existing = self.names.get(name).copied();
        if existing.is_none() && self.names.len() >= self.strings.capacity() {
            debug!(name, "file table full");
            return Ok(false);
        }
        // Tables are rolled back wholesale if any write below fails.
        let saved_blocks = self.blocks.clone();
        let saved_strings = self.strings.clone();
        let Some(allocation) = self.blocks.alloc(length) else {
            debug!(name, length, "no block available");
            return Ok(false);
        };
        let index = allocation.index;
        match self.stage_write(name, existing, allocation, data) {
            Ok(true) => {}
            outcome => {
                self.blocks.restore(saved_blocks);
                self.strings = saved_strings;
                if let Err(e) = &outcome {
                    warn!(name, error = %e, "write failed, tables rolled back");
                }
                return outcome;
            }
        }
        self.names.insert(name.to_owned(), index);
        self.stream.flush()?;
        debug!(name, length, block = index, replaced = existing.is_some(), "wrote file");
        Ok(true)
    }

    /// Store everything `reader` yields under `name`.
    pub fn write_file_from<R: Read + ?Sized>(&mut self, name: &str, reader: &mut R) -> Result<bool> {
        self.require_write()?;
        validate_name(name)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.write_file(name, &data)
    }

    /// Store the contents of the local file at `source` under `name`.
    pub fn write_file_from_path<P: AsRef<Path>>(&mut self, name: &str, source: P) -> Result<bool> {
        self.require_write()?;
        validate_name(name)?;
        let data = std::fs::read(source)?;
        self.write_file(name, &data)
    }

    /// Rename `from` to `to`.  Only the string record changes; the payload
    /// stays where it is.  Returns `Ok(false)` if `from` is missing or `to`
    /// is taken.
    pub fn rename_file(&mut self, from: &str, to: &str) -> Result<bool> {
        self.require_write()?;
        validate_name(from)?;
        validate_name(to)?;
        if from == to {
            return Ok(self.names.contains_key(from));
        }
        if self.names.contains_key(to) {
            return Ok(false);
        }
        let Some(&index) = self.names.get(from) else {
            return Ok(false);
        };
        let slot = self.blocks.blocks()[index].string_index as usize;
        self.write_name(slot, to)?;
        self.names.remove(from);
        self.names.insert(to.to_owned(), index);
        self.stream.flush()?;
        debug!(from, to, block = index, "renamed file");
        Ok(true)
    }

    /// Remove `name`, releasing its string slot and block.  Returns
    /// `Ok(false)` if there is no such file.
    pub fn delete_file(&mut self, name: &str) -> Result<bool> {
        self.require_write()?;
        validate_name(name)?;
        let Some(&index) = self.names.get(name) else {
            return Ok(false);
        };
        let slot = self.blocks.blocks()[index].string_index as usize;
        let saved_blocks = self.blocks.clone();
        self.blocks.free(index);
        let cleared = match self.persist_blocks() {
            Ok(()) => write_all_at(&mut self.stream, self.layout.string_record(slot), &[0u8])
                .map_err(ContainerError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = cleared {
            warn!(name, error = %e, "delete failed, tables rolled back");
            self.blocks.restore(saved_blocks);
            return Err(e);
        }
        self.names.remove(name);
        self.strings.free(slot);
        self.stream.flush()?;
        debug!(name, block = index, "deleted file");
        Ok(true)
    }

    /// Write back pending metadata and flush the stream.
    pub fn flush(&mut self) -> Result<()> {
        if self.access.can_write() {
            self.persist_blocks()?;
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Flush and release the container, handing the stream back.
    pub fn shutdown(mut self) -> Result<S> {
        self.flush()?;
        info!(path = %self.path.display(), files = self.names.len(), "container shut down");
        Ok(self.stream)
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn require_read(&self) -> Result<()> {
        if self.access.can_read() { Ok(()) } else { Err(ContainerError::AccessDenied("write-only")) }
    }

    fn require_write(&self) -> Result<()> {
        if self.access.can_write() { Ok(()) } else { Err(ContainerError::AccessDenied("read-only")) }
    }

    /// Validate a read request and clamp it to the file: absolute stream
    /// offset and byte count, or `None` for a missing file.
    fn resolve_read(&self, name: &str, offset: u64, length: u64) -> Result<Option<(u64, u64)>> {
        self.require_read()?;
        validate_name(name)?;
        let Some(block) = self.names.get(name).and_then(|&i| self.blocks.block(i)) else {
            return Ok(None);
        };
        let size = block.length as u64;
        let start = offset.min(size);
        let len = length.min(size - start);
        Ok(Some((self.layout.cluster(block.start_cluster()) + start, len)))
    }

    fn fill_block(&mut self, allocation: Allocation, data: &[u8]) -> Result<()> {
        if let Some(heap_end) = allocation.heap_end {
            let needed = self.layout.cluster(heap_end);
            if self.stream.len()? < needed {
                self.stream.set_len(needed)?;
                debug!(len = needed, "grew stream");
            }
        }
        let block = self.blocks.blocks()[allocation.index];
        write_all_at(&mut self.stream, self.layout.cluster(block.start_cluster()), data)?;
        Ok(())
    }

    /// Fill the freshly allocated block and link it to `name`, releasing the
    /// block `existing` replaces.  The caller rolls the tables back unless
    /// this returns `Ok(true)`.
    fn stage_write(
        &mut self,
        name: &str,
        existing: Option<usize>,
        allocation: Allocation,
        data: &[u8],
    ) -> Result<bool> {
        self.fill_block(allocation, data)?;
        let index = allocation.index;
        match existing {
            Some(old) => {
                let slot = self.blocks.blocks()[old].string_index as usize;
                self.blocks.link(index, slot);
                self.blocks.free(old);
            }
            None => {
                let Some(slot) = self.strings.alloc() else {
                    return Ok(false);
                };
                self.write_name(slot, name)?;
                self.blocks.link(index, slot);
            }
        }
        self.persist_blocks()?;
        Ok(true)
    }

    fn write_name(&mut self, slot: usize, name: &str) -> Result<()> {
        let record = StringData::encode(name, &self.header.key)
            .ok_or(ContainerError::NameTooLong(name.len()))?;
        let mut buf = Vec::with_capacity(STRING_RECORD_SIZE);
        record.write(&mut buf)?;
        write_all_at(&mut self.stream, self.layout.string_record(slot), &buf)?;
        Ok(())
    }

    fn read_name(&mut self, slot: usize) -> Result<Option<String>> {
        let mut buf = [0u8; STRING_RECORD_SIZE];
        read_exact_at(&mut self.stream, self.layout.string_record(slot), &mut buf)?;
        Ok(StringData::read(&buf[..])?.decode(&self.header.key))
    }

    /// Write every dirty block record, then the header if the table grew.
    /// Records that fail to reach the stream stay dirty.
    fn persist_blocks(&mut self) -> Result<()> {
        let dirty = self.blocks.take_dirty();
        let mut buf = Vec::with_capacity(BLOCK_RECORD_SIZE);
        for (pos, &(index, block)) in dirty.iter().enumerate() {
            buf.clear();
            block.write(&mut buf)?;
            if let Err(e) = write_all_at(&mut self.stream, self.layout.block_record(index), &buf) {
                for &(pending, _) in &dirty[pos..] {
                    self.blocks.mark_dirty(pending);
                }
                return Err(e.into());
            }
        }
        let block_count = self.blocks.block_count() as i32;
        if block_count != self.header.block_count {
            let mut header = self.header.clone();
            header.block_count = block_count;
            let mut buf = Vec::with_capacity(HEADER_SIZE);
            header.write(&mut buf)?;
            write_all_at(&mut self.stream, 0, &buf)?;
            self.header = header;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ContainerError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ContainerError::NameTooLong(name.len()));
    }
    Ok(())
}
