//! Random-access stream abstraction the container runs on.
//!
//! A container needs positioned reads and writes plus the ability to query
//! and change the stream length.  [`Stream`] adds the length operations to
//! `Read + Write + Seek`; it is implemented for files and for in-memory
//! cursors so a container can live on disk or entirely in RAM.
//!
//! All helpers here seek explicitly before every transfer.  No operation
//! relies on the position left behind by a previous one.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Chunk size used when copying between a container and an external
/// reader or writer.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

pub trait Stream: Read + Write + Seek {
    /// Current length of the stream in bytes.
    fn len(&mut self) -> io::Result<u64>;

    /// Truncate or extend the stream to exactly `len` bytes.  Extended
    /// regions read back as zeros.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl Stream for File {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl Stream for Cursor<Vec<u8>> {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds address space"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

impl<S: Stream + ?Sized> Stream for &mut S {
    fn len(&mut self) -> io::Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }
}

// ── Positioned I/O ───────────────────────────────────────────────────────────

/// Fill `buf` from absolute `offset`.
pub fn read_exact_at<S: Stream + ?Sized>(stream: &mut S, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(buf)
}

/// Write all of `data` at absolute `offset`.
pub fn write_all_at<S: Stream + ?Sized>(stream: &mut S, offset: u64, data: &[u8]) -> io::Result<()> {
    stream.seek(SeekFrom::Start(offset))?;
    stream.write_all(data)
}

/// Copy `len` bytes starting at `offset` into `sink`, chunk by chunk.
pub fn copy_range_to<S: Stream + ?Sized, W: Write + ?Sized>(
    stream: &mut S,
    offset: u64,
    len:    u64,
    sink:   &mut W,
) -> io::Result<u64> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; COPY_CHUNK_SIZE.min(len as usize)];
    let mut remaining = len;
    while remaining > 0 {
        let n = (remaining as usize).min(buf.len());
        stream.read_exact(&mut buf[..n])?;
        sink.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_set_len_zero_fills() {
        let mut cur = Cursor::new(vec![1u8, 2, 3]);
        cur.set_len(6).unwrap();
        assert_eq!(cur.get_ref(), &vec![1, 2, 3, 0, 0, 0]);
        cur.set_len(2).unwrap();
        assert_eq!(Stream::len(&mut cur).unwrap(), 2);
    }

    #[test]
    fn positioned_io_ignores_current_position() {
        let mut cur = Cursor::new(vec![0u8; 16]);
        write_all_at(&mut cur, 4, b"abcd").unwrap();
        cur.seek(SeekFrom::Start(15)).unwrap();
        let mut buf = [0u8; 4];
        read_exact_at(&mut cur, 4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn copy_range_spans_chunks() {
        let data: Vec<u8> = (0..COPY_CHUNK_SIZE * 2 + 17).map(|i| i as u8).collect();
        let mut cur = Cursor::new(data.clone());
        let mut out = Vec::new();
        let n = copy_range_to(&mut cur, 3, data.len() as u64 - 3, &mut out).unwrap();
        assert_eq!(n, data.len() as u64 - 3);
        assert_eq!(out, &data[3..]);
    }

    #[test]
    fn file_stream_length() {
        let mut file = tempfile::tempfile().unwrap();
        assert_eq!(Stream::len(&mut file).unwrap(), 0);
        Stream::set_len(&mut file, 8192).unwrap();
        assert_eq!(Stream::len(&mut file).unwrap(), 8192);
    }
}
