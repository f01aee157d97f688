//! # Storage Layer
//!
//! This module implements the on-disk side of the heap file: the file
//! header, the fixed-size page format, the free-page allocator, and the
//! record directory.
//!
//! ## File layout
//!
//! ```text
//! +---------------------------------------------+
//! | version string (u16 length + UTF-8 bytes)   |
//! | page_data_size: i32                         |
//! | allocation section (32 bytes, see header.rs)|
//! +---------------------------------------------+
//! | page: directory record start                |
//! +---------------------------------------------+
//! | page                                        |
//! | page                                        |
//! | ...                                         |
//! +---------------------------------------------+
//! ```
//!
//! Every page is `page_data_size + 16` bytes: a continuation address, a
//! magic word, and the payload. A record is a chain of pages linked through
//! the continuation addresses and terminated by 0. All integers on disk are
//! big-endian and signed.
//!
//! ## Access model
//!
//! [`PageStore`] wraps the backing file and performs positioned reads and
//! writes. The file grows incrementally, one page flush at a time, so pages
//! near the end may be partially materialized on disk; payload reads
//! tolerate short reads and zero-fill the tail. There is no mmap region and
//! no page cache: each page load is a seek plus two reads, which matches the
//! access pattern of streaming whole records.
//!
//! ## Module organization
//!
//! - `page`: page header layout and the buffered page handle
//! - `header`: file header encode/decode and version acceptance
//! - `freelist`: free-page chain and allocation
//! - `directory`: the record directory and its wire format

mod directory;
mod freelist;
mod header;
mod page;

pub(crate) use directory::{Directory, RecordEntry, DIRECTORY_RECORD_ID};
pub(crate) use freelist::Freelist;
pub(crate) use header::{read as read_header, write_new as write_new_header, AllocHeader};
pub(crate) use page::PageBuf;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use eyre::{Result, WrapErr};

/// Payload bytes per page when creating a file without an explicit size.
pub const DEFAULT_PAGE_DATA_SIZE: i32 = 2048;

/// Bytes of continuation address plus magic word at the start of each page.
pub(crate) const PAGE_HEADER_SIZE: usize = 16;

/// Magic word at the start of every page, stored in the low 32 bits of a
/// big-endian i64.
pub(crate) const PAGE_MAGIC: i64 = 0xABFAFCFD;

/// Positioned I/O over the backing file.
#[derive(Debug)]
pub(crate) struct PageStore {
    file: File,
    page_data_size: usize,
}

impl PageStore {
    pub(crate) fn new(file: File, page_data_size: usize) -> Self {
        Self {
            file,
            page_data_size,
        }
    }

    pub(crate) fn page_data_size(&self) -> usize {
        self.page_data_size
    }

    /// Full on-disk size of one page, header included.
    pub(crate) fn page_size(&self) -> i64 {
        (self.page_data_size + PAGE_HEADER_SIZE) as i64
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// Reads exactly `buf.len()` bytes; a short read is an error.
    pub(crate) fn read_exact_at(&mut self, offset: i64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file
            .read_exact(buf)
            .wrap_err_with(|| format!("failed to read {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    /// Fills as much of `buf` as the file holds past `offset`, stopping at
    /// end of file. Returns the number of bytes read.
    pub(crate) fn read_at(&mut self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub(crate) fn write_at(&mut self, offset: i64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file
            .write_all(buf)
            .wrap_err_with(|| format!("failed to write {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    pub(crate) fn read_i64_at(&mut self, offset: i64) -> Result<i64> {
        let mut bytes = [0u8; 8];
        self.read_exact_at(offset, &mut bytes)?;
        Ok(i64::from_be_bytes(bytes))
    }

    pub(crate) fn write_i64_at(&mut self, offset: i64, value: i64) -> Result<()> {
        self.write_at(offset, &value.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn test_store() -> PageStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("store.heap");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        PageStore::new(file, 64)
    }

    #[test]
    fn page_size_includes_the_header() {
        let store = test_store();

        assert_eq!(store.page_size(), 80);
    }

    #[test]
    fn i64_round_trips_big_endian() {
        let mut store = test_store();

        store.write_i64_at(0, -2).unwrap();
        store.write_i64_at(8, 0xABFAFCFD).unwrap();

        assert_eq!(store.read_i64_at(0).unwrap(), -2);
        assert_eq!(store.read_i64_at(8).unwrap(), 0xABFAFCFD);

        let mut raw = [0u8; 8];
        store.read_exact_at(8, &mut raw).unwrap();
        assert_eq!(raw, [0, 0, 0, 0, 0xAB, 0xFA, 0xFC, 0xFD]);
    }

    #[test]
    fn read_at_stops_at_end_of_file() {
        let mut store = test_store();
        store.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        let n = store.read_at(0, &mut buf).unwrap();

        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn writing_past_the_end_extends_the_file() {
        let mut store = test_store();

        store.write_at(100, b"xy").unwrap();

        assert_eq!(store.file().metadata().unwrap().len(), 102);
        assert_eq!(store.read_i64_at(94).unwrap(), i64::from_be_bytes(*b"\0\0\0\0\0\0xy"));
    }
}
