//! # Page Layout and the In-Memory Page Handle
//!
//! Every page in a heap file starts with a 16-byte header followed by a
//! payload area of `page_data_size` bytes:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  ----------------------------------------
//! 0       8     continuation  Address of the next page in the chain
//!                             (0 = terminal page)
//! 8       8     magic         Fixed word 0xABFAFCFD; mismatch on load
//!                             means the address does not hold a page
//! 16      N     payload       page_data_size bytes of record data
//! ```
//!
//! All header fields are big-endian signed integers.
//!
//! [`PageBuf`] mediates between in-memory byte operations and one on-disk
//! page. It buffers the payload, tracks a cursor, and knows whether it has
//! been flushed. Construction has two modes: `fresh` for a page that does not
//! exist on disk yet (zeroed buffer, nothing written until the first flush)
//! and `load` for an existing page (header validated, payload read).
//!
//! `flush` writes the header plus only the cursor prefix of the payload, so a
//! reloaded page may expose stale bytes past the written prefix. The page
//! cannot tell record data from that padding; the record directory's byte
//! count is the single authority on valid bytes per record, and readers clip
//! accordingly.
//!
//! Payload loads tolerate short reads: a just-created page has only its
//! header on disk and the missing tail is zero-filled.

use eyre::{ensure, Result};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::HeapError;

use super::{PageStore, PAGE_HEADER_SIZE, PAGE_MAGIC};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct PageHeader {
    continuation: I64,
    magic: I64,
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub(crate) fn new(continuation: i64) -> Self {
        Self {
            continuation: I64::new(continuation),
            magic: I64::new(PAGE_MAGIC),
        }
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );

        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub(crate) fn continuation(&self) -> i64 {
        self.continuation.get()
    }

    pub(crate) fn magic(&self) -> i64 {
        self.magic.get()
    }
}

/// One page's worth of buffered payload plus its chain link.
#[derive(Debug)]
pub(crate) struct PageBuf {
    address: i64,
    data: Vec<u8>,
    cursor: usize,
    continuation: i64,
    flushed: bool,
}

impl PageBuf {
    /// A page that does not exist on disk yet. Nothing is written until the
    /// first `flush`.
    pub(crate) fn fresh(address: i64, page_data_size: usize) -> Self {
        Self {
            address,
            data: vec![0u8; page_data_size],
            cursor: 0,
            continuation: 0,
            flushed: false,
        }
    }

    /// Loads an existing page, validating its magic word.
    pub(crate) fn load(store: &mut PageStore, address: i64) -> Result<Self> {
        let mut header_bytes = [0u8; PAGE_HEADER_SIZE];
        store.read_exact_at(address, &mut header_bytes)?;
        let header = PageHeader::from_bytes(&header_bytes)?;
        if header.magic() != PAGE_MAGIC {
            return Err(HeapError::CorruptedPage { address }.into());
        }

        // The payload on disk may be shorter than the page data size when the
        // last flush wrote a short prefix at the end of the file.
        let mut data = vec![0u8; store.page_data_size()];
        store.read_at(address + PAGE_HEADER_SIZE as i64, &mut data)?;

        Ok(Self {
            address,
            data,
            cursor: 0,
            continuation: header.continuation(),
            flushed: false,
        })
    }

    pub(crate) fn address(&self) -> i64 {
        self.address
    }

    pub(crate) fn has_more(&self) -> bool {
        self.cursor < self.data.len()
    }

    pub(crate) fn has_continuation(&self) -> bool {
        self.continuation != 0
    }

    pub(crate) fn continuation(&self) -> i64 {
        self.continuation
    }

    pub(crate) fn set_continuation(&mut self, address: i64) {
        self.continuation = address;
    }

    pub(crate) fn clear_continuation(&mut self) {
        self.continuation = 0;
    }

    pub(crate) fn read_byte(&mut self) -> u8 {
        let byte = self.data[self.cursor];
        self.cursor += 1;
        byte
    }

    /// Copies buffered bytes from the cursor into `buf`, bounded by whichever
    /// of the two runs out first. Returns the number of bytes copied.
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let n = (self.data.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.cursor..self.cursor + n]);
        self.cursor += n;
        n
    }

    pub(crate) fn write_byte(&mut self, byte: u8) {
        self.data[self.cursor] = byte;
        self.cursor += 1;
    }

    /// Copies bytes from `buf` into the page at the cursor, bounded by the
    /// remaining payload capacity. Returns the number of bytes written.
    pub(crate) fn write_from(&mut self, buf: &[u8]) -> usize {
        let n = (self.data.len() - self.cursor).min(buf.len());
        self.data[self.cursor..self.cursor + n].copy_from_slice(&buf[..n]);
        self.cursor += n;
        n
    }

    /// Writes the header and the cursor prefix of the payload. Idempotent per
    /// page handle lifetime.
    pub(crate) fn flush(&mut self, store: &mut PageStore) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        let header = PageHeader::new(self.continuation);
        store.write_at(self.address, header.as_bytes())?;
        store.write_at(self.address + PAGE_HEADER_SIZE as i64, &self.data[..self.cursor])?;
        self.flushed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageStore;
    use std::fs::OpenOptions;

    fn test_store(page_data_size: usize) -> PageStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("pages.heap");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        PageStore::new(file, page_data_size)
    }

    #[test]
    fn page_header_size_is_16_bytes() {
        assert_eq!(size_of::<PageHeader>(), 16);
    }

    #[test]
    fn page_header_encodes_big_endian() {
        let header = PageHeader::new(0x0102030405060708);
        let bytes = header.as_bytes();

        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 0, 0xAB, 0xFA, 0xFC, 0xFD]);
    }

    #[test]
    fn fresh_page_is_empty_and_terminal() {
        let page = PageBuf::fresh(64, 32);

        assert_eq!(page.address(), 64);
        assert!(page.has_more());
        assert!(!page.has_continuation());
    }

    #[test]
    fn cursor_tracks_writes_until_full() {
        let mut page = PageBuf::fresh(0, 4);

        assert_eq!(page.write_from(b"abcdef"), 4);
        assert!(!page.has_more());
        assert_eq!(page.write_from(b"gh"), 0);
    }

    #[test]
    fn flush_then_load_round_trips_written_prefix() {
        let mut store = test_store(16);
        let mut page = PageBuf::fresh(0, 16);
        page.write_from(b"hello");
        page.set_continuation(4242);
        page.flush(&mut store).unwrap();

        let mut loaded = PageBuf::load(&mut store, 0).unwrap();

        assert_eq!(loaded.continuation(), 4242);
        let mut buf = [0u8; 5];
        assert_eq!(loaded.read_into(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn load_zero_fills_payload_past_end_of_file() {
        let mut store = test_store(16);
        let mut page = PageBuf::fresh(0, 16);
        page.write_from(b"abc");
        page.flush(&mut store).unwrap();

        let mut loaded = PageBuf::load(&mut store, 0).unwrap();

        let mut buf = [0xFFu8; 16];
        assert_eq!(loaded.read_into(&mut buf), 16);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 13]);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let mut store = test_store(16);
        let mut page = PageBuf::fresh(0, 16);
        page.flush(&mut store).unwrap();
        store.write_i64_at(8, 0x1234).unwrap();

        let err = PageBuf::load(&mut store, 0).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HeapError>(),
            Some(HeapError::CorruptedPage { address: 0 })
        ));
    }

    #[test]
    fn flush_is_idempotent() {
        let mut store = test_store(16);
        let mut page = PageBuf::fresh(0, 16);
        page.write_from(b"once");
        page.flush(&mut store).unwrap();

        page.write_from(b"more");
        page.flush(&mut store).unwrap();

        let mut loaded = PageBuf::load(&mut store, 0).unwrap();
        let mut buf = [0u8; 8];
        loaded.read_into(&mut buf);
        assert_eq!(&buf, b"once\0\0\0\0");
    }

    #[test]
    fn writes_after_flush_stay_in_memory() {
        let mut store = test_store(8);
        let mut page = PageBuf::fresh(0, 8);
        page.write_from(&[10, 20, 30]);
        page.flush(&mut store).unwrap();
        page.write_from(&[40, 50]);

        let mut loaded = PageBuf::load(&mut store, 0).unwrap();

        assert_eq!(loaded.read_byte(), 10);
        assert_eq!(loaded.read_byte(), 20);
        assert_eq!(loaded.read_byte(), 30);
        assert_eq!(loaded.read_byte(), 0);
    }
}
