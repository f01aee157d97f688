//! Record reader: a byte stream over one record's page chain.
//!
//! The reader walks the chain from the record's start page, yielding payload
//! bytes up to the directory-recorded byte count. Pages cannot tell record
//! data from padding (a flush only persists the written prefix), so the byte
//! count is the sole authority on where the record ends:
//!
//! - Byte-level reads stop once the remaining count reaches zero.
//! - Bulk reads gather raw page bytes across continuation transitions and
//!   clip the returned length to the record's byte count.
//! - The directory record itself is read without a count; its decoder knows
//!   how much of the chain is meaningful.
//!
//! `available` is a lower bound on the bytes left: it reflects the remaining
//! count but not pending continuation pages.

use std::io;

use eyre::Result;

use crate::storage::{PageBuf, PageStore, RecordEntry, DIRECTORY_RECORD_ID};

use super::{to_io_error, HeapFile};

/// Per-stream state, owned by the heap file core so that closing the file
/// can retire live readers.
#[derive(Debug)]
pub(crate) struct ReaderState {
    pub(crate) id: u64,
    record_id: i64,
    page: PageBuf,
    available: i64,
    byte_count: usize,
}

impl ReaderState {
    pub(crate) fn record(
        store: &mut PageStore,
        id: u64,
        record_id: i64,
        entry: RecordEntry,
    ) -> Result<Self> {
        Ok(Self {
            id,
            record_id,
            page: PageBuf::load(store, entry.start_page)?,
            available: i64::from(entry.byte_count),
            byte_count: entry.byte_count.max(0) as usize,
        })
    }

    /// Reader over the directory's own record. No byte count applies; the
    /// chain is followed until it runs out.
    pub(crate) fn directory(store: &mut PageStore, directory_start: i64) -> Result<Self> {
        Ok(Self {
            id: 0,
            record_id: DIRECTORY_RECORD_ID,
            page: PageBuf::load(store, directory_start)?,
            available: 0,
            byte_count: 0,
        })
    }

    pub(crate) fn available(&self) -> u64 {
        self.available.max(0) as u64
    }

    pub(crate) fn read_byte(&mut self, store: &mut PageStore) -> Result<Option<u8>> {
        if self.page.has_more() {
            if self.record_id != DIRECTORY_RECORD_ID && self.available <= 0 {
                return Ok(None);
            }
            self.available -= 1;
            return Ok(Some(self.page.read_byte()));
        }
        if self.page.has_continuation() {
            self.page = PageBuf::load(store, self.page.continuation())?;
            self.available -= 1;
            return Ok(Some(self.page.read_byte()));
        }
        Ok(None)
    }

    /// Reads into `buf`, following continuations. Returns the number of
    /// bytes produced; 0 means end of stream.
    pub(crate) fn read_bytes(&mut self, store: &mut PageStore, buf: &mut [u8]) -> Result<usize> {
        let mut offset = 0;
        let mut accumulated = 0;
        loop {
            if !self.page.has_more() {
                if self.page.has_continuation() {
                    self.page = PageBuf::load(store, self.page.continuation())?;
                } else {
                    // The chain ended before the clip bound was reached.
                    return Ok(accumulated);
                }
            }
            let n = self.page.read_into(&mut buf[offset..]);
            offset += n;
            accumulated += n;
            if accumulated >= buf.len().min(self.byte_count) {
                break;
            }
        }
        self.available -= accumulated as i64;
        if self.record_id == DIRECTORY_RECORD_ID {
            return Ok(accumulated);
        }
        Ok(accumulated.min(self.byte_count))
    }
}

/// Byte stream over one record, obtained from [`HeapFile::record_reader`].
///
/// Any number of readers may be live at once, but none while a writer is.
/// Dropping the reader closes it; use [`RecordReader::close`] to observe
/// errors. The reader also implements [`std::io::Read`], reporting end of
/// stream as `Ok(0)`.
#[derive(Debug)]
pub struct RecordReader<'heap> {
    pub(crate) heap: &'heap HeapFile,
    pub(crate) id: u64,
    pub(crate) closed: bool,
}

impl RecordReader<'_> {
    /// Reads one byte; `None` signals end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        self.heap.with_core(|core| core.reader_read_byte(self.id))
    }

    /// Reads into `buf`; a return of 0 signals end of stream.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.heap.with_core(|core| core.reader_read_bytes(self.id, buf))
    }

    /// Lower bound on the bytes remaining in this record.
    pub fn available(&self) -> u64 {
        self.heap.with_core(|core| core.reader_available(self.id))
    }

    /// Closes the reader. Closing is idempotent.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.heap.with_core(|core| core.reader_close(self.id))
    }
}

impl Drop for RecordReader<'_> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl io::Read for RecordReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_bytes(buf).map_err(to_io_error)
    }
}
