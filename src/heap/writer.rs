//! Record writer: a byte sink that lays a record out across a page chain.
//!
//! On construction the writer positions itself on the record's existing
//! start page, or allocates a fresh one for a new record. Writes fill the
//! current page; when it is full the writer follows the existing
//! continuation (overwrites reuse the old chain page by page) or allocates
//! and links a new page, flushing the departed page either way.
//!
//! The last page stays buffered until close, which is what commits a
//! record: close releases the surplus continuation chain (how overwrites
//! shrink records), flushes the final page, and records the accumulated
//! byte count in the directory. `flush` on the writer is deliberately a
//! no-op.

use std::io;

use eyre::Result;

use crate::storage::{Directory, PageBuf, PageStore, DIRECTORY_RECORD_ID};

use super::{to_io_error, HeapFile};

/// Per-stream state, owned by the heap file core so that closing the file
/// can commit live writers.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub(crate) id: u64,
    pub(crate) record_id: i64,
    page: PageBuf,
    start_page: i64,
    byte_count: u64,
}

impl WriterState {
    pub(crate) fn begin(
        store: &mut PageStore,
        directory: &mut Directory,
        id: u64,
        record_id: i64,
        directory_start: i64,
    ) -> Result<Self> {
        let page = if record_id == DIRECTORY_RECORD_ID {
            PageBuf::load(store, directory_start)?
        } else if let Some(entry) = directory.get(record_id) {
            PageBuf::load(store, entry.start_page)?
        } else {
            let address = directory.allocate_page(store)?;
            PageBuf::fresh(address, store.page_data_size())
        };
        Ok(Self {
            id,
            record_id,
            start_page: page.address(),
            page,
            byte_count: 0,
        })
    }

    pub(crate) fn start_page(&self) -> i64 {
        self.start_page
    }

    pub(crate) fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Moves to the next page of the chain, reusing an existing continuation
    /// or allocating a new page. The departed page is flushed after the link
    /// is in place so its header carries the continuation.
    fn advance_page(&mut self, store: &mut PageStore, directory: &mut Directory) -> Result<()> {
        let next = if self.page.has_continuation() {
            PageBuf::load(store, self.page.continuation())?
        } else {
            let address = directory.allocate_page(store)?;
            self.page.set_continuation(address);
            PageBuf::fresh(address, store.page_data_size())
        };
        self.page.flush(store)?;
        self.page = next;
        Ok(())
    }

    pub(crate) fn write_byte(
        &mut self,
        store: &mut PageStore,
        directory: &mut Directory,
        byte: u8,
    ) -> Result<()> {
        if !self.page.has_more() {
            self.advance_page(store, directory)?;
        }
        self.page.write_byte(byte);
        self.byte_count += 1;
        Ok(())
    }

    pub(crate) fn write_bytes(
        &mut self,
        store: &mut PageStore,
        directory: &mut Directory,
        buf: &[u8],
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            if !self.page.has_more() {
                self.advance_page(store, directory)?;
            }
            offset += self.page.write_from(&buf[offset..]);
            if offset >= buf.len() {
                break;
            }
        }
        self.byte_count += buf.len() as u64;
        Ok(())
    }

    /// Releases the surplus continuation chain and flushes the last page.
    /// The caller updates the directory afterwards.
    pub(crate) fn seal(&mut self, store: &mut PageStore, directory: &mut Directory) -> Result<()> {
        if self.page.has_continuation() {
            let surplus = self.page.continuation();
            directory.release_chain(store, surplus)?;
            self.page.clear_continuation();
        }
        self.page.flush(store)
    }
}

/// Byte sink for one record, obtained from [`HeapFile::record_writer`].
///
/// At most one writer is live per heap file, and never alongside readers.
/// Between writes and close the on-disk state may lag: a page is persisted
/// when it fills or when the writer closes. Dropping the writer commits it
/// best-effort; use [`RecordWriter::close`] to observe errors. The writer
/// also implements [`std::io::Write`].
#[derive(Debug)]
pub struct RecordWriter<'heap> {
    pub(crate) heap: &'heap HeapFile,
    pub(crate) id: u64,
    pub(crate) closed: bool,
    pub(crate) start_page: i64,
    pub(crate) written: u64,
}

impl RecordWriter<'_> {
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.heap
            .with_core(|core| core.writer_write_byte(self.id, byte))?;
        self.written += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.heap
            .with_core(|core| core.writer_write_bytes(self.id, buf))?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Bytes accumulated by this writer so far.
    pub fn byte_count(&self) -> u64 {
        self.written
    }

    /// Address of the record's first page, fixed at writer construction.
    pub fn start_page_address(&self) -> i64 {
        self.start_page
    }

    /// No-op: the last page is committed by [`RecordWriter::close`].
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Commits the record: trims the surplus chain, flushes the last page,
    /// and updates the directory. Closing is idempotent.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.heap.with_core(|core| core.writer_close(self.id))
    }
}

impl Drop for RecordWriter<'_> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl io::Write for RecordWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
