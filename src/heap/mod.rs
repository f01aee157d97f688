//! # Heap File Handle
//!
//! [`HeapFile`] owns the backing file, the record directory, the allocator
//! state, and the set of live record streams. It hands out the byte streams
//! that read and write records and enforces their exclusivity rules.
//!
//! ## Record identifiers
//!
//! Callers address records with any `i64` in `[i64::MIN, i64::MAX - 1]`.
//! Internally, non-negative identifiers shift up by one so they can never
//! collide with the reserved identifier 0 under which the directory stores
//! itself; negative identifiers pass through unchanged. The mapping is part
//! of the file format and applies identically to read, write, and remove.
//!
//! ## Exclusivity
//!
//! At most one writer is live at a time; while a writer is live no reader
//! may be obtained, and while any reader is live no writer may be obtained.
//! Any number of concurrent readers is fine. The rules are enforced by
//! counting live streams at entry to each operation; streams un-count
//! themselves on close (or drop).
//!
//! ## Threading
//!
//! All operations serialize on one internal mutex, so a `HeapFile` may be
//! shared across threads; calls block one at a time. Individual streams are
//! meant to be driven from one thread at a time.
//!
//! ## Durability
//!
//! Writer close commits a record's pages and its directory entry in memory;
//! [`HeapFile::flush`] (and close) persist the directory record and the
//! header's allocation section when they have changed. There is no journal:
//! crash safety is best effort.

mod reader;
mod writer;

pub use reader::RecordReader;
pub use writer::RecordWriter;

pub(crate) use reader::ReaderState;
pub(crate) use writer::WriterState;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use fs2::FileExt;
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::error::HeapError;
use crate::storage::{
    read_header, write_new_header, AllocHeader, Directory, Freelist, PageBuf, PageStore,
    DEFAULT_PAGE_DATA_SIZE, DIRECTORY_RECORD_ID,
};

/// Converts a report into an `io::Error` for the std `Read`/`Write` seams.
pub(crate) fn to_io_error(report: eyre::Report) -> io::Error {
    io::Error::other(Box::<dyn std::error::Error + Send + Sync>::from(report))
}

/// Non-negative caller keys shift up by one so they cannot collide with the
/// reserved directory identifier; negative keys pass through unchanged.
fn remap_record_id(caller_id: i64) -> i64 {
    if caller_id >= 0 {
        caller_id.wrapping_add(1)
    } else {
        caller_id
    }
}

/// Open-time configuration for a heap file.
///
/// `page_data_size` is honored only when the file is created; opening an
/// existing file always uses the size stored in its header.
#[derive(Debug, Clone)]
pub struct HeapFileOptions {
    page_data_size: i32,
    lock: bool,
    read_only: bool,
    safe_mode: bool,
}

impl Default for HeapFileOptions {
    fn default() -> Self {
        Self {
            page_data_size: DEFAULT_PAGE_DATA_SIZE,
            lock: false,
            read_only: false,
            safe_mode: false,
        }
    }
}

impl HeapFileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes per page for a newly created file.
    pub fn page_data_size(mut self, bytes: i32) -> Self {
        self.page_data_size = bytes;
        self
    }

    /// Take an exclusive advisory lock on the file. Opening fails with
    /// [`HeapError::AlreadyLocked`] if another handle holds the lock.
    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Open for reading only. The file must already exist; writers and
    /// removals are rejected.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Persist the directory record on every writer close instead of only
    /// on flush. Slower, but narrows the window in which a crash loses
    /// directory updates.
    pub fn safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// Creates or opens the heap file at `path`.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<HeapFile> {
        let path = path.as_ref().to_path_buf();

        let mut file = if self.read_only {
            OpenOptions::new().read(true).open(&path)
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
        }
        .wrap_err_with(|| format!("failed to open heap file '{}'", path.display()))?;

        if self.lock {
            if let Err(e) = file.try_lock_exclusive() {
                if e.kind() == io::ErrorKind::WouldBlock {
                    return Err(HeapError::AlreadyLocked { path }.into());
                }
                return Err(eyre::Report::new(e)
                    .wrap_err(format!("failed to lock heap file '{}'", path.display())));
            }
        }

        let file_len = file.metadata()?.len();
        let core = if file_len == 0 {
            if self.read_only {
                return Err(HeapError::IllegalState(
                    "cannot create a heap file with a read-only handle".into(),
                )
                .into());
            }
            ensure!(
                self.page_data_size > 0,
                "page data size must be positive, got {}",
                self.page_data_size
            );

            let info = write_new_header(&mut file, self.page_data_size)?;
            let mut io = PageStore::new(file, info.page_data_size as usize);
            let mut directory = Directory::new(Freelist::new(info.directory_start));

            // Reserve and materialize the directory record's first page; its
            // address is fixed for the lifetime of the file.
            let first_page = directory.allocate_page(&mut io)?;
            let mut page = PageBuf::fresh(first_page, io.page_data_size());
            page.flush(&mut io)?;

            let mut core = HeapCore {
                io,
                directory,
                streams: Streams::default(),
                alloc_section: info.alloc_section,
                directory_start: info.directory_start,
                read_only: false,
                safe_mode: self.safe_mode,
                locked: self.lock,
                closed: false,
                path: path.clone(),
            };
            core.flush_directory()?;
            log::debug!(
                "created heap file '{}' with page data size {}",
                path.display(),
                core.io.page_data_size()
            );
            core
        } else {
            let info = read_header(&mut file)?;
            let mut io = PageStore::new(file, info.page_data_size as usize);
            let mut directory = Directory::new(Freelist::with_state(
                info.next_free_page,
                info.first_deallocated,
                info.last_deallocated,
            ));
            directory.set_index_byte_count(info.index_byte_count);

            // Reconstruct the directory by streaming its own record.
            let mut reader = ReaderState::directory(&mut io, info.directory_start)?;
            let mut bytes = Vec::new();
            let mut chunk = vec![0u8; io.page_data_size()];
            loop {
                let n = reader.read_bytes(&mut io, &mut chunk)?;
                if n == 0 {
                    break;
                }
                bytes.extend_from_slice(&chunk[..n]);
            }
            directory.load_entries(Directory::decode_entries(&bytes)?);

            log::debug!(
                "opened heap file '{}': {} records, page data size {}",
                path.display(),
                directory.len(),
                io.page_data_size()
            );
            HeapCore {
                io,
                directory,
                streams: Streams::default(),
                alloc_section: info.alloc_section,
                directory_start: info.directory_start,
                read_only: self.read_only,
                safe_mode: self.safe_mode,
                locked: self.lock,
                closed: false,
                path,
            }
        };

        Ok(HeapFile {
            core: Mutex::new(core),
        })
    }
}

/// Live streams, keyed by handle-unique identifiers. The states live here
/// rather than in the stream handles so that [`HeapFile::close`] can retire
/// them; a handle whose state is gone treats itself as closed.
#[derive(Debug, Default)]
struct Streams {
    writers: Vec<WriterState>,
    readers: Vec<ReaderState>,
    last_id: u64,
}

impl Streams {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn writer_mut(&mut self, id: u64) -> Option<&mut WriterState> {
        self.writers.iter_mut().find(|w| w.id == id)
    }

    fn take_writer(&mut self, id: u64) -> Option<WriterState> {
        let index = self.writers.iter().position(|w| w.id == id)?;
        Some(self.writers.remove(index))
    }

    fn reader_mut(&mut self, id: u64) -> Option<&mut ReaderState> {
        self.readers.iter_mut().find(|r| r.id == id)
    }

    fn take_reader(&mut self, id: u64) -> Option<ReaderState> {
        let index = self.readers.iter().position(|r| r.id == id)?;
        Some(self.readers.remove(index))
    }
}

#[derive(Debug)]
pub(crate) struct HeapCore {
    io: PageStore,
    directory: Directory,
    streams: Streams,
    alloc_section: i64,
    directory_start: i64,
    read_only: bool,
    safe_mode: bool,
    locked: bool,
    closed: bool,
    path: PathBuf,
}

impl HeapCore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(HeapError::IllegalState("the heap file is closed".into()).into());
        }
        Ok(())
    }

    fn ensure_exclusive(&self) -> Result<()> {
        let readers = self.streams.readers.len();
        let writers = self.streams.writers.len();
        if readers > 0 || writers > 0 {
            return Err(HeapError::IllegalState(format!(
                "there are open readers ({readers}) or writers ({writers})"
            ))
            .into());
        }
        Ok(())
    }

    fn ensure_no_writers(&self) -> Result<()> {
        let writers = self.streams.writers.len();
        if writers > 0 {
            return Err(
                HeapError::IllegalState(format!("there are open writers ({writers})")).into(),
            );
        }
        Ok(())
    }

    fn begin_writer(&mut self, caller_id: i64) -> Result<(u64, i64)> {
        self.ensure_open()?;
        if self.read_only {
            return Err(HeapError::IllegalState(
                "cannot obtain a record writer on a read-only heap file".into(),
            )
            .into());
        }
        self.ensure_exclusive()?;

        let record_id = remap_record_id(caller_id);
        let id = self.streams.next_id();
        let state = WriterState::begin(
            &mut self.io,
            &mut self.directory,
            id,
            record_id,
            self.directory_start,
        )?;
        let start_page = state.start_page();
        self.streams.writers.push(state);
        Ok((id, start_page))
    }

    fn begin_reader(&mut self, caller_id: i64) -> Result<Option<u64>> {
        self.ensure_open()?;
        self.ensure_no_writers()?;

        let record_id = remap_record_id(caller_id);
        let Some(entry) = self.directory.get(record_id) else {
            return Ok(None);
        };
        let id = self.streams.next_id();
        let state = ReaderState::record(&mut self.io, id, record_id, entry)?;
        self.streams.readers.push(state);
        Ok(Some(id))
    }

    pub(crate) fn writer_write_byte(&mut self, id: u64, byte: u8) -> Result<()> {
        let Some(state) = self.streams.writer_mut(id) else {
            return Err(
                HeapError::IllegalState("tried to write to a closed record writer".into()).into(),
            );
        };
        state.write_byte(&mut self.io, &mut self.directory, byte)
    }

    pub(crate) fn writer_write_bytes(&mut self, id: u64, buf: &[u8]) -> Result<()> {
        let Some(state) = self.streams.writer_mut(id) else {
            return Err(
                HeapError::IllegalState("tried to write to a closed record writer".into()).into(),
            );
        };
        state.write_bytes(&mut self.io, &mut self.directory, buf)
    }

    pub(crate) fn writer_close(&mut self, id: u64) -> Result<()> {
        match self.streams.take_writer(id) {
            Some(state) => self.close_writer_state(state),
            None => Ok(()),
        }
    }

    pub(crate) fn reader_read_byte(&mut self, id: u64) -> Result<Option<u8>> {
        let Some(state) = self.streams.reader_mut(id) else {
            return Err(
                HeapError::IllegalState("tried to read from a closed record reader".into()).into(),
            );
        };
        state.read_byte(&mut self.io)
    }

    pub(crate) fn reader_read_bytes(&mut self, id: u64, buf: &mut [u8]) -> Result<usize> {
        let Some(state) = self.streams.reader_mut(id) else {
            return Err(
                HeapError::IllegalState("tried to read from a closed record reader".into()).into(),
            );
        };
        state.read_bytes(&mut self.io, buf)
    }

    pub(crate) fn reader_available(&self, id: u64) -> u64 {
        self.streams
            .readers
            .iter()
            .find(|r| r.id == id)
            .map(ReaderState::available)
            .unwrap_or(0)
    }

    pub(crate) fn reader_close(&mut self, id: u64) -> Result<()> {
        self.streams.take_reader(id);
        Ok(())
    }

    /// Commits a writer: trims the surplus chain, flushes the last page,
    /// and records the byte count in the directory. The directory's own
    /// writer skips the directory update; it has no entry.
    fn close_writer_state(&mut self, mut state: WriterState) -> Result<()> {
        state.seal(&mut self.io, &mut self.directory)?;
        if state.record_id != DIRECTORY_RECORD_ID {
            let byte_count = i32::try_from(state.byte_count()).map_err(|_| {
                HeapError::RecordTooLarge {
                    bytes: state.byte_count(),
                }
            })?;
            self.directory
                .upsert(state.record_id, state.start_page(), byte_count);
            if self.safe_mode {
                self.write_directory_record()?;
            }
        }
        Ok(())
    }

    fn remove_record(&mut self, caller_id: i64) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(HeapError::IllegalState(
                "cannot remove a record on a read-only heap file".into(),
            )
            .into());
        }
        self.ensure_exclusive()?;

        let record_id = remap_record_id(caller_id);
        let Some(entry) = self.directory.get(record_id) else {
            // Not present; nothing to do.
            return Ok(());
        };
        self.directory.release_chain(&mut self.io, entry.start_page)?;
        self.directory.remove(record_id);
        Ok(())
    }

    /// Serializes the directory into its reserved record. The record's chain
    /// starts at the fixed page after the header, so this never consults the
    /// directory for its own location.
    fn write_directory_record(&mut self) -> Result<()> {
        let bytes = self.directory.encode();
        let mut state = WriterState::begin(
            &mut self.io,
            &mut self.directory,
            0,
            DIRECTORY_RECORD_ID,
            self.directory_start,
        )?;
        state.write_bytes(&mut self.io, &mut self.directory, &bytes)?;
        state.seal(&mut self.io, &mut self.directory)?;
        self.directory.set_index_byte_count(bytes.len() as i64);
        Ok(())
    }

    /// Persists the directory record and the header's allocation section if
    /// the directory has changed.
    fn flush_directory(&mut self) -> Result<()> {
        if !self.directory.is_dirty() {
            return Ok(());
        }
        self.write_directory_record()?;

        let freelist = self.directory.freelist();
        let alloc = AllocHeader::new(
            self.directory.index_byte_count(),
            freelist.next_free_page(),
            freelist.first_deallocated(),
            freelist.last_deallocated(),
        );
        self.io.write_at(self.alloc_section, alloc.as_bytes())?;
        self.directory.mark_clean();
        Ok(())
    }

    /// Commits live writers, retires live readers, flushes, and releases the
    /// advisory lock. Returns which stream kinds were still open at entry.
    fn close_impl(&mut self) -> Result<(bool, bool)> {
        if self.closed {
            return Ok((false, false));
        }
        let writers_open = !self.streams.writers.is_empty();
        let readers_open = !self.streams.readers.is_empty();

        let writers: Vec<WriterState> = self.streams.writers.drain(..).collect();
        for state in writers {
            self.close_writer_state(state)?;
        }
        self.streams.readers.clear();

        self.flush_directory()?;
        if self.locked {
            let _ = self.io.file().unlock();
        }
        self.closed = true;
        log::debug!("closed heap file '{}'", self.path.display());
        Ok((writers_open, readers_open))
    }
}

/// A single-file paged heap: a random-access container of variable-length
/// byte records keyed by `i64`.
///
/// See the [crate documentation](crate) for the format and an overview.
#[derive(Debug)]
pub struct HeapFile {
    core: Mutex<HeapCore>,
}

impl HeapFile {
    /// Creates or opens the file at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        HeapFileOptions::new().open(path)
    }

    /// Open-time configuration builder.
    pub fn options() -> HeapFileOptions {
        HeapFileOptions::new()
    }

    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    /// Payload bytes per page of this file.
    pub fn page_data_size(&self) -> i32 {
        self.with_core(|core| core.io.page_data_size() as i32)
    }

    /// Obtains the writer for `record_id`, creating the record if absent.
    ///
    /// Fails with [`HeapError::IllegalState`] if the file is read-only or if
    /// any stream is live.
    pub fn record_writer(&self, record_id: i64) -> Result<RecordWriter<'_>> {
        let (id, start_page) = self.with_core(|core| core.begin_writer(record_id))?;
        Ok(RecordWriter {
            heap: self,
            id,
            closed: false,
            start_page,
            written: 0,
        })
    }

    /// Obtains a reader for `record_id`, or `None` if no such record exists.
    ///
    /// Fails with [`HeapError::IllegalState`] if a writer is live.
    pub fn record_reader(&self, record_id: i64) -> Result<Option<RecordReader<'_>>> {
        Ok(self
            .with_core(|core| core.begin_reader(record_id))?
            .map(|id| RecordReader {
                heap: self,
                id,
                closed: false,
            }))
    }

    /// Removes the record, returning its pages to the free chain. Removing
    /// an absent record is a no-op.
    ///
    /// Fails with [`HeapError::IllegalState`] if the file is read-only or if
    /// any stream is live.
    pub fn remove_record(&self, record_id: i64) -> Result<()> {
        self.with_core(|core| core.remove_record(record_id))
    }

    /// Persists the directory record and header allocation fields if the
    /// directory has changed. Does not commit open writers' buffered pages;
    /// only a writer's close does that.
    pub fn flush(&self) -> Result<()> {
        self.with_core(|core| {
            core.ensure_open()?;
            core.flush_directory()
        })
    }

    /// Commits any still-live streams, flushes, and closes the handle.
    /// Closing is idempotent. Streams left open at entry are committed, but
    /// the condition is reported as a diagnostic.
    pub fn close(&self) -> Result<()> {
        let (writers_open, readers_open) = self.with_core(HeapCore::close_impl)?;
        if writers_open || readers_open {
            log::warn!(
                "heap file closed with record streams still open (writers: {writers_open}, readers: {readers_open})"
            );
            debug_assert!(!writers_open, "record writers still open at close");
            debug_assert!(!readers_open, "record readers still open at close");
        }
        Ok(())
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        if !core.closed {
            if let Err(e) = core.close_impl() {
                log::warn!("failed to close heap file on drop: {e:#}");
            }
        }
    }
}
