//! # heapfile — a single-file paged heap
//!
//! `heapfile` stores variable-length byte records in one file, keyed by a
//! caller-chosen `i64`. Records can be written, overwritten with a different
//! size, read back, and removed; the file reuses the space of shrunken and
//! removed records instead of growing. It is a mini document store whose
//! only key is the integer identifier — mapping application entities to
//! identifiers is the caller's job, and record contents are opaque bytes.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::io::{Read, Write};
//! use heapfile::HeapFile;
//!
//! let heap = HeapFile::open("app.heap")?;
//!
//! let mut writer = heap.record_writer(1)?;
//! writer.write_all(b"hello, record one")?;
//! writer.close()?;
//!
//! let mut reader = heap.record_reader(1)?.expect("record exists");
//! let mut contents = vec![0u8; reader.available() as usize];
//! reader.read_exact(&mut contents)?;
//!
//! heap.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              HeapFile handle                 │
//! │  exclusivity, identifier remap, lifecycle    │
//! ├──────────────────────┬──────────────────────┤
//! │    RecordReader      │     RecordWriter      │
//! │  chain walk + clip   │  fill, link, commit   │
//! ├──────────────────────┴──────────────────────┤
//! │      Directory (id → start page, bytes)      │
//! │        + Freelist (released page chain)      │
//! ├─────────────────────────────────────────────┤
//! │     Pages: continuation · magic · payload    │
//! ├─────────────────────────────────────────────┤
//! │        PageStore (positioned file I/O)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The file is an array of fixed-size pages after a small header. A record
//! occupies a chain of pages linked by continuation addresses; the
//! directory maps each identifier to its chain's start page and payload
//! length, and is itself stored as a record inside the file. Freed pages go
//! on a chain of their own and are handed back out before the file grows.
//!
//! ## Concurrency model
//!
//! A `HeapFile` may be shared across threads; every operation serializes on
//! an internal mutex. Stream exclusivity is coarse: one writer at a time,
//! never concurrent with readers, any number of readers otherwise. Streams
//! borrow the handle, so the handle always outlives them.
//!
//! ## What this crate does not do
//!
//! No object serialization, no journaling or crash-safety guarantees beyond
//! best effort, no file shrinking, no payload checksums, and no
//! multi-process coordination beyond an optional advisory lock at open.

pub mod error;

mod heap;
mod storage;

pub use error::HeapError;
pub use heap::{HeapFile, HeapFileOptions, RecordReader, RecordWriter};
pub use storage::DEFAULT_PAGE_DATA_SIZE;
