//! Error kinds for heap file operations.
//!
//! All fallible operations in this crate return `eyre::Result`. Failures that
//! a caller may want to react to programmatically carry a [`HeapError`] inside
//! the report and can be recovered with [`eyre::Report::downcast_ref`]:
//!
//! ```ignore
//! match heap.record_writer(7) {
//!     Err(e) if matches!(e.downcast_ref(), Some(HeapError::IllegalState(_))) => retry_later(),
//!     other => other?,
//! }
//! ```
//!
//! Plain I/O failures from the backing file travel as `std::io::Error` inside
//! the report. End-of-stream is not an error: byte reads return `Option<u8>`
//! and bulk reads return a count of `0`.

use std::path::PathBuf;

use thiserror::Error;

/// Distinguished failure kinds surfaced by heap file operations.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The advisory file lock is held by another handle or process.
    #[error("heap file '{}' is locked by another process", path.display())]
    AlreadyLocked {
        /// Path of the contended file.
        path: PathBuf,
    },

    /// The file header carries a version string this crate does not read.
    #[error("unsupported heap file version {found:?}")]
    UnsupportedVersion {
        /// The version string found in the header.
        found: String,
    },

    /// A page's magic word did not match on load.
    #[error("bad page magic at address {address}")]
    CorruptedPage {
        /// File offset of the corrupt page.
        address: i64,
    },

    /// An operation violated the handle or stream lifecycle rules: a writer
    /// requested while streams are live, a reader requested while a writer is
    /// live, a mutation on a read-only handle, or use of a closed handle or
    /// stream.
    #[error("{0}")]
    IllegalState(String),

    /// A record grew past the largest size the directory can describe.
    #[error("record of {bytes} bytes exceeds the i32 byte-count limit")]
    RecordTooLarge {
        /// Number of bytes the writer accumulated.
        bytes: u64,
    },
}
