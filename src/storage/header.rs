//! # File Header
//!
//! A heap file begins with a variable-length header written once at creation:
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ----------------------------------------
//! 0       2     version length  Big-endian u16 length of the version string
//! 2       L     version         UTF-8 version string
//! 2+L     4     page_data_size  Payload bytes per page (i32, creation-time)
//! 2+L+4   32    allocation      AllocHeader, rewritten on every flush
//! 2+L+36  -     first page      Start of the record directory's page chain
//! ```
//!
//! The allocation section holds the serialized directory's byte count and the
//! allocator state (next never-used page address, head and tail of the
//! deallocated-page chain). Its offset depends on the version string length,
//! so [`read`] and [`write_new`] both report it back to the caller.
//!
//! Two version strings open successfully: the current literal and a legacy
//! literal written by earlier producers of the same format. New files always
//! carry the current literal. `page_data_size` is honored only at creation;
//! opening an existing file always uses the stored value.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use eyre::{ensure, Result, WrapErr};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::HeapError;

/// Version string written into newly created files.
pub(crate) const CURRENT_VERSION_STRING: &str = "HeapFile Version 1";

/// Historical version string accepted for compatibility with existing files.
pub(crate) const LEGACY_VERSION_STRING: &str = "class se.marell.bucketfile.BucketFile Version 1";

pub(crate) const ALLOC_HEADER_SIZE: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct AllocHeader {
    index_byte_count: I64,
    next_free_page: I64,
    first_deallocated: I64,
    last_deallocated: I64,
}

const _: () = assert!(size_of::<AllocHeader>() == ALLOC_HEADER_SIZE);

impl AllocHeader {
    pub(crate) fn new(
        index_byte_count: i64,
        next_free_page: i64,
        first_deallocated: i64,
        last_deallocated: i64,
    ) -> Self {
        Self {
            index_byte_count: I64::new(index_byte_count),
            next_free_page: I64::new(next_free_page),
            first_deallocated: I64::new(first_deallocated),
            last_deallocated: I64::new(last_deallocated),
        }
    }

    pub(crate) fn index_byte_count(&self) -> i64 {
        self.index_byte_count.get()
    }

    pub(crate) fn next_free_page(&self) -> i64 {
        self.next_free_page.get()
    }

    pub(crate) fn first_deallocated(&self) -> i64 {
        self.first_deallocated.get()
    }

    pub(crate) fn last_deallocated(&self) -> i64 {
        self.last_deallocated.get()
    }
}

/// Everything the open path needs from the header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderInfo {
    pub page_data_size: i32,
    /// Offset of the allocation section, rewritten on flush.
    pub alloc_section: i64,
    /// Address of the record directory's first page, fixed for the lifetime
    /// of the file.
    pub directory_start: i64,
    pub index_byte_count: i64,
    pub next_free_page: i64,
    pub first_deallocated: i64,
    pub last_deallocated: i64,
}

/// Writes a fresh header with a zeroed allocation section.
pub(crate) fn write_new(file: &mut File, page_data_size: i32) -> Result<HeaderInfo> {
    let version = CURRENT_VERSION_STRING.as_bytes();

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&(version.len() as u16).to_be_bytes())?;
    file.write_all(version)?;
    file.write_all(&page_data_size.to_be_bytes())?;

    let alloc_section = (2 + version.len() + 4) as i64;
    let alloc = AllocHeader::new(0, 0, 0, 0);
    file.write_all(alloc.as_bytes())
        .wrap_err("failed to write heap file header")?;

    Ok(HeaderInfo {
        page_data_size,
        alloc_section,
        directory_start: alloc_section + ALLOC_HEADER_SIZE as i64,
        index_byte_count: 0,
        next_free_page: 0,
        first_deallocated: 0,
        last_deallocated: 0,
    })
}

/// Reads and validates the header of an existing file.
pub(crate) fn read(file: &mut File) -> Result<HeaderInfo> {
    file.seek(SeekFrom::Start(0))?;

    let mut len_bytes = [0u8; 2];
    file.read_exact(&mut len_bytes)
        .wrap_err("failed to read heap file version")?;
    let version_len = u16::from_be_bytes(len_bytes) as usize;

    let mut version_bytes = vec![0u8; version_len];
    file.read_exact(&mut version_bytes)
        .wrap_err("failed to read heap file version")?;
    let version = String::from_utf8_lossy(&version_bytes).into_owned();
    if version != CURRENT_VERSION_STRING && version != LEGACY_VERSION_STRING {
        return Err(HeapError::UnsupportedVersion { found: version }.into());
    }

    let mut size_bytes = [0u8; 4];
    file.read_exact(&mut size_bytes)
        .wrap_err("failed to read page data size")?;
    let page_data_size = i32::from_be_bytes(size_bytes);
    ensure!(
        page_data_size > 0,
        "invalid page data size in header: {}",
        page_data_size
    );

    let alloc_section = (2 + version_len + 4) as i64;
    let mut alloc_bytes = [0u8; ALLOC_HEADER_SIZE];
    file.read_exact(&mut alloc_bytes)
        .wrap_err("failed to read allocation header")?;
    let alloc = AllocHeader::read_from_bytes(&alloc_bytes)
        .map_err(|e| eyre::eyre!("failed to parse AllocHeader: {:?}", e))?;

    Ok(HeaderInfo {
        page_data_size,
        alloc_section,
        directory_start: alloc_section + ALLOC_HEADER_SIZE as i64,
        index_byte_count: alloc.index_byte_count(),
        next_free_page: alloc.next_free_page(),
        first_deallocated: alloc.first_deallocated(),
        last_deallocated: alloc.last_deallocated(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::path::Path;

    fn scratch_file(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn alloc_header_size_is_32_bytes() {
        assert_eq!(size_of::<AllocHeader>(), 32);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = scratch_file(&dir.path().join("h.heap"));

        let written = write_new(&mut file, 2048).unwrap();
        let read_back = read(&mut file).unwrap();

        assert_eq!(read_back.page_data_size, 2048);
        assert_eq!(read_back.alloc_section, written.alloc_section);
        assert_eq!(read_back.directory_start, written.directory_start);
        assert_eq!(read_back.index_byte_count, 0);
        assert_eq!(read_back.next_free_page, 0);
    }

    #[test]
    fn directory_start_follows_the_allocation_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = scratch_file(&dir.path().join("h.heap"));

        let info = write_new(&mut file, 512).unwrap();

        let expected = (2 + CURRENT_VERSION_STRING.len() + 4 + ALLOC_HEADER_SIZE) as i64;
        assert_eq!(info.directory_start, expected);
    }

    #[test]
    fn legacy_version_string_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = scratch_file(&dir.path().join("h.heap"));

        let version = LEGACY_VERSION_STRING.as_bytes();
        file.write_all(&(version.len() as u16).to_be_bytes()).unwrap();
        file.write_all(version).unwrap();
        file.write_all(&64i32.to_be_bytes()).unwrap();
        file.write_all(AllocHeader::new(4, 200, 0, 0).as_bytes())
            .unwrap();

        let info = read(&mut file).unwrap();

        assert_eq!(info.page_data_size, 64);
        assert_eq!(info.index_byte_count, 4);
        assert_eq!(info.next_free_page, 200);
    }

    #[test]
    fn unknown_version_string_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = scratch_file(&dir.path().join("h.heap"));

        let version = b"SomeOtherFormat Version 9";
        file.write_all(&(version.len() as u16).to_be_bytes()).unwrap();
        file.write_all(version).unwrap();
        file.write_all(&64i32.to_be_bytes()).unwrap();
        file.write_all(&[0u8; ALLOC_HEADER_SIZE]).unwrap();

        let err = read(&mut file).unwrap_err();

        match err.downcast_ref::<HeapError>() {
            Some(HeapError::UnsupportedVersion { found }) => {
                assert_eq!(found, "SomeOtherFormat Version 9");
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn nonpositive_page_data_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = scratch_file(&dir.path().join("h.heap"));

        let version = CURRENT_VERSION_STRING.as_bytes();
        file.write_all(&(version.len() as u16).to_be_bytes()).unwrap();
        file.write_all(version).unwrap();
        file.write_all(&0i32.to_be_bytes()).unwrap();
        file.write_all(&[0u8; ALLOC_HEADER_SIZE]).unwrap();

        let err = read(&mut file).unwrap_err();

        assert!(err.to_string().contains("invalid page data size"));
    }
}
