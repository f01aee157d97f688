//! # Record Directory
//!
//! The directory maps internal record identifiers to `{start page, byte
//! count}` and owns the page allocator state, so one dirty flag covers
//! everything the header's allocation section persists.
//!
//! The directory itself is stored inside the file it indexes, as the record
//! with the reserved identifier 0. That cycle is broken by rooting the
//! directory's own chain at a fixed address right after the file header and
//! never storing an entry for the reserved identifier.
//!
//! ## Wire format
//!
//! ```text
//! size: i32                    number of entries
//! size times:
//!   key:        i64            internal record identifier
//!   start_page: i64            address of the record's first page
//!   byte_count: i32            record payload length
//! ```
//!
//! All fields big-endian. Entry order is unspecified; the decoder accepts any
//! order. Decoding reads exactly the prefix it needs and ignores trailing
//! bytes, because the directory record's page chain pads the serialized form
//! up to whole pages.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use zerocopy::big_endian::{I32, I64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Freelist, PageStore};

/// Reserved internal identifier under which the directory stores itself.
pub(crate) const DIRECTORY_RECORD_ID: i64 = 0;

const ENTRY_WIRE_SIZE: usize = 20;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EntryRecord {
    key: I64,
    start_page: I64,
    byte_count: I32,
}

const _: () = assert!(size_of::<EntryRecord>() == ENTRY_WIRE_SIZE);

/// Where a record lives and how many of its chain's bytes are payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordEntry {
    pub start_page: i64,
    pub byte_count: i32,
}

#[derive(Debug)]
pub(crate) struct Directory {
    entries: HashMap<i64, RecordEntry>,
    freelist: Freelist,
    index_byte_count: i64,
    dirty: bool,
}

impl Directory {
    pub(crate) fn new(freelist: Freelist) -> Self {
        Self {
            entries: HashMap::new(),
            freelist,
            index_byte_count: 0,
            dirty: false,
        }
    }

    pub(crate) fn get(&self, key: i64) -> Option<RecordEntry> {
        self.entries.get(&key).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Creates the entry if absent (keeping the first-seen start page) and
    /// records the current byte count.
    pub(crate) fn upsert(&mut self, key: i64, start_page: i64, byte_count: i32) {
        self.entries
            .entry(key)
            .or_insert(RecordEntry {
                start_page,
                byte_count,
            })
            .byte_count = byte_count;
        self.dirty = true;
    }

    pub(crate) fn remove(&mut self, key: i64) {
        self.entries.remove(&key);
        self.dirty = true;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn index_byte_count(&self) -> i64 {
        self.index_byte_count
    }

    pub(crate) fn set_index_byte_count(&mut self, count: i64) {
        self.index_byte_count = count;
    }

    pub(crate) fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    pub(crate) fn allocate_page(&mut self, store: &mut PageStore) -> Result<i64> {
        let address = self.freelist.allocate(store)?;
        self.dirty = true;
        Ok(address)
    }

    pub(crate) fn release_chain(&mut self, store: &mut PageStore, start: i64) -> Result<()> {
        self.freelist.release_chain(store, start)?;
        self.dirty = true;
        Ok(())
    }

    /// Serializes the entry map in the wire format above.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * ENTRY_WIRE_SIZE);
        out.extend_from_slice(&(self.entries.len() as i32).to_be_bytes());
        for (&key, entry) in &self.entries {
            let record = EntryRecord {
                key: I64::new(key),
                start_page: I64::new(entry.start_page),
                byte_count: I32::new(entry.byte_count),
            };
            out.extend_from_slice(record.as_bytes());
        }
        out
    }

    /// Decodes an entry map from the prefix of `bytes`, ignoring any tail.
    pub(crate) fn decode_entries(bytes: &[u8]) -> Result<HashMap<i64, RecordEntry>> {
        ensure!(
            bytes.len() >= 4,
            "directory record truncated: {} bytes",
            bytes.len()
        );
        let size = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        ensure!(size >= 0, "corrupt directory entry count: {}", size);
        let size = size as usize;
        ensure!(
            bytes.len() >= 4 + size * ENTRY_WIRE_SIZE,
            "directory record truncated: {} entries do not fit in {} bytes",
            size,
            bytes.len()
        );

        let mut entries = HashMap::with_capacity(size);
        for i in 0..size {
            let offset = 4 + i * ENTRY_WIRE_SIZE;
            let record = EntryRecord::read_from_bytes(&bytes[offset..offset + ENTRY_WIRE_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse directory entry: {:?}", e))?;
            entries.insert(
                record.key.get(),
                RecordEntry {
                    start_page: record.start_page.get(),
                    byte_count: record.byte_count.get(),
                },
            );
        }
        Ok(entries)
    }

    /// Installs entries reconstructed from disk without dirtying the
    /// directory.
    pub(crate) fn load_entries(&mut self, entries: HashMap<i64, RecordEntry>) {
        self.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(entries: &[(i64, i64, i32)]) -> Directory {
        let mut directory = Directory::new(Freelist::new(0));
        for &(key, start_page, byte_count) in entries {
            directory.upsert(key, start_page, byte_count);
        }
        directory
    }

    #[test]
    fn empty_directory_encodes_to_four_bytes() {
        let directory = Directory::new(Freelist::new(0));

        assert_eq!(directory.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn encode_decode_round_trips() {
        let directory = directory_with(&[(1, 56, 111), (-1, 4096, 22), (4712, 80, 0)]);

        let decoded = Directory::decode_entries(&directory.encode()).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(
            decoded[&1],
            RecordEntry {
                start_page: 56,
                byte_count: 111
            }
        );
        assert_eq!(
            decoded[&-1],
            RecordEntry {
                start_page: 4096,
                byte_count: 22
            }
        );
        assert_eq!(
            decoded[&4712],
            RecordEntry {
                start_page: 80,
                byte_count: 0
            }
        );
    }

    #[test]
    fn decode_ignores_trailing_padding() {
        let directory = directory_with(&[(7, 56, 9)]);
        let mut bytes = directory.encode();
        bytes.extend_from_slice(&[0xAA; 37]);

        let decoded = Directory::decode_entries(&bytes).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[&7].byte_count, 9);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let directory = directory_with(&[(7, 56, 9), (8, 96, 10)]);
        let bytes = directory.encode();

        assert!(Directory::decode_entries(&bytes[..bytes.len() - 1]).is_err());
        assert!(Directory::decode_entries(&[]).is_err());
    }

    #[test]
    fn decode_rejects_negative_entry_count() {
        let bytes = (-1i32).to_be_bytes();

        assert!(Directory::decode_entries(&bytes).is_err());
    }

    #[test]
    fn upsert_keeps_the_original_start_page() {
        let mut directory = directory_with(&[(5, 100, 10)]);

        directory.upsert(5, 999, 25);

        let entry = directory.get(5).unwrap();
        assert_eq!(entry.start_page, 100);
        assert_eq!(entry.byte_count, 25);
    }

    #[test]
    fn mutations_set_the_dirty_flag() {
        let mut directory = Directory::new(Freelist::new(0));
        assert!(!directory.is_dirty());

        directory.upsert(1, 56, 4);
        assert!(directory.is_dirty());

        directory.mark_clean();
        directory.remove(1);
        assert!(directory.is_dirty());
    }

    #[test]
    fn load_entries_does_not_dirty() {
        let mut directory = Directory::new(Freelist::new(0));

        directory.load_entries(HashMap::new());

        assert!(!directory.is_dirty());
    }
}
