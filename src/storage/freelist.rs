//! # Free-Page Tracking and Allocation
//!
//! Pages released by shrinking or removed records are not returned to the
//! filesystem. They are linked into a free chain and handed back out before
//! the file is ever extended, so the file only grows when no released
//! capacity remains.
//!
//! The free chain reuses each page's on-disk continuation field; payload
//! bytes are never rewritten on release. The chain is addressed by two
//! header fields:
//!
//! - `first_deallocated`: head of the chain, popped by [`Freelist::allocate`]
//! - `last_deallocated`: tail of the chain, where released chains are linked
//!
//! Both are 0 when and only when the chain is empty.
//!
//! ## Allocation
//!
//! 1. If the chain is non-empty, take the head page: read its continuation
//!    to become the new head (clearing the tail if the chain emptied), then
//!    zero the taken page's on-disk continuation to detach it.
//! 2. Otherwise return `next_free_page` and advance it by one page size.
//!
//! Either way the caller receives an address to treat as an uninitialized
//! page; the magic word and payload are written on its first flush.
//!
//! ## Release
//!
//! An entire chain is appended at once: the current tail's continuation is
//! pointed at the chain head, then the chain is walked on disk to find its
//! terminal page, which becomes the new tail. Release is O(chain length)
//! in seeks.

use eyre::Result;

use super::PageStore;

#[derive(Debug)]
pub(crate) struct Freelist {
    next_free_page: i64,
    first_deallocated: i64,
    last_deallocated: i64,
}

impl Freelist {
    /// Allocator for a fresh file: nothing released yet, the first
    /// allocation lands at `next_free_page`.
    pub(crate) fn new(next_free_page: i64) -> Self {
        Self {
            next_free_page,
            first_deallocated: 0,
            last_deallocated: 0,
        }
    }

    /// Allocator state recovered from an existing file's header.
    pub(crate) fn with_state(
        next_free_page: i64,
        first_deallocated: i64,
        last_deallocated: i64,
    ) -> Self {
        Self {
            next_free_page,
            first_deallocated,
            last_deallocated,
        }
    }

    pub(crate) fn next_free_page(&self) -> i64 {
        self.next_free_page
    }

    pub(crate) fn first_deallocated(&self) -> i64 {
        self.first_deallocated
    }

    pub(crate) fn last_deallocated(&self) -> i64 {
        self.last_deallocated
    }

    /// Returns the address of a page the caller may treat as uninitialized.
    pub(crate) fn allocate(&mut self, store: &mut PageStore) -> Result<i64> {
        if self.first_deallocated != 0 {
            let address = self.first_deallocated;
            self.first_deallocated = store.read_i64_at(address)?;
            if self.first_deallocated == 0 {
                // The last free page was taken.
                self.last_deallocated = 0;
            }
            // Detach the page from the chain.
            store.write_i64_at(address, 0)?;
            Ok(address)
        } else {
            let address = self.next_free_page;
            self.next_free_page += store.page_size();
            Ok(address)
        }
    }

    /// Appends the whole chain rooted at `start` to the free chain.
    pub(crate) fn release_chain(&mut self, store: &mut PageStore, start: i64) -> Result<()> {
        if self.last_deallocated != 0 {
            store.write_i64_at(self.last_deallocated, start)?;
        }
        if self.first_deallocated == 0 {
            self.first_deallocated = start;
        }

        // Walk to the terminal page of the released chain.
        let mut tail = start;
        loop {
            let next = store.read_i64_at(tail)?;
            if next == 0 {
                break;
            }
            tail = next;
        }
        self.last_deallocated = tail;
        Ok(())
    }
}
