//! A hash-to-id index built on the B-tree.
//!
//! Records are 8 bytes: a 4-byte big-endian hash followed by a 4-byte
//! big-endian id. Big-endian encoding makes plain lexicographic record
//! order coincide with numeric `(hash, id)` order, so all ids stored under
//! one hash form a contiguous run that a partial-key range scan selects
//! exactly.
//!
//! The index is a filter, not an authority: different values can share a
//! hash, so a caller resolving a hash must fetch each candidate id's value
//! and compare bytes before trusting the match.

use std::path::Path;

use crate::storage::btree::{BTree, BTreeError, DefaultRecordComparator};

const RECORD_LEN: usize = 8;

/// Maps 32-bit hashes to sets of ids.
#[derive(Debug)]
pub struct HashIndex {
    tree: BTree,
}

impl HashIndex {
    /// Open the index file at `path`, creating it if it does not exist.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        force_sync: bool,
    ) -> Result<Self, BTreeError> {
        let tree = BTree::open(
            path,
            block_size,
            RECORD_LEN,
            force_sync,
            Box::new(DefaultRecordComparator),
        )?;
        Ok(Self { tree })
    }

    fn record(hash: u32, id: u32) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&hash.to_be_bytes());
        record[4..8].copy_from_slice(&id.to_be_bytes());
        record
    }

    /// Register `id` under `hash`. Storing the same pair twice is a no-op.
    pub fn store(&self, hash: u32, id: u32) -> Result<(), BTreeError> {
        self.tree.insert(&Self::record(hash, id))?;
        Ok(())
    }

    /// Remove the `(hash, id)` pair, reporting whether it was present.
    pub fn remove(&self, hash: u32, id: u32) -> Result<bool, BTreeError> {
        Ok(self.tree.remove(&Self::record(hash, id))?.is_some())
    }

    /// Iterate over every id registered under `hash`, in ascending order.
    #[must_use]
    pub fn get_ids(&self, hash: u32) -> IdIterator<'_> {
        let key = hash.to_be_bytes();
        IdIterator {
            inner: self.tree.iterate_range(Some(&key), Some(&key)),
        }
    }

    /// Flush the index to disk.
    pub fn sync(&self) -> Result<(), BTreeError> {
        self.tree.sync()
    }

    /// Discard every entry.
    pub fn clear(&self) -> Result<(), BTreeError> {
        self.tree.clear()
    }

    /// Sync and close the index.
    pub fn close(&self) -> Result<(), BTreeError> {
        self.tree.close()
    }
}

/// Iterates over the ids stored under a single hash.
#[derive(Debug)]
pub struct IdIterator<'a> {
    inner: crate::storage::btree::RecordIterator<'a>,
}

impl IdIterator<'_> {
    /// Return the next candidate id, or `None` once the hash's run is
    /// exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<u32>, BTreeError> {
        let Some(record) = self.inner.next()? else {
            return Ok(None);
        };
        Ok(Some(u32::from_be_bytes([
            record[4], record[5], record[6], record[7],
        ])))
    }
}
