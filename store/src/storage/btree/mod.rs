//! An on-disk B-tree of fixed-length records with a pluggable ordering.
//!
//! The tree stores byte records of one fixed length per tree, ordered by a
//! [`RecordComparator`] supplied at open time. Records live in internal
//! nodes as well as leaves, so a lookup can terminate above the leaf level.
//!
//! The tree performs no logical concurrency control of its own. Interior
//! state is guarded by a mutex for memory safety, but callers that mutate
//! the tree while iterating it get weak consistency (see
//! [`RecordIterator`]); serializing readers and writers is the job of the
//! lock managers in [`crate::locks`].

mod iter;
mod node;
mod tree;

use std::cmp::Ordering;

pub use iter::RecordIterator;
pub use node::{Geometry, Node, NodeError, NodeId, NodeType};
pub use tree::{BTree, BTreeError};

/// Defines the ordering of the records in a tree.
///
/// `key` may be shorter than a full record, in which case only the matching
/// prefix of the record takes part in the comparison. Partial keys make
/// range scans over composite records possible: a scan bounded by a prefix
/// visits every record carrying that prefix.
pub trait RecordComparator: Send + Sync {
    /// Compare a (possibly partial) key against a stored record.
    fn compare(&self, key: &[u8], record: &[u8]) -> Ordering;
}

/// Lexicographic byte ordering, using only as many record bytes as the key
/// supplies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRecordComparator;

impl RecordComparator for DefaultRecordComparator {
    fn compare(&self, key: &[u8], record: &[u8]) -> Ordering {
        let len = key.len().min(record.len());
        key.cmp(&record[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_comparator_full_keys() {
        let comparator = DefaultRecordComparator;
        assert_eq!(comparator.compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(comparator.compare(b"abb", b"abc"), Ordering::Less);
        assert_eq!(comparator.compare(b"abd", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_default_comparator_partial_key_matches_prefix() {
        let comparator = DefaultRecordComparator;
        assert_eq!(comparator.compare(b"ab", b"abcd"), Ordering::Equal);
        assert_eq!(comparator.compare(b"ac", b"abcd"), Ordering::Greater);
        assert_eq!(comparator.compare(b"aa", b"abcd"), Ordering::Less);
    }
}
