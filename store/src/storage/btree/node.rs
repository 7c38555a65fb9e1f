//! B-tree node types and block serialization.
//!
//! Every node occupies exactly one fixed-size block in the tree file. This
//! is a classic B-tree (not a B+ tree): records live in internal nodes as
//! well as leaves, and an internal node with `n` records has `n + 1`
//! children.
//!
//! Block layout:
//! - `node_type`: 1 byte (1 = internal, 2 = leaf, 3 = free)
//! - `record_count`: 2 bytes (LE)
//! - 1 byte reserved
//! - internal nodes: `child_0` (4 bytes LE), then `record_count` repetitions
//!   of `[record][child]`; leaves: records back to back
//!
//! A freed block keeps only its type byte and the id of the next block on
//! the free list (4 bytes LE at offset 4).

#![allow(clippy::cast_possible_truncation)]

use crate::storage::btree::RecordComparator;

/// A node identifier. Node `id` lives at file offset `id * block_size`;
/// id 0 is the file header and never a node.
pub type NodeId = u32;

/// Offset where node payload (children/records) starts within a block.
const NODE_DATA_OFFSET: usize = 4;

/// Bytes of a block consumed by bookkeeping: the 4-byte node header plus the
/// trailing child slot of an internal node.
const NODE_OVERHEAD: usize = NODE_DATA_OFFSET + CHILD_SIZE;

/// Size of one child pointer.
const CHILD_SIZE: usize = 4;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Internal = 1,
    Leaf = 2,
    Free = 3,
}

impl TryFrom<u8> for NodeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            3 => Ok(Self::Free),
            _ => Err(value),
        }
    }
}

/// Derived node geometry for one tree.
///
/// All nodes of a tree share one block size and one record length, so the
/// entry bounds are fixed at construction time.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Size in bytes of one node block.
    pub block_size: usize,
    /// Length in bytes of every record.
    pub record_len: usize,
    /// Maximum records per node.
    pub max_records: usize,
    /// Minimum records per non-root node.
    pub min_records: usize,
}

impl Geometry {
    /// Compute the geometry for a block size and record length.
    ///
    /// Returns `None` if a block cannot hold at least three records, which
    /// is the minimum for the balancing algorithm to make progress.
    #[must_use]
    pub const fn new(block_size: usize, record_len: usize) -> Option<Self> {
        if record_len == 0 || block_size < NODE_OVERHEAD {
            return None;
        }
        let max_records = (block_size - NODE_OVERHEAD) / (record_len + CHILD_SIZE);
        if max_records < 3 {
            return None;
        }
        Some(Self {
            block_size,
            record_len,
            max_records,
            min_records: max_records / 2,
        })
    }
}

/// An in-memory B-tree node, parsed from and written back to one block.
#[derive(Debug, Clone)]
pub struct Node {
    /// The node's id (also its position in the file).
    pub id: NodeId,
    /// Records in sorted order, each exactly `record_len` bytes.
    pub records: Vec<Vec<u8>>,
    /// Child node ids. Empty for leaves; `records.len() + 1` otherwise.
    pub children: Vec<NodeId>,
}

impl Node {
    /// Create a new empty leaf node.
    #[must_use]
    pub const fn new_leaf(id: NodeId) -> Self {
        Self {
            id,
            records: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Create a new internal root from a split: one record, two children.
    #[must_use]
    pub fn new_root(id: NodeId, left: NodeId, record: Vec<u8>, right: NodeId) -> Self {
        Self {
            id,
            records: vec![record],
            children: vec![left, right],
        }
    }

    /// Whether this node is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether this node holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parse a node from a block.
    pub fn from_block(id: NodeId, block: &[u8], geometry: &Geometry) -> Result<Self, NodeError> {
        let node_type = NodeType::try_from(block[0]).map_err(NodeError::InvalidNodeType)?;
        if node_type == NodeType::Free {
            return Err(NodeError::FreeBlock(id));
        }

        let record_count = u16::from_le_bytes([block[1], block[2]]) as usize;
        // One extra record may be present transiently in memory, never on
        // disk; anything beyond max_records in a stored block is corruption.
        if record_count > geometry.max_records {
            return Err(NodeError::RecordCountOutOfRange {
                id,
                record_count,
                max_records: geometry.max_records,
            });
        }

        let mut records = Vec::with_capacity(record_count);
        let mut children = Vec::new();
        let mut offset = NODE_DATA_OFFSET;

        if node_type == NodeType::Internal {
            children.reserve(record_count + 1);
            children.push(u32::from_le_bytes([
                block[offset],
                block[offset + 1],
                block[offset + 2],
                block[offset + 3],
            ]));
            offset += CHILD_SIZE;
        }

        for _ in 0..record_count {
            records.push(block[offset..offset + geometry.record_len].to_vec());
            offset += geometry.record_len;

            if node_type == NodeType::Internal {
                children.push(u32::from_le_bytes([
                    block[offset],
                    block[offset + 1],
                    block[offset + 2],
                    block[offset + 3],
                ]));
                offset += CHILD_SIZE;
            }
        }

        Ok(Self {
            id,
            records,
            children,
        })
    }

    /// Serialize this node into a block buffer. The buffer is fully
    /// overwritten; trailing bytes are zeroed.
    pub fn write_block(&self, block: &mut [u8]) {
        block.fill(0);
        block[0] = if self.is_leaf() {
            NodeType::Leaf as u8
        } else {
            NodeType::Internal as u8
        };
        block[1..3].copy_from_slice(&(self.records.len() as u16).to_le_bytes());

        let mut offset = NODE_DATA_OFFSET;

        if !self.is_leaf() {
            block[offset..offset + CHILD_SIZE].copy_from_slice(&self.children[0].to_le_bytes());
            offset += CHILD_SIZE;
        }

        for (i, record) in self.records.iter().enumerate() {
            block[offset..offset + record.len()].copy_from_slice(record);
            offset += record.len();

            if !self.is_leaf() {
                block[offset..offset + CHILD_SIZE]
                    .copy_from_slice(&self.children[i + 1].to_le_bytes());
                offset += CHILD_SIZE;
            }
        }
    }

    /// Binary-search the node's records for `key`.
    ///
    /// `Ok(i)` means the comparator considered record `i` equal to the key;
    /// `Err(i)` is the index of the first record larger than the key (which
    /// is also the index of the child subtree that may contain it).
    pub fn search(&self, comparator: &dyn RecordComparator, key: &[u8]) -> Result<usize, usize> {
        self.records
            .binary_search_by(|record| comparator.compare(key, record).reverse())
    }

    /// Insert `record` at `idx` with `right_child` directly to its right.
    /// For leaves, `right_child` is ignored.
    pub fn insert_record(&mut self, idx: usize, record: Vec<u8>, right_child: NodeId) {
        self.records.insert(idx, record);
        if !self.is_leaf() {
            self.children.insert(idx + 1, right_child);
        }
    }

    /// Remove the record at `idx` together with the child directly to its
    /// right, returning the record.
    pub fn remove_record_right(&mut self, idx: usize) -> Vec<u8> {
        let record = self.records.remove(idx);
        if !self.is_leaf() {
            self.children.remove(idx + 1);
        }
        record
    }

    /// Remove the record at `idx` together with the child directly to its
    /// left, returning the record.
    pub fn remove_record_left(&mut self, idx: usize) -> Vec<u8> {
        let record = self.records.remove(idx);
        if !self.is_leaf() {
            self.children.remove(idx);
        }
        record
    }

    /// Split a node that has grown one record past capacity.
    ///
    /// The median record is removed and returned together with the new
    /// right-hand node (which receives a fresh id from the caller); records
    /// and children after the median move to the right node.
    #[must_use]
    pub fn split(&mut self, right_id: NodeId) -> (Vec<u8>, Self) {
        let median_idx = self.records.len() / 2;

        let right_records: Vec<Vec<u8>> = self.records.drain(median_idx + 1..).collect();
        let right_children: Vec<NodeId> = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.drain(median_idx + 1..).collect()
        };
        let median = self
            .records
            .pop()
            .unwrap_or_default();

        (
            median,
            Self {
                id: right_id,
                records: right_records,
                children: right_children,
            },
        )
    }

    /// Merge `right` into this node, with `median` (pulled down from the
    /// parent) in between.
    pub fn merge_with_right(&mut self, median: Vec<u8>, right: Self) {
        self.records.push(median);
        self.records.extend(right.records);
        self.children.extend(right.children);
    }
}

/// Errors that can occur when parsing a node block.
#[derive(Debug)]
pub enum NodeError {
    /// Unknown node type byte.
    InvalidNodeType(u8),
    /// The block is on the free list but was read as a node.
    FreeBlock(NodeId),
    /// Stored record count exceeds what a block can hold.
    RecordCountOutOfRange {
        id: NodeId,
        record_count: usize,
        max_records: usize,
    },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidNodeType(v) => write!(f, "invalid node type: 0x{v:02x}"),
            Self::FreeBlock(id) => write!(f, "node {id} is on the free list"),
            Self::RecordCountOutOfRange {
                id,
                record_count,
                max_records,
            } => {
                write!(
                    f,
                    "node {id} claims {record_count} records (max {max_records})"
                )
            }
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::DefaultRecordComparator;

    fn geometry() -> Geometry {
        Geometry::new(128, 8).expect("valid geometry")
    }

    fn record(byte: u8) -> Vec<u8> {
        vec![byte; 8]
    }

    #[test]
    fn test_geometry_bounds() {
        let geometry = Geometry::new(4096, 8).expect("valid geometry");
        // (4096 - 8) / (8 + 4) = 340
        assert_eq!(geometry.max_records, 340);
        assert_eq!(geometry.min_records, 170);

        // Too small to hold three records.
        assert!(Geometry::new(32, 8).is_none());
        assert!(Geometry::new(4096, 0).is_none());
    }

    #[test]
    fn test_leaf_block_roundtrip() {
        let geometry = geometry();
        let mut node = Node::new_leaf(1);
        node.insert_record(0, record(3), 0);
        node.insert_record(0, record(1), 0);
        node.insert_record(1, record(2), 0);

        let mut block = vec![0u8; geometry.block_size];
        node.write_block(&mut block);

        let restored = Node::from_block(1, &block, &geometry).expect("parse leaf");
        assert!(restored.is_leaf());
        assert_eq!(restored.records, vec![record(1), record(2), record(3)]);
    }

    #[test]
    fn test_internal_block_roundtrip() {
        let geometry = geometry();
        let mut node = Node::new_root(7, 1, record(5), 2);
        node.insert_record(1, record(9), 3);

        let mut block = vec![0u8; geometry.block_size];
        node.write_block(&mut block);

        let restored = Node::from_block(7, &block, &geometry).expect("parse internal");
        assert!(!restored.is_leaf());
        assert_eq!(restored.records, vec![record(5), record(9)]);
        assert_eq!(restored.children, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_free_block() {
        let geometry = geometry();
        let mut block = vec![0u8; geometry.block_size];
        block[0] = NodeType::Free as u8;
        assert!(matches!(
            Node::from_block(4, &block, &geometry),
            Err(NodeError::FreeBlock(4))
        ));
    }

    #[test]
    fn test_rejects_bad_record_count() {
        let geometry = geometry();
        let mut block = vec![0u8; geometry.block_size];
        block[0] = NodeType::Leaf as u8;
        block[1..3].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(matches!(
            Node::from_block(4, &block, &geometry),
            Err(NodeError::RecordCountOutOfRange { .. })
        ));
    }

    #[test]
    fn test_search_uses_comparator() {
        let comparator = DefaultRecordComparator;
        let mut node = Node::new_leaf(1);
        for byte in [2u8, 4, 6] {
            node.records.push(record(byte));
        }

        assert_eq!(node.search(&comparator, &record(4)), Ok(1));
        assert_eq!(node.search(&comparator, &record(5)), Err(2));
        assert_eq!(node.search(&comparator, &record(1)), Err(0));
        assert_eq!(node.search(&comparator, &record(7)), Err(3));
    }

    #[test]
    fn test_split_promotes_median() {
        let mut node = Node::new_leaf(1);
        for byte in 0u8..5 {
            node.records.push(record(byte));
        }

        let (median, right) = node.split(2);
        assert_eq!(median, record(2));
        assert_eq!(node.records, vec![record(0), record(1)]);
        assert_eq!(right.records, vec![record(3), record(4)]);
        assert_eq!(right.id, 2);
    }

    #[test]
    fn test_merge_with_right() {
        let mut left = Node::new_leaf(1);
        left.records.push(record(1));
        let mut right = Node::new_leaf(2);
        right.records.push(record(5));

        left.merge_with_right(record(3), right);
        assert_eq!(left.records, vec![record(1), record(3), record(5)]);
    }
}
