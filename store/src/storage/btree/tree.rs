//! The on-disk B-tree proper.
//!
//! File layout: block 0 holds the header, every other block holds one node
//! (or sits on the free list). Node `id` lives at offset `id * block_size`.
//!
//! Header layout (all integers LE):
//! - magic: 8 bytes
//! - format version: 4 bytes
//! - block size: 4 bytes
//! - record length: 4 bytes
//! - root node id (0 = empty tree): 4 bytes
//! - head of the free-block list (0 = none): 4 bytes
//! - highest node id ever allocated: 4 bytes
//!
//! Node writes go straight to the file; only the header is written back
//! lazily, on [`BTree::sync`] and [`BTree::close`]. A crash can therefore
//! lose the tree's shape but never tears an individual node block.

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::storage::btree::node::{Geometry, Node, NodeError, NodeId, NodeType};
use crate::storage::btree::{RecordComparator, RecordIterator};

const MAGIC: &[u8; 8] = b"stbtree\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 32;

/// Errors produced by B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    Io(std::io::Error),
    /// The tree has been closed; no further operations are possible.
    Closed,
    /// A record or key of the wrong length was passed in.
    InvalidRecordLength { expected: usize, actual: usize },
    /// A node id outside the allocated range was referenced.
    InvalidNodeId(NodeId),
    /// A node block failed to parse.
    CorruptNode(NodeError),
    /// The file header is missing, malformed, or of the wrong version.
    CorruptHeader(String),
    /// The stored geometry does not match what the caller asked for.
    HeaderMismatch {
        field: &'static str,
        stored: u32,
        requested: u32,
    },
    /// The block size cannot hold enough records per node.
    UnsupportedGeometry {
        block_size: usize,
        record_len: usize,
    },
    /// An internal node referenced an empty subtree during rebalancing.
    EmptyNode(NodeId),
    /// `set` was called before `next` returned a record.
    NoCurrentRecord,
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "b-tree i/o error: {err}"),
            Self::Closed => write!(f, "b-tree is closed"),
            Self::InvalidRecordLength { expected, actual } => {
                write!(f, "record is {actual} bytes, tree stores {expected}-byte records")
            }
            Self::InvalidNodeId(id) => write!(f, "node id {id} is out of range"),
            Self::CorruptNode(err) => write!(f, "corrupt node: {err}"),
            Self::CorruptHeader(msg) => write!(f, "corrupt b-tree header: {msg}"),
            Self::HeaderMismatch {
                field,
                stored,
                requested,
            } => {
                write!(f, "stored {field} is {stored}, but {requested} was requested")
            }
            Self::UnsupportedGeometry {
                block_size,
                record_len,
            } => {
                write!(
                    f,
                    "block size {block_size} cannot hold 3 records of {record_len} bytes"
                )
            }
            Self::EmptyNode(id) => write!(f, "node {id} is unexpectedly empty"),
            Self::NoCurrentRecord => write!(f, "no record returned yet; call next first"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::CorruptNode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BTreeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<NodeError> for BTreeError {
    fn from(err: NodeError) -> Self {
        Self::CorruptNode(err)
    }
}

/// Mutable tree state, guarded by the tree's mutex.
struct Inner {
    /// `None` once the tree is closed.
    file: Option<File>,
    root_id: NodeId,
    free_head: NodeId,
    max_node_id: NodeId,
    header_dirty: bool,
}

/// A B-tree of fixed-length records stored in a single file.
pub struct BTree {
    inner: Mutex<Inner>,
    comparator: Box<dyn RecordComparator>,
    geometry: Geometry,
    force_sync: bool,
    path: PathBuf,
}

/// Result of a recursive insert: the replaced record, if any, and the
/// record/node pair promoted out of a split, if one happened.
type Insertion = (Option<Vec<u8>>, Option<(Vec<u8>, NodeId)>);

impl BTree {
    /// Open the tree file at `path`, creating it if it does not exist.
    ///
    /// `block_size` and `record_len` fix the tree's geometry; reopening an
    /// existing file with different values is an error. When `force_sync`
    /// is set, every mutating operation syncs the file before returning.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        record_len: usize,
        force_sync: bool,
        comparator: Box<dyn RecordComparator>,
    ) -> Result<Self, BTreeError> {
        let geometry = Geometry::new(block_size, record_len).ok_or(
            BTreeError::UnsupportedGeometry {
                block_size,
                record_len,
            },
        )?;
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let inner = if file_len == 0 {
            let mut inner = Inner {
                file: Some(file),
                root_id: 0,
                free_head: 0,
                max_node_id: 0,
                header_dirty: true,
            };
            Self::write_header(&mut inner, &geometry)?;
            inner
        } else {
            Self::read_header(&mut file, &geometry)?
        };

        Ok(Self {
            inner: Mutex::new(inner),
            comparator,
            geometry,
            force_sync,
            path,
        })
    }

    fn read_header(file: &mut File, geometry: &Geometry) -> Result<Inner, BTreeError> {
        let mut header = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)
            .map_err(|_| BTreeError::CorruptHeader("file too short for a header".to_owned()))?;

        if &header[0..8] != MAGIC {
            return Err(BTreeError::CorruptHeader("bad magic".to_owned()));
        }
        let read_u32 = |offset: usize| {
            u32::from_le_bytes([
                header[offset],
                header[offset + 1],
                header[offset + 2],
                header[offset + 3],
            ])
        };
        let version = read_u32(8);
        if version != FORMAT_VERSION {
            return Err(BTreeError::CorruptHeader(format!(
                "unsupported format version {version}"
            )));
        }

        let stored_block_size = read_u32(12);
        if stored_block_size as usize != geometry.block_size {
            return Err(BTreeError::HeaderMismatch {
                field: "block size",
                stored: stored_block_size,
                requested: u32::try_from(geometry.block_size).unwrap_or(u32::MAX),
            });
        }
        let stored_record_len = read_u32(16);
        if stored_record_len as usize != geometry.record_len {
            return Err(BTreeError::HeaderMismatch {
                field: "record length",
                stored: stored_record_len,
                requested: u32::try_from(geometry.record_len).unwrap_or(u32::MAX),
            });
        }

        Ok(Inner {
            file: Some(file.try_clone()?),
            root_id: read_u32(20),
            free_head: read_u32(24),
            max_node_id: read_u32(28),
            header_dirty: false,
        })
    }

    fn write_header(inner: &mut Inner, geometry: &Geometry) -> Result<(), BTreeError> {
        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[12..16]
            .copy_from_slice(&u32::try_from(geometry.block_size).unwrap_or(u32::MAX).to_le_bytes());
        header[16..20]
            .copy_from_slice(&u32::try_from(geometry.record_len).unwrap_or(u32::MAX).to_le_bytes());
        header[20..24].copy_from_slice(&inner.root_id.to_le_bytes());
        header[24..28].copy_from_slice(&inner.free_head.to_le_bytes());
        header[28..32].copy_from_slice(&inner.max_node_id.to_le_bytes());

        let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        inner.header_dirty = false;
        Ok(())
    }

    /// The length in bytes of the records this tree stores.
    #[must_use]
    pub const fn record_len(&self) -> usize {
        self.geometry.record_len
    }

    pub(crate) fn comparator(&self) -> &dyn RecordComparator {
        &*self.comparator
    }

    fn check_record_len(&self, record: &[u8]) -> Result<(), BTreeError> {
        if record.len() == self.geometry.record_len {
            Ok(())
        } else {
            Err(BTreeError::InvalidRecordLength {
                expected: self.geometry.record_len,
                actual: record.len(),
            })
        }
    }

    // --- block i/o ------------------------------------------------------

    fn read_node(&self, inner: &mut Inner, id: NodeId) -> Result<Node, BTreeError> {
        if id == 0 || id > inner.max_node_id {
            return Err(BTreeError::InvalidNodeId(id));
        }
        let mut block = vec![0u8; self.geometry.block_size];
        let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
        file.seek(SeekFrom::Start(
            u64::from(id) * self.geometry.block_size as u64,
        ))?;
        file.read_exact(&mut block)?;
        Ok(Node::from_block(id, &block, &self.geometry)?)
    }

    fn write_node(&self, inner: &mut Inner, node: &Node) -> Result<(), BTreeError> {
        let mut block = vec![0u8; self.geometry.block_size];
        node.write_block(&mut block);
        self.write_block(inner, node.id, &block)
    }

    fn write_block(&self, inner: &mut Inner, id: NodeId, block: &[u8]) -> Result<(), BTreeError> {
        let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
        file.seek(SeekFrom::Start(
            u64::from(id) * self.geometry.block_size as u64,
        ))?;
        file.write_all(block)?;
        Ok(())
    }

    /// Allocate a node id, preferring a block from the free list.
    fn alloc_node(&self, inner: &mut Inner) -> Result<NodeId, BTreeError> {
        inner.header_dirty = true;
        if inner.free_head == 0 {
            inner.max_node_id += 1;
            return Ok(inner.max_node_id);
        }

        let id = inner.free_head;
        let mut block = vec![0u8; self.geometry.block_size];
        let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
        file.seek(SeekFrom::Start(
            u64::from(id) * self.geometry.block_size as u64,
        ))?;
        file.read_exact(&mut block)?;
        if block[0] != NodeType::Free as u8 {
            return Err(BTreeError::CorruptHeader(format!(
                "free list head {id} is not a free block"
            )));
        }
        inner.free_head = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        Ok(id)
    }

    /// Push a node's block onto the free list.
    fn free_node(&self, inner: &mut Inner, id: NodeId) -> Result<(), BTreeError> {
        let mut block = vec![0u8; self.geometry.block_size];
        block[0] = NodeType::Free as u8;
        block[4..8].copy_from_slice(&inner.free_head.to_le_bytes());
        self.write_block(inner, id, &block)?;
        inner.free_head = id;
        inner.header_dirty = true;
        Ok(())
    }

    // --- lookups --------------------------------------------------------

    /// Look up the record matching `key`, per the tree's comparator.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(BTreeError::Closed);
        }
        let mut node_id = inner.root_id;
        while node_id != 0 {
            let node = self.read_node(&mut inner, node_id)?;
            match node.search(&*self.comparator, key) {
                Ok(idx) => return Ok(Some(node.records[idx].clone())),
                Err(idx) => {
                    if node.is_leaf() {
                        break;
                    }
                    node_id = node.children[idx];
                }
            }
        }
        Ok(None)
    }

    /// Iterate over every record in the tree in comparator order.
    #[must_use]
    pub fn iterate_all(&self) -> RecordIterator<'_> {
        RecordIterator::new(self, None, None)
    }

    /// Iterate over the records between `min` and `max`, both inclusive and
    /// both optional. Bounds may be partial keys when the comparator
    /// supports prefix comparison.
    #[must_use]
    pub fn iterate_range(&self, min: Option<&[u8]>, max: Option<&[u8]>) -> RecordIterator<'_> {
        RecordIterator::new(self, min.map(<[u8]>::to_vec), max.map(<[u8]>::to_vec))
    }

    /// Read a node on behalf of an iterator.
    ///
    /// Concurrent mutation can leave an iterator holding the id of a node
    /// that has since been freed or never re-allocated; those read as
    /// `None` so the iterator can abandon the stale subtree instead of
    /// failing the scan.
    pub(crate) fn read_node_for_scan(&self, id: NodeId) -> Result<Option<Node>, BTreeError> {
        let mut inner = self.inner.lock();
        match self.read_node(&mut inner, id) {
            Ok(node) => Ok(Some(node)),
            Err(BTreeError::InvalidNodeId(_) | BTreeError::CorruptNode(NodeError::FreeBlock(_))) => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn root_for_scan(&self) -> Result<NodeId, BTreeError> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(BTreeError::Closed);
        }
        Ok(inner.root_id)
    }

    /// Overwrite the record at a position previously reported by an
    /// iterator. The index is clamped against the node's current record
    /// count, since a concurrent writer may have shrunk the node.
    pub(crate) fn replace_at(
        &self,
        node_id: NodeId,
        idx: usize,
        record: &[u8],
    ) -> Result<(), BTreeError> {
        self.check_record_len(record)?;
        let mut inner = self.inner.lock();
        let mut node = match self.read_node(&mut inner, node_id) {
            Ok(node) => node,
            Err(BTreeError::InvalidNodeId(_) | BTreeError::CorruptNode(NodeError::FreeBlock(_))) => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if node.records.is_empty() {
            return Ok(());
        }
        let idx = idx.min(node.records.len() - 1);
        node.records[idx] = record.to_vec();
        self.write_node(&mut inner, &node)?;
        self.sync_if_forced(&mut inner)
    }

    // --- mutation -------------------------------------------------------

    /// Insert `record`, replacing any record the comparator considers equal.
    ///
    /// Returns the replaced record, if there was one.
    pub fn insert(&self, record: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        self.check_record_len(record)?;
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(BTreeError::Closed);
        }

        if inner.root_id == 0 {
            let id = self.alloc_node(&mut inner)?;
            let mut root = Node::new_leaf(id);
            root.records.push(record.to_vec());
            self.write_node(&mut inner, &root)?;
            inner.root_id = id;
            inner.header_dirty = true;
            self.sync_if_forced(&mut inner)?;
            return Ok(None);
        }

        let root_id = inner.root_id;
        let (old, promoted) = self.insert_in_node(&mut inner, root_id, record)?;
        if let Some((median, right_id)) = promoted {
            let id = self.alloc_node(&mut inner)?;
            let root = Node::new_root(id, root_id, median, right_id);
            self.write_node(&mut inner, &root)?;
            inner.root_id = id;
            inner.header_dirty = true;
        }
        self.sync_if_forced(&mut inner)?;
        Ok(old)
    }

    fn insert_in_node(
        &self,
        inner: &mut Inner,
        node_id: NodeId,
        record: &[u8],
    ) -> Result<Insertion, BTreeError> {
        let mut node = self.read_node(inner, node_id)?;
        match node.search(&*self.comparator, record) {
            Ok(idx) => {
                let old = std::mem::replace(&mut node.records[idx], record.to_vec());
                self.write_node(inner, &node)?;
                Ok((Some(old), None))
            }
            Err(idx) => {
                if node.is_leaf() {
                    node.insert_record(idx, record.to_vec(), 0);
                } else {
                    let child = node.children[idx];
                    let (old, promoted) = self.insert_in_node(inner, child, record)?;
                    match promoted {
                        None => return Ok((old, None)),
                        Some((median, right_id)) => node.insert_record(idx, median, right_id),
                    }
                }

                if node.records.len() > self.geometry.max_records {
                    let right_id = self.alloc_node(inner)?;
                    let (median, right) = node.split(right_id);
                    // The new sibling must be durable before anything can
                    // point at it.
                    self.write_node(inner, &right)?;
                    self.write_node(inner, &node)?;
                    Ok((None, Some((median, right_id))))
                } else {
                    self.write_node(inner, &node)?;
                    Ok((None, None))
                }
            }
        }
    }

    /// Remove the record matching `key`, returning it if it was present.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(BTreeError::Closed);
        }
        if inner.root_id == 0 {
            return Ok(None);
        }

        let root_id = inner.root_id;
        let old = self.remove_from_node(&mut inner, root_id, key)?;

        let root = self.read_node(&mut inner, root_id)?;
        if root.is_empty() {
            // Shrink the tree: an empty leaf root means an empty tree; an
            // empty internal root has exactly one child, which becomes the
            // new root.
            inner.root_id = if root.is_leaf() { 0 } else { root.children[0] };
            self.free_node(&mut inner, root_id)?;
            inner.header_dirty = true;
        }
        self.sync_if_forced(&mut inner)?;
        Ok(old)
    }

    fn remove_from_node(
        &self,
        inner: &mut Inner,
        node_id: NodeId,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        let mut node = self.read_node(inner, node_id)?;
        match node.search(&*self.comparator, key) {
            Ok(idx) => {
                if node.is_leaf() {
                    let old = node.records.remove(idx);
                    self.write_node(inner, &node)?;
                    Ok(Some(old))
                } else {
                    // Replace the record with its in-order predecessor, the
                    // largest record of the left subtree, then rebalance the
                    // path that lost it.
                    let left_child = node.children[idx];
                    let predecessor = self.remove_largest(inner, left_child)?;
                    let old = std::mem::replace(&mut node.records[idx], predecessor);
                    self.write_node(inner, &node)?;
                    self.balance_child(inner, &mut node, idx)?;
                    Ok(Some(old))
                }
            }
            Err(idx) => {
                if node.is_leaf() {
                    return Ok(None);
                }
                let child = node.children[idx];
                let old = self.remove_from_node(inner, child, key)?;
                if old.is_some() {
                    self.balance_child(inner, &mut node, idx)?;
                }
                Ok(old)
            }
        }
    }

    fn remove_largest(&self, inner: &mut Inner, node_id: NodeId) -> Result<Vec<u8>, BTreeError> {
        let mut node = self.read_node(inner, node_id)?;
        if node.is_leaf() {
            let largest = node.records.pop().ok_or(BTreeError::EmptyNode(node_id))?;
            self.write_node(inner, &node)?;
            Ok(largest)
        } else {
            let last_idx = node.children.len() - 1;
            let child = node.children[last_idx];
            let largest = self.remove_largest(inner, child)?;
            self.balance_child(inner, &mut node, last_idx)?;
            Ok(largest)
        }
    }

    /// Restore the minimum-occupancy invariant of `parent`'s child at
    /// `child_idx` after a removal, by rotating a record in from a sibling
    /// or merging with one.
    fn balance_child(
        &self,
        inner: &mut Inner,
        parent: &mut Node,
        child_idx: usize,
    ) -> Result<(), BTreeError> {
        let mut child = self.read_node(inner, parent.children[child_idx])?;
        if child.records.len() >= self.geometry.min_records {
            return Ok(());
        }

        // Rotate from the right sibling if it has records to spare.
        if child_idx < parent.children.len() - 1 {
            let mut right = self.read_node(inner, parent.children[child_idx + 1])?;
            if right.records.len() > self.geometry.min_records {
                let separator =
                    std::mem::replace(&mut parent.records[child_idx], right.records.remove(0));
                child.records.push(separator);
                if !child.is_leaf() {
                    child.children.push(right.children.remove(0));
                }
                self.write_node(inner, &child)?;
                self.write_node(inner, &right)?;
                self.write_node(inner, parent)?;
                return Ok(());
            }
        }

        // Rotate from the left sibling.
        if child_idx > 0 {
            let mut left = self.read_node(inner, parent.children[child_idx - 1])?;
            if left.records.len() > self.geometry.min_records {
                let spare = left.records.remove(left.records.len() - 1);
                let separator = std::mem::replace(&mut parent.records[child_idx - 1], spare);
                child.records.insert(0, separator);
                if !child.is_leaf() {
                    let moved = left.children.remove(left.children.len() - 1);
                    child.children.insert(0, moved);
                }
                self.write_node(inner, &child)?;
                self.write_node(inner, &left)?;
                self.write_node(inner, parent)?;
                return Ok(());
            }
        }

        // Neither sibling can spare a record: merge with one.
        if child_idx < parent.children.len() - 1 {
            let right = self.read_node(inner, parent.children[child_idx + 1])?;
            let right_id = right.id;
            let separator = parent.remove_record_right(child_idx);
            child.merge_with_right(separator, right);
            self.write_node(inner, &child)?;
            self.write_node(inner, parent)?;
            self.free_node(inner, right_id)?;
        } else {
            let mut left = self.read_node(inner, parent.children[child_idx - 1])?;
            let child_id = child.id;
            let separator = parent.remove_record_right(child_idx - 1);
            left.merge_with_right(separator, child);
            self.write_node(inner, &left)?;
            self.write_node(inner, parent)?;
            self.free_node(inner, child_id)?;
        }
        Ok(())
    }

    // --- lifecycle ------------------------------------------------------

    /// Write the header back and, if the tree was opened with `force_sync`,
    /// flush the file to stable storage.
    pub fn sync(&self) -> Result<(), BTreeError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(BTreeError::Closed);
        }
        self.sync_inner(&mut inner)
    }

    fn sync_inner(&self, inner: &mut Inner) -> Result<(), BTreeError> {
        if inner.header_dirty {
            Self::write_header(inner, &self.geometry)?;
        }
        if self.force_sync {
            let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn sync_if_forced(&self, inner: &mut Inner) -> Result<(), BTreeError> {
        if self.force_sync {
            self.sync_inner(inner)?;
        }
        Ok(())
    }

    /// Discard every record, truncating the file back to its header.
    pub fn clear(&self) -> Result<(), BTreeError> {
        let mut inner = self.inner.lock();
        {
            let file = inner.file.as_mut().ok_or(BTreeError::Closed)?;
            file.set_len(self.geometry.block_size as u64)?;
        }
        inner.root_id = 0;
        inner.free_head = 0;
        inner.max_node_id = 0;
        inner.header_dirty = true;
        Self::write_header(&mut inner, &self.geometry)?;
        self.sync_if_forced(&mut inner)
    }

    /// Sync and close the tree. Every later operation fails with
    /// [`BTreeError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), BTreeError> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Ok(());
        }
        if inner.header_dirty {
            Self::write_header(&mut inner, &self.geometry)?;
        }
        if let Some(file) = inner.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("path", &self.path)
            .field("block_size", &self.geometry.block_size)
            .field("record_len", &self.geometry.record_len)
            .finish_non_exhaustive()
    }
}
