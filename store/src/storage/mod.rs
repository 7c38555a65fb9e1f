//! On-disk storage primitives.
//!
//! Three building blocks live here:
//!
//! - [`btree`]: a B-tree of fixed-length records with a pluggable ordering
//! - [`data_file`] / [`id_file`]: an append-only heap of variable-length
//!   values plus the dense id-to-offset map over it
//! - [`hash_index`]: a hash-to-id index built on the B-tree
//!
//! None of these perform logical concurrency control; see [`crate::locks`].

pub mod btree;
pub mod data_file;
pub mod hash_index;
pub mod id_file;

pub use btree::{BTree, BTreeError, DefaultRecordComparator, RecordComparator, RecordIterator};
pub use data_file::{DataFile, DataFileError};
pub use hash_index::{HashIndex, IdIterator};
pub use id_file::{IdFile, IdFileError};
