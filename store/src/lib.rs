//! Native storage core for an RDF store.
//!
//! The crate provides the indexing and concurrency building blocks a triple
//! store is assembled from:
//!
//! - [`storage::btree`]: an on-disk B-tree of fixed-length records with a
//!   pluggable ordering and free-block reuse
//! - [`storage::hash_index`] with [`storage::data_file`] /
//!   [`storage::id_file`]: the files behind value interning
//! - [`ValueStore`]: maps RDF terms ([`model::Term`]) to dense internal ids
//!   and back, with revision-scoped id caching
//! - [`locks`]: the blocking lock managers that impose the store's
//!   reader/writer discipline
//!
//! # Example
//!
//! ```no_run
//! use store::{StoreConfig, ValueStore};
//! use store::model::{Iri, Term};
//!
//! # fn main() -> Result<(), store::ValueStoreError> {
//! let store = ValueStore::open(&StoreConfig::new("/var/lib/rdf"))?;
//! let term: Term = Iri::new("http://example.org/vocab#name").into();
//! let id = store.store_term(&term)?;
//! assert_eq!(store.get_term(id)?, term);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod locks;
pub mod model;
pub mod storage;
pub mod value_store;

pub use config::{ConfigError, StoreConfig};
pub use model::{Revision, Term, TermId};
pub use value_store::{ValueStore, ValueStoreError};
