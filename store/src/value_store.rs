//! Interning of RDF terms to dense internal ids, backed by files on disk.
//!
//! Three files hold the mapping. Encoded terms live in an append-only
//! [`DataFile`]; the [`IdFile`] maps each dense id to the offset of its
//! entry; a [`HashIndex`] maps a CRC-32 of the encoded bytes back to
//! candidate ids, which are verified byte for byte before a match is
//! trusted.
//!
//! Entry encodings (integers big-endian):
//! - IRI: `0x01`, namespace entry id (4 bytes), local name (UTF-8)
//! - blank node: `0x02`, label (UTF-8)
//! - literal: `0x03`, datatype entry id (4 bytes, 0 for none), language
//!   length (1 byte), language tag, label (UTF-8)
//!
//! Namespaces and datatypes are interned as entries of their own and
//! referenced by id: a namespace as its raw UTF-8 bytes, a datatype as a
//! regular IRI entry.
//!
//! Lookups and stores take a read lock and may run concurrently; the
//! files below synchronize their own accesses. The check-then-append
//! intern path additionally holds an exclusive lock, since two racing
//! stores of the same new term would otherwise both miss the index and
//! intern it twice. [`ValueStore::clear`] takes the write lock and
//! replaces the store's [`Revision`], which invalidates every id any term
//! has cached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConfigError, StoreConfig};
use crate::locks::{ExclusiveLockManager, ReadWriteLockManager};
use crate::model::{BNode, Iri, Literal, Revision, Term, TermId};
use crate::storage::{
    BTreeError, DataFile, DataFileError, HashIndex, IdFile, IdFileError,
};

const IRI_MARKER: u8 = 1;
const BNODE_MARKER: u8 = 2;
const LITERAL_MARKER: u8 = 3;

const DATA_FILE_NAME: &str = "values.dat";
const ID_FILE_NAME: &str = "values.id";
const HASH_INDEX_NAME: &str = "values.hash";

/// Errors produced by value-store operations.
#[derive(Debug)]
pub enum ValueStoreError {
    Io(std::io::Error),
    Config(ConfigError),
    Data(DataFileError),
    Ids(IdFileError),
    Index(BTreeError),
    /// The id has never been handed out.
    InvalidId(TermId),
    /// The entry under the id is not an encoded term.
    NotATerm(TermId),
    /// A stored entry holds bytes that are not valid UTF-8.
    InvalidUtf8(TermId),
    /// A language tag longer than the format's 1-byte length field.
    LanguageTagTooLong(usize),
}

impl std::fmt::Display for ValueStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "value store i/o error: {err}"),
            Self::Config(err) => write!(f, "invalid configuration: {err}"),
            Self::Data(err) => write!(f, "value data file error: {err}"),
            Self::Ids(err) => write!(f, "value id file error: {err}"),
            Self::Index(err) => write!(f, "value hash index error: {err}"),
            Self::InvalidId(id) => write!(f, "no term is stored under id {id}"),
            Self::NotATerm(id) => write!(f, "entry {id} is not an encoded term"),
            Self::InvalidUtf8(id) => write!(f, "entry {id} holds malformed UTF-8"),
            Self::LanguageTagTooLong(len) => {
                write!(f, "language tag of {len} bytes exceeds the format limit of 255")
            }
        }
    }
}

impl std::error::Error for ValueStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Data(err) => Some(err),
            Self::Ids(err) => Some(err),
            Self::Index(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ValueStoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ConfigError> for ValueStoreError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<DataFileError> for ValueStoreError {
    fn from(err: DataFileError) -> Self {
        Self::Data(err)
    }
}

impl From<IdFileError> for ValueStoreError {
    fn from(err: IdFileError) -> Self {
        Self::Ids(err)
    }
}

impl From<BTreeError> for ValueStoreError {
    fn from(err: BTreeError) -> Self {
        Self::Index(err)
    }
}

/// The term-to-id interning store.
pub struct ValueStore {
    data_file: DataFile,
    id_file: IdFile,
    hash_index: HashIndex,
    lock_manager: ReadWriteLockManager,
    /// Serializes interning, so a term checked against the index and found
    /// missing is appended before any other store can race it in.
    intern_lock: ExclusiveLockManager,
    revision: Mutex<Arc<Revision>>,
    /// Namespace interning caches, in both directions.
    namespace_ids: Mutex<HashMap<String, TermId>>,
    namespaces: Mutex<HashMap<TermId, String>>,
}

impl ValueStore {
    /// Open the value store under `config.data_dir`, creating the files if
    /// they do not exist.
    pub fn open(config: &StoreConfig) -> Result<Self, ValueStoreError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let data_file = DataFile::open(config.data_dir.join(DATA_FILE_NAME), config.force_sync)?;
        let id_file = IdFile::open(config.data_dir.join(ID_FILE_NAME), config.force_sync)?;
        let hash_index = HashIndex::open(
            config.data_dir.join(HASH_INDEX_NAME),
            config.block_size,
            config.force_sync,
        )?;

        tracing::debug!(data_dir = %config.data_dir.display(), "opened value store");
        Ok(Self {
            data_file,
            id_file,
            hash_index,
            lock_manager: ReadWriteLockManager::new(),
            intern_lock: ExclusiveLockManager::new(),
            revision: Mutex::new(Revision::new()),
            namespace_ids: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
        })
    }

    /// The store's current revision.
    #[must_use]
    pub fn revision(&self) -> Arc<Revision> {
        Arc::clone(&self.revision.lock())
    }

    /// Fetch the term stored under `id`.
    pub fn get_term(&self, id: TermId) -> Result<Term, ValueStoreError> {
        let revision = self.revision();
        let mut lock = self.lock_manager.read_lock();
        let result = self.fetch_term(id, &revision);
        lock.release();
        result
    }

    /// Look up the id of `term` without creating one.
    ///
    /// Returns `None` when the term was never stored. A hit is memoized on
    /// the term's id cache under the current revision, so repeated lookups
    /// of the same term instance skip the disk entirely.
    pub fn get_id(&self, term: &Term) -> Result<Option<TermId>, ValueStoreError> {
        let revision = self.revision();
        if let Some(id) = term.id_cache().get(&revision) {
            return Ok(Some(id));
        }
        let mut lock = self.lock_manager.read_lock();
        let result = self.term_id(term, false, &revision);
        lock.release();
        result
    }

    /// Store `term`, returning its id. Storing a term that already exists
    /// returns the existing id.
    ///
    /// Concurrent stores are safe: the intern path is serialized
    /// internally, while lookups keep running alongside it.
    pub fn store_term(&self, term: &Term) -> Result<TermId, ValueStoreError> {
        let revision = self.revision();
        if let Some(id) = term.id_cache().get(&revision) {
            return Ok(id);
        }
        let mut read_lock = self.lock_manager.read_lock();
        let mut intern_lock = self.intern_lock.exclusive_lock();
        let result = self.term_id(term, true, &revision);
        intern_lock.release();
        read_lock.release();
        // With create set, `term_id` always produces an id.
        result?.ok_or(ValueStoreError::InvalidId(0))
    }

    /// Flush all three files to stable storage.
    pub fn sync(&self) -> Result<(), ValueStoreError> {
        self.data_file.sync()?;
        self.id_file.sync()?;
        self.hash_index.sync()?;
        Ok(())
    }

    /// Discard every stored term and start a fresh revision.
    ///
    /// Takes the write lock, so it waits for in-flight lookups and blocks
    /// new ones until done. Ids cached on terms under the old revision stop
    /// matching the moment the revision is replaced.
    pub fn clear(&self) -> Result<(), ValueStoreError> {
        let mut lock = self.lock_manager.write_lock();
        let result = self.clear_locked();
        lock.release();
        result
    }

    fn clear_locked(&self) -> Result<(), ValueStoreError> {
        self.data_file.clear()?;
        self.id_file.clear()?;
        self.hash_index.clear()?;
        self.namespace_ids.lock().clear();
        self.namespaces.lock().clear();
        *self.revision.lock() = Revision::new();
        tracing::info!("value store cleared, new revision installed");
        Ok(())
    }

    /// Sync and close the store. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), ValueStoreError> {
        self.data_file.close()?;
        self.id_file.close()?;
        self.hash_index.close()?;
        Ok(())
    }

    // --- resolution -----------------------------------------------------

    /// Read the raw entry bytes stored under `id`.
    fn read_entry(&self, id: TermId) -> Result<Vec<u8>, ValueStoreError> {
        let offset = self.id_file.get_offset(id).map_err(|err| match err {
            IdFileError::InvalidId(id) => ValueStoreError::InvalidId(id),
            other => other.into(),
        })?;
        Ok(self.data_file.get(offset)?)
    }

    /// Find the id of an encoded entry via the hash index, appending the
    /// entry as a new one if `create` is set and no id matches.
    ///
    /// Hash collisions make candidate ids suggestions only; each one's
    /// entry is compared byte for byte.
    fn find_or_store(&self, data: &[u8], create: bool) -> Result<Option<TermId>, ValueStoreError> {
        let hash = crc32fast::hash(data);
        let mut candidates = self.hash_index.get_ids(hash);
        while let Some(id) = candidates.next()? {
            if self.read_entry(id)? == data {
                return Ok(Some(id));
            }
        }
        if !create {
            return Ok(None);
        }

        let offset = self.data_file.store(data)?;
        let id = self.id_file.store_offset(offset)?;
        self.hash_index.store(hash, id)?;
        Ok(Some(id))
    }

    /// Resolve (and with `create`, intern) a term's id, memoizing it on the
    /// term's cache.
    fn term_id(
        &self,
        term: &Term,
        create: bool,
        revision: &Arc<Revision>,
    ) -> Result<Option<TermId>, ValueStoreError> {
        if let Term::Iri(iri) = term {
            return self.iri_id(iri, create, revision);
        }
        if let Some(id) = term.id_cache().get(revision) {
            return Ok(Some(id));
        }
        let Some(data) = self.encode_term(term, create, revision)? else {
            return Ok(None);
        };
        let Some(id) = self.find_or_store(&data, create)? else {
            return Ok(None);
        };
        term.id_cache().set(id, revision);
        Ok(Some(id))
    }

    /// [`Self::term_id`] for a bare IRI, so literal datatypes resolve
    /// against their own id cache rather than a clone's.
    fn iri_id(
        &self,
        iri: &Iri,
        create: bool,
        revision: &Arc<Revision>,
    ) -> Result<Option<TermId>, ValueStoreError> {
        if let Some(id) = iri.id_cache().get(revision) {
            return Ok(Some(id));
        }
        let Some(data) = self.encode_iri(iri, create)? else {
            return Ok(None);
        };
        let Some(id) = self.find_or_store(&data, create)? else {
            return Ok(None);
        };
        iri.id_cache().set(id, revision);
        Ok(Some(id))
    }

    fn namespace_id(
        &self,
        namespace: &str,
        create: bool,
    ) -> Result<Option<TermId>, ValueStoreError> {
        if let Some(id) = self.namespace_ids.lock().get(namespace) {
            return Ok(Some(*id));
        }
        let Some(id) = self.find_or_store(namespace.as_bytes(), create)? else {
            return Ok(None);
        };
        self.namespace_ids.lock().insert(namespace.to_owned(), id);
        self.namespaces.lock().insert(id, namespace.to_owned());
        Ok(Some(id))
    }

    fn namespace_by_id(&self, id: TermId) -> Result<String, ValueStoreError> {
        if let Some(namespace) = self.namespaces.lock().get(&id) {
            return Ok(namespace.clone());
        }
        let data = self.read_entry(id)?;
        let namespace =
            String::from_utf8(data).map_err(|_| ValueStoreError::InvalidUtf8(id))?;
        self.namespace_ids.lock().insert(namespace.clone(), id);
        self.namespaces.lock().insert(id, namespace.clone());
        Ok(namespace)
    }

    // --- encoding -------------------------------------------------------

    fn encode_term(
        &self,
        term: &Term,
        create: bool,
        revision: &Arc<Revision>,
    ) -> Result<Option<Vec<u8>>, ValueStoreError> {
        match term {
            Term::Iri(iri) => self.encode_iri(iri, create),
            Term::BNode(bnode) => {
                let label = bnode.label().as_bytes();
                let mut data = Vec::with_capacity(1 + label.len());
                data.push(BNODE_MARKER);
                data.extend_from_slice(label);
                Ok(Some(data))
            }
            Term::Literal(literal) => self.encode_literal(literal, create, revision),
        }
    }

    fn encode_iri(&self, iri: &Iri, create: bool) -> Result<Option<Vec<u8>>, ValueStoreError> {
        let Some(namespace_id) = self.namespace_id(iri.namespace(), create)? else {
            return Ok(None);
        };
        let local = iri.local_name().as_bytes();
        let mut data = Vec::with_capacity(5 + local.len());
        data.push(IRI_MARKER);
        data.extend_from_slice(&namespace_id.to_be_bytes());
        data.extend_from_slice(local);
        Ok(Some(data))
    }

    fn encode_literal(
        &self,
        literal: &Literal,
        create: bool,
        revision: &Arc<Revision>,
    ) -> Result<Option<Vec<u8>>, ValueStoreError> {
        let datatype_id = match literal.datatype() {
            None => 0,
            Some(datatype) => match self.iri_id(datatype, create, revision)? {
                None => return Ok(None),
                Some(id) => id,
            },
        };
        let language = literal.language().unwrap_or("");
        let language_len = u8::try_from(language.len())
            .map_err(|_| ValueStoreError::LanguageTagTooLong(language.len()))?;

        let label = literal.label().as_bytes();
        let mut data = Vec::with_capacity(6 + language.len() + label.len());
        data.push(LITERAL_MARKER);
        data.extend_from_slice(&datatype_id.to_be_bytes());
        data.push(language_len);
        data.extend_from_slice(language.as_bytes());
        data.extend_from_slice(label);
        Ok(Some(data))
    }

    // --- decoding -------------------------------------------------------

    fn fetch_term(&self, id: TermId, revision: &Arc<Revision>) -> Result<Term, ValueStoreError> {
        let data = self.read_entry(id)?;
        let term = self.decode_term(id, &data, revision)?;
        term.id_cache().set(id, revision);
        Ok(term)
    }

    fn decode_term(
        &self,
        id: TermId,
        data: &[u8],
        revision: &Arc<Revision>,
    ) -> Result<Term, ValueStoreError> {
        let utf8 = |bytes: &[u8]| -> Result<String, ValueStoreError> {
            std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| ValueStoreError::InvalidUtf8(id))
        };

        match data.first() {
            Some(&IRI_MARKER) if data.len() >= 5 => {
                let namespace_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
                let namespace = self.namespace_by_id(namespace_id)?;
                let local_name = utf8(&data[5..])?;
                Ok(Term::Iri(Iri::from_parts(namespace, local_name)))
            }
            Some(&BNODE_MARKER) => Ok(Term::BNode(BNode::new(utf8(&data[1..])?))),
            Some(&LITERAL_MARKER) if data.len() >= 6 => {
                let datatype_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
                let language_len = usize::from(data[5]);
                if data.len() < 6 + language_len {
                    return Err(ValueStoreError::NotATerm(id));
                }
                let language = utf8(&data[6..6 + language_len])?;
                let label = utf8(&data[6 + language_len..])?;

                let literal = if language.is_empty() {
                    if datatype_id == 0 {
                        Literal::plain(label)
                    } else {
                        let Term::Iri(datatype) = self.fetch_term(datatype_id, revision)? else {
                            return Err(ValueStoreError::NotATerm(datatype_id));
                        };
                        Literal::typed(label, datatype)
                    }
                } else {
                    Literal::tagged(label, language)
                };
                Ok(Term::Literal(literal))
            }
            _ => Err(ValueStoreError::NotATerm(id)),
        }
    }
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("data_file", &self.data_file)
            .field("id_file", &self.id_file)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &std::path::Path) -> ValueStore {
        ValueStore::open(&StoreConfig::new(dir).with_block_size(256)).expect("open value store")
    }

    #[test]
    fn test_roundtrips_every_term_kind() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let terms: Vec<Term> = vec![
            Iri::new("http://example.org/vocab#name").into(),
            BNode::new("node1").into(),
            Literal::plain("hello").into(),
            Literal::tagged("hallo", "de").into(),
            Literal::typed("42", Iri::new("http://www.w3.org/2001/XMLSchema#int")).into(),
        ];

        for term in &terms {
            let id = store.store_term(term).expect("store term");
            let fetched = store.get_term(id).expect("get term");
            assert_eq!(&fetched, term);
            assert_eq!(store.get_id(term).expect("get id"), Some(id));
        }
    }

    #[test]
    fn test_storing_twice_returns_same_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let first: Term = Iri::new("http://example.org/a").into();
        // A separate instance with its own empty id cache.
        let second: Term = Iri::new("http://example.org/a").into();

        let id = store.store_term(&first).expect("store term");
        assert_eq!(store.store_term(&second).expect("store again"), id);
    }

    #[test]
    fn test_distinct_terms_get_distinct_ids() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        // Same label everywhere, different term kinds and qualifiers.
        let terms: Vec<Term> = vec![
            Literal::plain("x").into(),
            Literal::tagged("x", "en").into(),
            Literal::tagged("x", "de").into(),
            Literal::typed("x", Iri::new("http://example.org/dt")).into(),
            BNode::new("x").into(),
        ];

        let mut ids = Vec::new();
        for term in &terms {
            ids.push(store.store_term(term).expect("store term"));
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), terms.len());
    }

    #[test]
    fn test_get_id_returns_none_for_unknown_terms() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        store
            .store_term(&Iri::new("http://example.org/known").into())
            .expect("store term");

        let unknown: Term = Iri::new("http://example.org/unknown").into();
        assert_eq!(store.get_id(&unknown).expect("get id"), None);

        // A term whose namespace was never interned short-circuits without
        // touching the index.
        let foreign: Term = Iri::new("http://elsewhere.example/x").into();
        assert_eq!(store.get_id(&foreign).expect("get id"), None);
    }

    #[test]
    fn test_get_term_rejects_unknown_id() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        assert!(matches!(
            store.get_term(99),
            Err(ValueStoreError::InvalidId(99))
        ));
    }

    #[test]
    fn test_datatype_is_interned_as_its_own_term() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let datatype = Iri::new("http://www.w3.org/2001/XMLSchema#int");
        let literal: Term = Literal::typed("1", datatype.clone()).into();
        store.store_term(&literal).expect("store literal");

        // The datatype IRI must be resolvable as a term in its own right.
        let datatype_term: Term = datatype.into();
        let datatype_id = store.get_id(&datatype_term).expect("get id");
        assert!(datatype_id.is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let terms: Vec<Term> = vec![
            Iri::new("http://example.org/vocab#p").into(),
            Literal::tagged("bonjour", "fr").into(),
        ];

        let ids: Vec<TermId> = {
            let store = open_store(dir.path());
            let ids = terms
                .iter()
                .map(|term| store.store_term(term).expect("store term"))
                .collect();
            store.close().expect("close");
            ids
        };

        let store = open_store(dir.path());
        for (term, id) in terms.iter().zip(&ids) {
            assert_eq!(&store.get_term(*id).expect("get term"), term);
            // Terms carry caches stamped by the old store's revision; the
            // new store must not trust them.
            assert_eq!(store.get_id(term).expect("get id"), Some(*id));
        }
    }

    #[test]
    fn test_clear_starts_a_fresh_revision() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let term: Term = Iri::new("http://example.org/a").into();
        let id = store.store_term(&term).expect("store term");
        let old_revision = store.revision();

        store.clear().expect("clear");

        assert!(!old_revision.same_as(&store.revision()));
        // The cached id on `term` is stamped with the old revision and must
        // be ignored; the store itself is empty.
        assert_eq!(store.get_id(&term).expect("get id"), None);
        assert!(matches!(
            store.get_term(id),
            Err(ValueStoreError::InvalidId(_))
        ));

        // The store stays usable, and ids restart from the bottom.
        let new_id = store.store_term(&term).expect("store term");
        assert_eq!(store.get_id(&term).expect("get id"), Some(new_id));
    }

    #[test]
    fn test_shared_namespace_is_interned_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let a = store
            .store_term(&Iri::new("http://example.org/vocab#a").into())
            .expect("store term");
        let b = store
            .store_term(&Iri::new("http://example.org/vocab#b").into())
            .expect("store term");

        // Two terms plus one shared namespace entry.
        assert_ne!(a, b);
        assert_eq!(store.id_file.max_id().expect("max id"), 3);
    }

    #[test]
    fn test_racing_stores_agree_on_one_id() {
        use std::thread;

        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(open_store(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                // Fresh instances per thread, so nothing is served from a
                // term's id cache.
                let term: Term = Iri::new("http://example.org/contended").into();
                store.store_term(&term).expect("store term")
            }));
        }

        let ids: Vec<TermId> = handles
            .into_iter()
            .map(|handle| handle.join().expect("store thread panicked"))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_rejects_oversized_language_tag() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open_store(dir.path());

        let literal: Term = Literal::tagged("x", "y".repeat(300)).into();
        assert!(matches!(
            store.store_term(&literal),
            Err(ValueStoreError::LanguageTagTooLong(300))
        ));
    }
}
