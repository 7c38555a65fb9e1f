//! RDF terms and the store revision they cache their ids against.

use std::sync::Arc;

use parking_lot::Mutex;

/// The internal id of a stored term. Ids are dense, starting at 1; 0 is
/// never a valid id.
pub type TermId = u32;

/// A store generation token.
///
/// Every value store holds a current revision and stamps it into the id
/// caches of the terms it resolves. Revisions carry no data; two revisions
/// are the same only if they are the same allocation, so replacing the
/// store's revision (on [`clear`](crate::ValueStore::clear)) instantly
/// invalidates every id cached under the old one without touching the
/// terms.
#[derive(Debug)]
pub struct Revision(());

impl Revision {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(()))
    }

    /// Whether two revision handles denote the same store generation.
    #[must_use]
    pub fn same_as(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, other)
    }
}

/// A term's memoized internal id, valid only for the revision it was
/// stamped with.
#[derive(Default)]
pub struct IdCache {
    cached: Mutex<Option<CachedId>>,
}

struct CachedId {
    id: TermId,
    revision: Arc<Revision>,
}

impl IdCache {
    /// The cached id, if one was stored under `revision` (by identity).
    pub(crate) fn get(&self, revision: &Arc<Revision>) -> Option<TermId> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|entry| entry.revision.same_as(revision))
            .map(|entry| entry.id)
    }

    pub(crate) fn set(&self, id: TermId, revision: &Arc<Revision>) {
        *self.cached.lock() = Some(CachedId {
            id,
            revision: Arc::clone(revision),
        });
    }
}

impl Clone for IdCache {
    fn clone(&self) -> Self {
        let cached = self.cached.lock();
        Self {
            cached: Mutex::new(cached.as_ref().map(|entry| CachedId {
                id: entry.id,
                revision: Arc::clone(&entry.revision),
            })),
        }
    }
}

impl std::fmt::Debug for IdCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached = self.cached.lock();
        f.debug_struct("IdCache")
            .field("id", &cached.as_ref().map(|entry| entry.id))
            .finish()
    }
}

/// An IRI, split into a namespace and a local name.
///
/// The split happens at the first `#`, or failing that after the last `/`
/// or `:`. Equality and hashing consider only the two string parts; the id
/// cache rides along invisibly.
#[derive(Debug, Clone, Default)]
pub struct Iri {
    namespace: String,
    local_name: String,
    id_cache: IdCache,
}

impl Iri {
    /// Build an IRI from its full string form.
    #[must_use]
    pub fn new(iri: impl Into<String>) -> Self {
        let iri = iri.into();
        let split_at = Self::local_name_index(&iri);
        let (namespace, local_name) = iri.split_at(split_at);
        Self {
            namespace: namespace.to_owned(),
            local_name: local_name.to_owned(),
            id_cache: IdCache::default(),
        }
    }

    /// Build an IRI from an already-split namespace and local name.
    #[must_use]
    pub fn from_parts(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
            id_cache: IdCache::default(),
        }
    }

    /// Index of the first local-name byte. An IRI with no separator at all
    /// is treated as pure namespace.
    fn local_name_index(iri: &str) -> usize {
        if let Some(idx) = iri.find('#') {
            return idx + 1;
        }
        if let Some(idx) = iri.rfind('/') {
            return idx + 1;
        }
        if let Some(idx) = iri.rfind(':') {
            return idx + 1;
        }
        iri.len()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub(crate) const fn id_cache(&self) -> &IdCache {
        &self.id_cache
    }
}

impl PartialEq for Iri {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.local_name == other.local_name
    }
}

impl Eq for Iri {}

impl std::hash::Hash for Iri {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.local_name.hash(state);
    }
}

impl std::fmt::Display for Iri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.namespace, self.local_name)
    }
}

/// A blank node, identified by its label.
#[derive(Debug, Clone, Default)]
pub struct BNode {
    label: String,
    id_cache: IdCache,
}

impl BNode {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            id_cache: IdCache::default(),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) const fn id_cache(&self) -> &IdCache {
        &self.id_cache
    }
}

impl PartialEq for BNode {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl Eq for BNode {}

impl std::hash::Hash for BNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.label.hash(state);
    }
}

impl std::fmt::Display for BNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "_:{}", self.label)
    }
}

/// A literal: a label with an optional language tag or datatype.
///
/// A literal has at most one of the two qualifiers; a language-tagged
/// literal has no explicit datatype.
#[derive(Debug, Clone, Default)]
pub struct Literal {
    label: String,
    language: Option<String>,
    datatype: Option<Iri>,
    id_cache: IdCache,
}

impl Literal {
    /// A plain literal with neither language nor datatype.
    #[must_use]
    pub fn plain(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// A language-tagged literal.
    #[must_use]
    pub fn tagged(label: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            language: Some(language.into()),
            ..Self::default()
        }
    }

    /// A literal with an explicit datatype.
    #[must_use]
    pub fn typed(label: impl Into<String>, datatype: Iri) -> Self {
        Self {
            label: label.into(),
            datatype: Some(datatype),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    #[must_use]
    pub const fn datatype(&self) -> Option<&Iri> {
        self.datatype.as_ref()
    }

    pub(crate) const fn id_cache(&self) -> &IdCache {
        &self.id_cache
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.language == other.language
            && self.datatype == other.datatype
    }
}

impl Eq for Literal {}

impl std::hash::Hash for Literal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.label.hash(state);
        self.language.hash(state);
        self.datatype.hash(state);
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.label)?;
        if let Some(language) = &self.language {
            write!(f, "@{language}")?;
        }
        if let Some(datatype) = &self.datatype {
            write!(f, "^^<{datatype}>")?;
        }
        Ok(())
    }
}

/// Any RDF term the store can intern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Iri(Iri),
    BNode(BNode),
    Literal(Literal),
}

impl Term {
    pub(crate) const fn id_cache(&self) -> &IdCache {
        match self {
            Self::Iri(iri) => iri.id_cache(),
            Self::BNode(bnode) => bnode.id_cache(),
            Self::Literal(literal) => literal.id_cache(),
        }
    }
}

impl From<Iri> for Term {
    fn from(iri: Iri) -> Self {
        Self::Iri(iri)
    }
}

impl From<BNode> for Term {
    fn from(bnode: BNode) -> Self {
        Self::BNode(bnode)
    }
}

impl From<Literal> for Term {
    fn from(literal: Literal) -> Self {
        Self::Literal(literal)
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iri(iri) => write!(f, "{iri}"),
            Self::BNode(bnode) => write!(f, "{bnode}"),
            Self::Literal(literal) => write!(f, "{literal}"),
        }
    }
}
