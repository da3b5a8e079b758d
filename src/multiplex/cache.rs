//! # Document Cache
//!
//! Keyed stores backing the caching observer: an unordered id map and an
//! ordered dictionary with "insert before" / "move before" positioning.

use std::collections::{BTreeMap, HashMap};

use super::errors::{MultiplexError, MultiplexResult};
use super::event::{Document, DocumentId};

/// Unordered id → document map.
///
/// Iterates in id order so replays are reproducible.
#[derive(Debug, Default, Clone)]
pub struct IdMap {
    docs: BTreeMap<DocumentId, Document>,
}

impl IdMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot stored under `id`
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.docs.get(id)
    }

    /// Mutable snapshot under `id`
    pub fn get_mut(&mut self, id: &DocumentId) -> Option<&mut Document> {
        self.docs.get_mut(id)
    }

    /// Insert or replace a document
    pub fn set(&mut self, id: DocumentId, doc: Document) {
        self.docs.insert(id, doc);
    }

    /// Remove and return the snapshot, if present
    pub fn remove(&mut self, id: &DocumentId) -> Option<Document> {
        self.docs.remove(id)
    }

    /// Whether `id` is cached
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.docs.contains_key(id)
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Iterate in id order
    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &Document)> {
        self.docs.iter()
    }
}

#[derive(Debug, Clone)]
struct Node {
    doc: Document,
    prev: Option<DocumentId>,
    next: Option<DocumentId>,
}

/// Ordered dictionary: a doubly linked sequence of ids over a hash map.
///
/// `before = None` always means "at the end".
#[derive(Debug, Default, Clone)]
pub struct OrderedDict {
    nodes: HashMap<DocumentId, Node>,
    head: Option<DocumentId>,
    tail: Option<DocumentId>,
}

impl OrderedDict {
    /// Empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot stored under `id`
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.nodes.get(id).map(|n| &n.doc)
    }

    /// Mutable snapshot under `id`
    pub fn get_mut(&mut self, id: &DocumentId) -> Option<&mut Document> {
        self.nodes.get_mut(id).map(|n| &mut n.doc)
    }

    /// Whether `id` is in the sequence
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the sequence is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `id` immediately before `before`, or at the end
    pub fn put_before(
        &mut self,
        id: DocumentId,
        doc: Document,
        before: Option<&DocumentId>,
    ) -> MultiplexResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(MultiplexError::protocol(format!(
                "Item {} already present in OrderedDict",
                id
            )));
        }
        self.check_before(before)?;

        self.nodes.insert(
            id.clone(),
            Node {
                doc,
                prev: None,
                next: None,
            },
        );
        self.link_before(&id, before);
        Ok(())
    }

    /// Move `id` immediately before `before`, or to the end
    pub fn move_before(
        &mut self,
        id: &DocumentId,
        before: Option<&DocumentId>,
    ) -> MultiplexResult<()> {
        let current_next = match self.nodes.get(id) {
            Some(node) => node.next.clone(),
            None => {
                return Err(MultiplexError::protocol(format!(
                    "Item {} not present in OrderedDict",
                    id
                )))
            }
        };
        if before == Some(id) {
            return Err(MultiplexError::protocol(format!(
                "Cannot move {} before itself",
                id
            )));
        }
        self.check_before(before)?;

        // Already in place
        if current_next.as_ref() == before {
            return Ok(());
        }

        self.unlink(id);
        self.link_before(id, before);
        Ok(())
    }

    /// Unlink and return the snapshot; absent ids are an error
    pub fn remove(&mut self, id: &DocumentId) -> MultiplexResult<Document> {
        if !self.nodes.contains_key(id) {
            return Err(MultiplexError::protocol(format!(
                "Item {} not present in OrderedDict",
                id
            )));
        }
        self.unlink(id);
        self.nodes
            .remove(id)
            .map(|n| n.doc)
            .ok_or_else(|| MultiplexError::internal("OrderedDict node vanished"))
    }

    /// Iterate in sequence order
    pub fn iter(&self) -> OrderedIter<'_> {
        OrderedIter {
            dict: self,
            cursor: self.head.as_ref(),
        }
    }

    fn check_before(&self, before: Option<&DocumentId>) -> MultiplexResult<()> {
        match before {
            Some(b) if !self.nodes.contains_key(b) => Err(MultiplexError::protocol(format!(
                "Could not find item {} to put this one before",
                b
            ))),
            _ => Ok(()),
        }
    }

    // Node for `id` must exist and be detached from the list.
    fn link_before(&mut self, id: &DocumentId, before: Option<&DocumentId>) {
        let prev = match before {
            Some(b) => self.nodes.get(b).and_then(|n| n.prev.clone()),
            None => self.tail.clone(),
        };

        if let Some(node) = self.nodes.get_mut(id) {
            node.prev = prev.clone();
            node.next = before.cloned();
        }

        match &prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(p) {
                    node.next = Some(id.clone());
                }
            }
            None => self.head = Some(id.clone()),
        }

        match before {
            Some(b) => {
                if let Some(node) = self.nodes.get_mut(b) {
                    node.prev = Some(id.clone());
                }
            }
            None => self.tail = Some(id.clone()),
        }
    }

    fn unlink(&mut self, id: &DocumentId) {
        let (prev, next) = match self.nodes.get_mut(id) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };

        match &prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(p) {
                    node.next = next.clone();
                }
            }
            None => self.head = next.clone(),
        }

        match &next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

/// Sequence-order iterator over an [`OrderedDict`]
pub struct OrderedIter<'a> {
    dict: &'a OrderedDict,
    cursor: Option<&'a DocumentId>,
}

impl<'a> Iterator for OrderedIter<'a> {
    type Item = (&'a DocumentId, &'a Document);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let (key, node) = self.dict.nodes.get_key_value(id)?;
        self.cursor = node.next.as_ref();
        Some((key, &node.doc))
    }
}

/// The observer's cache, fixed to one mode for its whole life
#[derive(Debug, Clone)]
pub enum DocumentCache {
    Unordered(IdMap),
    Ordered(OrderedDict),
}

impl DocumentCache {
    /// Empty cache for the given mode
    pub fn new(ordered: bool) -> Self {
        if ordered {
            DocumentCache::Ordered(OrderedDict::new())
        } else {
            DocumentCache::Unordered(IdMap::new())
        }
    }

    /// Whether entries carry a position
    pub fn is_ordered(&self) -> bool {
        matches!(self, DocumentCache::Ordered(_))
    }

    /// Snapshot stored under `id`
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        match self {
            DocumentCache::Unordered(map) => map.get(id),
            DocumentCache::Ordered(dict) => dict.get(id),
        }
    }

    /// Mutable snapshot; only the observer mutates
    pub(crate) fn get_mut(&mut self, id: &DocumentId) -> Option<&mut Document> {
        match self {
            DocumentCache::Unordered(map) => map.get_mut(id),
            DocumentCache::Ordered(dict) => dict.get_mut(id),
        }
    }

    /// Whether `id` is cached
    pub fn contains(&self, id: &DocumentId) -> bool {
        match self {
            DocumentCache::Unordered(map) => map.contains(id),
            DocumentCache::Ordered(dict) => dict.contains(id),
        }
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        match self {
            DocumentCache::Unordered(map) => map.len(),
            DocumentCache::Ordered(dict) => dict.len(),
        }
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate in cache order
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&DocumentId, &Document)> + '_> {
        match self {
            DocumentCache::Unordered(map) => Box::new(map.iter()),
            DocumentCache::Ordered(dict) => Box::new(dict.iter()),
        }
    }

    /// Deep copy of every entry, in cache order
    pub fn to_vec(&self) -> Vec<(DocumentId, Document)> {
        self.iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect()
    }
}
