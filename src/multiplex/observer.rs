//! # Caching Change Observer
//!
//! Receives change callbacks and keeps the canonical cached snapshot up to
//! date. Optional hooks run immediately before each mutation and see the
//! cache as it was.

use super::cache::DocumentCache;
use super::errors::{MultiplexError, MultiplexResult};
use super::event::{apply_delta, ChangeEvent, Document, DocumentId, FieldDelta, OrderingMode};

type AddedHook = Box<dyn Fn(&DocumentCache, &DocumentId, &Document) + Send>;
type AddedBeforeHook =
    Box<dyn Fn(&DocumentCache, &DocumentId, &Document, Option<&DocumentId>) + Send>;
type ChangedHook = Box<dyn Fn(&DocumentCache, &DocumentId, FieldDelta) + Send>;
type MovedBeforeHook = Box<dyn Fn(&DocumentCache, &DocumentId, Option<&DocumentId>) + Send>;
type RemovedHook = Box<dyn Fn(&DocumentCache, &DocumentId) + Send>;

/// Pre-update hooks, one per event kind
pub struct ObserverHooks {
    ordered: bool,
    added: Option<AddedHook>,
    added_before: Option<AddedBeforeHook>,
    changed: Option<ChangedHook>,
    moved_before: Option<MovedBeforeHook>,
    removed: Option<RemovedHook>,
}

impl ObserverHooks {
    fn empty(ordered: bool) -> Self {
        Self {
            ordered,
            added: None,
            added_before: None,
            changed: None,
            moved_before: None,
            removed: None,
        }
    }

    /// Hooks for an ordered observer
    pub fn ordered() -> Self {
        Self::empty(true)
    }

    /// Hooks for an unordered observer
    pub fn unordered() -> Self {
        Self::empty(false)
    }

    /// Mode these hooks were built for
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Runs before an insert
    pub fn on_added<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentCache, &DocumentId, &Document) + Send + 'static,
    {
        self.added = Some(Box::new(f));
        self
    }

    /// Runs before a positioned insert
    pub fn on_added_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentCache, &DocumentId, &Document, Option<&DocumentId>) + Send + 'static,
    {
        self.added_before = Some(Box::new(f));
        self
    }

    /// Runs before a delta is merged, with its own copy of the delta
    pub fn on_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentCache, &DocumentId, FieldDelta) + Send + 'static,
    {
        self.changed = Some(Box::new(f));
        self
    }

    /// Runs before a reposition
    pub fn on_moved_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentCache, &DocumentId, Option<&DocumentId>) + Send + 'static,
    {
        self.moved_before = Some(Box::new(f));
        self
    }

    /// Runs before a deletion
    pub fn on_removed<F>(mut self, f: F) -> Self
    where
        F: Fn(&DocumentCache, &DocumentId) + Send + 'static,
    {
        self.removed = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ObserverHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHooks")
            .field("ordered", &self.ordered)
            .field("added", &self.added.is_some())
            .field("added_before", &self.added_before.is_some())
            .field("changed", &self.changed.is_some())
            .field("moved_before", &self.moved_before.is_some())
            .field("removed", &self.removed.is_some())
            .finish()
    }
}

/// Construction options for [`CachingChangeObserver`]
#[derive(Debug, Default)]
pub struct ObserverOptions {
    pub ordered: Option<bool>,
    pub hooks: Option<ObserverHooks>,
}

impl ObserverOptions {
    /// Options for a mode without hooks
    pub fn with_mode(mode: OrderingMode) -> Self {
        Self {
            ordered: Some(mode.is_ordered()),
            hooks: None,
        }
    }

    /// Options taking the mode from `hooks`
    pub fn with_hooks(hooks: ObserverHooks) -> Self {
        Self {
            ordered: None,
            hooks: Some(hooks),
        }
    }
}

/// Keeps the cached document set current
#[derive(Debug)]
pub struct CachingChangeObserver {
    mode: OrderingMode,
    docs: DocumentCache,
    hooks: ObserverHooks,
}

impl CachingChangeObserver {
    /// Create an observer; the mode comes from `ordered`, the hooks, or both
    /// when they agree.
    pub fn new(options: ObserverOptions) -> MultiplexResult<Self> {
        let ordered = match (options.ordered, &options.hooks) {
            (Some(ordered), Some(hooks)) if ordered != hooks.ordered => {
                return Err(MultiplexError::config("ordered option doesn't match hooks"))
            }
            (Some(ordered), _) => ordered,
            (None, Some(hooks)) => hooks.ordered,
            (None, None) => return Err(MultiplexError::config("must provide ordered or hooks")),
        };

        Ok(Self {
            mode: OrderingMode::from_ordered(ordered),
            docs: DocumentCache::new(ordered),
            hooks: options
                .hooks
                .unwrap_or_else(|| ObserverHooks::empty(ordered)),
        })
    }

    /// Ordering mode of the cache
    pub fn mode(&self) -> OrderingMode {
        self.mode
    }

    /// Read-only view of the cache
    pub fn docs(&self) -> &DocumentCache {
        &self.docs
    }

    /// Apply one event by kind
    pub fn apply(&mut self, event: &ChangeEvent) -> MultiplexResult<()> {
        match event {
            ChangeEvent::Added { id, fields } => self.added(id, fields),
            ChangeEvent::AddedBefore { id, fields, before } => {
                self.added_before(id, fields, before.as_ref())
            }
            ChangeEvent::Changed { id, delta } => self.changed(id, delta),
            ChangeEvent::MovedBefore { id, before } => self.moved_before(id, before.as_ref()),
            ChangeEvent::Removed { id } => self.removed(id),
        }
    }

    /// Insert a document. In ordered mode it goes at the end; in unordered
    /// mode an existing id is overwritten.
    pub fn added(&mut self, id: &DocumentId, fields: &Document) -> MultiplexResult<()> {
        if self.mode.is_ordered() {
            return self.added_before(id, fields, None);
        }

        let doc = fields.clone();
        if let Some(hook) = &self.hooks.added {
            hook(&self.docs, id, fields);
        }
        match &mut self.docs {
            DocumentCache::Unordered(map) => {
                map.set(id.clone(), doc);
                Ok(())
            }
            DocumentCache::Ordered(_) => {
                Err(MultiplexError::internal("cache mode drifted from observer mode"))
            }
        }
    }

    /// Insert a document immediately before `before`, or at the end
    pub fn added_before(
        &mut self,
        id: &DocumentId,
        fields: &Document,
        before: Option<&DocumentId>,
    ) -> MultiplexResult<()> {
        if !self.mode.is_ordered() {
            return Err(MultiplexError::protocol(
                "addedBefore is only valid for an ordered observer",
            ));
        }
        if self.docs.contains(id) {
            return Err(MultiplexError::protocol(format!(
                "Duplicate id for addedBefore: {}",
                id
            )));
        }
        if let Some(b) = before {
            if !self.docs.contains(b) {
                return Err(MultiplexError::protocol(format!(
                    "Unknown before id for addedBefore: {}",
                    b
                )));
            }
        }

        let doc = fields.clone();
        if let Some(hook) = &self.hooks.added_before {
            hook(&self.docs, id, fields, before);
        }
        if let Some(hook) = &self.hooks.added {
            hook(&self.docs, id, fields);
        }
        match &mut self.docs {
            DocumentCache::Ordered(dict) => dict.put_before(id.clone(), doc, before),
            DocumentCache::Unordered(_) => {
                Err(MultiplexError::internal("cache mode drifted from observer mode"))
            }
        }
    }

    /// Merge a delta into an existing document
    pub fn changed(&mut self, id: &DocumentId, delta: &FieldDelta) -> MultiplexResult<()> {
        if !self.docs.contains(id) {
            return Err(MultiplexError::protocol(format!(
                "Unknown id for changed: {}",
                id
            )));
        }
        if let Some(hook) = &self.hooks.changed {
            hook(&self.docs, id, delta.clone());
        }
        let doc = self
            .docs
            .get_mut(id)
            .ok_or_else(|| MultiplexError::protocol(format!("Unknown id for changed: {}", id)))?;
        apply_delta(doc, delta);
        Ok(())
    }

    /// Reposition a document (ordered mode only)
    pub fn moved_before(
        &mut self,
        id: &DocumentId,
        before: Option<&DocumentId>,
    ) -> MultiplexResult<()> {
        if !self.mode.is_ordered() {
            return Err(MultiplexError::protocol(
                "movedBefore is only valid for an ordered observer",
            ));
        }
        if !self.docs.contains(id) {
            return Err(MultiplexError::protocol(format!(
                "Unknown id for movedBefore: {}",
                id
            )));
        }
        if let Some(hook) = &self.hooks.moved_before {
            hook(&self.docs, id, before);
        }
        match &mut self.docs {
            DocumentCache::Ordered(dict) => dict.move_before(id, before),
            DocumentCache::Unordered(_) => {
                Err(MultiplexError::internal("cache mode drifted from observer mode"))
            }
        }
    }

    /// Delete a document. An absent id is a no-op in unordered mode and an
    /// error in ordered mode.
    pub fn removed(&mut self, id: &DocumentId) -> MultiplexResult<()> {
        if self.mode.is_ordered() && !self.docs.contains(id) {
            return Err(MultiplexError::protocol(format!(
                "Unknown id for removed: {}",
                id
            )));
        }
        if let Some(hook) = &self.hooks.removed {
            hook(&self.docs, id);
        }
        match &mut self.docs {
            DocumentCache::Unordered(map) => {
                map.remove(id);
                Ok(())
            }
            DocumentCache::Ordered(dict) => dict.remove(id).map(|_| ()),
        }
    }
}
