//! # Observe Handles
//!
//! A subscriber's registration token. Callers supply callbacks per event
//! kind; the handle resolves them against the multiplexer's mode into a
//! fixed dispatch table.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::errors::MultiplexResult;
use super::event::{ChangeEvent, Document, DocumentId, EventKind, FieldDelta, OrderingMode};
use super::multiplexer::ObserveMultiplexer;

pub type AddedFn = Arc<dyn Fn(DocumentId, Document) + Send + Sync>;
pub type AddedBeforeFn = Arc<dyn Fn(DocumentId, Document, Option<DocumentId>) + Send + Sync>;
pub type ChangedFn = Arc<dyn Fn(DocumentId, FieldDelta) + Send + Sync>;
pub type MovedBeforeFn = Arc<dyn Fn(DocumentId, Option<DocumentId>) + Send + Sync>;
pub type RemovedFn = Arc<dyn Fn(DocumentId) + Send + Sync>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks supplied by a subscriber. Kinds the multiplexer's mode does
/// not support are ignored.
#[derive(Clone, Default)]
pub struct ObserveCallbacks {
    added: Option<AddedFn>,
    added_before: Option<AddedBeforeFn>,
    changed: Option<ChangedFn>,
    moved_before: Option<MovedBeforeFn>,
    removed: Option<RemovedFn>,
}

impl ObserveCallbacks {
    /// No callbacks; the handle only holds the multiplexer open
    pub fn new() -> Self {
        Self::default()
    }

    /// Unordered inserts, and ordered inserts when `added_before` is absent
    pub fn added<F>(mut self, f: F) -> Self
    where
        F: Fn(DocumentId, Document) + Send + Sync + 'static,
    {
        self.added = Some(Arc::new(f));
        self
    }

    /// Positioned inserts (ordered mode)
    pub fn added_before<F>(mut self, f: F) -> Self
    where
        F: Fn(DocumentId, Document, Option<DocumentId>) + Send + Sync + 'static,
    {
        self.added_before = Some(Arc::new(f));
        self
    }

    /// Field deltas
    pub fn changed<F>(mut self, f: F) -> Self
    where
        F: Fn(DocumentId, FieldDelta) + Send + Sync + 'static,
    {
        self.changed = Some(Arc::new(f));
        self
    }

    /// Repositioning (ordered mode)
    pub fn moved_before<F>(mut self, f: F) -> Self
    where
        F: Fn(DocumentId, Option<DocumentId>) + Send + Sync + 'static,
    {
        self.moved_before = Some(Arc::new(f));
        self
    }

    /// Deletions
    pub fn removed<F>(mut self, f: F) -> Self
    where
        F: Fn(DocumentId) + Send + Sync + 'static,
    {
        self.removed = Some(Arc::new(f));
        self
    }

    /// Kinds with a callback supplied
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        if self.added.is_some() {
            kinds.push(EventKind::Added);
        }
        if self.added_before.is_some() {
            kinds.push(EventKind::AddedBefore);
        }
        if self.changed.is_some() {
            kinds.push(EventKind::Changed);
        }
        if self.moved_before.is_some() {
            kinds.push(EventKind::MovedBefore);
        }
        if self.removed.is_some() {
            kinds.push(EventKind::Removed);
        }
        kinds
    }
}

impl fmt::Debug for ObserveCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveCallbacks")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Dispatch table resolved against one ordering mode
pub(crate) struct HandleCallbacks {
    mode: OrderingMode,
    added: Option<AddedFn>,
    added_before: Option<AddedBeforeFn>,
    changed: Option<ChangedFn>,
    moved_before: Option<MovedBeforeFn>,
    removed: Option<RemovedFn>,
}

impl HandleCallbacks {
    /// Build the table for `mode`, dropping kinds it does not support
    pub(crate) fn resolve(mode: OrderingMode, callbacks: ObserveCallbacks) -> Self {
        match mode {
            OrderingMode::Unordered => Self {
                mode,
                added: callbacks.added,
                added_before: None,
                changed: callbacks.changed,
                moved_before: None,
                removed: callbacks.removed,
            },
            OrderingMode::Ordered => {
                // `added` without `addedBefore` still observes ordered
                // inserts, minus the position.
                let added_before = match (callbacks.added_before, callbacks.added) {
                    (Some(f), _) => Some(f),
                    (None, Some(added)) => {
                        let shim: AddedBeforeFn =
                            Arc::new(move |id, fields, _before| added(id, fields));
                        Some(shim)
                    }
                    (None, None) => None,
                };
                Self {
                    mode,
                    added: None,
                    added_before,
                    changed: callbacks.changed,
                    moved_before: callbacks.moved_before,
                    removed: callbacks.removed,
                }
            }
        }
    }

    /// Whether this handle has a callback for `kind`
    pub(crate) fn accepts(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Added => self.added.is_some(),
            EventKind::AddedBefore => self.added_before.is_some(),
            EventKind::Changed => self.changed.is_some(),
            EventKind::MovedBefore => self.moved_before.is_some(),
            EventKind::Removed => self.removed.is_some(),
        }
    }

    /// Whether this handle wants the initial replay at all
    pub(crate) fn receives_initial_adds(&self) -> bool {
        match self.mode {
            OrderingMode::Ordered => self.added_before.is_some(),
            OrderingMode::Unordered => self.added.is_some(),
        }
    }

    /// Deliver one replayed document. Ordered replays go to the end since
    /// they arrive in sequence order.
    pub(crate) fn deliver_initial(&self, id: DocumentId, fields: Document) {
        match self.mode {
            OrderingMode::Ordered => {
                if let Some(f) = &self.added_before {
                    f(id, fields, None);
                }
            }
            OrderingMode::Unordered => {
                if let Some(f) = &self.added {
                    f(id, fields);
                }
            }
        }
    }

    /// Dispatch one live event
    pub(crate) fn deliver(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Added { id, fields } => {
                if let Some(f) = &self.added {
                    f(id, fields);
                }
            }
            ChangeEvent::AddedBefore { id, fields, before } => {
                if let Some(f) = &self.added_before {
                    f(id, fields, before);
                }
            }
            ChangeEvent::Changed { id, delta } => {
                if let Some(f) = &self.changed {
                    f(id, delta);
                }
            }
            ChangeEvent::MovedBefore { id, before } => {
                if let Some(f) = &self.moved_before {
                    f(id, before);
                }
            }
            ChangeEvent::Removed { id } => {
                if let Some(f) = &self.removed {
                    f(id);
                }
            }
        }
    }
}

/// A subscriber's handle. Only `stop` is meant for end users.
pub struct ObserveHandle {
    id: HandleId,
    multiplexer: Arc<ObserveMultiplexer>,
    callbacks: Arc<HandleCallbacks>,
    stopped: AtomicBool,
}

impl ObserveHandle {
    /// Create an unattached handle with a fresh id
    pub fn new(multiplexer: &Arc<ObserveMultiplexer>, callbacks: ObserveCallbacks) -> Self {
        Self {
            id: HandleId::next(),
            multiplexer: Arc::clone(multiplexer),
            callbacks: Arc::new(HandleCallbacks::resolve(multiplexer.mode(), callbacks)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Process-unique id
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The multiplexer this handle belongs to
    pub fn multiplexer(&self) -> &Arc<ObserveMultiplexer> {
        &self.multiplexer
    }

    /// Shared dispatch table for the registry
    pub(crate) fn callbacks(&self) -> Arc<HandleCallbacks> {
        Arc::clone(&self.callbacks)
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Detach from the multiplexer. Later calls are no-ops.
    pub fn stop(&self) -> MultiplexResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.multiplexer.detach(self.id)
    }
}

impl fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("id", &self.id)
            .field("mode", &self.callbacks.mode)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
