//! # Observe Multiplexer
//!
//! Fans one watcher's change stream out to any number of handles while
//! keeping a cached snapshot for late subscribers.
//!
//! ## Serialization
//! Cache mutation, broadcast, the readiness transition and initial replays
//! all run as tasks on one worker, one at a time, in submission order. A
//! new handle's replay and the live stream therefore share a single total
//! order: no duplicates, no gaps.
//!
//! ## Detach
//! Detach is the one operation that does not go through the queue. It
//! removes the handle on the calling thread, so a broadcast re-checks
//! registration before every delivery and skips handles that are gone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};

use super::config::MultiplexerConfig;
use super::errors::{MultiplexError, MultiplexResult};
use super::event::{
    ChangeEvent, Document, DocumentId, EventKind, FieldDelta, OrderingMode,
};
use super::handle::{HandleCallbacks, HandleId, ObserveCallbacks, ObserveHandle};
use super::observer::{CachingChangeObserver, ObserverOptions};
use super::queue::{TaskErrorHandler, TaskQueue};
use super::ready::ReadySignal;
use crate::observability::{log_event, log_event_with_fields, Event, MetricsRegistry};

/// Teardown collaborator, run once when the last handle leaves
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Registry {
    /// `None` once torn down
    handles: Option<BTreeMap<HandleId, Arc<HandleCallbacks>>>,
    /// Attach tasks queued but not yet finished
    pending_attaches: usize,
}

impl Registry {
    /// Close the registry if it is empty with nothing inbound.
    /// Returns true exactly once.
    fn close_if_drained(&mut self) -> bool {
        let drained = matches!(&self.handles, Some(h) if h.is_empty())
            && self.pending_attaches == 0;
        if drained {
            self.handles = None;
        }
        drained
    }
}

/// Builder for [`ObserveMultiplexer`]
pub struct MultiplexerBuilder {
    config: MultiplexerConfig,
    on_stop: Option<StopCallback>,
    metrics: Option<Arc<MetricsRegistry>>,
    on_task_error: Option<TaskErrorHandler>,
}

impl MultiplexerBuilder {
    /// Start from `config` with no collaborators
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            config,
            on_stop: None,
            metrics: None,
            on_task_error: None,
        }
    }

    /// Called once when the last handle detaches
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// Counters to update; defaults to the process-wide registry
    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Extra sink for failures of queued tasks (they are always logged)
    pub fn on_task_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&MultiplexError) + Send + Sync + 'static,
    {
        self.on_task_error = Some(Arc::new(f));
        self
    }

    /// Validate the config, start the worker and return the multiplexer
    pub fn build(self) -> MultiplexResult<Arc<ObserveMultiplexer>> {
        self.config.validate()?;
        let mode = self.config.resolve_mode()?;
        let metrics = self.metrics.unwrap_or_else(MetricsRegistry::global);

        let cache = CachingChangeObserver::new(ObserverOptions::with_mode(mode))?;

        let error_metrics = Arc::clone(&metrics);
        let user_handler = self.on_task_error;
        let handler: TaskErrorHandler = Arc::new(move |err: &MultiplexError| {
            error_metrics.increment_task_failures();
            log_event_with_fields(
                Event::TaskFailed,
                &[("code", err.code()), ("error", err.to_string().as_str())],
            );
            if let Some(f) = &user_handler {
                f(err);
            }
        });
        let queue = TaskQueue::spawn(&self.config.worker_name, handler)?;

        metrics.increment_multiplexers_created();
        log_event_with_fields(
            Event::MultiplexerCreated,
            &[
                ("mode", mode.to_string().as_str()),
                ("worker", self.config.worker_name.as_str()),
            ],
        );

        Ok(Arc::new(ObserveMultiplexer {
            mode,
            queue,
            cache: Mutex::new(cache),
            registry: Mutex::new(Registry {
                handles: Some(BTreeMap::new()),
                pending_attaches: 0,
            }),
            ready: ReadySignal::new(),
            on_stop: Mutex::new(self.on_stop),
            metrics,
        }))
    }
}

/// Serialized change-event multiplexer
pub struct ObserveMultiplexer {
    mode: OrderingMode,
    queue: TaskQueue,
    cache: Mutex<CachingChangeObserver>,
    registry: Mutex<Registry>,
    ready: ReadySignal,
    on_stop: Mutex<Option<StopCallback>>,
    metrics: Arc<MetricsRegistry>,
}

impl ObserveMultiplexer {
    /// Create a multiplexer with the default config for `mode`
    pub fn new<F>(mode: OrderingMode, on_stop: F) -> MultiplexResult<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::builder(MultiplexerConfig::with_mode(mode))
            .on_stop(on_stop)
            .build()
    }

    /// Builder for a multiplexer with collaborators
    pub fn builder(config: MultiplexerConfig) -> MultiplexerBuilder {
        MultiplexerBuilder::new(config)
    }

    /// Ordering mode, fixed at construction
    pub fn mode(&self) -> OrderingMode {
        self.mode
    }

    /// Callback names accepted by this multiplexer
    pub fn callback_kinds(&self) -> &'static [EventKind] {
        self.mode.callback_kinds()
    }

    /// Whether the readiness task has run
    pub fn is_ready(&self) -> bool {
        self.ready.is_resolved()
    }

    /// Whether teardown has run
    pub fn is_stopped(&self) -> bool {
        self.registry
            .lock()
            .map(|r| r.handles.is_none())
            .unwrap_or(true)
    }

    /// Handles currently registered; zero once stopped
    pub fn handle_count(&self) -> usize {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.handles.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }

    /// Copy of the cache in cache order. Only consistent with the event
    /// stream when read after a flush.
    pub fn cached_documents(&self) -> MultiplexResult<Vec<(DocumentId, Document)>> {
        Ok(self.lock_cache()?.docs().to_vec())
    }

    // ==================
    // Handles
    // ==================

    /// Create a handle for `callbacks` and attach it
    pub fn observe(self: &Arc<Self>, callbacks: ObserveCallbacks) -> MultiplexResult<ObserveHandle> {
        let handle = ObserveHandle::new(self, callbacks);
        self.attach_and_send_initial_adds(&handle)?;
        Ok(handle)
    }

    /// Register `handle`, replay the cache to it from the worker, then block
    /// until the multiplexer is ready.
    pub fn attach_and_send_initial_adds(
        self: &Arc<Self>,
        handle: &ObserveHandle,
    ) -> MultiplexResult<()> {
        self.begin_attach(handle)?.wait()
    }

    /// Queue the attach task without waiting for it.
    ///
    /// The replay is ordered against everything queued before this call.
    /// [`AttachTicket::wait`] completes the attach.
    pub fn begin_attach(self: &Arc<Self>, handle: &ObserveHandle) -> MultiplexResult<AttachTicket> {
        // Checked before touching the pending count so a rejected call
        // leaves nothing behind.
        if !self.queue.safe_to_run_task() {
            return Err(MultiplexError::reentrancy(
                "Can't attach a handle from an observe callback on the same multiplexer",
            ));
        }
        if !Arc::ptr_eq(handle.multiplexer(), self) {
            return Err(MultiplexError::protocol(
                "Handle belongs to a different multiplexer",
            ));
        }

        {
            let mut registry = self.lock_registry()?;
            if registry.handles.is_none() {
                return Err(MultiplexError::lifecycle(
                    "Can't attach a handle to a stopped multiplexer",
                ));
            }
            registry.pending_attaches += 1;
        }

        let pending = PendingAttach {
            multiplexer: Arc::clone(self),
        };
        let handle_id = handle.id();
        let callbacks = handle.callbacks();
        let done = self.queue.queue_task_tracked(Box::new(move || {
            let result = pending
                .multiplexer
                .register_and_send_adds(handle_id, callbacks);
            drop(pending);
            result
        }))?;

        Ok(AttachTicket {
            multiplexer: Arc::clone(self),
            handle_id,
            done,
        })
    }

    /// Remove a handle. Runs on the calling thread, not the queue.
    ///
    /// If this empties the registry with no attach pending, the teardown
    /// collaborator runs and the multiplexer stops for good.
    pub fn detach(&self, handle_id: HandleId) -> MultiplexResult<()> {
        // Handles are only handed out after readiness.
        if !self.is_ready() {
            return Err(MultiplexError::protocol(
                "Can't remove handles until the multiplexer is ready",
            ));
        }

        let drained = {
            let mut registry = self.lock_registry()?;
            let removed = registry
                .handles
                .as_mut()
                .map(|h| h.remove(&handle_id).is_some())
                .unwrap_or(false);
            if removed {
                self.metrics.increment_handles_detached();
                log_event_with_fields(
                    Event::HandleDetached,
                    &[("handle_id", handle_id.to_string().as_str())],
                );
            }
            registry.close_if_drained()
        };

        if drained {
            self.teardown();
        }
        Ok(())
    }

    // ==================
    // Watcher entry points
    // ==================

    /// Queue an unordered insert
    pub fn added(self: &Arc<Self>, id: impl Into<DocumentId>, fields: Document) -> MultiplexResult<()> {
        self.notify(ChangeEvent::Added {
            id: id.into(),
            fields,
        })
    }

    /// Queue a positioned insert (ordered mode)
    pub fn added_before(
        self: &Arc<Self>,
        id: impl Into<DocumentId>,
        fields: Document,
        before: Option<DocumentId>,
    ) -> MultiplexResult<()> {
        self.notify(ChangeEvent::AddedBefore {
            id: id.into(),
            fields,
            before,
        })
    }

    /// Queue a field delta
    pub fn changed(self: &Arc<Self>, id: impl Into<DocumentId>, delta: FieldDelta) -> MultiplexResult<()> {
        self.notify(ChangeEvent::Changed {
            id: id.into(),
            delta,
        })
    }

    /// Queue a reposition (ordered mode)
    pub fn moved_before(
        self: &Arc<Self>,
        id: impl Into<DocumentId>,
        before: Option<DocumentId>,
    ) -> MultiplexResult<()> {
        self.notify(ChangeEvent::MovedBefore {
            id: id.into(),
            before,
        })
    }

    /// Queue a deletion
    pub fn removed(self: &Arc<Self>, id: impl Into<DocumentId>) -> MultiplexResult<()> {
        self.notify(ChangeEvent::Removed { id: id.into() })
    }

    /// Queue one change event for cache application and broadcast.
    ///
    /// A kind outside this mode is rejected here. Events arriving after
    /// teardown are dropped.
    pub fn notify(self: &Arc<Self>, event: ChangeEvent) -> MultiplexResult<()> {
        let kind = event.kind();
        if !self.mode.supports(kind) {
            log_event_with_fields(
                Event::EventRejected,
                &[("kind", kind.as_str()), ("mode", self.mode.to_string().as_str())],
            );
            return Err(MultiplexError::protocol(format!(
                "{} is not a callback of an {} multiplexer",
                kind, self.mode
            )));
        }

        let mux = Arc::clone(self);
        match self
            .queue
            .queue_task(Box::new(move || mux.apply_and_broadcast(event)))
        {
            Err(MultiplexError::LifecycleViolation(_)) if self.is_stopped() => Ok(()),
            other => other,
        }
    }

    // ==================
    // Readiness and flush
    // ==================

    /// Queue the one-shot transition to ready. Releases every blocked attach
    /// once it drains.
    pub fn mark_ready(self: &Arc<Self>) -> MultiplexResult<()> {
        if self.is_ready() {
            return Err(MultiplexError::protocol(
                "Can't make the multiplexer ready twice",
            ));
        }
        let mux = Arc::clone(self);
        self.queue.queue_task(Box::new(move || {
            if !mux.ready.resolve()? {
                return Err(MultiplexError::protocol(
                    "Can't make the multiplexer ready twice",
                ));
            }
            log_event_with_fields(
                Event::MultiplexerReady,
                &[("handles", mux.handle_count().to_string().as_str())],
            );
            Ok(())
        }))
    }

    /// Run `callback` on the worker once everything queued before it has
    /// been delivered. Readiness must be established by then.
    pub fn on_flush<F>(self: &Arc<Self>, callback: F) -> MultiplexResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mux = Arc::clone(self);
        self.queue.queue_task(Box::new(move || {
            if !mux.is_ready() {
                return Err(MultiplexError::lifecycle(
                    "Only call on_flush on a multiplexer that will be ready",
                ));
            }
            callback();
            log_event(Event::FlushComplete);
            Ok(())
        }))
    }

    /// Block until every task queued so far has run
    pub fn flush(self: &Arc<Self>) -> MultiplexResult<()> {
        if !self.queue.safe_to_run_task() {
            return Err(MultiplexError::reentrancy(
                "Can't wait for a flush from an observe callback",
            ));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.on_flush(move || {
            let _ = tx.send(());
        })?;
        rx.recv().map_err(|_| {
            MultiplexError::lifecycle("Flush never ran: the multiplexer was not ready")
        })
    }

    // ==================
    // Worker side
    // ==================

    fn register_and_send_adds(
        &self,
        handle_id: HandleId,
        callbacks: Arc<HandleCallbacks>,
    ) -> MultiplexResult<()> {
        {
            let mut registry = self.lock_registry()?;
            let Some(handles) = registry.handles.as_mut() else {
                return Err(MultiplexError::lifecycle(
                    "Multiplexer stopped before the handle was registered",
                ));
            };
            handles.insert(handle_id, Arc::clone(&callbacks));
        }
        self.metrics.increment_handles_attached();
        // Whatever is cached goes out now, ready or not.
        self.send_adds(handle_id, &callbacks)
    }

    fn send_adds(&self, handle_id: HandleId, callbacks: &HandleCallbacks) -> MultiplexResult<()> {
        if self.queue.safe_to_run_task() {
            return Err(MultiplexError::internal(
                "send_adds may only be called from within a task",
            ));
        }
        if !callbacks.receives_initial_adds() {
            return Ok(());
        }

        // Copy out first so callbacks never run under the cache lock.
        let docs = self.lock_cache()?.docs().to_vec();
        let total = docs.len();
        let mut sent = 0usize;
        for (id, fields) in docs {
            if !self.is_registered(handle_id) {
                break;
            }
            callbacks.deliver_initial(id, fields);
            sent += 1;
        }

        log_event_with_fields(
            Event::InitialAddsSent,
            &[
                ("handle_id", handle_id.to_string().as_str()),
                ("sent", sent.to_string().as_str()),
                ("total", total.to_string().as_str()),
            ],
        );
        Ok(())
    }

    fn apply_and_broadcast(&self, event: ChangeEvent) -> MultiplexResult<()> {
        if self.is_stopped() {
            return Ok(());
        }

        let kind = event.kind();
        self.lock_cache()?.apply(&event)?;

        // Until ready, only the initial inserts may arrive.
        if !self.is_ready() && !kind.is_insert() {
            return Err(MultiplexError::protocol(format!(
                "Got {} during initial adds",
                kind
            )));
        }
        self.metrics.increment_events_processed();

        // Iterate a snapshot of ids; detach may shrink the registry while
        // callbacks run.
        let handle_ids: Vec<HandleId> = {
            let registry = self.lock_registry()?;
            match &registry.handles {
                Some(handles) => handles.keys().copied().collect(),
                None => return Ok(()),
            }
        };

        for handle_id in handle_ids {
            let Some(callbacks) = self.registered(handle_id)? else {
                continue;
            };
            if callbacks.accepts(kind) {
                callbacks.deliver(event.clone());
            }
        }
        Ok(())
    }

    fn teardown(&self) {
        let on_stop = self.on_stop.lock().ok().and_then(|mut f| f.take());
        if let Some(on_stop) = on_stop {
            on_stop();
        }
        self.queue.close();
        self.metrics.increment_multiplexers_stopped();
        log_event_with_fields(
            Event::MultiplexerStopped,
            &[("mode", self.mode.to_string().as_str())],
        );
    }

    fn finish_attach(&self) {
        let drained = match self.registry.lock() {
            Ok(mut registry) => {
                registry.pending_attaches = registry.pending_attaches.saturating_sub(1);
                // A handle stopped during its own replay can leave the
                // registry empty with nobody left to notice.
                self.is_ready() && registry.close_if_drained()
            }
            Err(_) => false,
        };
        if drained {
            self.teardown();
        }
    }

    fn registered(&self, handle_id: HandleId) -> MultiplexResult<Option<Arc<HandleCallbacks>>> {
        let registry = self.lock_registry()?;
        Ok(registry
            .handles
            .as_ref()
            .and_then(|h| h.get(&handle_id).cloned()))
    }

    fn is_registered(&self, handle_id: HandleId) -> bool {
        matches!(self.registered(handle_id), Ok(Some(_)))
    }

    fn lock_registry(&self) -> MultiplexResult<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| MultiplexError::poisoned())
    }

    fn lock_cache(&self) -> MultiplexResult<MutexGuard<'_, CachingChangeObserver>> {
        self.cache.lock().map_err(|_| MultiplexError::poisoned())
    }
}

impl fmt::Debug for ObserveMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveMultiplexer")
            .field("mode", &self.mode)
            .field("ready", &self.is_ready())
            .field("stopped", &self.is_stopped())
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// An attach whose task is queued
#[must_use = "the attach is not complete until `wait` returns"]
pub struct AttachTicket {
    multiplexer: Arc<ObserveMultiplexer>,
    handle_id: HandleId,
    done: Receiver<MultiplexResult<()>>,
}

impl AttachTicket {
    /// Handle being attached
    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// Block until the replay has run and the multiplexer is ready
    pub fn wait(self) -> MultiplexResult<()> {
        // Outside the task, or the worker would wait on itself.
        if !self.multiplexer.queue.safe_to_run_task() {
            return Err(MultiplexError::reentrancy(
                "Can't wait for an attach from an observe callback",
            ));
        }
        self.done.recv().map_err(|_| {
            MultiplexError::internal("Worker exited before finishing the attach")
        })??;
        self.multiplexer.ready.wait()?;

        log_event_with_fields(
            Event::HandleAttached,
            &[("handle_id", self.handle_id.to_string().as_str())],
        );
        Ok(())
    }
}

impl fmt::Debug for AttachTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachTicket")
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

/// Counts one in-flight attach; released when the attach task finishes or
/// is dropped without running.
struct PendingAttach {
    multiplexer: Arc<ObserveMultiplexer>,
}

impl Drop for PendingAttach {
    fn drop(&mut self) {
        self.multiplexer.finish_attach();
    }
}
