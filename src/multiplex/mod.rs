//! # Observe Multiplexer
//!
//! One upstream watcher, many subscribers.
//!
//! ## Architecture
//!
//! - **Events**: change notifications and ordering modes
//! - **Cache**: unordered id map and ordered dictionary
//! - **Observer**: applies events to the cached snapshot
//! - **Queue**: strict FIFO, single worker thread
//! - **Multiplexer**: serializes cache updates, broadcast, readiness and
//!   initial replays on that worker
//! - **Handles**: per-subscriber dispatch tables with an idempotent stop

pub mod cache;
pub mod config;
pub mod errors;
pub mod event;
pub mod handle;
pub mod multiplexer;
pub mod observer;
pub mod queue;
pub mod ready;

pub use cache::{DocumentCache, IdMap, OrderedDict};
pub use config::MultiplexerConfig;
pub use errors::{MultiplexError, MultiplexResult};
pub use event::{
    apply_delta, document_to_value, ChangeEvent, Document, DocumentId, EventKind, FieldChange,
    FieldDelta, OrderingMode,
};
pub use handle::{HandleId, ObserveCallbacks, ObserveHandle};
pub use multiplexer::{AttachTicket, MultiplexerBuilder, ObserveMultiplexer, StopCallback};
pub use observer::{CachingChangeObserver, ObserverHooks, ObserverOptions};
pub use queue::{Task, TaskErrorHandler, TaskQueue};
pub use ready::ReadySignal;
