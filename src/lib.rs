//! observe-multiplex - fan one ordered change stream out to many subscribers
//!
//! A single watcher feeds change events into an [`ObserveMultiplexer`],
//! which keeps a cached snapshot and replays it to every handle that
//! attaches later, gap-free relative to the live stream.

pub mod cli;
pub mod multiplex;
pub mod observability;

pub use multiplex::{
    ChangeEvent, Document, DocumentId, EventKind, FieldChange, FieldDelta, MultiplexError,
    MultiplexResult, MultiplexerConfig, ObserveCallbacks, ObserveHandle, ObserveMultiplexer,
    OrderingMode,
};
