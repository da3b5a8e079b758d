//! # Change Events
//!
//! Document ids, field maps and the change notifications a watcher emits.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{MultiplexError, MultiplexResult};

/// Opaque document key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap a raw id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Cached field mapping for one document
pub type Document = BTreeMap<String, Value>;

/// One entry of a `changed` delta
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Set the field to this value
    Set(Value),
    /// Tombstone: remove the field
    Unset,
}

/// Field delta carried by `changed`
pub type FieldDelta = BTreeMap<String, FieldChange>;

/// Apply a delta in place. Tombstones remove, everything else overwrites.
pub fn apply_delta(doc: &mut Document, delta: &FieldDelta) {
    for (key, change) in delta {
        match change {
            FieldChange::Set(value) => {
                doc.insert(key.clone(), value.clone());
            }
            FieldChange::Unset => {
                doc.remove(key);
            }
        }
    }
}

/// Kind of change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    AddedBefore,
    Changed,
    MovedBefore,
    Removed,
}

impl EventKind {
    /// Callback name used by handles and the replay script
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::AddedBefore => "addedBefore",
            EventKind::Changed => "changed",
            EventKind::MovedBefore => "movedBefore",
            EventKind::Removed => "removed",
        }
    }

    /// Whether this kind inserts a document
    pub fn is_insert(&self) -> bool {
        matches!(self, EventKind::Added | EventKind::AddedBefore)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = MultiplexError;

    fn from_str(s: &str) -> MultiplexResult<Self> {
        match s {
            "added" => Ok(EventKind::Added),
            "addedBefore" => Ok(EventKind::AddedBefore),
            "changed" => Ok(EventKind::Changed),
            "movedBefore" => Ok(EventKind::MovedBefore),
            "removed" => Ok(EventKind::Removed),
            other => Err(MultiplexError::protocol(format!(
                "Unknown event kind: {}",
                other
            ))),
        }
    }
}

/// Whether observed documents carry a relative position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    Ordered,
    Unordered,
}

impl OrderingMode {
    /// Mode from the `ordered` flag
    pub fn from_ordered(ordered: bool) -> Self {
        if ordered {
            OrderingMode::Ordered
        } else {
            OrderingMode::Unordered
        }
    }

    /// Whether documents carry a position
    pub fn is_ordered(&self) -> bool {
        matches!(self, OrderingMode::Ordered)
    }

    /// Kinds a watcher may send, and handles may receive, in this mode
    pub fn callback_kinds(&self) -> &'static [EventKind] {
        match self {
            OrderingMode::Ordered => &[
                EventKind::AddedBefore,
                EventKind::Changed,
                EventKind::MovedBefore,
                EventKind::Removed,
            ],
            OrderingMode::Unordered => {
                &[EventKind::Added, EventKind::Changed, EventKind::Removed]
            }
        }
    }

    /// Whether `kind` is valid in this mode
    pub fn supports(&self, kind: EventKind) -> bool {
        self.callback_kinds().contains(&kind)
    }
}

impl fmt::Display for OrderingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingMode::Ordered => write!(f, "ordered"),
            OrderingMode::Unordered => write!(f, "unordered"),
        }
    }
}

/// A single change notification
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added {
        id: DocumentId,
        fields: Document,
    },
    AddedBefore {
        id: DocumentId,
        fields: Document,
        before: Option<DocumentId>,
    },
    Changed {
        id: DocumentId,
        delta: FieldDelta,
    },
    MovedBefore {
        id: DocumentId,
        before: Option<DocumentId>,
    },
    Removed {
        id: DocumentId,
    },
}

impl ChangeEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Added { .. } => EventKind::Added,
            ChangeEvent::AddedBefore { .. } => EventKind::AddedBefore,
            ChangeEvent::Changed { .. } => EventKind::Changed,
            ChangeEvent::MovedBefore { .. } => EventKind::MovedBefore,
            ChangeEvent::Removed { .. } => EventKind::Removed,
        }
    }

    /// Document the event refers to
    pub fn id(&self) -> &DocumentId {
        match self {
            ChangeEvent::Added { id, .. }
            | ChangeEvent::AddedBefore { id, .. }
            | ChangeEvent::Changed { id, .. }
            | ChangeEvent::MovedBefore { id, .. }
            | ChangeEvent::Removed { id } => id,
        }
    }

    /// Serialize to the JSON-lines shape used by the replay tool.
    ///
    /// Tombstones in a delta are listed under `cleared`.
    pub fn to_wire_format(&self) -> Value {
        let mut out = Map::new();
        out.insert("callback".into(), Value::from(self.kind().as_str()));
        out.insert("id".into(), Value::from(self.id().as_str()));

        match self {
            ChangeEvent::Added { fields, .. } => {
                out.insert("fields".into(), document_to_value(fields));
            }
            ChangeEvent::AddedBefore { fields, before, .. } => {
                out.insert("fields".into(), document_to_value(fields));
                out.insert("before".into(), before_to_value(before));
            }
            ChangeEvent::Changed { delta, .. } => {
                let mut set = Map::new();
                let mut cleared = Vec::new();
                for (key, change) in delta {
                    match change {
                        FieldChange::Set(value) => {
                            set.insert(key.clone(), value.clone());
                        }
                        FieldChange::Unset => cleared.push(Value::from(key.as_str())),
                    }
                }
                out.insert("fields".into(), Value::Object(set));
                if !cleared.is_empty() {
                    out.insert("cleared".into(), Value::Array(cleared));
                }
            }
            ChangeEvent::MovedBefore { before, .. } => {
                out.insert("before".into(), before_to_value(before));
            }
            ChangeEvent::Removed { .. } => {}
        }

        Value::Object(out)
    }
}

/// Convert a document to a JSON object
pub fn document_to_value(doc: &Document) -> Value {
    Value::Object(doc.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn before_to_value(before: &Option<DocumentId>) -> Value {
    match before {
        Some(id) => Value::from(id.as_str()),
        None => Value::Null,
    }
}
