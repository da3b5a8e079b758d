//! JSON-lines I/O for the CLI
//!
//! - Input: one script line per JSON object (file or stdin)
//! - Output: one JSON object per line on stdout
//! - UTF-8 only

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::errors::{CliError, CliResult};
use crate::multiplex::{ChangeEvent, Document, DocumentId, FieldChange, FieldDelta};

/// One line of a replay script
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScriptLine {
    Added {
        id: DocumentId,
        #[serde(default)]
        fields: Document,
    },
    AddedBefore {
        id: DocumentId,
        #[serde(default)]
        fields: Document,
        #[serde(default)]
        before: Option<DocumentId>,
    },
    Changed {
        id: DocumentId,
        #[serde(default)]
        fields: Document,
        #[serde(default)]
        cleared: Vec<String>,
    },
    MovedBefore {
        id: DocumentId,
        #[serde(default)]
        before: Option<DocumentId>,
    },
    Removed {
        id: DocumentId,
    },
    Ready,
    Attach {
        handle: String,
    },
    Stop {
        handle: String,
    },
    Flush,
}

impl ScriptLine {
    /// The watcher event this line carries, if it is not a control line
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            ScriptLine::Added { id, fields } => Some(ChangeEvent::Added { id, fields }),
            ScriptLine::AddedBefore { id, fields, before } => {
                Some(ChangeEvent::AddedBefore { id, fields, before })
            }
            ScriptLine::Changed {
                id,
                fields,
                cleared,
            } => {
                let mut delta: FieldDelta = fields
                    .into_iter()
                    .map(|(k, v)| (k, FieldChange::Set(v)))
                    .collect();
                for key in cleared {
                    delta.insert(key, FieldChange::Unset);
                }
                Some(ChangeEvent::Changed { id, delta })
            }
            ScriptLine::MovedBefore { id, before } => Some(ChangeEvent::MovedBefore { id, before }),
            ScriptLine::Removed { id } => Some(ChangeEvent::Removed { id }),
            ScriptLine::Ready
            | ScriptLine::Attach { .. }
            | ScriptLine::Stop { .. }
            | ScriptLine::Flush => None,
        }
    }
}

/// Parse a script. Blank lines are skipped.
pub fn parse_script<R: BufRead>(reader: R) -> CliResult<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str(&line)
            .map_err(|e| CliError::script_error(index + 1, e))?;
        lines.push(parsed);
    }
    Ok(lines)
}

/// Read a script from `path`, or stdin when absent
pub fn read_script(path: Option<&Path>) -> CliResult<Vec<ScriptLine>> {
    match path {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                CliError::io_error(format!("Failed to open {}: {}", path.display(), e))
            })?;
            parse_script(BufReader::new(file))
        }
        None => parse_script(io::stdin().lock()),
    }
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_line(&serde_json::json!({
        "status": "ok",
        "data": data
    }))
}

/// Write one JSON value as a line on stdout
pub fn write_line(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}
