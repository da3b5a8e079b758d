//! CLI command implementations
//!
//! `replay` runs every script line on the calling thread. Attaches that
//! precede `ready` are queued with [`ObserveMultiplexer::begin_attach`] and
//! completed when the `ready` line arrives, so each replay lands at its
//! exact position in the script.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::multiplex::{
    document_to_value, AttachTicket, ChangeEvent, MultiplexError, MultiplexerConfig,
    ObserveCallbacks, ObserveHandle, ObserveMultiplexer,
};
use crate::observability::{Logger, MetricsRegistry};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{read_script, write_line, write_response, ScriptLine};

/// Receives every JSON line the replay produces before the summary
pub type OutputSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}

/// Run a command
pub fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Replay {
            config,
            input,
            log_level,
        } => {
            Logger::set_min_severity(log_level);
            replay(&config, input.as_deref())
        }
        Command::Kinds { config } => kinds(&config),
    }
}

/// `observe-mux replay`
pub fn replay(config_path: &Path, input: Option<&Path>) -> CliResult<()> {
    let config = load_config(config_path)?;
    let script = read_script(input)?;

    let summary = run_script(config, script, stdout_sink())?;
    write_response(summary)
}

/// `observe-mux kinds`
pub fn kinds(config_path: &Path) -> CliResult<()> {
    let config = load_config(config_path)?;
    let mode = config.resolve_mode()?;
    let names: Vec<&str> = mode.callback_kinds().iter().map(|k| k.as_str()).collect();
    write_response(json!({
        "mode": mode.to_string(),
        "kinds": names,
    }))
}

/// Replay `script` against a fresh multiplexer, streaming handle output to
/// `out`. Returns the summary: final cache contents and counters.
pub fn run_script(
    config: MultiplexerConfig,
    script: Vec<ScriptLine>,
    out: OutputSink,
) -> CliResult<Value> {
    let metrics = Arc::new(MetricsRegistry::new());
    let errors = Arc::clone(&out);
    let mux = ObserveMultiplexer::builder(config)
        .metrics(Arc::clone(&metrics))
        .on_task_error(move |e: &MultiplexError| {
            errors(json!({
                "status": "error",
                "code": e.code(),
                "message": e.to_string(),
            }))
        })
        .build()?;

    let mut session = ReplaySession {
        mux: Arc::clone(&mux),
        out,
        ready_requested: false,
        pending: Vec::new(),
        handles: HashMap::new(),
    };
    for (index, line) in script.into_iter().enumerate() {
        session.step(index + 1, line)?;
    }

    if !mux.is_stopped() {
        mux.flush()?;
    }

    let documents: Vec<Value> = mux
        .cached_documents()?
        .iter()
        .map(|(id, fields)| json!({ "id": id.as_str(), "fields": document_to_value(fields) }))
        .collect();

    Ok(json!({
        "mode": mux.mode().to_string(),
        "ready": mux.is_ready(),
        "stopped": mux.is_stopped(),
        "documents": documents,
        "metrics": metrics.to_json(),
    }))
}

fn load_config(path: &Path) -> CliResult<MultiplexerConfig> {
    if !path.exists() {
        return Err(CliError::config_error(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Ok(MultiplexerConfig::from_file(path)?)
}

fn stdout_sink() -> OutputSink {
    Arc::new(|value: Value| {
        if let Err(e) = write_line(&value) {
            Logger::error(
                "CLI_OUTPUT_FAILED",
                &[("code", e.code_str()), ("error", e.message())],
            );
        }
    })
}

struct ReplaySession {
    mux: Arc<ObserveMultiplexer>,
    out: OutputSink,
    ready_requested: bool,
    /// Attaches queued before `ready`
    pending: Vec<AttachTicket>,
    handles: HashMap<String, ObserveHandle>,
}

impl ReplaySession {
    fn step(&mut self, line_no: usize, line: ScriptLine) -> CliResult<()> {
        match line {
            ScriptLine::Ready => {
                if self.ready_requested {
                    return Err(CliError::script_error(line_no, "ready given twice"));
                }
                self.mux.mark_ready()?;
                self.ready_requested = true;
                for ticket in self.pending.drain(..) {
                    ticket.wait()?;
                }
                Ok(())
            }
            ScriptLine::Attach { handle } => self.attach(line_no, handle),
            ScriptLine::Stop { handle } => {
                let Some(observe_handle) = self.handles.get(&handle) else {
                    return Err(CliError::script_error(
                        line_no,
                        format!("unknown handle {}", handle),
                    ));
                };
                observe_handle.stop()?;
                Ok(())
            }
            ScriptLine::Flush => {
                self.mux.flush()?;
                Ok(())
            }
            event_line => match event_line.into_event() {
                Some(event) => {
                    self.mux.notify(event)?;
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    fn attach(&mut self, line_no: usize, name: String) -> CliResult<()> {
        if self.handles.contains_key(&name) {
            return Err(CliError::script_error(
                line_no,
                format!("handle {} attached twice", name),
            ));
        }

        let handle = ObserveHandle::new(&self.mux, printing_callbacks(&name, &self.out));
        let ticket = self.mux.begin_attach(&handle)?;
        if self.ready_requested {
            ticket.wait()?;
        } else {
            self.pending.push(ticket);
        }
        self.handles.insert(name, handle);
        Ok(())
    }
}

/// Callbacks for every kind, each printing the event tagged with `name`
fn printing_callbacks(name: &str, out: &OutputSink) -> ObserveCallbacks {
    let emit: Arc<dyn Fn(ChangeEvent) + Send + Sync> = {
        let name = name.to_string();
        let out = Arc::clone(out);
        Arc::new(move |event: ChangeEvent| {
            let mut line = match event.to_wire_format() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            line.insert("handle".into(), Value::from(name.as_str()));
            out(Value::Object(line));
        })
    };

    let on_added = Arc::clone(&emit);
    let on_added_before = Arc::clone(&emit);
    let on_changed = Arc::clone(&emit);
    let on_moved_before = Arc::clone(&emit);
    let on_removed = emit;
    ObserveCallbacks::new()
        .added(move |id, fields| on_added(ChangeEvent::Added { id, fields }))
        .added_before(move |id, fields, before| {
            on_added_before(ChangeEvent::AddedBefore { id, fields, before })
        })
        .changed(move |id, delta| on_changed(ChangeEvent::Changed { id, delta }))
        .moved_before(move |id, before| on_moved_before(ChangeEvent::MovedBefore { id, before }))
        .removed(move |id| on_removed(ChangeEvent::Removed { id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<Value>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let sink: OutputSink = Arc::new(move |v| captured.lock().unwrap().push(v));
        (sink, lines)
    }

    fn script(lines: &[Value]) -> Vec<ScriptLine> {
        lines
            .iter()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_attach_before_ready_replays_in_place() {
        let (sink, lines) = collecting_sink();
        let summary = run_script(
            MultiplexerConfig::unordered(),
            script(&[
                json!({"kind": "added", "id": "a", "fields": {"n": 1}}),
                json!({"kind": "attach", "handle": "h1"}),
                json!({"kind": "added", "id": "b", "fields": {"n": 2}}),
                json!({"kind": "ready"}),
                json!({"kind": "changed", "id": "a", "fields": {"n": 3}}),
            ]),
            sink,
        )
        .unwrap();

        let lines = lines.lock().unwrap();
        let seen: Vec<(&str, &str)> = lines
            .iter()
            .map(|l| (l["callback"].as_str().unwrap(), l["id"].as_str().unwrap()))
            .collect();
        assert_eq!(seen, vec![("added", "a"), ("added", "b"), ("changed", "a")]);
        assert!(lines.iter().all(|l| l["handle"] == "h1"));

        assert_eq!(summary["ready"], true);
        assert_eq!(
            summary["documents"],
            json!([
                {"id": "a", "fields": {"n": 3}},
                {"id": "b", "fields": {"n": 2}},
            ])
        );
    }

    #[test]
    fn test_stop_last_handle_stops_multiplexer() {
        let (sink, _lines) = collecting_sink();
        let summary = run_script(
            MultiplexerConfig::ordered(),
            script(&[
                json!({"kind": "ready"}),
                json!({"kind": "attach", "handle": "h1"}),
                json!({"kind": "stop", "handle": "h1"}),
                json!({"kind": "stop", "handle": "h1"}),
            ]),
            sink,
        )
        .unwrap();
        assert_eq!(summary["stopped"], true);
        assert_eq!(summary["metrics"]["multiplexers_stopped"], 1);
    }

    #[test]
    fn test_stop_before_ready_is_protocol_error() {
        let (sink, _lines) = collecting_sink();
        let err = run_script(
            MultiplexerConfig::unordered(),
            script(&[
                json!({"kind": "attach", "handle": "h1"}),
                json!({"kind": "stop", "handle": "h1"}),
            ]),
            sink,
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "OBSERVE_PROTOCOL_VIOLATION");
    }

    #[test]
    fn test_task_failure_is_printed() {
        let (sink, lines) = collecting_sink();
        run_script(
            MultiplexerConfig::unordered(),
            script(&[
                json!({"kind": "ready"}),
                json!({"kind": "changed", "id": "ghost", "fields": {"a": 1}}),
            ]),
            sink,
        )
        .unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["status"], "error");
        assert_eq!(lines[0]["code"], "OBSERVE_PROTOCOL_VIOLATION");
    }

    #[test]
    fn test_unordered_remove_of_absent_id_is_delivered() {
        let (sink, lines) = collecting_sink();
        let summary = run_script(
            MultiplexerConfig::unordered(),
            script(&[
                json!({"kind": "ready"}),
                json!({"kind": "attach", "handle": "h1"}),
                json!({"kind": "removed", "id": "ghost"}),
            ]),
            sink,
        )
        .unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![json!({"handle": "h1", "callback": "removed", "id": "ghost"})]
        );
        assert_eq!(summary["metrics"]["task_failures"], 0);
    }

    #[test]
    fn test_unknown_handle_is_script_error() {
        let (sink, _lines) = collecting_sink();
        let err = run_script(
            MultiplexerConfig::unordered(),
            script(&[json!({"kind": "stop", "handle": "nobody"})]),
            sink,
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "OBSERVE_CLI_SCRIPT_ERROR");
    }
}
