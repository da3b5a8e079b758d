//! Observable lifecycle events of the multiplexer

use std::fmt;

use super::logger::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Multiplexer constructed and worker started
    MultiplexerCreated,
    /// Readiness transition completed
    MultiplexerReady,
    /// Last handle detached, teardown ran
    MultiplexerStopped,
    /// Handle registered
    HandleAttached,
    /// Handle removed from the registry
    HandleDetached,
    /// Initial replay delivered to a new handle
    InitialAddsSent,
    /// Flush callback invoked
    FlushComplete,
    /// Watcher event rejected before queuing
    EventRejected,
    /// A queued task failed
    TaskFailed,
}

impl Event {
    /// Event name used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MultiplexerCreated => "MULTIPLEXER_CREATED",
            Event::MultiplexerReady => "MULTIPLEXER_READY",
            Event::MultiplexerStopped => "MULTIPLEXER_STOPPED",
            Event::HandleAttached => "HANDLE_ATTACHED",
            Event::HandleDetached => "HANDLE_DETACHED",
            Event::InitialAddsSent => "INITIAL_ADDS_SENT",
            Event::FlushComplete => "FLUSH_COMPLETE",
            Event::EventRejected => "EVENT_REJECTED",
            Event::TaskFailed => "TASK_FAILED",
        }
    }

    /// Severity this event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::MultiplexerCreated | Event::MultiplexerReady | Event::MultiplexerStopped => {
                Severity::Info
            }
            Event::HandleAttached
            | Event::HandleDetached
            | Event::InitialAddsSent
            | Event::FlushComplete => Severity::Trace,
            Event::EventRejected => Severity::Warn,
            Event::TaskFailed => Severity::Error,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
