//! # Serialized Task Queue
//!
//! Strict FIFO queue drained by one dedicated worker thread. Tasks run one
//! at a time to completion. A failing or panicking task is reported and the
//! worker moves on to the next one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use super::errors::{MultiplexError, MultiplexResult};

/// A unit of work for the worker
pub type Task = Box<dyn FnOnce() -> MultiplexResult<()> + Send + 'static>;

/// Receives errors from tasks nobody is waiting on
pub type TaskErrorHandler = Arc<dyn Fn(&MultiplexError) + Send + Sync>;

struct Job {
    task: Task,
    done: Option<SyncSender<MultiplexResult<()>>>,
}

pub struct TaskQueue {
    sender: Mutex<Option<Sender<Job>>>,
    worker: ThreadId,
}

impl TaskQueue {
    /// Start the worker thread
    pub fn spawn(name: &str, on_error: TaskErrorHandler) -> MultiplexResult<Self> {
        let (tx, rx) = mpsc::channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    let result = run_guarded(job.task);
                    match job.done {
                        Some(done) => {
                            let _ = done.send(result);
                        }
                        None => {
                            if let Err(e) = &result {
                                on_error(e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| MultiplexError::internal(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: handle.thread().id(),
        })
    }

    /// False when called from the worker itself, where waiting on a task
    /// would deadlock.
    pub fn safe_to_run_task(&self) -> bool {
        thread::current().id() != self.worker
    }

    /// Enqueue and return immediately
    pub fn queue_task(&self, task: Task) -> MultiplexResult<()> {
        self.submit(Job { task, done: None })
    }

    /// Enqueue and block until the task has run, returning its result
    pub fn run_task(&self, task: Task) -> MultiplexResult<()> {
        if !self.safe_to_run_task() {
            return Err(MultiplexError::reentrancy(
                "Can't run a task and wait for it from inside another task",
            ));
        }

        self.queue_task_tracked(task)?
            .recv()
            .map_err(|_| MultiplexError::internal("Worker exited before finishing task"))?
    }

    /// Enqueue and return a receiver for the task's result instead of
    /// reporting it to the error handler
    pub fn queue_task_tracked(&self, task: Task) -> MultiplexResult<Receiver<MultiplexResult<()>>> {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.submit(Job {
            task,
            done: Some(done_tx),
        })?;
        Ok(done_rx)
    }

    /// Stop accepting tasks. Anything already queued still runs.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    fn submit(&self, job: Job) -> MultiplexResult<()> {
        let sender = self.sender.lock().map_err(|_| MultiplexError::poisoned())?;
        let Some(sender) = sender.as_ref() else {
            return Err(MultiplexError::lifecycle("Task queue is closed"));
        };
        sender
            .send(job)
            .map_err(|_| MultiplexError::lifecycle("Task queue worker has exited"))
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("worker", &self.worker)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn run_guarded(task: Task) -> MultiplexResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(payload) => Err(MultiplexError::internal(format!(
            "Task panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
