//! # Completion records produced by capability tasks.
//!
//! A [`ScriptEvent`] is created exactly once per task completion (or per timer tick)
//! by a background task and consumed by the generation that owns the task. It
//! carries everything dispatch needs: the callback name, the payload, and the
//! [`TaskId`] that lets dispatch tell a live task from a superseded one.
//!
//! ## Ordering guarantees
//! Task ids are process-wide unique and increase monotonically in creation order.
//! Events are dispatched in completion order, which is unrelated to id order.
//!
//! ## Example
//! ```rust
//! use scriptvisor::{ScriptEvent, TaskId};
//!
//! let ev = ScriptEvent::timer(TaskId::next(), "t1", "onTick");
//! assert_eq!(ev.name(), "t1");
//! assert_eq!(ev.as_label(), "timer");
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Global sequence counter for task identity.
static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of one registered task.
///
/// A tag can be reused after its task is gone; the id cannot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocates the next id.
    pub fn next() -> Self {
        Self(TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable completion record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptEvent {
    /// A periodic timer fired.
    Timer {
        /// Registering task.
        id: TaskId,
        /// Timer tag (passed to the callback).
        tag: Arc<str>,
        /// Exported function to invoke.
        callback: Arc<str>,
    },

    /// A download finished, successfully or not.
    Download {
        /// Registering task.
        id: TaskId,
        /// Download tag.
        tag: Arc<str>,
        /// Exported function to invoke.
        callback: Arc<str>,
        /// Destination path.
        path: PathBuf,
        /// Checksum of the written file (empty on failure).
        checksum: String,
        /// Failure description (`None` on success).
        error: Option<String>,
    },

    /// A supervised process exited.
    Process {
        /// Registering task.
        id: TaskId,
        /// Process name.
        name: Arc<str>,
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
    },
}

impl ScriptEvent {
    /// Creates a timer tick record.
    pub fn timer(id: TaskId, tag: impl Into<Arc<str>>, callback: impl Into<Arc<str>>) -> Self {
        ScriptEvent::Timer {
            id,
            tag: tag.into(),
            callback: callback.into(),
        }
    }

    /// Creates a successful download record.
    pub fn download_ok(
        id: TaskId,
        tag: impl Into<Arc<str>>,
        callback: impl Into<Arc<str>>,
        path: impl Into<PathBuf>,
        checksum: impl Into<String>,
    ) -> Self {
        ScriptEvent::Download {
            id,
            tag: tag.into(),
            callback: callback.into(),
            path: path.into(),
            checksum: checksum.into(),
            error: None,
        }
    }

    /// Creates a failed download record (checksum is empty).
    pub fn download_failed(
        id: TaskId,
        tag: impl Into<Arc<str>>,
        callback: impl Into<Arc<str>>,
        path: impl Into<PathBuf>,
        error: impl Into<String>,
    ) -> Self {
        ScriptEvent::Download {
            id,
            tag: tag.into(),
            callback: callback.into(),
            path: path.into(),
            checksum: String::new(),
            error: Some(error.into()),
        }
    }

    /// Creates a process exit record.
    pub fn process_exit(id: TaskId, name: impl Into<Arc<str>>, exit_code: Option<i32>) -> Self {
        ScriptEvent::Process {
            id,
            name: name.into(),
            exit_code,
        }
    }

    /// Returns the id of the task that produced this record.
    pub fn id(&self) -> TaskId {
        match self {
            ScriptEvent::Timer { id, .. }
            | ScriptEvent::Download { id, .. }
            | ScriptEvent::Process { id, .. } => *id,
        }
    }

    /// Returns the tag or process name.
    pub fn name(&self) -> &str {
        match self {
            ScriptEvent::Timer { tag, .. } | ScriptEvent::Download { tag, .. } => tag,
            ScriptEvent::Process { name, .. } => name,
        }
    }

    /// Returns the callback to invoke, if this kind of record has one.
    pub fn callback(&self) -> Option<&str> {
        match self {
            ScriptEvent::Timer { callback, .. } | ScriptEvent::Download { callback, .. } => {
                Some(callback)
            }
            ScriptEvent::Process { .. } => None,
        }
    }

    /// Returns a short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ScriptEvent::Timer { .. } => "timer",
            ScriptEvent::Download { .. } => "download",
            ScriptEvent::Process { .. } => "process",
        }
    }
}
