//! # Task registry - name-keyed map of live capability tasks.
//!
//! Every capability module (timer, downloader, process) keeps its tasks in one
//! [`Registry`]. The registry owns the task handles (JoinHandle + CancellationToken)
//! plus module-specific metadata.
//!
//! ## Architecture
//! ```text
//! script call ──► Registry::try_register(name, launch)
//!                    ├─► reject empty / duplicate name
//!                    ├─► launch(id, token) → (meta, future)   (under the lock)
//!                    └─► tokio::spawn(future), insert Handle
//!
//! background task ──► Registry::complete(name, id) → true  → enqueue ScriptEvent
//!                                                   → false → discard (cancelled/superseded)
//!
//! deleteX(name) ──► Registry::cancel(name)   → token.cancel(), remove entry
//! Generation::stop ──► Registry::drain()     → cancel all, hand back JoinHandles
//! ```
//!
//! ## Rules
//! - A name maps to at most one live task.
//! - Spawning happens while the lock is held, so a task can never complete before it is registered.
//! - `complete` removes an entry only if it still belongs to the calling task id.
//! - Cancellation is advisory: a task past its last await may still finish; its
//!   `complete` call then returns `false`.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TaskStartError;
use crate::events::TaskId;

/// Handle to a running capability task.
pub(crate) struct Handle<M> {
    /// Identity of this registration.
    pub id: TaskId,
    /// Individual cancellation token for this task.
    pub cancel: CancellationToken,
    /// Join handle of the background future.
    pub join: JoinHandle<()>,
    /// Module-specific metadata.
    pub meta: M,
}

/// Name-keyed registry of live tasks.
pub(crate) struct Registry<M> {
    kind: &'static str,
    tasks: Mutex<HashMap<String, Handle<M>>>,
}

impl<M> Registry<M> {
    /// Creates an empty registry; `kind` names the module in errors and logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a task under `name` and spawns its future.
    ///
    /// `launch` receives the fresh id and token and returns the metadata and the
    /// future to spawn. If it fails nothing is registered.
    pub fn try_register<F, Fut>(&self, name: &str, launch: F) -> Result<TaskId, TaskStartError>
    where
        F: FnOnce(TaskId, CancellationToken) -> Result<(M, Fut), TaskStartError>,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if name.is_empty() {
            return Err(TaskStartError::EmptyName { kind: self.kind });
        }

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(name) {
            return Err(TaskStartError::AlreadyExists {
                kind: self.kind,
                name: name.to_string(),
            });
        }

        let id = TaskId::next();
        let cancel = CancellationToken::new();
        let (meta, fut) = launch(id, cancel.clone())?;
        let join = tokio::spawn(fut);

        tasks.insert(
            name.to_string(),
            Handle {
                id,
                cancel,
                join,
                meta,
            },
        );
        Ok(id)
    }

    /// Removes the entry for `name` if it still belongs to task `id`.
    ///
    /// Called by a task when it completes; `false` means the completion must be discarded.
    pub fn complete(&self, name: &str, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(name) {
            Some(h) if h.id == id => {
                tasks.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Cancels and removes the task under `name`. No-op if absent.
    pub fn cancel(&self, name: &str) -> bool {
        let handle = self.tasks.lock().remove(name);
        match handle {
            Some(h) => {
                h.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns true if `name` is registered to task `id`.
    pub fn contains(&self, name: &str, id: TaskId) -> bool {
        self.tasks.lock().get(name).is_some_and(|h| h.id == id)
    }

    /// Returns sorted list of registered names.
    pub fn names(&self) -> Vec<String> {
        let tasks = self.tasks.lock();
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Returns the number of registered tasks.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Removes every entry and hands the handles back (tokens not cancelled yet).
    pub fn drain(&self) -> Vec<(String, Handle<M>)> {
        self.tasks.lock().drain().collect()
    }

    /// Cancels every task and returns their join handles.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        self.drain()
            .into_iter()
            .map(|(_, h)| {
                h.cancel.cancel();
                h.join
            })
            .collect()
    }
}

impl<M: Clone> Registry<M> {
    /// Returns metadata for `name`.
    pub fn get(&self, name: &str) -> Option<M> {
        self.tasks.lock().get(name).map(|h| h.meta.clone())
    }

    /// Returns `(name, metadata)` for every entry, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, M)> {
        let tasks = self.tasks.lock();
        let mut all: Vec<(String, M)> = tasks
            .iter()
            .map(|(name, h)| (name.clone(), h.meta.clone()))
            .collect();
        all.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
