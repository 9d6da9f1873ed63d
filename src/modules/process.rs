//! # Process module - supervised child processes.
//!
//! Lua surface:
//! ```lua
//! local err = process.createProcess("worker", "/usr/bin/worker --flag", "A=1 B=2")
//! process.killProcess("worker")
//! local all = process.listProcess()   -- nil or { {name=.., pid=..}, .. }
//! local one = process.getProcess("worker")
//! ```
//!
//! Each child gets a waiter task. When the child exits on its own the waiter
//! removes the entry and reports a [`ScriptEvent::Process`] (no callback is
//! invoked for it). Killing a process tears the entry down immediately.

use std::sync::Arc;

use mlua::{Lua, Table, Value};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProcessPolicy;
use crate::core::Registry;
use crate::error::TaskStartError;
use crate::events::{EventSender, ScriptEvent, TaskId};

/// Metadata of a supervised process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    /// OS process id (absent if the OS did not report one).
    pub pid: Option<u32>,
    /// Command line as passed by the script.
    pub command: String,
}

/// Process registry of one generation.
pub struct Processes {
    registry: Arc<Registry<ProcessInfo>>,
    events: EventSender,
    policy: ProcessPolicy,
}

impl Processes {
    /// Creates an empty process registry.
    pub fn new(events: EventSender, policy: ProcessPolicy) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry::new("process")),
            events,
            policy,
        })
    }

    /// Launches `command` under `name`.
    ///
    /// A non-empty `env` replaces the child's environment entirely; an empty one
    /// lets it inherit the agent's.
    pub fn create(
        &self,
        name: &str,
        command: &str,
        env: &[(String, String)],
    ) -> Result<TaskId, TaskStartError> {
        let argv = super::split_command(command);
        let name_arc: Arc<str> = Arc::from(name);
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();

        self.registry.try_register(name, move |id, token| {
            let Some((program, args)) = argv.split_first() else {
                return Err(TaskStartError::InvalidCommand {
                    command: command.to_string(),
                });
            };

            let mut cmd = Command::new(program);
            cmd.args(args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::inherit())
                .stderr(std::process::Stdio::inherit());
            if !env.is_empty() {
                cmd.env_clear();
                cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }

            let child = cmd.spawn().map_err(|e| TaskStartError::Spawn {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

            let info = ProcessInfo {
                pid: child.id(),
                command: command.to_string(),
            };
            info!(name = %name_arc, pid = ?info.pid, %command, "process started");
            Ok((info, wait_child(id, name_arc, child, token, registry, events)))
        })
    }

    /// Kills the process under `name` and removes its entry. No-op if absent.
    ///
    /// The signal is sent before returning; the waiter only reaps the child.
    pub fn kill(&self, name: &str) -> bool {
        let pid = self.registry.get(name).and_then(|info| info.pid);
        if !self.registry.cancel(name) {
            return false;
        }
        if let Some(pid) = pid {
            send_kill(name, pid);
        }
        true
    }

    /// Returns metadata for `name`.
    pub fn get(&self, name: &str) -> Option<ProcessInfo> {
        self.registry.get(name)
    }

    /// Returns every supervised process, sorted by name.
    pub fn list(&self) -> Vec<(String, ProcessInfo)> {
        self.registry.snapshot()
    }

    /// Drops the entry for `name` if it still belongs to `id`.
    pub fn reclaim(&self, name: &str, id: TaskId) -> bool {
        self.registry.complete(name, id)
    }

    /// Releases every process according to the configured [`ProcessPolicy`].
    ///
    /// Returns the waiter handles that still need to be joined.
    pub fn clear(&self) -> Vec<JoinHandle<()>> {
        match self.policy {
            ProcessPolicy::KillOnStop => self.registry.cancel_all(),
            ProcessPolicy::Detach => {
                for (name, h) in self.registry.drain() {
                    debug!(%name, pid = ?h.meta.pid, "process detached");
                    h.join.abort();
                }
                Vec::new()
            }
        }
    }

    /// Builds the `process` Lua module.
    pub(crate) fn loader(self: &Arc<Self>, lua: &Lua) -> mlua::Result<Table> {
        let module = lua.create_table()?;

        let procs = Arc::clone(self);
        module.set(
            "createProcess",
            lua.create_function(move |_, (name, command, env): (Value, Value, Value)| {
                let name = super::arg_string(&name);
                let command = super::arg_string(&command);
                info!(%name, %command, "createProcess");
                let res = parse_env(&env).and_then(|env| procs.create(&name, &command, &env));
                Ok(super::err_value(res))
            })?,
        )?;

        let procs = Arc::clone(self);
        module.set(
            "killProcess",
            lua.create_function(move |_, name: Value| {
                let name = super::arg_string(&name);
                if procs.kill(&name) {
                    info!(%name, "killProcess");
                }
                Ok(())
            })?,
        )?;

        let procs = Arc::clone(self);
        module.set(
            "listProcess",
            lua.create_function(move |lua, ()| {
                let all = procs.list();
                if all.is_empty() {
                    return Ok(Value::Nil);
                }
                let list = lua.create_table()?;
                for (name, info) in all {
                    list.push(process_table(lua, &name, &info)?)?;
                }
                Ok(Value::Table(list))
            })?,
        )?;

        let procs = Arc::clone(self);
        module.set(
            "getProcess",
            lua.create_function(move |lua, name: Value| {
                let name = super::arg_string(&name);
                match procs.get(&name) {
                    Some(info) => Ok(Value::Table(process_table(lua, &name, &info)?)),
                    None => Ok(Value::Nil),
                }
            })?,
        )?;

        Ok(module)
    }
}

#[cfg(unix)]
fn send_kill(name: &str, pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; the child is not reaped until its waiter runs.
    if unsafe { libc::kill(raw, libc::SIGKILL) } != 0 {
        warn!(%name, pid, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

#[cfg(not(unix))]
fn send_kill(_name: &str, _pid: u32) {}

fn process_table(lua: &Lua, name: &str, info: &ProcessInfo) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("name", name)?;
    t.set("pid", info.pid)?;
    t.set("command", info.command.as_str())?;
    Ok(t)
}

/// Reads an environment given as `"K=V K2=V2"` or as a `{K = V}` table.
fn parse_env(value: &Value) -> Result<Vec<(String, String)>, TaskStartError> {
    let invalid = |reason: String| TaskStartError::InvalidEnv { reason };
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::String(s) => Ok(parse_env_str(&s.to_string_lossy())),
        Value::Table(t) => {
            let mut env = Vec::new();
            for pair in t.pairs::<String, String>() {
                env.push(pair.map_err(|e| invalid(e.to_string()))?);
            }
            env.sort();
            Ok(env)
        }
        other => Err(invalid(format!(
            "expected a string or table, got {}",
            other.type_name()
        ))),
    }
}

fn parse_env_str(s: &str) -> Vec<(String, String)> {
    s.split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn wait_child(
    id: TaskId,
    name: Arc<str>,
    mut child: Child,
    token: CancellationToken,
    registry: Arc<Registry<ProcessInfo>>,
    events: EventSender,
) {
    let status = select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!(%name, error = %e, "kill failed");
            }
            let _ = child.wait().await;
            info!(%name, "process killed");
            return;
        }
    };

    let exit_code = match status {
        Ok(s) => s.code(),
        Err(e) => {
            warn!(%name, error = %e, "wait failed");
            None
        }
    };
    info!(%name, ?exit_code, "process exited");

    if registry.complete(&name, id) {
        events.send(ScriptEvent::process_exit(id, name, exit_code)).await;
    }
}
