//! # Capability modules exposed to scripts.
//!
//! Each module is a Lua table of host functions installed both as a global and
//! into `package.preload`, so scripts can use either `timer.createTimer(..)` or
//! `local timer = require("timer")`.
//!
//! | Lua module   | Host type       | Stateful | Produces events        |
//! |--------------|-----------------|----------|------------------------|
//! | `timer`      | [`Timers`]      | yes      | `ScriptEvent::Timer`   |
//! | `downloader` | [`Downloads`]   | yes      | `ScriptEvent::Download`|
//! | `process`    | [`Processes`]   | yes      | `ScriptEvent::Process` |
//! | `agent`      | utilities       | no       | -                      |
//! | `log`        | tracing bridge  | no       | -                      |
//! | `json`       | serde_json      | no       | -                      |
//!
//! ## Rules
//! - Host functions run on the script-owner thread only (they are Lua callbacks).
//! - Rejections are returned to the script as an error string; `nil` means success.
//! - Background work never touches the interpreter; it only sends [`ScriptEvent`](crate::ScriptEvent)s.

mod download;
mod host;
mod json;
mod log;
mod process;
mod timer;

use std::sync::Arc;

use mlua::{Function, Lua, Table, Value};

use crate::config::AgentConfig;
use crate::devinfo::DevInfo;
use crate::error::TaskStartError;

pub use download::{DownloadInfo, Downloads};
pub use process::{ProcessInfo, Processes};
pub use timer::{TimerInfo, Timers};

pub(crate) use host::loader as host_loader;
pub(crate) use json::loader as json_loader;
pub(crate) use log::loader as log_loader;

/// Registry slot holding the script's exports table.
pub(crate) const EXPORTS_KEY: &str = "scriptvisor.exports";

/// Agent-wide values shared by every generation's modules.
#[derive(Clone, Debug)]
pub struct HostContext {
    /// Agent configuration.
    pub config: Arc<AgentConfig>,
    /// Device information collected at startup.
    pub device: Arc<DevInfo>,
    /// HTTP client shared by downloads.
    pub http: reqwest::Client,
}

impl HostContext {
    /// Creates a context with a default HTTP client.
    pub fn new(config: AgentConfig, device: DevInfo) -> Self {
        Self {
            config: Arc::new(config),
            device: Arc::new(device),
            http: reqwest::Client::new(),
        }
    }
}

/// Returns the exported function `name`, if the script defines one.
pub(crate) fn exported_function(lua: &Lua, name: &str) -> Option<Function> {
    let exports: Table = lua
        .named_registry_value::<Option<Table>>(EXPORTS_KEY)
        .ok()
        .flatten()?;
    match exports.get::<Value>(name).ok()? {
        Value::Function(f) => Some(f),
        _ => None,
    }
}

/// Checks that `callback` is an exported function of the running script.
pub(crate) fn resolve_callback(lua: &Lua, callback: &str) -> Result<(), TaskStartError> {
    let has_exports = lua
        .named_registry_value::<Option<Table>>(EXPORTS_KEY)
        .ok()
        .flatten()
        .is_some();
    if !has_exports {
        return Err(TaskStartError::NoExports);
    }
    match exported_function(lua, callback) {
        Some(_) => Ok(()),
        None => Err(TaskStartError::UnknownCallback {
            callback: callback.to_string(),
        }),
    }
}

/// Installs `module` as global `name` and as `package.preload[name]`.
pub(crate) fn install(lua: &Lua, name: &str, module: Table) -> mlua::Result<()> {
    lua.globals().set(name, module.clone())?;

    let package: Table = lua.globals().get("package")?;
    let preload: Table = package.get("preload")?;
    preload.set(name, lua.create_function(move |_, ()| Ok(module.clone()))?)?;
    Ok(())
}

/// Maps a module result to the Lua convention: `nil` on success, message on error.
pub(crate) fn err_value<T>(res: Result<T, TaskStartError>) -> Option<String> {
    res.err().map(|e| e.to_string())
}

/// Reads a script argument as a string.
///
/// Strings and numbers convert; anything else, including a missing argument,
/// reads as empty so the caller's own validation rejects it.
pub(crate) fn arg_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Reads a script argument as a number; numeric strings convert.
pub(crate) fn arg_number(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Number(n) => Some(*n),
        Value::String(s) => s.to_str().ok().and_then(|s| s.trim().parse().ok()),
        _ => None,
    }
}

/// Splits a command line on whitespace. No quoting support.
pub(crate) fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
