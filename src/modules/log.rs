//! # Log module - script logging bridged to `tracing`.
//!
//! `log.debug(msg)`, `log.info(msg)`, `log.warn(msg)`, `log.error(msg)` emit events
//! under target `script`, tagged with the generation id.

use mlua::{Lua, Table};
use tracing::{debug, error, info, warn};

pub(crate) fn loader(lua: &Lua, generation: u64) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set(
        "debug",
        lua.create_function(move |_, msg: String| {
            debug!(target: "script", generation, "{msg}");
            Ok(())
        })?,
    )?;
    module.set(
        "info",
        lua.create_function(move |_, msg: String| {
            info!(target: "script", generation, "{msg}");
            Ok(())
        })?,
    )?;
    module.set(
        "warn",
        lua.create_function(move |_, msg: String| {
            warn!(target: "script", generation, "{msg}");
            Ok(())
        })?,
    )?;
    module.set(
        "error",
        lua.create_function(move |_, msg: String| {
            error!(target: "script", generation, "{msg}");
            Ok(())
        })?,
    )?;

    Ok(module)
}
