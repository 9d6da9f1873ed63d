//! # JSON module.
//!
//! ```lua
//! local s, err = json.encode({ name = "edge", ports = { 80, 443 } })
//! local t, err = json.decode('{"ok":true}')
//! ```
//!
//! Both functions return `value, nil` or `nil, err`. JSON `null` decodes to
//! `nil`; decoded arrays keep an array marker so they encode back as arrays.

use mlua::{Lua, LuaSerdeExt, MultiValue, SerializeOptions, Table, Value};

/// Builds the `json` Lua module.
pub(crate) fn loader(lua: &Lua) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let res = lua
                .from_value::<serde_json::Value>(value)
                .map_err(|e| e.to_string())
                .and_then(|v| serde_json::to_string(&v).map_err(|e| e.to_string()));
            match res {
                Ok(s) => result(lua, Value::String(lua.create_string(&s)?), None),
                Err(e) => result(lua, Value::Nil, Some(e)),
            }
        })?,
    )?;

    module.set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let options = SerializeOptions::new()
                .serialize_none_to_null(false)
                .serialize_unit_to_null(false);
            match serde_json::from_slice::<serde_json::Value>(&text.as_bytes()) {
                Ok(v) => result(lua, lua.to_value_with(&v, options)?, None),
                Err(e) => result(lua, Value::Nil, Some(e.to_string())),
            }
        })?,
    )?;

    Ok(module)
}

fn result(lua: &Lua, value: Value, err: Option<String>) -> mlua::Result<MultiValue> {
    let err = match err {
        Some(e) => Value::String(lua.create_string(&e)?),
        None => Value::Nil,
    };
    Ok(MultiValue::from_vec(vec![value, err]))
}
