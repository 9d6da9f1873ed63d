//! # Agent module - stateless host utilities.
//!
//! Functions return `nil` on success or an error string, except `fileMD5` and
//! `exec` which return `value, nil` / `nil, err`.
//!
//! These run synchronously on the script-owner thread. `exec` blocks the script
//! until the command finishes or its timeout expires.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use mlua::{Lua, MultiValue, Table, Value};
use tokio::runtime::{self, Handle, RuntimeFlavor};
use tokio::{task, time};
use tracing::{debug, info};

use super::HostContext;
use crate::checksum;

/// Builds the `agent` Lua module.
pub(crate) fn loader(lua: &Lua, host: &HostContext) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set(
        "fileMD5",
        lua.create_function(|lua, path: String| {
            pair(lua, checksum::file_md5_hex(&path).map_err(|e| format!("{path}: {e}")))
        })?,
    )?;

    let ctx = host.clone();
    module.set(
        "info",
        lua.create_function(move |lua, ()| info_table(lua, &ctx))?,
    )?;

    module.set(
        "extractZip",
        lua.create_function(|_, (path, out): (String, Option<String>)| {
            let out = out
                .map(PathBuf::from)
                .unwrap_or_else(|| parent_dir(Path::new(&path)));
            info!(%path, out = %out.display(), "extractZip");
            Ok(extract_zip(Path::new(&path), &out).err())
        })?,
    )?;

    module.set(
        "extract7z",
        lua.create_function(|_, (path, out): (String, Option<String>)| {
            let out = out
                .map(PathBuf::from)
                .unwrap_or_else(|| parent_dir(Path::new(&path)));
            info!(%path, out = %out.display(), "extract7z");
            Ok(extract_7z(Path::new(&path), &out).err())
        })?,
    )?;

    module.set(
        "copyDir",
        lua.create_function(|_, (src, dst): (String, String)| {
            info!(%src, %dst, "copyDir");
            Ok(copy_dir(Path::new(&src), Path::new(&dst)).err())
        })?,
    )?;

    module.set(
        "removeAll",
        lua.create_function(|_, path: String| {
            info!(%path, "removeAll");
            Ok(remove_all(Path::new(&path)).err())
        })?,
    )?;

    module.set(
        "chmod",
        lua.create_function(|_, (path, mode): (String, String)| {
            Ok(chmod(Path::new(&path), &mode).err())
        })?,
    )?;

    let default_timeout = host.config.exec_timeout();
    module.set(
        "exec",
        lua.create_function(move |lua, (command, timeout): (String, Option<f64>)| {
            let timeout = timeout
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .unwrap_or(default_timeout);
            info!(%command, ?timeout, "exec");
            match exec(&command, timeout) {
                Ok(out) => {
                    let t = lua.create_table()?;
                    t.set("status", out.status)?;
                    t.set("stdout", lua.create_string(&out.stdout)?)?;
                    t.set("stderr", lua.create_string(&out.stderr)?)?;
                    Ok((Value::Table(t), Value::Nil))
                }
                Err(e) => Ok((Value::Nil, Value::String(lua.create_string(&e)?))),
            }
        })?,
    )?;

    module.set(
        "execWithDetach",
        lua.create_function(|_, command: String| {
            info!(%command, "execWithDetach");
            Ok(exec_detached(&command).err())
        })?,
    )?;

    Ok(module)
}

/// Returns `value, nil` or `nil, err`.
fn pair(lua: &Lua, res: Result<String, String>) -> mlua::Result<MultiValue> {
    let (v, e) = match res {
        Ok(v) => (Value::String(lua.create_string(&v)?), Value::Nil),
        Err(e) => (Value::Nil, Value::String(lua.create_string(&e)?)),
    };
    Ok(MultiValue::from_vec(vec![v, e]))
}

fn info_table(lua: &Lua, ctx: &HostContext) -> mlua::Result<Table> {
    let dev = &ctx.device;
    let cfg = &ctx.config;
    let t = lua.create_table()?;
    t.set("hostname", dev.hostname.as_str())?;
    t.set("os", dev.os.as_str())?;
    t.set("platform", dev.platform.as_str())?;
    t.set("platformVersion", dev.platform_version.as_str())?;
    t.set("bootTime", dev.boot_time)?;
    t.set("arch", dev.arch.as_str())?;
    t.set("macs", dev.macs.as_str())?;
    t.set("cpuModuleName", dev.cpu_model.as_str())?;
    t.set("cpuCores", dev.cpu_cores)?;
    t.set("cpuMhz", dev.cpu_mhz)?;
    t.set("totalmemory", dev.total_memory)?;
    t.set("usedMemory", dev.used_memory)?;
    t.set("availableMemory", dev.available_memory)?;
    t.set("baseboard", dev.baseboard.as_str())?;
    t.set("uuid", dev.machine_id.as_str())?;
    t.set("androidID", dev.android_id.as_str())?;
    t.set("androidSerialNumber", dev.android_serial.as_str())?;
    t.set("workingDir", cfg.working_dir.display().to_string())?;
    t.set("version", crate::VERSION)?;
    t.set("serverURL", cfg.server_url.as_str())?;
    t.set("scriptFileName", cfg.script_file.as_str())?;
    t.set("scriptInterval", cfg.check_interval_clamped().as_secs())?;
    Ok(t)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn extract_zip(path: &Path, out: &Path) -> Result<(), String> {
    let file = fs::File::open(path).map_err(|e| format!("open {}: {e}", path.display()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| format!("read {}: {e}", path.display()))?;
    fs::create_dir_all(out).map_err(|e| format!("create {}: {e}", out.display()))?;
    archive
        .extract(out)
        .map_err(|e| format!("extract {}: {e}", path.display()))
}

fn extract_7z(path: &Path, out: &Path) -> Result<(), String> {
    fs::create_dir_all(out).map_err(|e| format!("create {}: {e}", out.display()))?;
    sevenz_rust::decompress_file(path, out).map_err(|e| format!("extract {}: {e}", path.display()))
}

/// Copies every file under `src` into `dst`, creating directories as needed.
fn copy_dir(src: &Path, dst: &Path) -> Result<(), String> {
    if !src.is_dir() {
        return Err(format!("{} is not a directory", src.display()));
    }
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| e.to_string())?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| e.to_string())?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| format!("create {}: {e}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("create {}: {e}", parent.display()))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| format!("copy {}: {e}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Removes a file or a directory tree; a missing path is not an error.
fn remove_all(path: &Path) -> Result<(), String> {
    let res = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("remove {}: {e}", path.display())),
    }
}

#[cfg(unix)]
fn chmod(path: &Path, mode: &str) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let bits = u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|e| format!("invalid mode `{mode}`: {e}"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(bits))
        .map_err(|e| format!("chmod {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn chmod(_path: &Path, _mode: &str) -> Result<(), String> {
    Err("chmod is not supported on this platform".to_string())
}

struct ExecOutput {
    status: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Runs `command` to completion, killing it once `timeout` expires.
fn exec(command: &str, timeout: Duration) -> Result<ExecOutput, String> {
    let argv = super::split_command(command);
    let Some((program, args)) = argv.split_first() else {
        return Err(format!("invalid command `{command}`"));
    };

    let out = block_on(async {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match time::timeout(timeout, cmd.output()).await {
            Ok(res) => res.map_err(|e| format!("failed to run `{command}`: {e}")),
            Err(_) => {
                debug!(%command, "exec timed out");
                Err("execute timeout".to_string())
            }
        }
    })??;

    Ok(ExecOutput {
        status: out.status.code().unwrap_or(-1),
        stdout: out.stdout,
        stderr: out.stderr,
    })
}

/// Drives `fut` to completion from the synchronous script thread.
///
/// On a multi-thread runtime the current worker hands its other tasks off while
/// blocking. Anywhere else the future runs on a scoped thread with its own
/// current-thread runtime.
fn block_on<F>(fut: F) -> Result<F::Output, String>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(task::block_in_place(|| handle.block_on(fut)))
        }
        _ => thread::scope(|scope| {
            scope
                .spawn(|| {
                    let rt = runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| format!("exec runtime: {e}"))?;
                    Ok(rt.block_on(fut))
                })
                .join()
                .map_err(|_| "exec thread panicked".to_string())?
        }),
    }
}

/// Starts `command` through the system shell and forgets it.
fn exec_detached(command: &str) -> Result<(), String> {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd.exe");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    cmd.arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(drop)
        .map_err(|e| format!("failed to start `{command}`: {e}"))
}
