//! # Generation: one loaded script and everything it started.
//!
//! A [`Generation`] owns the Lua state of one script version, its exports table,
//! its three capability registries and the receiving half of its event queue.
//!
//! ## Lifecycle
//! ```text
//! Generation::new(checksum, source)   evaluate top level once, capture exports
//!        │                            (load failure → inert generation, logged)
//!        ▼
//! start()                             install timer/downloader/process/agent/log,
//!        │                            call exports.start()
//!        ▼
//! dispatch(event) ◄── next_event()    one at a time, never reentrant (&mut self)
//!        │
//!        ▼
//! stop()                              call exports.stop() once, cancel every task,
//!                                     drop the Lua state, close + drain the queue,
//!                                     join cancelled tasks within the grace period
//! ```
//!
//! ## Rules
//! - Only the owner of the generation touches the Lua state.
//! - Callback failures are logged and reported as [`Dispatch::Failed`]; they never escape.
//! - `stop()` is idempotent; after it returns every call is a no-op.
//! - A generation that is dropped without `stop()` still cancels its tasks.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use mlua::{IntoLuaMulti, Lua, Table, Value};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::events::{EventQueue, EventReceiver, ScriptEvent};
use crate::modules::{self, Downloads, HostContext, Processes, Timers};

/// Global sequence counter for generation identity.
static GENERATION_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Loaded,
    Started,
    Stopped,
}

/// Outcome of dispatching one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// The callback ran to completion.
    Delivered,
    /// The callback raised an error (logged).
    Failed,
    /// The producing task no longer owns its tag; the record was dropped.
    Stale,
    /// Nothing to invoke (process exit, missing callback, stopped or inert generation).
    Skipped,
}

/// One loaded script instance and its live tasks.
pub struct Generation {
    id: u64,
    checksum: String,
    created_at: Instant,
    started_at: Option<Instant>,
    state: State,
    lua: Option<Lua>,
    has_exports: bool,
    load_error: Option<AgentError>,
    timers: Arc<Timers>,
    downloads: Arc<Downloads>,
    processes: Arc<Processes>,
    events: EventReceiver,
    host: HostContext,
}

impl Generation {
    /// Evaluates `source` once and captures its exports table.
    ///
    /// Never fails: a script that does not load yields an inert generation whose
    /// error is available through [`Generation::load_error`].
    pub fn new(checksum: impl Into<String>, source: &[u8], host: HostContext) -> Self {
        let id = GENERATION_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
        let checksum = checksum.into();
        let cfg = &host.config;

        let (tx, rx) = EventQueue::bounded(cfg.queue_capacity_clamped());
        let timers = Timers::new(tx.clone());
        let downloads = Downloads::new(tx.clone(), host.http.clone(), cfg.download_timeout());
        let processes = Processes::new(tx, cfg.process_policy);

        let lua = Lua::new();
        let (has_exports, load_error) = match load_exports(&lua, id, source) {
            Ok(has) => {
                if !has {
                    warn!(generation = id, %checksum, "script returned no exports table");
                }
                (has, None)
            }
            Err(e) => {
                error!(generation = id, %checksum, error = %e, "script load failed");
                (false, Some(e))
            }
        };
        debug!(generation = id, %checksum, bytes = source.len(), "generation created");

        Self {
            id,
            checksum,
            created_at: Instant::now(),
            started_at: None,
            state: State::Loaded,
            lua: Some(lua),
            has_exports,
            load_error,
            timers,
            downloads,
            processes,
            events: rx,
            host,
        }
    }

    /// Installs the capability modules and calls the script's `start` export.
    ///
    /// Only the first call has an effect.
    pub fn start(&mut self) {
        if self.state != State::Loaded {
            return;
        }
        self.state = State::Started;
        self.started_at = Some(Instant::now());

        let Some(lua) = self.lua.as_ref() else {
            return;
        };
        if let Err(e) = install_modules(lua, self) {
            error!(generation = self.id, error = %e, "module install failed");
        }
        info!(generation = self.id, checksum = %self.checksum, "generation started");

        if self.has_exports {
            self.invoke("start", ());
        }
    }

    /// Delivers one event to its callback.
    pub fn dispatch(&mut self, ev: ScriptEvent) -> Dispatch {
        if self.state != State::Started {
            return Dispatch::Skipped;
        }

        match ev {
            ScriptEvent::Timer { id, tag, callback } => {
                if !self.timers.is_active(&tag, id) {
                    debug!(generation = self.id, %tag, task = %id, "stale timer tick dropped");
                    return Dispatch::Stale;
                }
                self.invoke(&callback, tag.as_ref())
            }
            ScriptEvent::Download {
                tag,
                callback,
                path,
                checksum,
                error,
                ..
            } => {
                let Some(lua) = self.lua.as_ref() else {
                    return Dispatch::Skipped;
                };
                let record = match download_record(lua, &tag, &path, &checksum, error.as_deref()) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(generation = self.id, %tag, error = %e, "download record build failed");
                        return Dispatch::Failed;
                    }
                };
                self.invoke(&callback, record)
            }
            ScriptEvent::Process { id, name, exit_code } => {
                self.processes.reclaim(&name, id);
                debug!(generation = self.id, %name, ?exit_code, "process exit recorded");
                Dispatch::Skipped
            }
        }
    }

    /// Waits for the next queued event.
    ///
    /// Never resolves once the generation is stopped.
    pub async fn next_event(&mut self) -> ScriptEvent {
        match self.events.recv().await {
            Some(ev) => ev,
            None => std::future::pending().await,
        }
    }

    /// Calls the `stop` export, cancels every task and releases the Lua state.
    ///
    /// Waits up to the configured grace period for cancelled tasks, then aborts
    /// the rest. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        let was_started = self.state == State::Started;
        if was_started && self.has_exports {
            self.invoke("stop", ());
        }
        self.state = State::Stopped;

        let mut joins = self.timers.clear();
        joins.extend(self.downloads.clear());
        joins.extend(self.processes.clear());

        self.lua = None;
        let dropped = self.events.close_and_drain();
        let tasks = joins.len();

        let grace = self.host.config.stop_grace;
        if join_with_grace(joins, grace).await {
            info!(generation = self.id, tasks, dropped, "generation stopped");
        } else {
            warn!(generation = self.id, tasks, dropped, ?grace, "generation stop exceeded grace; tasks aborted");
        }
    }

    /// Returns the generation's unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the checksum of the loaded source.
    #[inline]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns when the generation was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns when `start()` ran, if it did.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Returns true after `stop()`.
    pub fn is_stopped(&self) -> bool {
        self.state == State::Stopped
    }

    /// Returns the load failure of an inert generation.
    pub fn load_error(&self) -> Option<&AgentError> {
        self.load_error.as_ref()
    }

    /// Returns true if the script returned an exports table.
    pub fn has_exports(&self) -> bool {
        self.has_exports
    }

    /// Returns true if the exports table defines function `name`.
    pub fn has_callback(&self, name: &str) -> bool {
        self.lua
            .as_ref()
            .is_some_and(|lua| modules::exported_function(lua, name).is_some())
    }

    /// Timer registry.
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Download registry.
    pub fn downloads(&self) -> &Downloads {
        &self.downloads
    }

    /// Process registry.
    pub fn processes(&self) -> &Processes {
        &self.processes
    }

    #[cfg(test)]
    pub(crate) fn lua(&self) -> Option<&Lua> {
        self.lua.as_ref()
    }

    /// Invokes exported function `name`, logging failures.
    fn invoke(&self, name: &str, args: impl IntoLuaMulti) -> Dispatch {
        let Some(lua) = self.lua.as_ref() else {
            return Dispatch::Skipped;
        };
        let Some(f) = modules::exported_function(lua, name) else {
            debug!(generation = self.id, callback = name, "callback not exported");
            return Dispatch::Skipped;
        };
        match f.call::<()>(args) {
            Ok(()) => Dispatch::Delivered,
            Err(e) => {
                let err = AgentError::Callback {
                    callback: name.to_string(),
                    reason: e.to_string(),
                };
                error!(generation = self.id, label = err.as_label(), error = %err, "callback failed");
                Dispatch::Failed
            }
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if self.state != State::Stopped {
            self.timers.clear();
            self.downloads.clear();
            self.processes.clear();
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("checksum", &self.checksum)
            .field("state", &self.state)
            .field("has_exports", &self.has_exports)
            .finish_non_exhaustive()
    }
}

/// Evaluates the top level; returns whether it produced an exports table.
fn load_exports(lua: &Lua, id: u64, source: &[u8]) -> Result<bool, AgentError> {
    let value: Value = lua
        .load(source)
        .set_name(format!("=generation-{id}"))
        .eval()
        .map_err(|e| AgentError::Load {
            reason: e.to_string(),
        })?;

    match value {
        Value::Table(exports) => {
            lua.set_named_registry_value(modules::EXPORTS_KEY, exports)
                .map_err(|e| AgentError::Load {
                    reason: e.to_string(),
                })?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn install_modules(lua: &Lua, script: &Generation) -> mlua::Result<()> {
    modules::install(lua, "timer", script.timers.loader(lua)?)?;
    modules::install(lua, "downloader", script.downloads.loader(lua)?)?;
    modules::install(lua, "process", script.processes.loader(lua)?)?;
    modules::install(lua, "agent", modules::host_loader(lua, &script.host)?)?;
    modules::install(lua, "log", modules::log_loader(lua, script.id)?)?;
    modules::install(lua, "json", modules::json_loader(lua)?)?;
    Ok(())
}

/// Builds the table passed to a download callback.
fn download_record(
    lua: &Lua,
    tag: &str,
    path: &std::path::Path,
    checksum: &str,
    error: Option<&str>,
) -> mlua::Result<Table> {
    let path = path.display().to_string();
    let error = error.unwrap_or("");
    let t = lua.create_table()?;
    t.set("tag", tag)?;
    t.set("path", path.as_str())?;
    t.set("checksum", checksum)?;
    t.set("error", error)?;
    t.set("filePath", path.as_str())?;
    t.set("md5", checksum)?;
    t.set("err", error)?;
    Ok(t)
}

/// Joins `joins` within `grace`; aborts whatever is left. Returns false on timeout.
async fn join_with_grace(mut joins: Vec<JoinHandle<()>>, grace: Duration) -> bool {
    if joins.is_empty() {
        return true;
    }
    let res = time::timeout(grace, join_all(joins.iter_mut())).await;
    match res {
        Ok(_) => true,
        Err(_) => {
            for j in &joins {
                j.abort();
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::config::AgentConfig;
    use crate::devinfo::DevInfo;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn host() -> HostContext {
        let cfg = AgentConfig {
            stop_grace: Duration::from_secs(2),
            ..AgentConfig::default()
        };
        HostContext::new(cfg, DevInfo::default())
    }

    fn generation(src: &str) -> Generation {
        Generation::new(checksum::md5_hex(src.as_bytes()), src.as_bytes(), host())
    }

    /// Dispatches events for `dur`, returning the outcomes.
    async fn pump(script: &mut Generation, dur: Duration) -> Vec<Dispatch> {
        let deadline = Instant::now() + dur;
        let mut out = Vec::new();
        while let Ok(ev) = time::timeout_at(deadline, script.next_event()).await {
            out.push(script.dispatch(ev));
        }
        out
    }

    fn global<T: mlua::FromLua>(script: &Generation, name: &str) -> T {
        script.lua().unwrap().globals().get(name).unwrap()
    }

    #[tokio::test]
    async fn test_timer_fires_until_deleted() {
        let mut script = generation(
            r#"
            ticks = 0
            local M = {}
            function M.start() timer.createTimer("t1", 0.1, "onTick") end
            function M.onTick(tag) assert(tag == "t1"); ticks = ticks + 1 end
            return M
            "#,
        );
        script.start();

        pump(&mut script, Duration::from_millis(450)).await;
        let seen: i64 = global(&script, "ticks");
        assert!(seen >= 1, "onTick never ran");

        script.lua().unwrap().load("timer.deleteTimer('t1')").exec().unwrap();
        let after = pump(&mut script, Duration::from_millis(300)).await;
        assert!(after.iter().all(|d| *d == Dispatch::Stale));
        let later: i64 = global(&script, "ticks");
        assert_eq!(seen, later);

        script.stop().await;
    }

    #[tokio::test]
    async fn test_download_callback_receives_record() {
        let server = MockServer::start().await;
        let body = vec![0xABu8; 200];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let mut script = generation(
            r#"
            local M = {}
            function M.start()
              local err = downloader.createDownloader("d1", DEST, URL, "onDone", 5)
              assert(err == nil, err)
            end
            function M.onDone(r)
              calls = (calls or 0) + 1
              got = r
            end
            return M
            "#,
        );
        {
            let g = script.lua().unwrap().globals();
            g.set("DEST", dest.display().to_string()).unwrap();
            g.set("URL", server.uri()).unwrap();
        }
        script.start();

        let out = pump(&mut script, Duration::from_millis(800)).await;
        assert_eq!(out, vec![Dispatch::Delivered]);

        let got: Table = global(&script, "got");
        assert_eq!(got.get::<String>("path").unwrap(), dest.display().to_string());
        assert_eq!(got.get::<String>("checksum").unwrap(), checksum::md5_hex(&body));
        assert_eq!(got.get::<String>("error").unwrap(), "");
        assert_eq!(got.get::<String>("md5").unwrap(), checksum::md5_hex(&body));
        assert_eq!(global::<i64>(&script, "calls"), 1);
        script.stop().await;
    }

    #[tokio::test]
    async fn test_download_404_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let mut script = generation(
            r#"
            local M = {}
            function M.start() downloader.createDownloader("d1", DEST, URL, "onDone", 5) end
            function M.onDone(r) got = r end
            return M
            "#,
        );
        {
            let g = script.lua().unwrap().globals();
            g.set("DEST", dir.path().join("x").display().to_string()).unwrap();
            g.set("URL", server.uri()).unwrap();
        }
        script.start();

        let out = pump(&mut script, Duration::from_millis(800)).await;
        assert_eq!(out, vec![Dispatch::Delivered]);
        let got: Table = global(&script, "got");
        assert!(!got.get::<String>("error").unwrap().is_empty());
        assert_eq!(got.get::<String>("checksum").unwrap(), "");
        script.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_calls_stop_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stops");
        let mut script = generation(
            r#"
            local M = {}
            function M.start() timer.createTimer("t", 10, "onTick") end
            function M.onTick() end
            function M.stop()
              local f = io.open(MARKER, "a"); f:write("x"); f:close()
            end
            return M
            "#,
        );
        script.lua()
            .unwrap()
            .globals()
            .set("MARKER", marker.display().to_string())
            .unwrap();
        script.start();
        assert_eq!(script.timers().tags(), vec!["t".to_string()]);

        script.stop().await;
        script.stop().await;
        assert!(script.is_stopped());
        assert!(script.timers().tags().is_empty());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "x");
        assert_eq!(script.dispatch(ScriptEvent::timer(crate::TaskId::next(), "t", "onTick")), Dispatch::Skipped);
    }

    #[tokio::test]
    async fn test_dispatch_is_never_reentrant() {
        let mut script = generation(
            r#"
            busy, overlaps, calls = false, 0, 0
            local M = {}
            function M.start()
              timer.createTimer("a", 0.02, "onTick")
              timer.createTimer("b", 0.03, "onTick")
            end
            function M.onTick()
              if busy then overlaps = overlaps + 1 end
              busy = true
              local x = 0
              for i = 1, 20000 do x = x + i end
              calls = calls + 1
              busy = false
            end
            return M
            "#,
        );
        script.start();
        pump(&mut script, Duration::from_millis(300)).await;
        assert!(global::<i64>(&script, "calls") > 0);
        assert_eq!(global::<i64>(&script, "overlaps"), 0);
        script.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_callback_is_rejected_without_task() {
        let mut script = generation(
            r#"
            local M = {}
            function M.start()
              err = timer.createTimer("t", 1, "missing")
              dup1 = timer.createTimer("ok", 1, "onTick")
              dup2 = timer.createTimer("ok", 1, "onTick")
            end
            function M.onTick() end
            return M
            "#,
        );
        script.start();
        let err: Option<String> = global(&script, "err");
        assert!(err.unwrap().contains("missing"));
        assert_eq!(global::<Option<String>>(&script, "dup1"), None);
        assert!(global::<Option<String>>(&script, "dup2").is_some());
        assert_eq!(script.timers().tags(), vec!["ok".to_string()]);
        assert!(script.has_callback("onTick"));
        assert!(!script.has_callback("missing"));
        script.stop().await;
    }

    #[tokio::test]
    async fn test_missing_arguments_return_errors_and_start_continues() {
        let mut script = generation(
            r#"
            local M = {}
            function M.start()
              no_callback = timer.createTimer("t", 1)
              no_interval = timer.createTimer("t", nil, "onTick")
              no_url = downloader.createDownloader("d", "/tmp/x")
              no_command = process.createProcess("p")
              bad_env = process.createProcess("p", "true", true)
              timer.deleteTimer()
              reached = timer.createTimer("ok", 1, "onTick") == nil
            end
            function M.onTick() end
            return M
            "#,
        );
        script.start();

        let no_callback: Option<String> = global(&script, "no_callback");
        assert_eq!(
            no_callback.as_deref(),
            Some("callback `` is not exported by the script")
        );
        let no_interval: Option<String> = global(&script, "no_interval");
        assert!(no_interval.unwrap().starts_with("invalid timer interval"));
        assert!(global::<Option<String>>(&script, "no_url").is_some());
        let no_command: Option<String> = global(&script, "no_command");
        assert_eq!(no_command.as_deref(), Some("invalid command ``"));
        let bad_env: Option<String> = global(&script, "bad_env");
        assert!(bad_env.unwrap().starts_with("invalid process env"));

        assert!(global::<bool>(&script, "reached"));
        assert_eq!(script.timers().tags(), vec!["ok".to_string()]);
        assert!(script.downloads().tags().is_empty());
        assert!(script.processes().list().is_empty());
        script.stop().await;
    }

    #[tokio::test]
    async fn test_syntax_error_yields_inert_generation() {
        let mut script = generation("return {");
        assert!(matches!(script.load_error(), Some(AgentError::Load { .. })));
        assert!(!script.has_exports());
        script.start();

        let err: Option<String> = script
            .lua()
            .unwrap()
            .load("return timer.createTimer('t', 1, 'cb')")
            .eval()
            .unwrap();
        assert!(err.is_some());
        assert!(script.timers().tags().is_empty());
        script.stop().await;
    }

    #[tokio::test]
    async fn test_callback_error_does_not_stop_dispatch() {
        let mut script = generation(
            r#"
            local M = {}
            function M.start() timer.createTimer("t", 0.05, "onTick") end
            function M.onTick() error("boom") end
            return M
            "#,
        );
        script.start();
        let out = pump(&mut script, Duration::from_millis(200)).await;
        assert!(out.len() >= 2);
        assert!(out.iter().all(|d| *d == Dispatch::Failed));
        script.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_lifecycle_from_script() {
        let mut script = generation(
            r#"
            local M = {}
            function M.start()
              assert(process.createProcess("sleeper", "sleep 30") == nil)
              assert(process.createProcess("quick", "true") == nil)
            end
            return M
            "#,
        );
        script.start();
        assert_eq!(script.processes().list().len(), 2);

        let out = pump(&mut script, Duration::from_millis(500)).await;
        assert_eq!(out, vec![Dispatch::Skipped]);
        assert!(script.processes().get("quick").is_none());

        let pid: Option<i64> = script
            .lua()
            .unwrap()
            .load("return process.getProcess('sleeper').pid")
            .eval()
            .unwrap();
        assert!(pid.is_some());

        script.lua().unwrap().load("process.killProcess('sleeper')").exec().unwrap();
        let listed: Value = script.lua().unwrap().load("return process.listProcess()").eval().unwrap();
        assert!(listed.is_nil());
        script.stop().await;
    }

    #[tokio::test]
    async fn test_join_with_grace_aborts_stuck_tasks() {
        let stuck = tokio::spawn(async { std::future::pending::<()>().await });
        assert!(!join_with_grace(vec![stuck], Duration::from_millis(50)).await);
        assert!(join_with_grace(Vec::new(), Duration::ZERO).await);
    }
}
