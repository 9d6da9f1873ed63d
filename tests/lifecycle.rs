//! End-to-end behaviour of the agent against an in-memory update source.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scriptvisor::{Agent, AgentConfig, AgentError, DevInfo, Phase, UpdateConfig, UpdateSource, checksum};
use tokio_util::sync::CancellationToken;

/// Serves one script; the advertised checksum can be overridden.
struct MemSource {
    script: Mutex<Vec<u8>>,
    advertised: Mutex<Option<String>>,
    metadata_calls: AtomicUsize,
    script_calls: AtomicUsize,
}

impl MemSource {
    fn new(script: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.as_bytes().to_vec()),
            advertised: Mutex::new(None),
            metadata_calls: AtomicUsize::new(0),
            script_calls: AtomicUsize::new(0),
        })
    }

    fn publish(&self, script: &str) {
        *self.script.lock() = script.as_bytes().to_vec();
        *self.advertised.lock() = None;
    }

    fn advertise(&self, md5: &str) {
        *self.advertised.lock() = Some(md5.to_string());
    }

    fn script_calls(&self) -> usize {
        self.script_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSource for MemSource {
    async fn fetch_metadata(&self) -> Result<UpdateConfig, AgentError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let md5 = match self.advertised.lock().clone() {
            Some(md5) => md5,
            None => checksum::md5_hex(&self.script.lock()),
        };
        Ok(UpdateConfig {
            md5,
            url: "mem://script.lua".into(),
            project_id: None,
        })
    }

    async fn fetch_script(&self, _url: &str) -> Result<Vec<u8>, AgentError> {
        self.script_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().clone())
    }
}

fn config(dir: &Path) -> AgentConfig {
    AgentConfig {
        working_dir: dir.to_path_buf(),
        check_interval: Duration::from_secs(1),
        stop_grace: Duration::from_secs(1),
        ..AgentConfig::default()
    }
}

fn agent(dir: &Path, source: Arc<MemSource>) -> Agent {
    Agent::with_device(config(dir), DevInfo::default(), source)
}

/// Script that appends `mark` to `log` on start, on every tick and on stop.
fn script(log: &Path, mark: &str, tick: f64) -> String {
    format!(
        r#"
local LOG = {log:?}
local function note(s) local f = io.open(LOG, "a"); f:write(s); f:close() end
local M = {{}}
function M.start() note("{mark}+") ; timer.createTimer("t", {tick}, "onTick") end
function M.onTick(tag) note("{mark}") end
function M.stop() note("{mark}-") end
return M
"#,
        log = log.display().to_string(),
    )
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn unchanged_checksum_keeps_generation_and_skips_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let source = MemSource::new(&script(&log, "a", 10.0));
    let mut agent = agent(dir.path(), source.clone());

    agent.boot().await;
    assert_eq!(agent.phase(), Phase::Active);
    assert_eq!(source.script_calls(), 1);
    let (id, started) = {
        let g = agent.generation().unwrap();
        (g.id(), g.started_at())
    };

    assert!(!agent.refresh().await.unwrap());
    assert!(!agent.refresh().await.unwrap());

    let g = agent.generation().unwrap();
    assert_eq!(g.id(), id);
    assert_eq!(g.started_at(), started);
    assert_eq!(source.script_calls(), 1, "content must not be refetched");
    assert_eq!(source.metadata_calls.load(Ordering::SeqCst), 3);
    agent.shutdown().await;
}

#[tokio::test]
async fn mismatched_content_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let source = MemSource::new(&script(&log, "a", 10.0));
    let mut agent = agent(dir.path(), source.clone());
    agent.boot().await;
    let id = agent.generation().unwrap().id();
    let before = agent.checksum().to_string();

    source.publish(&script(&log, "b", 10.0));
    source.advertise("00000000000000000000000000000000");

    let err = agent.refresh().await.unwrap_err();
    assert_eq!(err.as_label(), "checksum_mismatch");
    assert_eq!(agent.generation().unwrap().id(), id);
    assert_eq!(agent.checksum(), before);
    assert_eq!(read(&log), "a+");
    agent.shutdown().await;
}

#[tokio::test]
async fn changed_script_swaps_generation_and_updates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let source = MemSource::new(&script(&log, "a", 10.0));
    let mut agent = agent(dir.path(), source.clone());
    agent.boot().await;
    let old = agent.generation().unwrap().id();

    let next = script(&log, "b", 10.0);
    source.publish(&next);
    assert!(agent.refresh().await.unwrap());

    let g = agent.generation().unwrap();
    assert_ne!(g.id(), old);
    assert_eq!(g.checksum(), checksum::md5_hex(next.as_bytes()));
    assert_eq!(g.timers().tags(), vec!["t".to_string()]);
    assert_eq!(read(&log), "a+a-b+", "old generation stops before the new one starts");
    assert_eq!(read(&dir.path().join("script.lua")), next);

    agent.shutdown().await;
    assert_eq!(read(&log), "a+a-b+b-");
}

#[tokio::test]
async fn restart_runs_cached_script_before_network() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let src = script(&log, "a", 10.0);

    let source = MemSource::new(&src);
    let mut first = agent(dir.path(), source);
    first.boot().await;
    first.shutdown().await;

    let source = MemSource::new(&src);
    let mut second = agent(dir.path(), source.clone());
    second.boot().await;
    assert_eq!(second.checksum(), checksum::md5_hex(src.as_bytes()));
    assert_eq!(source.script_calls(), 0, "cache hit must skip the content fetch");
    second.shutdown().await;
}

#[tokio::test]
async fn run_loop_dispatches_and_hot_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("log");
    let source = MemSource::new(&script(&log, "a", 0.1));
    let mut agent = agent(dir.path(), source.clone());
    agent.boot().await;

    let token = CancellationToken::new();
    let control = token.clone();
    let src = source.clone();
    let log_path = log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        src.publish(&script(&log_path, "b", 0.1));
        tokio::time::sleep(Duration::from_millis(1400)).await;
        control.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), agent.run(token))
        .await
        .expect("run must return after shutdown");
    assert_eq!(agent.phase(), Phase::Idle);

    let out = read(&log);
    let swap = out.find("a-b+").expect("hot reload happened");
    let (old, new) = out.split_at(swap);
    assert!(old.starts_with("a+a"), "old script ticked: {out}");
    assert!(!new[2..].contains('a'), "no old ticks after swap: {out}");
    assert!(new.contains("b+b"), "new script ticked: {out}");
    assert!(out.ends_with("b-"), "final stop ran: {out}");
}
