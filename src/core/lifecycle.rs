//! # Agent: generation lifecycle manager.
//!
//! The [`Agent`] owns the current script (checksum + bytes), the active
//! [`Generation`] and the update source. Its loop multiplexes three inputs:
//!
//! ```text
//!            ┌──────────── shutdown token cancelled ──► stop generation, exit
//!            │
//! Agent::run ┼──────────── update tick ──► refresh():
//!            │                              fetch metadata
//!            │                              ├─ md5 == running → nothing
//!            │                              └─ md5 != running → fetch script
//!            │                                   ├─ hash mismatch → reject, keep running
//!            │                                   └─ ok → save cache, stop old, start new
//!            │
//!            └──────────── next event of the active generation ──► dispatch
//! ```
//!
//! ## Rules
//! - At most one generation exists at a time; the old one is fully stopped
//!   before its replacement is created.
//! - Update failures never stop the loop; the last good script keeps running.
//! - Shutdown has priority over pending events and update ticks.

use std::sync::Arc;

use tokio::select;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::generation::Generation;
use crate::checksum;
use crate::config::AgentConfig;
use crate::devinfo::DevInfo;
use crate::error::AgentError;
use crate::events::ScriptEvent;
use crate::modules::HostContext;
use crate::update::{HttpUpdateSource, ScriptStore, UpdateSource};

/// Lifecycle phase of the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No generation is running.
    Idle,
    /// A generation is running and receiving events.
    Active,
    /// The current generation is being stopped.
    Stopping,
}

enum Step {
    Shutdown,
    Check,
    Event(ScriptEvent),
}

/// Remotely updatable script agent.
pub struct Agent {
    host: HostContext,
    source: Arc<dyn UpdateSource>,
    store: ScriptStore,
    checksum: String,
    content: Vec<u8>,
    generation: Option<Generation>,
    phase: Phase,
}

impl Agent {
    /// Creates an agent that collects device info from the running host.
    pub fn new(cfg: AgentConfig, source: Arc<dyn UpdateSource>) -> Self {
        Self::with_device(cfg, DevInfo::collect(), source)
    }

    /// Creates an agent with explicit device info.
    pub fn with_device(cfg: AgentConfig, device: DevInfo, source: Arc<dyn UpdateSource>) -> Self {
        let store = ScriptStore::new(cfg.script_path());
        Self {
            host: HostContext::new(cfg, device),
            source,
            store,
            checksum: String::new(),
            content: Vec::new(),
            generation: None,
            phase: Phase::Idle,
        }
    }

    /// Creates an agent talking to `cfg.server_url` over HTTP.
    pub fn from_config(cfg: AgentConfig) -> Self {
        let device = DevInfo::collect();
        let source = Arc::new(HttpUpdateSource::new(&cfg, &device));
        Self::with_device(cfg, device, source)
    }

    /// Loads the cached script, runs one update check and starts the first generation.
    pub async fn boot(&mut self) {
        self.load_local().await;
        if let Err(e) = self.check_update().await {
            warn!(label = e.as_label(), error = %e, "initial update check failed");
        }
        self.renew().await;
    }

    /// Runs one update check and swaps the generation if the script changed.
    ///
    /// Returns `Ok(true)` if a new generation was started.
    pub async fn refresh(&mut self) -> Result<bool, AgentError> {
        self.check_update().await?;
        let current = self
            .generation
            .as_ref()
            .is_some_and(|g| checksum::same(g.checksum(), &self.checksum));
        if current {
            return Ok(false);
        }
        self.renew().await;
        Ok(true)
    }

    /// Runs the agent loop until `shutdown` is cancelled, then stops the generation.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let period = self.host.config.check_interval_clamped();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?period, "agent loop started");

        loop {
            let step = select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                _ = ticker.tick() => Step::Check,
                ev = next_event(&mut self.generation) => Step::Event(ev),
            };

            match step {
                Step::Shutdown => break,
                Step::Check => {
                    if let Err(e) = self.refresh().await {
                        warn!(label = e.as_label(), error = %e, "update check failed");
                    }
                }
                Step::Event(ev) => {
                    if let Some(script) = self.generation.as_mut() {
                        let label = ev.as_label();
                        let outcome = script.dispatch(ev);
                        debug!(generation = script.id(), event = label, ?outcome, "dispatched");
                    }
                }
            }
        }

        self.shutdown().await;
        info!("agent loop stopped");
    }

    /// Stops the active generation.
    pub async fn shutdown(&mut self) {
        if let Some(mut old) = self.generation.take() {
            self.phase = Phase::Stopping;
            old.stop().await;
        }
        self.phase = Phase::Idle;
    }

    /// Returns the lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the active generation.
    pub fn generation(&self) -> Option<&Generation> {
        self.generation.as_ref()
    }

    /// Returns the active generation mutably.
    pub fn generation_mut(&mut self) -> Option<&mut Generation> {
        self.generation.as_mut()
    }

    /// Returns the checksum of the current script (empty if none).
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Returns the agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.host.config
    }

    async fn load_local(&mut self) {
        match self.store.load().await {
            Ok(Some(bytes)) => {
                self.checksum = checksum::md5_hex(&bytes);
                self.content = bytes;
                info!(path = %self.store.path().display(), md5 = %self.checksum, "cached script loaded");
            }
            Ok(None) => debug!(path = %self.store.path().display(), "no cached script"),
            Err(e) => warn!(label = e.as_label(), error = %e, "cached script unreadable"),
        }
    }

    /// Fetches metadata and, if the checksum changed, the verified new content.
    async fn check_update(&mut self) -> Result<bool, AgentError> {
        let meta = self.source.fetch_metadata().await?;
        if checksum::same(&meta.md5, &self.checksum) {
            debug!(md5 = %meta.md5, "script unchanged");
            return Ok(false);
        }

        let body = self.source.fetch_script(&meta.url).await?;
        let actual = checksum::md5_hex(&body);
        if !checksum::same(&actual, &meta.md5) {
            return Err(AgentError::ChecksumMismatch {
                expected: meta.md5,
                actual,
            });
        }

        if let Err(e) = self.store.save(&body).await {
            warn!(label = e.as_label(), error = %e, "script cache not updated");
        }
        info!(md5 = %actual, url = %meta.url, "script updated");
        self.checksum = actual;
        self.content = body;
        Ok(true)
    }

    /// Stops the current generation and starts one from the current script.
    async fn renew(&mut self) {
        self.phase = Phase::Stopping;
        if let Some(mut old) = self.generation.take() {
            old.stop().await;
        }

        let mut next = Generation::new(self.checksum.clone(), &self.content, self.host.clone());
        next.start();
        self.generation = Some(next);
        self.phase = Phase::Active;
    }
}

async fn next_event(generation: &mut Option<Generation>) -> ScriptEvent {
    match generation {
        Some(script) => script.next_event().await,
        None => std::future::pending().await,
    }
}
