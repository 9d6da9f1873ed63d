//! # scriptvisor
//!
//! **Scriptvisor** is a remotely updatable automation agent. It fetches a Lua
//! script from a control server, runs it in an embedded interpreter and exposes
//! host capabilities (timers, downloads, child processes, file utilities) to it.
//!
//! The interpreter is single-threaded; capabilities are concurrent. Background
//! tasks never touch the interpreter: they send immutable [`ScriptEvent`]s to the
//! generation that created them, and the agent loop dispatches those one at a time.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!       control server                         local cache
//!  (UpdateSource: md5 + url)                 (ScriptStore)
//!             │                                    │
//!             ▼                                    ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Agent (lifecycle manager)                                        │
//! │  - checksum gate before fetching content                          │
//! │  - md5 verification of fetched content                            │
//! │  - stop old generation fully, then start the new one              │
//! │  - select { shutdown, update tick, next event }                   │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Generation (one script version)                                  │
//! │  - Lua state + exports table { start, stop, callbacks... }        │
//! │  - Timers / Downloads / Processes registries                      │
//! │  - EventReceiver (bounded, FIFO)                                  │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!  ┌────────────┐    ┌─────────────┐    ┌──────────────┐
//!  │ timer task │    │download task│    │process waiter│
//!  │  (ticks)   │    │ (GET → file)│    │ (child.wait) │
//!  └─────┬──────┘    └──────┬──────┘    └──────┬───────┘
//!        │ ScriptEvent      │ ScriptEvent      │ ScriptEvent
//!        └──────────────────┴────────┬─────────┘
//!                                    ▼
//!                      EventSender ──► queue ──► Generation::dispatch
//! ```
//!
//! ### Generation swap
//! ```text
//! update tick ─► fetch metadata ─► md5 == running? ── yes ─► nothing
//!                                       │ no
//!                                       ▼
//!                                fetch content ─► md5(content) == advertised? ── no ─► reject
//!                                       │ yes
//!                                       ▼
//!                  save cache ─► old.stop() (stop callback, cancel all, drain)
//!                                       ▼
//!                  Generation::new(content) ─► start() (install modules, start callback)
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types                                 |
//! |-------------------|--------------------------------------------------------------|-------------------------------------------|
//! | **Lifecycle**     | Update checks, hot reload, shutdown.                         | [`Agent`], [`Phase`]                      |
//! | **Runtime**       | One loaded script, sequential callback dispatch.             | [`Generation`], [`Dispatch`]              |
//! | **Events**        | Completion records and the per-generation queue.             | [`ScriptEvent`], [`TaskId`], [`EventQueue`] |
//! | **Capabilities**  | Timer, download and process registries exposed to Lua.       | [`Timers`], [`Downloads`], [`Processes`]  |
//! | **Updates**       | Control server seam and local cache.                         | [`UpdateSource`], [`ScriptStore`]         |
//! | **Errors**        | Typed failures, none of them fatal to the agent.             | [`AgentError`], [`TaskStartError`]        |
//! | **Configuration** | Centralized runtime settings.                                | [`AgentConfig`], [`ProcessPolicy`]        |
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use scriptvisor::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cfg = AgentConfig {
//!         server_url: "http://127.0.0.1:8080/update".into(),
//!         check_interval: Duration::from_secs(30),
//!         ..AgentConfig::default()
//!     };
//!
//!     let mut agent = Agent::from_config(cfg);
//!     agent.boot().await;
//!
//!     let shutdown = CancellationToken::new();
//!     scriptvisor::cancel_on_signal(shutdown.clone());
//!     agent.run(shutdown).await;
//! }
//! ```
pub mod checksum;
mod config;
mod core;
mod devinfo;
mod error;
mod events;
mod modules;
mod update;

/// Agent version reported to the control server and to scripts.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---- Public re-exports ----

pub use config::{AgentConfig, DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_EXEC_TIMEOUT, ProcessPolicy};
pub use core::{Agent, Dispatch, Generation, Phase, cancel_on_signal, wait_for_shutdown_signal};
pub use devinfo::DevInfo;
pub use error::{AgentError, TaskStartError};
pub use events::{EventQueue, EventReceiver, EventSender, ScriptEvent, TaskId};
pub use modules::{DownloadInfo, Downloads, HostContext, ProcessInfo, Processes, TimerInfo, Timers};
pub use update::{HttpUpdateSource, ScriptStore, UpdateConfig, UpdateResponse, UpdateSource};
