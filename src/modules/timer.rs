//! # Timer module - periodic callbacks.
//!
//! Lua surface:
//! ```lua
//! local err = timer.createTimer("t1", 1, "onTick")  -- nil on success
//! timer.deleteTimer("t1")
//! ```
//!
//! Each timer is one background task that, every interval, sends a
//! [`ScriptEvent::Timer`] to the generation's queue. Timers repeat until deleted or
//! until their generation stops. A tick that was queued before `deleteTimer` is
//! discarded at dispatch (see [`Timers::is_active`]).

use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Table, Value};
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::Registry;
use crate::error::TaskStartError;
use crate::events::{EventSender, ScriptEvent, TaskId};

/// Metadata of a registered timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerInfo {
    /// Exported function invoked on each tick.
    pub callback: Arc<str>,
    /// Tick period.
    pub interval: Duration,
}

/// Timer registry of one generation.
pub struct Timers {
    registry: Arc<Registry<TimerInfo>>,
    events: EventSender,
}

impl Timers {
    /// Creates an empty timer registry sending to `events`.
    pub fn new(events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry::new("timer")),
            events,
        })
    }

    /// Starts a periodic timer under `tag`.
    ///
    /// The callback name is not checked here; the Lua binding resolves it first.
    pub fn create(
        &self,
        tag: &str,
        interval: Duration,
        callback: &str,
    ) -> Result<TaskId, TaskStartError> {
        if interval.is_zero() {
            return Err(TaskStartError::InvalidInterval { interval: 0.0 });
        }

        let tag_arc: Arc<str> = Arc::from(tag);
        let callback: Arc<str> = Arc::from(callback);
        let events = self.events.clone();

        self.registry.try_register(tag, move |id, token| {
            let info = TimerInfo {
                callback: callback.clone(),
                interval,
            };
            Ok((info, serve_timer(id, tag_arc, callback, interval, token, events)))
        })
    }

    /// Cancels and removes the timer under `tag`. No-op if absent.
    pub fn delete(&self, tag: &str) -> bool {
        self.registry.cancel(tag)
    }

    /// Returns true if `tag` is still registered to timer `id`.
    pub fn is_active(&self, tag: &str, id: TaskId) -> bool {
        self.registry.contains(tag, id)
    }

    /// Returns metadata for `tag`.
    pub fn get(&self, tag: &str) -> Option<TimerInfo> {
        self.registry.get(tag)
    }

    /// Returns sorted active tags.
    pub fn tags(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Cancels and removes every timer; returns their join handles.
    pub fn clear(&self) -> Vec<JoinHandle<()>> {
        self.registry.cancel_all()
    }

    /// Builds the `timer` Lua module.
    pub(crate) fn loader(self: &Arc<Self>, lua: &Lua) -> mlua::Result<Table> {
        let module = lua.create_table()?;

        let timers = Arc::clone(self);
        module.set(
            "createTimer",
            lua.create_function(
                move |lua, (tag, interval, callback): (Value, Value, Value)| {
                    let tag = super::arg_string(&tag);
                    let callback = super::arg_string(&callback);
                    let interval = super::arg_number(&interval).unwrap_or(f64::NAN);
                    info!(%tag, interval, %callback, "createTimer");
                    let res = super::resolve_callback(lua, &callback)
                        .and_then(|()| interval_from_secs(interval))
                        .and_then(|d| timers.create(&tag, d, &callback));
                    Ok(super::err_value(res))
                },
            )?,
        )?;

        let timers = Arc::clone(self);
        module.set(
            "deleteTimer",
            lua.create_function(move |_, tag: Value| {
                let tag = super::arg_string(&tag);
                if timers.delete(&tag) {
                    info!(%tag, "deleteTimer");
                }
                Ok(())
            })?,
        )?;

        Ok(module)
    }
}

/// Converts script seconds into a positive interval.
fn interval_from_secs(secs: f64) -> Result<Duration, TaskStartError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(TaskStartError::InvalidInterval { interval: secs });
    }
    Duration::try_from_secs_f64(secs).map_err(|_| TaskStartError::InvalidInterval { interval: secs })
}

/// Tick loop of one timer; first tick fires one interval after creation.
async fn serve_timer(
    id: TaskId,
    tag: Arc<str>,
    callback: Arc<str>,
    interval: Duration,
    token: CancellationToken,
    events: EventSender,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let ev = ScriptEvent::timer(id, tag.clone(), callback.clone());
                select! {
                    _ = token.cancelled() => break,
                    sent = events.send(ev) => if !sent { break },
                }
            }
        }
    }
    debug!(%tag, task = %id, "timer stopped");
}
