//! # Completion events and the per-generation event queue.
//!
//! - [`ScriptEvent`] - immutable completion record (timer tick, download result, process exit)
//! - [`TaskId`] - process-wide unique task identity carried by every record
//! - [`EventQueue`] - bounded FIFO between background tasks and the script owner

mod event;
mod queue;

pub use event::{ScriptEvent, TaskId};
pub use queue::{EventQueue, EventReceiver, EventSender};
