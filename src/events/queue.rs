//! # Bounded event queue between capability tasks and the script owner.
//!
//! [`EventQueue::bounded`] is a thin wrapper around [`tokio::sync::mpsc`] that gives
//! every generation its own ordered, first-in-first-out channel.
//!
//! ## Architecture
//! ```text
//! Producers (many):                    Consumer (one):
//!   timer task    ──┐
//!   download task ──┼──► EventSender ──► EventReceiver ──► Agent loop ──► Generation::dispatch
//!   process waiter──┘   (bounded mpsc)    (owned by Generation)
//! ```
//!
//! ## Rules
//! - **Backpressure**: `send()` waits while the queue is full; producers never drop silently.
//! - **Single reader**: only the owning generation receives.
//! - **Straggler discard**: once the receiver is closed or dropped (generation stopped),
//!   `send()` returns `false` and the record is discarded.

use tokio::sync::mpsc;

use super::event::ScriptEvent;

/// Constructor namespace for event queues.
pub struct EventQueue;

impl EventQueue {
    /// Creates a bounded queue (capacity clamped to a minimum of 1).
    pub fn bounded(capacity: usize) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventSender { tx }, EventReceiver { rx })
    }
}

/// Producer half. Cheap to clone; one clone per background task.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<ScriptEvent>,
}

impl EventSender {
    /// Enqueues a record, waiting for capacity.
    ///
    /// Returns `false` if the owning generation is gone.
    pub async fn send(&self, ev: ScriptEvent) -> bool {
        self.tx.send(ev).await.is_ok()
    }

    /// Returns true once the consumer closed or dropped its half.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by exactly one generation.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<ScriptEvent>,
}

impl EventReceiver {
    /// Waits for the next record; `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<ScriptEvent> {
        self.rx.recv().await
    }

    /// Takes a record if one is already queued.
    pub fn try_recv(&mut self) -> Option<ScriptEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops accepting records and discards everything still queued.
    ///
    /// Returns the number of discarded records.
    pub fn close_and_drain(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
