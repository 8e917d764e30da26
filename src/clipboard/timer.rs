//! Scheduled tasks.
//!
//! A [`ScheduledTask`] posts one event to the engine loop after a delay.
//! The loop never blocks on timers: a fire is just another event, tagged
//! with the task id so that the owner can ignore fires of tasks it already
//! replaced. Cancelling aborts the sleeping task and is idempotent.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::clipboard::event::{EngineEvent, EventSender};

/// Allocates ids for scheduled tasks
#[derive(Debug, Default)]
pub struct TimerIds {
    next: u64,
}

impl TimerIds {
    /// Next unused id
    pub fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// An event scheduled for later delivery
#[derive(Debug)]
pub struct ScheduledTask {
    id: u64,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Deliver `event` on `events` after `delay`
    pub fn schedule(id: u64, delay: Duration, events: EventSender, event: EngineEvent) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(event).is_err() {
                trace!("timer {} fired after the engine stopped", id);
            }
        });
        Self {
            id,
            handle: Some(handle),
        }
    }

    /// Task id, carried by the fired event
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true until the task is cancelled or has fired
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the task. Returns true if it was still pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
